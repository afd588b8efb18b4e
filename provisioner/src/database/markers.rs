// Expected psql output per operation.
//
// psql reports success as fixed command tags on stdout. Every literal the engine matches
// against lives here and nowhere else. The tags are the English ones; a localised toolchain
// is not recognised and its output is reported as a tool failure.

use crate::installation::CommandOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsqlOp {
    AlterSystem,
    CreateRole,
    CreateDatabase,
    /// `CREATE EXTENSION IF NOT EXISTS x; COMMENT ON EXTENSION x IS null;`
    CreateSuperExtension,
    CreateAppExtension,
    DropDatabase,
}

impl PsqlOp {
    /// Command tags psql prints, in order, when the operation succeeds.
    pub fn expected_tags(self) -> &'static [&'static str] {
        match self {
            PsqlOp::AlterSystem => &["ALTER SYSTEM"],
            PsqlOp::CreateRole => &["CREATE ROLE"],
            PsqlOp::CreateDatabase => &["CREATE DATABASE"],
            PsqlOp::CreateSuperExtension => &["CREATE EXTENSION", "COMMENT"],
            PsqlOp::CreateAppExtension => &["CREATE EXTENSION"],
            PsqlOp::DropDatabase => &["DROP DATABASE"],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PsqlOp::AlterSystem => "alter_system",
            PsqlOp::CreateRole => "create_role",
            PsqlOp::CreateDatabase => "create_database",
            PsqlOp::CreateSuperExtension => "create_super_extension",
            PsqlOp::CreateAppExtension => "create_app_extension",
            PsqlOp::DropDatabase => "drop_database",
        }
    }
}

/// Notice psql prints on stderr for `CREATE EXTENSION IF NOT EXISTS` when the extension is there.
pub fn extension_already_exists_notice(extension: &str) -> String {
    format!("NOTICE:  extension \"{}\" already exists, skipping", extension)
}

fn tag_lines(stdout: &str) -> Vec<&str> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect()
}

/// stdout carries the expected tags. psql before 15 prints only the last tag of a
/// multi-statement `-c`, so a matching suffix is accepted too.
pub fn stdout_matches(op: PsqlOp, stdout: &str) -> bool {
    let lines = tag_lines(stdout);
    let expected = op.expected_tags();
    if lines.is_empty() || lines.len() > expected.len() {
        return false;
    }
    expected[expected.len() - lines.len()..]
        .iter()
        .zip(&lines)
        .all(|(want, got)| want == got)
}

/// Exit code 0, the expected tags, and nothing on stderr.
pub fn is_success(op: PsqlOp, out: &CommandOutput) -> bool {
    out.success() && stdout_matches(op, &out.stdout) && out.stderr.trim().is_empty()
}

/// Success, or the "already exists, skipping" notice for this extension as the only stderr.
pub fn extension_outcome(op: PsqlOp, extension: &str, out: &CommandOutput) -> ExtensionOutcome {
    if !out.success() || !stdout_matches(op, &out.stdout) {
        return ExtensionOutcome::Failed;
    }
    let stderr = out.stderr.trim();
    if stderr.is_empty() {
        ExtensionOutcome::Created
    } else if stderr == extension_already_exists_notice(extension) {
        ExtensionOutcome::AlreadyExists
    } else {
        ExtensionOutcome::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionOutcome {
    Created,
    AlreadyExists,
    Failed,
}

/// Role names from `psql -XtA -c "\du"` (first `|`-separated column).
pub fn parse_role_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let name = line.split('|').next()?.trim();
            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

/// `SELECT 1 FROM pg_database ...` printed `1`.
pub fn is_exists_query_hit(out: &CommandOutput) -> bool {
    out.stdout.trim() == "1"
}
