// Runtime-library detection
//
// Read-only report of installed runtime libraries (the Visual C++ redistributables the Windows
// engine binaries link against), taken from the uninstall registry keys through `reg query`.
// Not part of install/uninstall: a failed lookup degrades to an empty report with a warning.

use log::{debug, info, warn};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::error::Result;
use crate::installation::{CommandRunner, CommandSpec};

pub const DEFAULT_RUNTIME_NEEDLE: &str = "Visual C++";

pub const UNINSTALL_KEY_64: &str = "HKLM\\SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\Uninstall";
pub const UNINSTALL_KEY_32: &str =
    "HKLM\\SOFTWARE\\WOW6432Node\\Microsoft\\Windows\\CurrentVersion\\Uninstall";

const DISPLAY_NAME: &str = "DisplayName";
const DISPLAY_VERSION: &str = "DisplayVersion";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLibrary {
    pub key: String,
    pub name: String,
    pub version: Option<String>,
}

impl fmt::Display for RuntimeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.name,
            self.version.as_deref().unwrap_or("unknown")
        )
    }
}

/// `    DisplayName    REG_SZ    Microsoft Visual C++ 2015-2022 ...`
fn value_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+(\S+)\s+(REG_[A-Z_]+)\s*(.*)$").expect("static regex"))
}

/// `(subkey, DisplayName)` pairs from `reg query <root> /s /v DisplayName`.
pub fn parse_display_names(stdout: &str) -> Vec<(String, String)> {
    let mut current_key: Option<&str> = None;
    let mut out = Vec::new();
    for line in stdout.lines() {
        if line.starts_with("HKEY_") {
            current_key = Some(line.trim());
            continue;
        }
        let Some(caps) = value_line().captures(line) else {
            continue;
        };
        if &caps[1] != DISPLAY_NAME {
            continue;
        }
        if let Some(key) = current_key {
            out.push((key.to_string(), caps[3].trim().to_string()));
        }
    }
    out
}

/// Data of value `name` from `reg query <key> /v <name>`.
pub fn parse_reg_value(stdout: &str, name: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let caps = value_line().captures(line)?;
        if &caps[1] == name {
            Some(caps[3].trim().to_string()).filter(|v| !v.is_empty())
        } else {
            None
        }
    })
}

fn reg_query(key: &str, value: &str, recursive: bool) -> CommandSpec {
    let mut cmd = CommandSpec::new("reg", "reg_query").args(["query", key]);
    if recursive {
        cmd = cmd.arg("/s");
    }
    cmd.args(["/v", value])
}

async fn detect_under<R: CommandRunner>(
    runner: &R,
    root: &str,
    needle: &str,
) -> Result<Vec<RuntimeLibrary>> {
    let out = runner.run(&reg_query(root, DISPLAY_NAME, true)).await?;
    if !out.success() {
        // `reg query` exits 1 when the key or the value is absent.
        debug!(
            "[PHASE: diagnostics] [STEP: reg_query] No entries under {} (exit_code={:?})",
            root, out.exit_code
        );
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for (key, name) in parse_display_names(&out.stdout) {
        if !name.contains(needle) {
            continue;
        }
        let version_out = runner.run(&reg_query(&key, DISPLAY_VERSION, false)).await?;
        let version = if version_out.success() {
            parse_reg_value(&version_out.stdout, DISPLAY_VERSION)
        } else {
            None
        };
        found.push(RuntimeLibrary { key, name, version });
    }
    Ok(found)
}

/// Installed runtime libraries whose display name contains `needle`, 64-bit view first.
pub async fn detect_runtime_libraries<R: CommandRunner>(runner: &R, needle: &str) -> Vec<RuntimeLibrary> {
    let mut all = Vec::new();
    for root in [UNINSTALL_KEY_64, UNINSTALL_KEY_32] {
        match detect_under(runner, root, needle).await {
            Ok(found) => all.extend(found),
            Err(e) => warn!(
                "[PHASE: diagnostics] [STEP: reg_query] Registry lookup failed under {}: {}",
                root, e
            ),
        }
    }
    info!(
        "[PHASE: diagnostics] [STEP: done] Runtime libraries matching '{}': {}",
        needle,
        all.len()
    );
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{exited, ok, ScriptedRunner};

    const LISTING_64: &str = "\r
HKEY_LOCAL_MACHINE\\SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\{0A1B}\r
    DisplayName    REG_SZ    Microsoft Visual C++ 2015-2022 Redistributable (x64) - 14.38.33130\r
\r
HKEY_LOCAL_MACHINE\\SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\7-Zip\r
    DisplayName    REG_SZ    7-Zip 23.01 (x64)\r
\r
End of search: 2 match(es) found.\r
";

    #[test]
    fn display_names_are_paired_with_their_subkey() {
        let pairs = parse_display_names(LISTING_64);
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].0.ends_with("Uninstall\\{0A1B}"));
        assert_eq!(
            pairs[0].1,
            "Microsoft Visual C++ 2015-2022 Redistributable (x64) - 14.38.33130"
        );
        assert_eq!(pairs[1].1, "7-Zip 23.01 (x64)");
    }

    #[test]
    fn reg_value_extraction() {
        let out = "\r\nHKEY_LOCAL_MACHINE\\SOFTWARE\\X\\{0A1B}\r\n    DisplayVersion    REG_SZ    14.38.33130.0\r\n";
        assert_eq!(
            parse_reg_value(out, "DisplayVersion").as_deref(),
            Some("14.38.33130.0")
        );
        assert_eq!(parse_reg_value(out, "DisplayName"), None);
        assert_eq!(parse_reg_value("", "DisplayVersion"), None);
    }

    #[test]
    fn report_line_falls_back_to_unknown_version() {
        let lib = RuntimeLibrary {
            key: "k".to_string(),
            name: "Microsoft Visual C++ 2013 Redistributable (x86)".to_string(),
            version: None,
        };
        assert_eq!(
            lib.to_string(),
            "Microsoft Visual C++ 2013 Redistributable (x86) - unknown"
        );
    }

    #[tokio::test]
    async fn detection_filters_by_needle_and_reads_versions() {
        let runner = ScriptedRunner::new(|cmd| {
            let key = cmd.get_args().get(1).cloned().unwrap_or_default();
            if cmd.has_arg("/s") {
                if key == UNINSTALL_KEY_64 {
                    ok(LISTING_64)
                } else {
                    exited(1, "", "ERROR: The system was unable to find the specified registry key or value.")
                }
            } else {
                ok("HKEY_LOCAL_MACHINE\\x\n    DisplayVersion    REG_SZ    14.38.33130.0")
            }
        });

        let libs = detect_runtime_libraries(&runner, DEFAULT_RUNTIME_NEEDLE).await;
        assert_eq!(libs.len(), 1);
        assert_eq!(
            libs[0].to_string(),
            "Microsoft Visual C++ 2015-2022 Redistributable (x64) - 14.38.33130 - 14.38.33130.0"
        );
        // One listing per root, one version lookup for the single match.
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn launch_failure_yields_empty_report() {
        struct NoReg;
        #[async_trait::async_trait]
        impl CommandRunner for NoReg {
            async fn run(&self, cmd: &CommandSpec) -> Result<crate::installation::CommandOutput> {
                Err(crate::error::ProvisionError::io(
                    format!("Failed to spawn command '{}'", cmd.program()),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                ))
            }
        }
        assert!(detect_runtime_libraries(&NoReg, DEFAULT_RUNTIME_NEEDLE)
            .await
            .is_empty());
    }
}
