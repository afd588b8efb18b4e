// pg_hba.conf / postgresql.conf patching
//
// New lines are inserted right after a fixed anchor comment. Each insertion is guarded by an
// "already contains" check, so applying the same settings twice leaves the file unchanged.
// The patch functions are pure; `apply_*` do the file I/O and only write when content changed.

use log::{debug, info, warn};
use std::path::Path;

use crate::error::{ProvisionError, Result};
use crate::installation::files;

pub const HBA_FILE_NAME: &str = "pg_hba.conf";
pub const SERVER_CONF_FILE_NAME: &str = "postgresql.conf";

pub const HBA_ANCHOR: &str = "# IPv4 local connections:";
pub const CONNECTION_SETTINGS_ANCHOR: &str = "# - Connection Settings -";

/// Result of a pure patch: new content plus the lines that were inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub content: String,
    pub inserted: Vec<String>,
}

impl Patch {
    pub fn changed(&self) -> bool {
        !self.inserted.is_empty()
    }
}

pub fn hba_line(address: &str) -> String {
    format!("host    all    all    {}    scram-sha-256", address)
}

pub fn port_line(port: u16) -> String {
    format!("port = {}", port)
}

pub fn listen_addresses_line(pattern: &str) -> String {
    format!("listen_addresses = '{}'", pattern)
}

fn line_ending(content: &str) -> &'static str {
    if content.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// Insert `line` on its own line right after the first line that starts with `anchor`.
fn insert_after_anchor(content: &str, anchor: &str, line: &str, file_name: &str) -> Result<String> {
    let Some(anchor_pos) = content.find(anchor) else {
        return Err(ProvisionError::config(format!(
            "Anchor comment '{}' not found in {}",
            anchor, file_name
        )));
    };
    let eol = line_ending(content);
    let insert_at = match content[anchor_pos..].find('\n') {
        Some(i) => anchor_pos + i + 1,
        None => content.len(),
    };

    let mut out = String::with_capacity(content.len() + line.len() + 2);
    out.push_str(&content[..insert_at]);
    if insert_at == content.len() && !content.ends_with('\n') {
        out.push_str(eol);
    }
    out.push_str(line);
    out.push_str(eol);
    out.push_str(&content[insert_at..]);
    Ok(out)
}

/// Allow each client address that does not already appear anywhere in the file.
pub fn patch_hba(content: &str, allowed_client_addresses: &[String]) -> Result<Patch> {
    let mut current = content.to_string();
    let mut inserted = Vec::new();
    for address in allowed_client_addresses {
        if current.contains(address.as_str()) {
            debug!(
                "[PHASE: install] [STEP: pg_hba] {} already contains: {}",
                HBA_FILE_NAME, address
            );
            continue;
        }
        let line = hba_line(address);
        current = insert_after_anchor(&current, HBA_ANCHOR, &line, HBA_FILE_NAME)?;
        inserted.push(line);
    }
    Ok(Patch {
        content: current,
        inserted,
    })
}

/// `(name, value)` of an active `name = value` line, trailing comment stripped.
/// Comments and blank lines yield None, so `#port = 5432` is not a setting.
fn parse_setting(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let split = line.find(|c: char| c == '=' || c.is_whitespace())?;
    let name = &line[..split];
    let rest = line[split..].trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim_start();
    let mut quoted = false;
    let end = rest
        .char_indices()
        .find(|&(_, c)| {
            if c == '\'' {
                quoted = !quoted;
            }
            c == '#' && !quoted
        })
        .map_or(rest.len(), |(i, _)| i);
    Some((name, rest[..end].trim_end()))
}

/// True when `content` already sets the same name to the same value as `line`.
fn has_active_setting(content: &str, line: &str) -> bool {
    let Some(wanted) = parse_setting(line) else {
        return false;
    };
    content.lines().filter_map(parse_setting).any(|s| s == wanted)
}

/// Add `port = <n>` and `listen_addresses = '<pattern>'` unless already present.
pub fn patch_server_conf(content: &str, port: u16, listen_addresses: &str) -> Result<Patch> {
    let mut current = content.to_string();
    let mut inserted = Vec::new();
    for line in [port_line(port), listen_addresses_line(listen_addresses)] {
        if has_active_setting(&current, &line) {
            debug!(
                "[PHASE: install] [STEP: connection_settings] {} already contains: {}",
                SERVER_CONF_FILE_NAME, line
            );
            continue;
        }
        if let Some((name, _)) = parse_setting(&line) {
            for other in current.lines().filter_map(parse_setting).filter(|s| s.0 == name) {
                // Later lines override earlier ones in postgresql.conf.
                warn!(
                    "[PHASE: install] [STEP: connection_settings] {} also sets {} = {}; the last occurrence wins",
                    SERVER_CONF_FILE_NAME, other.0, other.1
                );
            }
        }
        current = insert_after_anchor(
            &current,
            CONNECTION_SETTINGS_ANCHOR,
            &line,
            SERVER_CONF_FILE_NAME,
        )?;
        inserted.push(line);
    }
    Ok(Patch {
        content: current,
        inserted,
    })
}

async fn apply(path: &Path, patch: impl FnOnce(&str) -> Result<Patch>) -> Result<bool> {
    let content = files::read_to_string(path).await?;
    let patch = patch(&content)?;
    if !patch.changed() {
        info!(
            "[PHASE: install] [STEP: patch_conf] {:?} already up to date",
            path
        );
        return Ok(false);
    }
    files::write_string(path, &patch.content).await?;
    info!(
        "[PHASE: install] [STEP: patch_conf] Patched {:?} (inserted={:?})",
        path, patch.inserted
    );
    Ok(true)
}

/// Patch `<data>/pg_hba.conf`. Returns whether the file was rewritten.
pub async fn apply_hba(data_dir: &Path, allowed_client_addresses: &[String]) -> Result<bool> {
    let path = data_dir.join(HBA_FILE_NAME);
    apply(&path, |c| patch_hba(c, allowed_client_addresses)).await
}

/// Patch `<data>/postgresql.conf`. Returns whether the file was rewritten.
pub async fn apply_server_conf(data_dir: &Path, port: u16, listen_addresses: &str) -> Result<bool> {
    let path = data_dir.join(SERVER_CONF_FILE_NAME);
    apply(&path, |c| patch_server_conf(c, port, listen_addresses)).await
}
