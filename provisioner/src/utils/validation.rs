// Input validation utilities
//
// Names from the configuration end up interpolated into psql `-c` commands, so anything that is
// an identifier (role, database, extension) must pass these checks first.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{ProvisionError, Result};

const PG_MAX_IDENTIFIER_LEN: usize = 63;

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Unquoted PostgreSQL identifiers fold to lower case, so only lower case is accepted.
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_$]*$").expect("static regex"))
}

fn extension_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_][a-z0-9_\-]*$").expect("static regex"))
}

/// Validate a role or database name (`kind` is used in the error message).
pub fn validate_pg_identifier(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProvisionError::config(format!("{} name cannot be empty", kind)));
    }
    if name.len() > PG_MAX_IDENTIFIER_LEN {
        return Err(ProvisionError::config(format!(
            "{} name cannot exceed {} characters: '{}'",
            kind, PG_MAX_IDENTIFIER_LEN, name
        )));
    }
    if !identifier_re().is_match(name) {
        return Err(ProvisionError::config(format!(
            "{} name must start with a lower-case letter or underscore and contain only lower-case letters, digits, '_' or '$': '{}'",
            kind, name
        )));
    }
    Ok(())
}

/// Validate an extension name (`uuid-ossp` style hyphens are allowed; the name is always quoted).
pub fn validate_extension_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > PG_MAX_IDENTIFIER_LEN || !extension_re().is_match(name) {
        return Err(ProvisionError::config(format!(
            "Invalid extension name: '{}'",
            name
        )));
    }
    Ok(())
}

/// Validate a pg_hba address column value (CIDR, IP or host name; no whitespace).
pub fn validate_client_address(address: &str) -> Result<()> {
    let a = address.trim();
    if a.is_empty() || a.len() != address.len() || a.chars().any(char::is_whitespace) || a.contains('#') {
        return Err(ProvisionError::config(format!(
            "Invalid allowed client address: '{}'",
            address
        )));
    }
    Ok(())
}

/// Validate a raw `ALTER SYSTEM SET` assignment such as `work_mem = '20971kB'`.
pub fn validate_system_setting(setting: &str) -> Result<()> {
    let s = setting.trim();
    let has_assignment = s.contains('=') || s.to_ascii_uppercase().contains(" TO ");
    if s.is_empty() || !has_assignment || s.contains(';') || s.contains('"') {
        return Err(ProvisionError::config(format!(
            "Invalid system setting (expected `name = value`): '{}'",
            setting
        )));
    }
    Ok(())
}

/// Double-quote a PostgreSQL identifier.
pub fn pg_quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a PostgreSQL string literal.
pub fn pg_quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
