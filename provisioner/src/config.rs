// Configuration model
//
// Immutable value objects describing one PostgreSQL instance: connection parameters,
// installation parameters and (ancillary) foreign-data-wrapper parameters.
//
// Values are built once (from a TOML file + `PGPROV_` environment overrides, or in code via the
// `with_*` builders) and only read afterwards. Derived names and paths are computed on every call
// from the explicit override or the defaults, so nothing derived is ever cached.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};
use crate::utils::validation;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_SUPER_USER: &str = "postgres";
pub const DEFAULT_ENV_NAME: &str = "PgProvision";
pub const DEFAULT_LISTEN_ADDRESSES: &str = "*";
pub const ENV_PREFIX: &str = "PGPROV";

const SERVICE_NAME_SUFFIX: &str = "_Postgresql";

// ============================================================================
// Secret
// ============================================================================

/// A password. Never printed by `Debug`/`Display`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Secret::new(s)
    }
}

// ============================================================================
// Backup format
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupFormat {
    /// Plain SQL script.
    Plain,
    /// pg_dump custom archive (`-F c`).
    #[default]
    CustomArchive,
    /// One file per table in a directory (`-F d`); the only format that supports parallel dumps.
    Directory,
}

impl BackupFormat {
    pub fn supports_parallelism(self) -> bool {
        matches!(self, BackupFormat::Directory)
    }
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupFormat::Plain => "plain",
            BackupFormat::CustomArchive => "custom-archive",
            BackupFormat::Directory => "directory",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Connection configuration
// ============================================================================

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_super_user() -> String {
    DEFAULT_SUPER_USER.to_string()
}

fn default_parallelism() -> u32 {
    1
}

/// Connection parameters and filesystem layout of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_super_user")]
    super_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    super_pass: Option<Secret>,
    /// Installation home. Relative path overrides below are resolved against it.
    home_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tools_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_path: Option<PathBuf>,
    #[serde(default)]
    backup_format: BackupFormat,
    #[serde(default = "default_parallelism")]
    backup_restore_parallelism: u32,
    /// Extensions created with superuser privilege in every application database.
    #[serde(default)]
    super_extensions: Vec<String>,
}

impl ConnectionConfig {
    pub fn new(home_path: impl Into<PathBuf>) -> Self {
        ConnectionConfig {
            host: default_host(),
            port: default_port(),
            super_user: default_super_user(),
            super_pass: None,
            home_path: home_path.into(),
            system_path: None,
            tools_path: None,
            data_path: None,
            backup_format: BackupFormat::default(),
            backup_restore_parallelism: default_parallelism(),
            super_extensions: Vec::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_super_user(mut self, user: impl Into<String>) -> Self {
        self.super_user = user.into();
        self
    }

    pub fn with_super_pass(mut self, pass: impl Into<Secret>) -> Self {
        self.super_pass = Some(pass.into());
        self
    }

    pub fn with_system_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.system_path = Some(path.into());
        self
    }

    pub fn with_tools_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tools_path = Some(path.into());
        self
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    pub fn with_backup_format(mut self, format: BackupFormat) -> Self {
        self.backup_format = format;
        self
    }

    pub fn with_backup_restore_parallelism(mut self, parallelism: u32) -> Self {
        self.backup_restore_parallelism = parallelism;
        self
    }

    pub fn with_super_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        push_unique(&mut self.super_extensions, extensions);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn super_user(&self) -> &str {
        &self.super_user
    }

    pub fn super_pass(&self) -> Option<&Secret> {
        self.super_pass.as_ref()
    }

    /// The superuser password, or a configuration error when it is missing or blank.
    pub fn require_super_pass(&self) -> Result<&Secret> {
        match &self.super_pass {
            Some(p) if !p.is_blank() => Ok(p),
            _ => Err(ProvisionError::config("Superuser password is not configured")),
        }
    }

    pub fn home_path(&self) -> &Path {
        &self.home_path
    }

    /// Engine binaries root. Defaults to `<home>/pgsql`.
    pub fn system_path(&self) -> PathBuf {
        self.resolve(self.system_path.as_deref(), || self.home_path.join("pgsql"))
    }

    /// Directory holding psql, pg_dump, initdb... Defaults to `<system>/bin`.
    pub fn tools_path(&self) -> PathBuf {
        self.resolve(self.tools_path.as_deref(), || self.system_path().join("bin"))
    }

    /// Primary data directory (cluster). Defaults to `<home>/data`.
    pub fn data_path(&self) -> PathBuf {
        self.resolve(self.data_path.as_deref(), || self.home_path.join("data"))
    }

    /// Sibling of the data directory that receives data/database backups: `<data>_backup`.
    pub fn data_backup_parent_path(&self) -> PathBuf {
        let data = self.data_path();
        let name = data
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "data".to_string());
        let parent = data
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.home_path.clone());
        parent.join(format!("{}_backup", name))
    }

    /// Full path of an engine tool, with the platform executable suffix.
    pub fn tool(&self, name: &str) -> PathBuf {
        self.tools_path()
            .join(format!("{}{}", name, std::env::consts::EXE_SUFFIX))
    }

    pub fn backup_format(&self) -> BackupFormat {
        self.backup_format
    }

    pub fn backup_restore_parallelism(&self) -> u32 {
        self.backup_restore_parallelism
    }

    pub fn super_extensions(&self) -> &[String] {
        &self.super_extensions
    }

    /// Parallelism > 1 is only valid with the directory format.
    pub fn check_parallelism(&self) -> Result<()> {
        if self.backup_restore_parallelism > 1 && !self.backup_format.supports_parallelism() {
            return Err(ProvisionError::UnsupportedParallelism {
                parallelism: self.backup_restore_parallelism,
                format: self.backup_format,
            });
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ProvisionError::config("Port must be a positive integer"));
        }
        if self.host.trim().is_empty() {
            return Err(ProvisionError::config("Host cannot be empty"));
        }
        if self.backup_restore_parallelism == 0 {
            return Err(ProvisionError::config(
                "Backup/restore parallelism must be at least 1",
            ));
        }
        self.check_parallelism()?;
        validation::validate_pg_identifier("superuser", &self.super_user)?;
        for ext in &self.super_extensions {
            validation::validate_extension_name(ext)?;
        }
        Ok(())
    }

    fn resolve(&self, explicit: Option<&Path>, default: impl FnOnce() -> PathBuf) -> PathBuf {
        match explicit {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => self.home_path.join(p),
            None => default(),
        }
    }
}

// ============================================================================
// Installation configuration
// ============================================================================

fn default_locale() -> String {
    if cfg!(windows) {
        "English_United States.UTF8".to_string()
    } else {
        "en_US.UTF-8".to_string()
    }
}

fn default_listen_addresses() -> String {
    DEFAULT_LISTEN_ADDRESSES.to_string()
}

/// Everything `install`/`uninstall` need: the connection config plus host-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallConfig {
    connection: ConnectionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    env_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    firewall_rule_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_name: Option<String>,
    /// OS account the Linux systemd unit runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    installer_path: Option<PathBuf>,
    #[serde(default = "default_locale")]
    locale: String,
    #[serde(default = "default_listen_addresses")]
    listen_addresses: String,
    #[serde(default)]
    allowed_client_addresses: Vec<String>,
    /// Raw `ALTER SYSTEM SET` assignments, e.g. `shared_buffers = '8GB'`.
    #[serde(default)]
    system_settings: Vec<String>,
    /// Extensions created by each database owner in its own database.
    #[serde(default)]
    app_extensions: Vec<String>,
    /// username -> password
    #[serde(default)]
    app_users: BTreeMap<String, Secret>,
    /// database -> owning username
    #[serde(default)]
    app_databases: BTreeMap<String, String>,
}

impl InstallConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        InstallConfig {
            connection,
            env_name: None,
            firewall_rule_name: None,
            service_name: None,
            service_user: None,
            installer_path: None,
            locale: default_locale(),
            listen_addresses: default_listen_addresses(),
            allowed_client_addresses: Vec::new(),
            system_settings: Vec::new(),
            app_extensions: Vec::new(),
            app_users: BTreeMap::new(),
            app_databases: BTreeMap::new(),
        }
    }

    pub fn with_env_name(mut self, name: impl Into<String>) -> Self {
        self.env_name = Some(name.into());
        self
    }

    pub fn with_firewall_rule_name(mut self, name: impl Into<String>) -> Self {
        self.firewall_rule_name = Some(name.into());
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn with_service_user(mut self, user: impl Into<String>) -> Self {
        self.service_user = Some(user.into());
        self
    }

    pub fn with_installer_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.installer_path = Some(path.into());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_listen_addresses(mut self, pattern: impl Into<String>) -> Self {
        self.listen_addresses = pattern.into();
        self
    }

    pub fn with_allowed_client_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        push_unique(&mut self.allowed_client_addresses, addresses);
        self
    }

    pub fn with_system_settings<I, S>(mut self, settings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        push_unique(&mut self.system_settings, settings);
        self
    }

    pub fn with_app_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        push_unique(&mut self.app_extensions, extensions);
        self
    }

    pub fn with_app_user(mut self, user: impl Into<String>, pass: impl Into<Secret>) -> Self {
        self.app_users.insert(user.into(), pass.into());
        self
    }

    pub fn with_app_database(mut self, db: impl Into<String>, owner: impl Into<String>) -> Self {
        self.app_databases.insert(db.into(), owner.into());
        self
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    pub fn env_name(&self) -> &str {
        self.env_name.as_deref().unwrap_or(DEFAULT_ENV_NAME)
    }

    /// Explicit override, else `<env>_Postgresql`.
    pub fn service_name(&self) -> String {
        match &self.service_name {
            Some(name) => name.clone(),
            None => format!("{}{}", self.env_name(), SERVICE_NAME_SUFFIX),
        }
    }

    /// Explicit override, else `<env>_PG - open <port>`.
    pub fn firewall_rule_name(&self) -> String {
        match &self.firewall_rule_name {
            Some(name) => name.clone(),
            None => format!("{}_PG - open {}", self.env_name(), self.connection.port()),
        }
    }

    pub fn service_user(&self) -> Option<&str> {
        self.service_user.as_deref()
    }

    pub fn installer_path(&self) -> Option<&Path> {
        self.installer_path.as_deref()
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn listen_addresses(&self) -> &str {
        &self.listen_addresses
    }

    pub fn allowed_client_addresses(&self) -> &[String] {
        &self.allowed_client_addresses
    }

    pub fn system_settings(&self) -> &[String] {
        &self.system_settings
    }

    pub fn app_extensions(&self) -> &[String] {
        &self.app_extensions
    }

    pub fn app_users(&self) -> &BTreeMap<String, Secret> {
        &self.app_users
    }

    pub fn app_databases(&self) -> &BTreeMap<String, String> {
        &self.app_databases
    }

    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;

        if self.env_name().trim().is_empty() {
            return Err(ProvisionError::config("Environment name cannot be empty"));
        }
        if self.listen_addresses.trim().is_empty() || self.listen_addresses.contains('\'') {
            return Err(ProvisionError::config(format!(
                "Invalid listen_addresses pattern: '{}'",
                self.listen_addresses
            )));
        }
        for address in &self.allowed_client_addresses {
            validation::validate_client_address(address)?;
        }
        for setting in &self.system_settings {
            validation::validate_system_setting(setting)?;
        }
        for ext in &self.app_extensions {
            validation::validate_extension_name(ext)?;
        }
        for user in self.app_users.keys() {
            validation::validate_pg_identifier("user", user)?;
        }
        for (db, owner) in &self.app_databases {
            validation::validate_pg_identifier("database", db)?;
            validation::validate_pg_identifier("owner", owner)?;
            if !self.app_users.contains_key(owner) {
                // The owner may already exist on the instance; app-extensions need its password though.
                warn!(
                    "[PHASE: config] [STEP: validate] Database owner has no configured password (db={}, owner={})",
                    db, owner
                );
            }
        }

        debug!(
            "[PHASE: config] [STEP: validate] InstallConfig valid (env={}, service={}, firewall_rule={})",
            self.env_name(),
            self.service_name(),
            self.firewall_rule_name()
        );
        Ok(())
    }
}

// ============================================================================
// Runtime settings + file loading
// ============================================================================

/// Settings of the tool itself rather than the instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Kill external commands that run longer than this. None = wait indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Shape of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(flatten)]
    pub install: InstallConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Load a TOML config file, then apply `PGPROV_*` environment overrides
/// (`PGPROV_CONNECTION__PORT=5433`, `PGPROV_ENV_NAME=Prod`...).
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    debug!(
        "[PHASE: config] [STEP: load] load_config_file entered (path={:?})",
        path
    );

    if !path.exists() {
        return Err(ProvisionError::config(format!(
            "Config file not found: {:?}",
            path
        )));
    }

    let settings = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ProvisionError::config(format!("Failed to read config {:?}: {}", path, e)))?;

    let file: ConfigFile = settings
        .try_deserialize()
        .map_err(|e| ProvisionError::config(format!("Invalid config {:?}: {}", path, e)))?;

    file.install.validate()?;
    Ok(file)
}

/// Sample configuration, rendered as TOML.
pub fn render_sample_config() -> Result<String> {
    let connection = ConnectionConfig::new(if cfg!(windows) {
        "C:\\pg-provision\\postgresql"
    } else {
        "/opt/pg-provision/postgresql"
    })
    .with_port(5430)
    .with_super_pass("change-me")
    .with_super_extensions(["btree_gist", "postgres_fdw"]);

    let install = InstallConfig::new(connection)
        .with_env_name("Example")
        .with_installer_path(if cfg!(windows) {
            "C:\\pg-provision\\install\\postgresql-18.0-1-windows-x64.exe"
        } else {
            "/opt/pg-provision/install/postgresql-18.0-1-linux-x64.run"
        })
        .with_allowed_client_addresses(["192.168.0.0/16", "172.17.0.0/16"])
        .with_system_settings(["max_connections = '100'", "shared_buffers = '2GB'"])
        .with_app_user("app1", "change-me-too")
        .with_app_database("app1", "app1");

    let file = ConfigFile {
        install,
        runtime: RuntimeConfig {
            command_timeout_secs: Some(1800),
            log_dir: None,
        },
    };
    toml::to_string_pretty(&file)
        .map_err(|e| ProvisionError::config(format!("Failed to render sample config: {}", e)))
}

// ============================================================================
// Foreign-data-wrapper configuration (data holder; not executed by the engine)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FdwConfig {
    pub source_db: String,
    pub source_db_user: String,
    pub source_db_pass: Secret,
    pub fdw_schema: String,
    pub foreign_host: String,
    pub foreign_port: u16,
    pub foreign_db: String,
    pub foreign_schema: String,
    pub foreign_user: String,
    pub foreign_pass: Secret,
}

impl FdwConfig {
    /// Server name used for the foreign server object.
    pub fn server_name(&self) -> String {
        format!("{}_{}_fdw", self.foreign_host.replace(['.', '-'], "_"), self.foreign_db)
    }

    /// SQL to run in `source_db` (as `source_db_user`) to expose `foreign_schema` as `fdw_schema`.
    pub fn setup_statements(&self) -> Vec<String> {
        let server = self.server_name();
        vec![
            format!(
                "CREATE SERVER IF NOT EXISTS {server} FOREIGN DATA WRAPPER postgres_fdw OPTIONS (host '{}', port '{}', dbname '{}')",
                escape_literal(&self.foreign_host),
                self.foreign_port,
                escape_literal(&self.foreign_db)
            ),
            format!(
                "CREATE USER MAPPING IF NOT EXISTS FOR {} SERVER {server} OPTIONS (user '{}', password '{}')",
                self.source_db_user,
                escape_literal(&self.foreign_user),
                escape_literal(self.foreign_pass.expose())
            ),
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.fdw_schema),
            format!(
                "IMPORT FOREIGN SCHEMA {} FROM SERVER {server} INTO {}",
                self.foreign_schema, self.fdw_schema
            ),
        ]
    }
}

fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

fn push_unique<I, S>(target: &mut Vec<String>, items: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    for item in items {
        let item = item.into();
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionConfig {
        ConnectionConfig::new("/srv/pg").with_super_pass("S3cr3t!123")
    }

    #[test]
    fn paths_default_relative_to_home() {
        let c = conn();
        assert_eq!(c.system_path(), PathBuf::from("/srv/pg/pgsql"));
        assert_eq!(c.tools_path(), PathBuf::from("/srv/pg/pgsql/bin"));
        assert_eq!(c.data_path(), PathBuf::from("/srv/pg/data"));
        assert_eq!(c.data_backup_parent_path(), PathBuf::from("/srv/pg/data_backup"));
    }

    #[test]
    fn relative_overrides_resolve_against_home() {
        let c = conn()
            .with_system_path("engine")
            .with_data_path("/var/lib/pgdata");
        assert_eq!(c.system_path(), PathBuf::from("/srv/pg/engine"));
        assert_eq!(c.tools_path(), PathBuf::from("/srv/pg/engine/bin"));
        assert_eq!(c.data_path(), PathBuf::from("/var/lib/pgdata"));
        assert_eq!(
            c.data_backup_parent_path(),
            PathBuf::from("/var/lib/pgdata_backup")
        );
    }

    #[test]
    fn derived_names_follow_env_name_lazily() {
        let c = InstallConfig::new(conn().with_port(5430));
        assert_eq!(c.service_name(), "PgProvision_Postgresql");
        assert_eq!(c.firewall_rule_name(), "PgProvision_PG - open 5430");

        // Env name set after construction is reflected, nothing stale.
        let c = c.with_env_name("BrinvexDbaTest");
        assert_eq!(c.service_name(), "BrinvexDbaTest_Postgresql");
        assert_eq!(c.firewall_rule_name(), "BrinvexDbaTest_PG - open 5430");

        let c = c.with_service_name("pg-main").with_firewall_rule_name("pg in");
        assert_eq!(c.service_name(), "pg-main");
        assert_eq!(c.firewall_rule_name(), "pg in");
    }

    #[test]
    fn secret_is_never_printed() {
        let c = conn();
        let dbg = format!("{:?}", c);
        assert!(!dbg.contains("S3cr3t"), "secret leaked: {}", dbg);
        assert!(dbg.contains("***"));
    }

    #[test]
    fn require_super_pass_rejects_missing_and_blank() {
        assert!(ConnectionConfig::new("/x").require_super_pass().is_err());
        assert!(ConnectionConfig::new("/x")
            .with_super_pass("   ")
            .require_super_pass()
            .is_err());
        assert_eq!(conn().require_super_pass().unwrap().expose(), "S3cr3t!123");
    }

    #[test]
    fn parallelism_requires_directory_format() {
        let plain = conn()
            .with_backup_format(BackupFormat::Plain)
            .with_backup_restore_parallelism(4);
        assert!(matches!(
            plain.check_parallelism(),
            Err(ProvisionError::UnsupportedParallelism { parallelism: 4, .. })
        ));

        let dir = conn()
            .with_backup_format(BackupFormat::Directory)
            .with_backup_restore_parallelism(4);
        assert!(dir.check_parallelism().is_ok());
    }

    #[test]
    fn validate_rejects_zero_port_and_bad_identifiers() {
        assert!(conn().with_port(0).validate().is_err());

        let bad_user = InstallConfig::new(conn()).with_app_user("app; DROP", "x");
        assert!(bad_user.validate().is_err());

        let ok = InstallConfig::new(conn())
            .with_app_user("app1", "pw")
            .with_app_database("app1", "app1")
            .with_app_extensions(["uuid-ossp"]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn builders_deduplicate_sets() {
        let c = InstallConfig::new(conn())
            .with_allowed_client_addresses(["10.0.0.0/8", "10.0.0.0/8"])
            .with_allowed_client_addresses(["10.0.0.0/8"]);
        assert_eq!(c.allowed_client_addresses(), &["10.0.0.0/8".to_string()]);
    }

    #[test]
    fn load_config_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.toml");
        std::fs::write(
            &path,
            r#"
env_name = "test"
allowed_client_addresses = ["192.168.0.0/16"]
system_settings = ["max_connections = '100'"]

[connection]
port = 5430
super_pass = "pw"
home_path = "/srv/pg"
backup_format = "directory"
backup_restore_parallelism = 4

[app_users]
app1 = "app-pw"

[app_databases]
app1 = "app1"

[runtime]
command_timeout_secs = 60
"#,
        )
        .unwrap();

        let file = load_config_file(&path).unwrap();
        assert_eq!(file.install.env_name(), "test");
        assert_eq!(file.install.connection().port(), 5430);
        assert_eq!(
            file.install.connection().backup_format(),
            BackupFormat::Directory
        );
        assert_eq!(file.install.app_users()["app1"].expose(), "app-pw");
        assert_eq!(file.install.app_databases()["app1"], "app1");
        assert_eq!(file.runtime.command_timeout_secs, Some(60));
    }

    #[test]
    fn load_config_file_missing_is_config_error() {
        let err = load_config_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }

    #[test]
    fn sample_config_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.toml");
        std::fs::write(&path, render_sample_config().unwrap()).unwrap();
        let file = load_config_file(&path).unwrap();
        assert_eq!(file.install.env_name(), "Example");
        assert_eq!(file.install.connection().port(), 5430);
    }

    #[test]
    fn fdw_statements_quote_literals_and_hide_nothing_in_debug() {
        let fdw = FdwConfig {
            source_db: "app1".to_string(),
            source_db_user: "app1".to_string(),
            source_db_pass: Secret::new("a"),
            fdw_schema: "remote".to_string(),
            foreign_host: "db.example.org".to_string(),
            foreign_port: 5432,
            foreign_db: "ledger".to_string(),
            foreign_schema: "public".to_string(),
            foreign_user: "reader".to_string(),
            foreign_pass: Secret::new("it's"),
        };
        let stmts = fdw.setup_statements();
        assert_eq!(stmts.len(), 4);
        assert!(stmts[0].contains("db_example_org_ledger_fdw"));
        assert!(stmts[1].contains("password 'it''s'"));
        assert!(!format!("{:?}", fdw).contains("it's"));
    }
}
