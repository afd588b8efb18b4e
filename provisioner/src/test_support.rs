// Test doubles for the host capabilities.
//
// - `ScriptedRunner` answers every command from a closure and records what it was asked.
// - `FakeToolchain` emulates the installer, initdb, psql, pg_dump and pg_restore closely enough
//   for the engine's output checks: same command tags, same notices, same error shapes.
// - `FakeHost` keeps services and firewall rules in memory and records every mutation. Start and
//   stop can be made to settle only after a number of state queries.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::{ConnectionConfig, InstallConfig};
use crate::database::markers::extension_already_exists_notice;
use crate::database::tools::PGPASSWORD;
use crate::database::DbManager;
use crate::error::{ProvisionError, Result};
use crate::installation::pg_conf::{
    CONNECTION_SETTINGS_ANCHOR, HBA_ANCHOR, HBA_FILE_NAME, SERVER_CONF_FILE_NAME,
};
use crate::installation::service::{
    wait_for_service_state, FirewallControl, ServiceControl, ServiceState, StateWait,
};
use crate::installation::{CommandOutput, CommandRunner, CommandSpec};

pub const SUPER_PASS: &str = "superpw";
pub const PORT: u16 = 5430;

pub fn ok(stdout: &str) -> CommandOutput {
    exited(0, stdout, "")
}

pub fn exited(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        duration_ms: 0,
    }
}

pub fn manager(toolchain: FakeToolchain, host: FakeHost) -> DbManager<FakeToolchain, FakeHost> {
    DbManager::new(toolchain, host)
}

// ============================================================================
// ScriptedRunner
// ============================================================================

type Script = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

pub struct ScriptedRunner {
    script: Script,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
    {
        ScriptedRunner {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Program and arguments joined by single spaces.
    pub fn lines(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| {
                let mut parts = vec![c.program().to_string()];
                parts.extend(c.get_args().iter().cloned());
                parts.join(" ")
            })
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(cmd.clone());
        Ok((self.script)(cmd))
    }
}

// ============================================================================
// FakeToolchain
// ============================================================================

#[derive(Default)]
struct Catalog {
    /// role -> password (None: created outside the fake, any password accepted)
    roles: BTreeMap<String, Option<String>>,
    /// database -> owner
    databases: BTreeMap<String, String>,
    /// database -> extensions
    extensions: BTreeMap<String, BTreeSet<String>>,
    already_exists_notices: usize,
}

impl Catalog {
    fn bootstrap(&mut self, super_user: &str, super_pass: &str) {
        self.roles
            .insert(super_user.to_string(), Some(super_pass.to_string()));
        for db in ["postgres", "template0", "template1"] {
            self.databases.insert(db.to_string(), super_user.to_string());
        }
    }
}

#[derive(Default)]
struct ToolchainState {
    catalog: Catalog,
    calls: Vec<CommandSpec>,
    failures: Vec<(String, CommandOutput)>,
    last_pwfile: Option<PathBuf>,
    pwfile_contents: Option<String>,
}

pub struct FakeToolchain {
    root: PathBuf,
    state: Mutex<ToolchainState>,
}

impl FakeToolchain {
    /// A bare host: nothing installed, no cluster. The installer file exists.
    pub fn new(root: &Path) -> Self {
        let installer = root.join("installer.run");
        std::fs::write(&installer, "#!/bin/sh\n").unwrap();
        FakeToolchain {
            root: root.to_path_buf(),
            state: Mutex::new(ToolchainState::default()),
        }
    }

    /// An instance that is already up with the default catalog.
    pub fn running(root: &Path) -> Self {
        let toolchain = Self::new(root);
        let conn = toolchain.connection();
        toolchain
            .state
            .lock()
            .unwrap()
            .catalog
            .bootstrap(conn.super_user(), SUPER_PASS);
        toolchain
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.root.join("pg"))
            .with_port(PORT)
            .with_super_pass(SUPER_PASS)
    }

    pub fn installer_path(&self) -> PathBuf {
        self.root.join("installer.run")
    }

    pub fn install_config(&self) -> InstallConfig {
        InstallConfig::new(self.connection())
            .with_env_name("Test")
            .with_installer_path(self.installer_path())
    }

    pub fn add_role(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .catalog
            .roles
            .insert(name.to_string(), None);
    }

    pub fn add_database(&self, db: &str, owner: &str) {
        self.state
            .lock()
            .unwrap()
            .catalog
            .databases
            .insert(db.to_string(), owner.to_string());
    }

    /// The next command with this operation label returns the given output instead of running.
    pub fn fail_next(&self, operation: &str, code: i32, stdout: &str, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((operation.to_string(), exited(code, stdout, stderr)));
    }

    pub fn has_database(&self, db: &str) -> bool {
        self.state.lock().unwrap().catalog.databases.contains_key(db)
    }

    /// Sorted extension names present in `db`.
    pub fn extensions(&self, db: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .catalog
            .extensions
            .get(db)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn already_exists_notices(&self) -> usize {
        self.state.lock().unwrap().catalog.already_exists_notices
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn operations(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| c.operation().to_string())
            .collect()
    }

    pub fn count_operation(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    pub fn count_program(&self, program: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.program_name() == program)
            .count()
    }

    pub fn last_pwfile(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().last_pwfile.clone()
    }

    pub fn pwfile_contents(&self) -> Option<String> {
        self.state.lock().unwrap().pwfile_contents.clone()
    }

    fn installer(&self, cmd: &CommandSpec) -> CommandOutput {
        let (Some(prefix), Some(_)) = (cmd.arg_after("--prefix"), cmd.arg_after("--superpassword"))
        else {
            return exited(1, "", "installer: missing --prefix or --superpassword");
        };
        match std::fs::create_dir_all(Path::new(prefix).join("bin")) {
            Ok(()) => ok(""),
            Err(e) => exited(1, "", &format!("installer: {}", e)),
        }
    }

    fn initdb(&self, state: &mut ToolchainState, cmd: &CommandSpec) -> CommandOutput {
        let (Some(data), Some(user)) = (cmd.arg_after("-D"), cmd.arg_after("-U")) else {
            return exited(1, "", "initdb: error: no data directory specified");
        };
        let Some(pass) = state.pwfile_contents.clone() else {
            return exited(1, "", "initdb: error: could not read password file");
        };
        let data = Path::new(data);
        if data.exists() {
            return exited(1, "", "initdb: error: directory exists but is not empty");
        }
        let hba = format!(
            "# TYPE  DATABASE        USER            ADDRESS                 METHOD\n\nlocal   all             all                                     scram-sha-256\n{}\nhost    all             all             127.0.0.1/32            scram-sha-256\n",
            HBA_ANCHOR
        );
        let server_conf = format!(
            "#------------------------------------------------------------------------------\n# CONNECTIONS AND AUTHENTICATION\n#------------------------------------------------------------------------------\n\n{}\n\n#listen_addresses = 'localhost'\n#port = 5432\nmax_connections = 100\n",
            CONNECTION_SETTINGS_ANCHOR
        );
        let written = std::fs::create_dir_all(data)
            .and_then(|_| std::fs::write(data.join(HBA_FILE_NAME), hba))
            .and_then(|_| std::fs::write(data.join(SERVER_CONF_FILE_NAME), server_conf))
            .and_then(|_| std::fs::write(data.join("PG_VERSION"), "18\n"));
        if let Err(e) = written {
            return exited(1, "", &format!("initdb: error: {}", e));
        }
        state.catalog.bootstrap(user, &pass);
        ok("Success. You can now start the database server.")
    }

    fn psql(&self, catalog: &mut Catalog, cmd: &CommandSpec) -> CommandOutput {
        let user = cmd.arg_after("-U").unwrap_or_default();
        let pass = cmd.env_value(PGPASSWORD).unwrap_or_default();
        match catalog.roles.get(user) {
            None => {
                return exited(
                    2,
                    "",
                    &format!("psql: error: FATAL:  role \"{}\" does not exist", user),
                )
            }
            Some(Some(expected)) if expected != pass => {
                return exited(
                    2,
                    "",
                    &format!(
                        "psql: error: FATAL:  password authentication failed for user \"{}\"",
                        user
                    ),
                )
            }
            Some(_) => {}
        }
        let db = cmd.arg_after("-d").unwrap_or("postgres").to_string();
        if !catalog.databases.contains_key(&db) {
            return exited(
                2,
                "",
                &format!("psql: error: FATAL:  database \"{}\" does not exist", db),
            );
        }
        let sql = cmd.arg_after("-c").unwrap_or_default();

        if sql == "\\du" {
            let rows: Vec<String> = catalog
                .roles
                .keys()
                .map(|r| format!("{}||{{}}", r))
                .collect();
            return ok(&rows.join("\n"));
        }
        if let Some(rest) = sql.strip_prefix("SELECT 1 FROM pg_database WHERE datname=") {
            let name = unquote_literal(rest);
            return if catalog.databases.contains_key(&name) {
                ok("1")
            } else {
                ok("")
            };
        }
        if sql.starts_with("ALTER SYSTEM SET ") {
            return ok("ALTER SYSTEM");
        }
        if let Some(rest) = sql.strip_prefix("CREATE USER ") {
            let name = first_ident(rest);
            let password = rest
                .split_once(" WITH PASSWORD ")
                .map(|(_, p)| unquote_literal(p));
            if catalog.roles.contains_key(&name) {
                return exited(1, "", &format!("ERROR:  role \"{}\" already exists", name));
            }
            catalog.roles.insert(name, password);
            return ok("CREATE ROLE");
        }
        if let Some(rest) = sql.strip_prefix("CREATE DATABASE ") {
            let name = first_ident(rest);
            let owner = rest
                .split_once("OWNER=")
                .map(|(_, o)| first_ident(o))
                .unwrap_or_else(|| user.to_string());
            if !catalog.roles.contains_key(&owner) {
                return exited(1, "", &format!("ERROR:  role \"{}\" does not exist", owner));
            }
            if catalog.databases.contains_key(&name) {
                return exited(
                    1,
                    "",
                    &format!("ERROR:  database \"{}\" already exists", name),
                );
            }
            catalog.databases.insert(name, owner);
            return ok("CREATE DATABASE");
        }
        if let Some(rest) = sql.strip_prefix("CREATE EXTENSION IF NOT EXISTS ") {
            let name = first_ident(rest);
            let installed = catalog.extensions.entry(db).or_default();
            let stderr = if installed.insert(name.clone()) {
                String::new()
            } else {
                catalog.already_exists_notices += 1;
                extension_already_exists_notice(&name)
            };
            let stdout = if sql.contains("COMMENT ON EXTENSION") {
                "CREATE EXTENSION\nCOMMENT"
            } else {
                "CREATE EXTENSION"
            };
            return exited(0, stdout, &stderr);
        }
        if let Some(rest) = sql.strip_prefix("DROP DATABASE ") {
            let name = first_ident(rest);
            if catalog.databases.remove(&name).is_none() {
                return exited(
                    1,
                    "",
                    &format!("ERROR:  database \"{}\" does not exist", name),
                );
            }
            catalog.extensions.remove(&name);
            return ok("DROP DATABASE");
        }
        exited(1, "", &format!("ERROR:  syntax error at or near \"{}\"", sql))
    }

    fn pg_dump(&self, catalog: &Catalog, cmd: &CommandSpec) -> CommandOutput {
        let db = cmd
            .arg_after("-d")
            .and_then(|url| url.rsplit('/').next())
            .unwrap_or_default();
        if !catalog.databases.contains_key(db) {
            return exited(
                1,
                "",
                &format!("pg_dump: error: FATAL:  database \"{}\" does not exist", db),
            );
        }
        let Some(file) = cmd.arg_after("--file") else {
            return exited(1, "", "pg_dump: error: no output file");
        };
        match std::fs::write(file, format!("-- dump of {}\n", db)) {
            Ok(()) => ok(""),
            Err(e) => exited(1, "", &format!("pg_dump: error: {}", e)),
        }
    }

    fn pg_restore(&self, catalog: &Catalog, cmd: &CommandSpec) -> CommandOutput {
        let db = cmd.arg_after("-d").unwrap_or_default();
        if !catalog.databases.contains_key(db) {
            return exited(
                1,
                "",
                &format!("pg_restore: error: FATAL:  database \"{}\" does not exist", db),
            );
        }
        let backup = cmd.get_args().last().map(String::as_str).unwrap_or_default();
        if !Path::new(backup).exists() {
            return exited(
                1,
                "",
                &format!("pg_restore: error: could not open input file \"{}\"", backup),
            );
        }
        ok("")
    }
}

#[async_trait]
impl CommandRunner for FakeToolchain {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(cmd.clone());

        if cmd.operation() == "init_main_database" {
            let pwfile = cmd.arg_after("--pwfile").map(PathBuf::from);
            state.pwfile_contents = pwfile
                .as_deref()
                .and_then(|p| std::fs::read_to_string(p).ok());
            state.last_pwfile = pwfile;
        }

        if let Some(i) = state
            .failures
            .iter()
            .position(|(op, _)| op == cmd.operation())
        {
            let (_, out) = state.failures.remove(i);
            return Ok(out);
        }

        let out = match cmd.operation() {
            "install_db_system" => self.installer(cmd),
            "init_main_database" => self.initdb(&mut state, cmd),
            _ => match cmd.program_name().as_str() {
                "psql" => self.psql(&mut state.catalog, cmd),
                "pg_dump" => self.pg_dump(&state.catalog, cmd),
                "pg_restore" => self.pg_restore(&state.catalog, cmd),
                other => {
                    return Err(ProvisionError::io(
                        format!("Failed to spawn command '{}'", other),
                        std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                    ))
                }
            },
        };
        Ok(out)
    }
}

/// `"name" ...` -> `name`
fn first_ident(s: &str) -> String {
    let s = s.trim_start();
    match s.strip_prefix('"') {
        Some(rest) => rest.split('"').next().unwrap_or_default().to_string(),
        None => s
            .split(|c: char| c.is_whitespace() || c == ';')
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

/// `'it''s'` -> `it's`
fn unquote_literal(s: &str) -> String {
    let s = s.trim().trim_end_matches(';');
    let inner = s
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .unwrap_or(s);
    inner.replace("''", "'")
}

// ============================================================================
// FakeHost
// ============================================================================

#[derive(Default)]
pub struct FakeHost {
    /// name -> running, once settled
    services: Mutex<BTreeMap<String, bool>>,
    /// name -> state queries left before a start/stop settles
    pending: Mutex<BTreeMap<String, usize>>,
    settle_after: Mutex<usize>,
    state_queries: Mutex<usize>,
    rules: Mutex<BTreeMap<String, u16>>,
    mutations: Mutex<Vec<String>>,
}

impl FakeHost {
    /// Every later start/stop keeps reporting the previous state for `queries` state queries.
    pub fn slow_transitions(&self, queries: usize) {
        *self.settle_after.lock().unwrap() = queries;
    }

    pub fn state_queries(&self) -> usize {
        *self.state_queries.lock().unwrap()
    }

    /// Running as reported right now, consuming one pending query.
    fn observe(&self, name: &str) -> bool {
        *self.state_queries.lock().unwrap() += 1;
        let settled = self
            .services
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(false);
        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(name) {
            Some(left) if *left > 0 => {
                *left -= 1;
                !settled
            }
            _ => settled,
        }
    }

    fn in_transition(&self, name: &str) -> bool {
        self.pending
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|left| *left > 0)
    }

    fn quick_wait() -> StateWait {
        StateWait {
            timeout: std::time::Duration::from_secs(1),
            interval: std::time::Duration::ZERO,
        }
    }

    pub fn add_service(&self, name: &str, running: bool) {
        self.services
            .lock()
            .unwrap()
            .insert(name.to_string(), running);
    }

    /// `register <name>`, `start <name>`, `create_rule <name> <port>`...
    pub fn mutations(&self) -> Vec<String> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn clear_mutations(&self) {
        self.mutations.lock().unwrap().clear();
    }

    fn record(&self, mutation: String) {
        self.mutations.lock().unwrap().push(mutation);
    }

    fn refuse(operation: &str, message: String) -> ProvisionError {
        ProvisionError::ToolFailure {
            operation: operation.to_string(),
            command: operation.to_string(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: message,
        }
    }

    fn set_running(&self, operation: &str, name: &str, running: bool) -> Result<()> {
        if self.in_transition(name) {
            return Err(Self::refuse(
                operation,
                format!("service {} is changing state", name),
            ));
        }
        let mut services = self.services.lock().unwrap();
        match services.get_mut(name) {
            Some(state) => {
                if running && *state {
                    return Err(Self::refuse(
                        operation,
                        format!("An instance of the service {} is already running", name),
                    ));
                }
                *state = running;
                let settle_after = *self.settle_after.lock().unwrap();
                self.pending
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), settle_after);
                Ok(())
            }
            None => Err(Self::refuse(
                operation,
                format!("service {} does not exist", name),
            )),
        }
    }
}

#[async_trait]
impl ServiceControl for FakeHost {
    async fn service_exists(&self, name: &str) -> Result<bool> {
        Ok(self.services.lock().unwrap().contains_key(name))
    }

    async fn service_is_running(&self, name: &str) -> Result<bool> {
        Ok(self.observe(name))
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        self.set_running("start_service", name, true)?;
        self.record(format!("start {}", name));
        wait_for_service_state(self, name, ServiceState::Running, Self::quick_wait()).await
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        self.set_running("stop_service", name, false)?;
        self.record(format!("stop {}", name));
        wait_for_service_state(self, name, ServiceState::Stopped, Self::quick_wait()).await
    }

    async fn register_service(&self, name: &str, _data_dir: &Path) -> Result<()> {
        {
            let mut services = self.services.lock().unwrap();
            if services.contains_key(name) {
                return Err(Self::refuse(
                    "register_service",
                    format!("service {} already exists", name),
                ));
            }
            services.insert(name.to_string(), false);
        }
        self.record(format!("register {}", name));
        Ok(())
    }

    async fn unregister_service(&self, name: &str, _data_dir: &Path) -> Result<()> {
        if self.services.lock().unwrap().remove(name).is_none() {
            return Err(Self::refuse(
                "unregister_service",
                format!("service {} does not exist", name),
            ));
        }
        self.record(format!("unregister {}", name));
        Ok(())
    }
}

#[async_trait]
impl FirewallControl for FakeHost {
    async fn rule_exists(&self, name: &str) -> Result<bool> {
        Ok(self.rules.lock().unwrap().contains_key(name))
    }

    async fn create_tcp_open_rule(&self, name: &str, port: u16) -> Result<()> {
        self.rules.lock().unwrap().insert(name.to_string(), port);
        self.record(format!("create_rule {} {}", name, port));
        Ok(())
    }

    async fn remove_rule(&self, name: &str) -> Result<()> {
        self.rules.lock().unwrap().remove(name);
        self.record(format!("remove_rule {}", name));
        Ok(())
    }
}
