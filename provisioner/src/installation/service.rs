// Service and firewall control
//
// Two capability traits sit between the provisioning engine and the host: `ServiceControl`
// (exists / running / start / stop / register / unregister) and `FirewallControl`
// (exists / create / remove). Queries never mutate. Mutations are not idempotent on their own;
// the engine always queries first. Start and stop return only once the service has settled in
// the requested state, so a restart never races a pending stop.
//
// Backends:
// - Windows: sc.exe for state, pg_ctl.exe register/unregister, netsh advfirewall for rules.
// - Linux: a forking systemd unit per instance driving `pg_ctl -w` (systemctl through
//   `sudo -n` when not root), ufw rules tagged with the rule name as their comment.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::InstallConfig;
use crate::error::{ProvisionError, Result};
use crate::installation::{files, CommandOutput, CommandRunner, CommandSpec};

#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn service_exists(&self, name: &str) -> Result<bool>;
    async fn service_is_running(&self, name: &str) -> Result<bool>;
    /// Fully stopped. Pending states are neither running nor stopped.
    async fn service_is_stopped(&self, name: &str) -> Result<bool> {
        Ok(!self.service_is_running(name).await?)
    }
    async fn start_service(&self, name: &str) -> Result<()>;
    async fn stop_service(&self, name: &str) -> Result<()>;
    /// Register a service that runs the engine on `data_dir`.
    async fn register_service(&self, name: &str, data_dir: &Path) -> Result<()>;
    async fn unregister_service(&self, name: &str, data_dir: &Path) -> Result<()>;
}

#[async_trait]
pub trait FirewallControl: Send + Sync {
    async fn rule_exists(&self, name: &str) -> Result<bool>;
    /// Open inbound TCP `port` under the rule `name`.
    async fn create_tcp_open_rule(&self, name: &str, port: u16) -> Result<()>;
    async fn remove_rule(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Bounds for waiting on a service after start/stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateWait {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for StateWait {
    fn default() -> Self {
        StateWait {
            timeout: Duration::from_secs(300),
            interval: Duration::from_millis(500),
        }
    }
}

/// Poll `host` until `name` reports `want`. Fails with `Timeout` once `wait.timeout` has passed.
pub async fn wait_for_service_state<S>(
    host: &S,
    name: &str,
    want: ServiceState,
    wait: StateWait,
) -> Result<()>
where
    S: ServiceControl + ?Sized,
{
    let started = Instant::now();
    let mut polls = 0u32;
    loop {
        polls += 1;
        let reached = match want {
            ServiceState::Running => host.service_is_running(name).await?,
            ServiceState::Stopped => host.service_is_stopped(name).await?,
        };
        if reached {
            debug!(
                "[PHASE: host] [STEP: wait_state] {} is {} (polls={}, duration_ms={})",
                name,
                want,
                polls,
                started.elapsed().as_millis()
            );
            return Ok(());
        }
        if started.elapsed() >= wait.timeout {
            warn!(
                "[PHASE: host] [STEP: wait_state] {} did not become {} within {}ms",
                name,
                want,
                wait.timeout.as_millis()
            );
            return Err(ProvisionError::Timeout {
                command: format!("wait for service {} to be {}", name, want),
                timeout_ms: wait.timeout.as_millis(),
            });
        }
        tokio::time::sleep(wait.interval).await;
    }
}

/// Run `cmd` and require exit code 0.
async fn run_checked<R: CommandRunner>(runner: &R, cmd: &CommandSpec) -> Result<CommandOutput> {
    let out = runner.run(cmd).await?;
    if !out.success() {
        warn!(
            "[PHASE: host] [STEP: {}] Command failed (exit_code={:?}, stderr={})",
            cmd.operation(),
            out.exit_code,
            out.stderr
        );
        return Err(cmd.failure(&out));
    }
    Ok(out)
}

#[cfg(windows)]
pub type PlatformHostControl<R> = WindowsHostControl<R>;
#[cfg(not(windows))]
pub type PlatformHostControl<R> = SystemdHostControl<R>;

/// Host controller for the current platform, configured from `config`.
pub fn platform_host_control<R: CommandRunner>(
    runner: R,
    config: &InstallConfig,
) -> PlatformHostControl<R> {
    #[cfg(windows)]
    {
        WindowsHostControl::new(runner, config.connection().tool("pg_ctl"))
    }
    #[cfg(not(windows))]
    {
        SystemdHostControl::new(
            runner,
            config.connection().tool("pg_ctl"),
            config.service_user().map(str::to_string),
        )
    }
}

// ============================================================================
// Windows: sc.exe + pg_ctl + netsh
// ============================================================================

/// `sc query` exit code for an unknown service.
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;

/// State name from `sc query` output, e.g. `STATE              : 3  STOP_PENDING`.
pub fn parse_sc_state(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "STATE" {
            return None;
        }
        value.split_whitespace().nth(1).map(str::to_ascii_uppercase)
    })
}

pub struct WindowsHostControl<R> {
    runner: R,
    pg_ctl: PathBuf,
    wait: StateWait,
}

impl<R: CommandRunner> WindowsHostControl<R> {
    pub fn new(runner: R, pg_ctl: PathBuf) -> Self {
        WindowsHostControl {
            runner,
            pg_ctl,
            wait: StateWait::default(),
        }
    }

    pub fn with_state_wait(mut self, wait: StateWait) -> Self {
        self.wait = wait;
        self
    }

    fn sc(&self, verb: &str, name: &str) -> CommandSpec {
        CommandSpec::new("sc.exe", &format!("sc_{}", verb)).args([verb, name])
    }

    fn netsh_rule(&self, verb: &str, name: &str) -> CommandSpec {
        CommandSpec::new("netsh", &format!("netsh_{}_rule", verb)).args([
            "advfirewall".to_string(),
            "firewall".to_string(),
            verb.to_string(),
            "rule".to_string(),
            format!("name={}", name),
        ])
    }
}

#[async_trait]
impl<R: CommandRunner> ServiceControl for WindowsHostControl<R> {
    async fn service_exists(&self, name: &str) -> Result<bool> {
        // `sc query` exits non-zero (1060) for an unknown service.
        let out = self.runner.run(&self.sc("query", name)).await?;
        Ok(out.success())
    }

    async fn service_is_running(&self, name: &str) -> Result<bool> {
        let out = self.runner.run(&self.sc("query", name)).await?;
        Ok(out.success() && parse_sc_state(&out.stdout).as_deref() == Some("RUNNING"))
    }

    async fn service_is_stopped(&self, name: &str) -> Result<bool> {
        let cmd = self.sc("query", name);
        let out = self.runner.run(&cmd).await?;
        if !out.success() {
            if out.exit_code == Some(ERROR_SERVICE_DOES_NOT_EXIST) {
                return Ok(true);
            }
            return Err(cmd.failure(&out));
        }
        Ok(parse_sc_state(&out.stdout).as_deref() == Some("STOPPED"))
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        // sc.exe returns while the service is still START_PENDING. pg_ctl's service reports
        // RUNNING once the server accepts connections.
        run_checked(&self.runner, &self.sc("start", name)).await?;
        wait_for_service_state(self, name, ServiceState::Running, self.wait).await
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        run_checked(&self.runner, &self.sc("stop", name)).await?;
        wait_for_service_state(self, name, ServiceState::Stopped, self.wait).await
    }

    async fn register_service(&self, name: &str, data_dir: &Path) -> Result<()> {
        let cmd = CommandSpec::new(&self.pg_ctl, "pg_ctl_register")
            .args(["register", "-N", name, "-D"])
            .arg(data_dir.to_string_lossy());
        run_checked(&self.runner, &cmd).await?;
        Ok(())
    }

    async fn unregister_service(&self, name: &str, data_dir: &Path) -> Result<()> {
        let cmd = CommandSpec::new(&self.pg_ctl, "pg_ctl_unregister")
            .args(["unregister", "-N", name, "-D"])
            .arg(data_dir.to_string_lossy());
        run_checked(&self.runner, &cmd).await?;
        Ok(())
    }
}

#[async_trait]
impl<R: CommandRunner> FirewallControl for WindowsHostControl<R> {
    async fn rule_exists(&self, name: &str) -> Result<bool> {
        // "No rules match the specified criteria." comes with exit code 1.
        let out = self.runner.run(&self.netsh_rule("show", name)).await?;
        Ok(out.success())
    }

    async fn create_tcp_open_rule(&self, name: &str, port: u16) -> Result<()> {
        let cmd = self.netsh_rule("add", name).args([
            "dir=in".to_string(),
            "action=allow".to_string(),
            "protocol=TCP".to_string(),
            format!("localport={}", port),
        ]);
        run_checked(&self.runner, &cmd).await?;
        Ok(())
    }

    async fn remove_rule(&self, name: &str) -> Result<()> {
        run_checked(&self.runner, &self.netsh_rule("delete", name)).await?;
        Ok(())
    }
}

// ============================================================================
// Linux: systemd + ufw
// ============================================================================

const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// `pg_ctl -w -t` bound for startup and shutdown, mirrored in the unit's `TimeoutSec=`.
const PG_CTL_WAIT_SECS: u32 = 300;

/// Build the systemd unit for one PostgreSQL instance.
///
/// `pg_ctl -w` under `Type=forking` makes `systemctl start` return only once the server
/// accepts connections, and `systemctl stop` only once it has shut down.
/// Pure so it can be tested on any OS. Paths containing spaces are quoted.
pub fn build_systemd_unit_text(
    service_name: &str,
    pg_ctl: &Path,
    data_dir: &Path,
    user: Option<&str>,
) -> String {
    let exec_quoted = quote_systemd_path(&pg_ctl.to_string_lossy());
    let data_quoted = quote_systemd_path(&data_dir.to_string_lossy());
    let pid_file = data_dir.join("postmaster.pid");

    let user_line = match user {
        Some(u) => format!("User={}\n", u),
        None => String::new(),
    };

    format!(
        r#"[Unit]
Description=PostgreSQL instance ({service_name})
After=network.target

[Service]
Type=forking
PIDFile={pid_file}
ExecStart={exec_quoted} start -D {data_quoted} -w -t {wait} -s
ExecStop={exec_quoted} stop -D {data_quoted} -m fast -w -t {wait} -s
ExecReload={exec_quoted} reload -D {data_quoted} -s
TimeoutSec={wait}
Restart=on-failure
RestartSec=5
{user_line}
[Install]
WantedBy=multi-user.target
"#,
        service_name = service_name,
        pid_file = pid_file.to_string_lossy(),
        exec_quoted = exec_quoted,
        data_quoted = data_quoted,
        wait = PG_CTL_WAIT_SECS,
        user_line = user_line.trim_end(),
    )
}

fn quote_systemd_path(path: &str) -> String {
    if path.contains(' ') || path.contains('\t') || path.contains('"') {
        format!("\"{}\"", path.replace('"', "\\\""))
    } else {
        path.to_string()
    }
}

/// Value of `LoadState=` in `systemctl show -p LoadState` output.
pub fn parse_load_state(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix("LoadState=")
            .map(|v| v.trim().to_string())
    })
}

/// Numbers of the `ufw status numbered` rules whose comment is exactly `rule_name`,
/// highest first so they can be deleted without renumbering the rest.
///
/// ```text
/// [ 1] 5432/tcp                   ALLOW IN    Anywhere                   # Prod_PG - open 5432
/// ```
pub fn parse_ufw_rule_numbers(stdout: &str, rule_name: &str) -> Vec<u32> {
    let mut numbers: Vec<u32> = stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix('[')?;
            let (num, rule) = rest.split_once(']')?;
            let (_, comment) = rule.split_once('#')?;
            if comment.trim() != rule_name {
                return None;
            }
            num.trim().parse::<u32>().ok()
        })
        .collect();
    numbers.sort_unstable_by(|a, b| b.cmp(a));
    numbers.dedup();
    numbers
}

#[cfg(target_os = "linux")]
fn is_running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(target_os = "linux"))]
fn is_running_as_root() -> bool {
    false
}

pub struct SystemdHostControl<R> {
    runner: R,
    pg_ctl: PathBuf,
    service_user: Option<String>,
    unit_dir: PathBuf,
    ufw: PathBuf,
    use_sudo: bool,
    wait: StateWait,
}

impl<R: CommandRunner> SystemdHostControl<R> {
    pub fn new(runner: R, pg_ctl: PathBuf, service_user: Option<String>) -> Self {
        let ufw = match which::which("ufw") {
            Ok(p) => p,
            Err(e) => {
                debug!(
                    "[PHASE: host] [STEP: ufw] ufw not found on PATH ({}); using bare name",
                    e
                );
                PathBuf::from("ufw")
            }
        };
        if service_user.is_none() {
            warn!("[PHASE: host] [STEP: systemd] No service user configured; postgres refuses to start as root");
        }
        SystemdHostControl {
            runner,
            pg_ctl,
            service_user,
            unit_dir: PathBuf::from(SYSTEMD_UNIT_DIR),
            ufw,
            use_sudo: !is_running_as_root(),
            wait: StateWait::default(),
        }
    }

    pub fn with_state_wait(mut self, wait: StateWait) -> Self {
        self.wait = wait;
        self
    }

    /// Write units somewhere other than /etc/systemd/system (tests, user units).
    pub fn with_unit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.unit_dir = dir.into();
        self
    }

    pub fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    pub fn unit_path(&self, service_name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.service", service_name))
    }

    /// `program args...`, prefixed with `sudo -n` when not root.
    fn privileged(&self, program: &Path, operation: &str) -> CommandSpec {
        if self.use_sudo {
            CommandSpec::new("sudo", operation)
                .arg("-n")
                .arg(program.to_string_lossy())
        } else {
            CommandSpec::new(program, operation)
        }
    }

    fn systemctl<'a>(&self, args: impl IntoIterator<Item = &'a str>, operation: &str) -> CommandSpec {
        self.privileged(Path::new("systemctl"), operation)
            .args(args)
            .arg("--no-pager")
    }

    async fn write_unit(&self, path: &Path, content: &str) -> Result<()> {
        if !self.use_sudo {
            return files::write_string(path, content).await;
        }
        // Stage in a temp file, then let `install` place it with the right mode.
        let staged = tempfile::Builder::new()
            .prefix("pg-provision-unit-")
            .tempfile()
            .map_err(|e| ProvisionError::io("create staged unit file", e))?;
        files::write_string(staged.path(), content).await?;
        let cmd = self
            .privileged(Path::new("install"), "install_unit")
            .args(["-m", "0644", "--"])
            .arg(staged.path().to_string_lossy())
            .arg(path.to_string_lossy());
        run_checked(&self.runner, &cmd).await?;
        Ok(())
    }

    async fn remove_unit(&self, path: &Path) -> Result<()> {
        if !self.use_sudo {
            if files::path_exists(path).await? {
                tokio::fs::remove_file(path)
                    .await
                    .map_err(|e| ProvisionError::fs("remove_file", path, e))?;
            }
            return Ok(());
        }
        let cmd = self
            .privileged(Path::new("rm"), "remove_unit")
            .args(["-f", "--"])
            .arg(path.to_string_lossy());
        run_checked(&self.runner, &cmd).await?;
        Ok(())
    }

    async fn ufw_numbered(&self) -> Result<String> {
        let cmd = self
            .privileged(&self.ufw, "ufw_status")
            .args(["status", "numbered"]);
        Ok(run_checked(&self.runner, &cmd).await?.stdout)
    }
}

#[async_trait]
impl<R: CommandRunner> ServiceControl for SystemdHostControl<R> {
    async fn service_exists(&self, name: &str) -> Result<bool> {
        let unit = format!("{}.service", name);
        let out = self
            .runner
            .run(&self.systemctl(["show", unit.as_str(), "-p", "LoadState"], "systemctl_show"))
            .await?;
        let state = parse_load_state(&out.stdout);
        debug!(
            "[PHASE: host] [STEP: systemd] service_exists (service_name={}, load_state={:?})",
            name, state
        );
        Ok(out.success() && state.as_deref() == Some("loaded"))
    }

    async fn service_is_running(&self, name: &str) -> Result<bool> {
        // Non-zero exit just means "not active".
        let out = self
            .runner
            .run(&self.systemctl(["is-active", name], "systemctl_is_active"))
            .await?;
        Ok(out.stdout.trim().eq_ignore_ascii_case("active"))
    }

    async fn service_is_stopped(&self, name: &str) -> Result<bool> {
        let out = self
            .runner
            .run(&self.systemctl(["is-active", name], "systemctl_is_active"))
            .await?;
        let state = out.stdout.trim().to_ascii_lowercase();
        Ok(state == "inactive" || state == "failed")
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        run_checked(&self.runner, &self.systemctl(["start", name], "systemctl_start")).await?;
        wait_for_service_state(self, name, ServiceState::Running, self.wait).await
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        run_checked(&self.runner, &self.systemctl(["stop", name], "systemctl_stop")).await?;
        wait_for_service_state(self, name, ServiceState::Stopped, self.wait).await
    }

    async fn register_service(&self, name: &str, data_dir: &Path) -> Result<()> {
        let started = Instant::now();
        let unit_path = self.unit_path(name);
        let unit = build_systemd_unit_text(
            name,
            &self.pg_ctl,
            data_dir,
            self.service_user.as_deref(),
        );
        self.write_unit(&unit_path, &unit).await?;
        info!(
            "[PHASE: host] [STEP: systemd] Wrote systemd unit file: {:?}",
            unit_path
        );

        run_checked(&self.runner, &self.systemctl(["daemon-reload"], "daemon_reload")).await?;
        run_checked(&self.runner, &self.systemctl(["enable", name], "systemctl_enable")).await?;

        info!(
            "[PHASE: host] [STEP: systemd] register_service exit ok (service_name={}, duration_ms={})",
            name,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn unregister_service(&self, name: &str, _data_dir: &Path) -> Result<()> {
        run_checked(&self.runner, &self.systemctl(["disable", name], "systemctl_disable")).await?;
        let unit_path = self.unit_path(name);
        self.remove_unit(&unit_path).await?;
        run_checked(&self.runner, &self.systemctl(["daemon-reload"], "daemon_reload")).await?;
        info!(
            "[PHASE: host] [STEP: systemd] Removed systemd unit {:?}",
            unit_path
        );
        Ok(())
    }
}

#[async_trait]
impl<R: CommandRunner> FirewallControl for SystemdHostControl<R> {
    async fn rule_exists(&self, name: &str) -> Result<bool> {
        let status = self.ufw_numbered().await?;
        Ok(!parse_ufw_rule_numbers(&status, name).is_empty())
    }

    async fn create_tcp_open_rule(&self, name: &str, port: u16) -> Result<()> {
        let cmd = self
            .privileged(&self.ufw, "ufw_allow")
            .arg("allow")
            .arg(format!("{}/tcp", port))
            .args(["comment", name]);
        run_checked(&self.runner, &cmd).await?;
        Ok(())
    }

    async fn remove_rule(&self, name: &str) -> Result<()> {
        let status = self.ufw_numbered().await?;
        for number in parse_ufw_rule_numbers(&status, name) {
            let cmd = self
                .privileged(&self.ufw, "ufw_delete")
                .args(["--force", "delete"])
                .arg(number.to_string());
            run_checked(&self.runner, &cmd).await?;
            debug!(
                "[PHASE: host] [STEP: ufw] Deleted rule #{} ({})",
                number, name
            );
        }
        Ok(())
    }
}
