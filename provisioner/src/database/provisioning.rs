// Instance provisioning: install / uninstall
//
// Install runs a fixed sequence of steps. Each step looks at the current state first and is
// skipped (with an "already ..." log line) when its target state already holds, so the whole
// sequence can be re-run after any failure. Nothing is rolled back: the first failing step
// aborts the sequence and the error carries the command and its captured output.
//
// Order matters:
// - the cluster needs the binaries, the service needs the cluster;
// - connection settings are patched before the first restart;
// - roles exist before the databases they own, databases before their extensions.

use log::info;
use std::time::Instant;

use super::tools;
use super::DbManager;
use crate::config::{ConnectionConfig, InstallConfig};
use crate::error::{ProvisionError, Result};
use crate::installation::files::{self, CredentialFile};
use crate::installation::pg_conf;
use crate::installation::service::{FirewallControl, ServiceControl};
use crate::installation::CommandRunner;

impl<R, H> DbManager<R, H>
where
    R: CommandRunner,
    H: ServiceControl + FirewallControl,
{
    pub async fn install(&self, conf: &InstallConfig) -> Result<()> {
        let started = Instant::now();
        conf.validate()?;
        let conn = conf.connection();
        let service = conf.service_name();
        info!(
            "[PHASE: install] [STEP: start] Installing instance (env={}, service={}, port={}, home={:?})",
            conf.env_name(),
            service,
            conn.port(),
            conn.home_path()
        );

        self.init_home_folder(conn).await?;
        self.install_db_system(conf).await?;
        self.init_main_database(conn, conf.locale()).await?;
        self.register_service(conf).await?;
        self.start_service(&service).await?;
        self.allow_client_addresses(conf).await?;
        self.alter_connection_settings(conf).await?;
        self.restart_db_system(conf).await?;
        self.alter_system_settings(conn, conf.system_settings()).await?;
        self.create_app_db_users(conn, conf.app_users()).await?;
        self.create_app_databases(conn, conf.app_databases()).await?;
        self.create_super_extensions(
            conn,
            conf.app_databases().keys().map(String::as_str),
            conn.super_extensions(),
        )
        .await?;
        self.create_app_extensions(
            conn,
            conf.app_databases(),
            conf.app_users(),
            conf.app_extensions(),
        )
        .await?;
        self.create_firewall_rule(conf).await?;
        self.restart_db_system(conf).await?;

        info!(
            "[PHASE: install] [STEP: done] Install successful (service={}, duration_ms={})",
            service,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    pub async fn uninstall(&self, conf: &InstallConfig) -> Result<()> {
        let started = Instant::now();
        let conn = conf.connection();
        info!(
            "[PHASE: uninstall] [STEP: start] Uninstalling instance (env={}, service={})",
            conf.env_name(),
            conf.service_name()
        );

        self.unregister_service(conf).await?;
        self.backup_all_db_data(conn).await?;
        self.uninstall_db_system(conn).await?;
        self.remove_firewall_rule(conf).await?;

        info!(
            "[PHASE: uninstall] [STEP: done] Uninstall successful (duration_ms={})",
            started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn init_home_folder(&self, conn: &ConnectionConfig) -> Result<()> {
        if !files::ensure_dir(conn.home_path()).await? {
            info!(
                "[PHASE: install] [STEP: home] Home folder already exists: {:?}",
                conn.home_path()
            );
        }
        Ok(())
    }

    /// Extract the engine binaries with the installer unless the system folder exists.
    async fn install_db_system(&self, conf: &InstallConfig) -> Result<()> {
        let conn = conf.connection();
        let system = files::absolutize(&conn.system_path())?;
        if files::path_exists(&system).await? {
            info!(
                "[PHASE: install] [STEP: db_system] System folder already exists; skipping installer: {:?}",
                system
            );
            return Ok(());
        }

        let installer = conf
            .installer_path()
            .ok_or_else(|| ProvisionError::config("Installer path is not configured"))?;
        if !files::path_exists(installer).await? {
            return Err(ProvisionError::config(format!(
                "Installer not found: {:?}",
                installer
            )));
        }
        let pass = conn.require_super_pass()?;

        info!(
            "[PHASE: install] [STEP: db_system] Extracting installer {:?} into {:?}",
            installer, system
        );
        let cmd = tools::installer_command(installer, &system, conn.super_user(), pass);
        let out = self.runner.run(&cmd).await?;
        if !out.success() || !files::path_exists(&system).await? {
            return Err(cmd.failure(&out));
        }
        Ok(())
    }

    /// initdb unless the data folder exists. The superuser password goes through a
    /// credential file that is removed before this returns, whatever initdb did.
    async fn init_main_database(&self, conn: &ConnectionConfig, locale: &str) -> Result<()> {
        let data = conn.data_path();
        if files::path_exists(&data).await? {
            info!(
                "[PHASE: install] [STEP: initdb] Data folder already exists; skipping cluster initialisation: {:?}",
                data
            );
            return Ok(());
        }

        let pass = conn.require_super_pass()?;
        let pwfile_dir = data
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| conn.home_path().to_path_buf());
        files::ensure_dir(&pwfile_dir).await?;

        info!(
            "[PHASE: install] [STEP: initdb] Initialising cluster (data={:?}, locale={})",
            data, locale
        );
        let credential = CredentialFile::create_in(&pwfile_dir, pass)?;
        let cmd = tools::initdb_command(conn, credential.path(), locale);
        let result = self.runner.run(&cmd).await;
        let cleanup = credential.remove();
        let out = result?;
        cleanup?;

        if !out.success() || !files::path_exists(&data).await? {
            return Err(cmd.failure(&out));
        }
        Ok(())
    }

    async fn register_service(&self, conf: &InstallConfig) -> Result<()> {
        let name = conf.service_name();
        if self.host.service_exists(&name).await? {
            info!(
                "[PHASE: install] [STEP: service] Service already exists: {}",
                name
            );
            return Ok(());
        }
        info!("[PHASE: install] [STEP: service] Registering service: {}", name);
        self.host
            .register_service(&name, &conf.connection().data_path())
            .await
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        if self.host.service_is_running(name).await? {
            info!(
                "[PHASE: install] [STEP: service] Service already running: {}",
                name
            );
            return Ok(());
        }
        info!("[PHASE: install] [STEP: service] Starting service: {}", name);
        self.host.start_service(name).await
    }

    async fn allow_client_addresses(&self, conf: &InstallConfig) -> Result<()> {
        let addresses = conf.allowed_client_addresses();
        if addresses.is_empty() {
            info!("[PHASE: install] [STEP: pg_hba] No client addresses to allow");
            return Ok(());
        }
        info!(
            "[PHASE: install] [STEP: pg_hba] Allowing client addresses: {:?}",
            addresses
        );
        pg_conf::apply_hba(&conf.connection().data_path(), addresses).await?;
        Ok(())
    }

    async fn alter_connection_settings(&self, conf: &InstallConfig) -> Result<()> {
        let conn = conf.connection();
        info!(
            "[PHASE: install] [STEP: connection_settings] listen_addresses={}, port={}",
            conf.listen_addresses(),
            conn.port()
        );
        pg_conf::apply_server_conf(&conn.data_path(), conn.port(), conf.listen_addresses()).await?;
        Ok(())
    }

    async fn create_firewall_rule(&self, conf: &InstallConfig) -> Result<()> {
        let rule = conf.firewall_rule_name();
        if self.host.rule_exists(&rule).await? {
            info!(
                "[PHASE: install] [STEP: firewall] Firewall rule already exists: {}",
                rule
            );
            return Ok(());
        }
        info!(
            "[PHASE: install] [STEP: firewall] Creating firewall rule: {}",
            rule
        );
        self.host
            .create_tcp_open_rule(&rule, conf.connection().port())
            .await
    }

    async fn unregister_service(&self, conf: &InstallConfig) -> Result<()> {
        let name = conf.service_name();
        if !self.host.service_exists(&name).await? {
            info!(
                "[PHASE: uninstall] [STEP: service] Service already unregistered: {}",
                name
            );
            return Ok(());
        }
        if self.host.service_is_running(&name).await? {
            info!("[PHASE: uninstall] [STEP: service] Stopping service: {}", name);
            self.host.stop_service(&name).await?;
        }
        info!(
            "[PHASE: uninstall] [STEP: service] Unregistering service: {}",
            name
        );
        self.host
            .unregister_service(&name, &conf.connection().data_path())
            .await
    }

    async fn uninstall_db_system(&self, conn: &ConnectionConfig) -> Result<()> {
        let system = conn.system_path();
        let removed = files::delete_dir_recursive(&system).await?;
        if removed == 0 {
            info!(
                "[PHASE: uninstall] [STEP: db_system] System folder does not exist: {:?}",
                system
            );
        }
        Ok(())
    }

    async fn remove_firewall_rule(&self, conf: &InstallConfig) -> Result<()> {
        let rule = conf.firewall_rule_name();
        if !self.host.rule_exists(&rule).await? {
            info!(
                "[PHASE: uninstall] [STEP: firewall] Firewall rule does not exist: {}",
                rule
            );
            return Ok(());
        }
        info!(
            "[PHASE: uninstall] [STEP: firewall] Removing firewall rule: {}",
            rule
        );
        self.host.remove_rule(&rule).await
    }
}
