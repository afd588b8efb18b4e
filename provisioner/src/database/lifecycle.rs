// Lifecycle operations usable on a running instance, independently of a full install:
// existence check, users, databases, extensions, system settings, backup, restore, drop and
// service restart.
//
// Every operation checks state before acting where a check exists, validates the tool's
// output against the psql markers, and propagates the first failure. A tool that fails to
// answer a check is an error, never a negative answer.

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::markers::{self, ExtensionOutcome, PsqlOp};
use super::tools;
use super::DbManager;
use crate::config::{ConnectionConfig, InstallConfig, Secret};
use crate::error::{ProvisionError, Result};
use crate::installation::files;
use crate::installation::service::{FirewallControl, ServiceControl};
use crate::installation::CommandRunner;
use crate::utils::validation::{validate_extension_name, validate_pg_identifier};

impl<R, H> DbManager<R, H>
where
    R: CommandRunner,
    H: ServiceControl + FirewallControl,
{
    /// True iff `SELECT 1 FROM pg_database WHERE datname=<db>` prints exactly `1`.
    pub async fn database_exists(&self, conn: &ConnectionConfig, db: &str) -> Result<bool> {
        validate_pg_identifier("database", db)?;
        let cmd = tools::psql_query_command(conn, &tools::database_exists_sql(db), "database_exists")?;
        let out = self.runner.run(&cmd).await?;
        if !out.success() {
            warn!(
                "[PHASE: lifecycle] [STEP: database_exists] Existence query exited with {:?}: {}",
                out.exit_code, out.stderr
            );
            return Err(cmd.failure(&out));
        }
        let exists = markers::is_exists_query_hit(&out);
        debug!(
            "[PHASE: lifecycle] [STEP: database_exists] {} exists={}",
            db, exists
        );
        Ok(exists)
    }

    /// Role names currently defined on the instance.
    pub async fn list_roles(&self, conn: &ConnectionConfig) -> Result<Vec<String>> {
        let cmd = tools::psql_query_command(conn, tools::LIST_ROLES_META_COMMAND, "list_roles")?;
        let out = self.runner.run(&cmd).await?;
        if !out.success() {
            return Err(cmd.failure(&out));
        }
        Ok(markers::parse_role_names(&out.stdout))
    }

    /// Create every user that does not exist yet. Returns how many were created.
    pub async fn create_app_db_users(
        &self,
        conn: &ConnectionConfig,
        users: &BTreeMap<String, Secret>,
    ) -> Result<usize> {
        if users.is_empty() {
            info!("[PHASE: lifecycle] [STEP: app_users] No app users to create");
            return Ok(0);
        }

        let existing = self.list_roles(conn).await?;
        let mut created = 0;
        for (user, pass) in users {
            validate_pg_identifier("user", user)?;
            if existing.iter().any(|r| r == user) {
                info!(
                    "[PHASE: lifecycle] [STEP: app_users] App user already exists: {}",
                    user
                );
                continue;
            }
            info!(
                "[PHASE: lifecycle] [STEP: app_users] Creating app user: {}",
                user
            );
            let cmd = tools::psql_super_command(conn, &tools::create_user_sql(user, pass), "create_role")?
                .secret(pass.expose());
            self.run_psql(&cmd, PsqlOp::CreateRole).await?;
            created += 1;
        }
        Ok(created)
    }

    /// Create every database that does not exist yet, owned by its mapped user.
    /// The owner role must already exist.
    pub async fn create_app_databases(
        &self,
        conn: &ConnectionConfig,
        databases: &BTreeMap<String, String>,
    ) -> Result<usize> {
        if databases.is_empty() {
            info!("[PHASE: lifecycle] [STEP: app_databases] No app databases to create");
            return Ok(0);
        }

        let mut created = 0;
        for (db, owner) in databases {
            if self.database_exists(conn, db).await? {
                info!(
                    "[PHASE: lifecycle] [STEP: app_databases] App database already exists: {}",
                    db
                );
                continue;
            }
            self.create_database(conn, db, owner).await?;
            created += 1;
        }
        Ok(created)
    }

    async fn create_database(&self, conn: &ConnectionConfig, db: &str, owner: &str) -> Result<()> {
        validate_pg_identifier("database", db)?;
        validate_pg_identifier("owner", owner)?;
        info!(
            "[PHASE: lifecycle] [STEP: create_database] Creating database {} (owner={})",
            db, owner
        );
        let cmd = tools::psql_super_command(
            conn,
            &tools::create_database_sql(db, owner),
            "create_database",
        )?;
        self.run_psql(&cmd, PsqlOp::CreateDatabase).await?;
        Ok(())
    }

    /// Create the superuser-scoped extensions in each database, clearing their comments.
    pub async fn create_super_extensions<'a, I>(
        &self,
        conn: &ConnectionConfig,
        databases: I,
        extensions: &[String],
    ) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if extensions.is_empty() {
            info!("[PHASE: lifecycle] [STEP: super_extensions] No super extensions to create");
            return Ok(());
        }
        let pass = conn.require_super_pass()?;
        for db in databases {
            self.create_extensions_in(
                conn,
                db,
                conn.super_user(),
                pass,
                extensions,
                PsqlOp::CreateSuperExtension,
            )
            .await?;
        }
        Ok(())
    }

    /// Create the application-scoped extensions in each database as its owner.
    /// The owner's password comes from `users`, keyed by the owner's name.
    pub async fn create_app_extensions(
        &self,
        conn: &ConnectionConfig,
        databases: &BTreeMap<String, String>,
        users: &BTreeMap<String, Secret>,
        extensions: &[String],
    ) -> Result<()> {
        if extensions.is_empty() {
            info!("[PHASE: lifecycle] [STEP: app_extensions] No app extensions to create");
            return Ok(());
        }
        for (db, owner) in databases {
            let pass = users.get(owner).ok_or_else(|| {
                ProvisionError::config(format!(
                    "No password configured for user '{}' (owner of database '{}'); cannot create app extensions",
                    owner, db
                ))
            })?;
            self.create_extensions_in(conn, db, owner, pass, extensions, PsqlOp::CreateAppExtension)
                .await?;
        }
        Ok(())
    }

    async fn create_extensions_in(
        &self,
        conn: &ConnectionConfig,
        db: &str,
        user: &str,
        pass: &Secret,
        extensions: &[String],
        op: PsqlOp,
    ) -> Result<()> {
        for extension in extensions {
            validate_extension_name(extension)?;
            info!(
                "[PHASE: lifecycle] [STEP: {}] Creating extension in {} (if not exists): {}",
                op.label(),
                db,
                extension
            );
            let sql = match op {
                PsqlOp::CreateSuperExtension => tools::create_super_extension_sql(extension),
                _ => tools::create_app_extension_sql(extension),
            };
            let cmd = tools::psql_command(conn, user, pass, db, &sql, op.label());
            let out = self.runner.run(&cmd).await?;
            match markers::extension_outcome(op, extension, &out) {
                ExtensionOutcome::Created => {}
                ExtensionOutcome::AlreadyExists => info!(
                    "[PHASE: lifecycle] [STEP: {}] Extension already exists in {}: {}",
                    op.label(),
                    db,
                    extension
                ),
                ExtensionOutcome::Failed => return Err(cmd.failure(&out)),
            }
        }
        Ok(())
    }

    /// `ALTER SYSTEM SET <setting>` for each raw assignment. Takes effect after a restart.
    pub async fn alter_system_settings(&self, conn: &ConnectionConfig, settings: &[String]) -> Result<()> {
        if settings.is_empty() {
            info!("[PHASE: lifecycle] [STEP: alter_system] No system settings to alter");
            return Ok(());
        }
        for setting in settings {
            info!(
                "[PHASE: lifecycle] [STEP: alter_system] Altering system setting: {}",
                setting
            );
            let cmd = tools::psql_super_command(conn, &tools::alter_system_sql(setting), "alter_system")?;
            self.run_psql(&cmd, PsqlOp::AlterSystem).await?;
        }
        Ok(())
    }

    /// Dump `db` to `destination`. pg_dump is silent on success; any output is a failure.
    pub async fn backup_database(&self, conn: &ConnectionConfig, db: &str, destination: &Path) -> Result<()> {
        conn.check_parallelism()?;
        validate_pg_identifier("database", db)?;
        let started = Instant::now();
        let destination = files::absolutize(destination)?;
        info!(
            "[PHASE: lifecycle] [STEP: backup] Backing up {} to {:?} (format={}, parallelism={})",
            db,
            destination,
            conn.backup_format(),
            conn.backup_restore_parallelism()
        );

        let cmd = tools::pg_dump_command(conn, db, &destination)?;
        let out = self.runner.run(&cmd).await?;
        if !out.success() || !out.is_silent() {
            return Err(cmd.failure(&out));
        }

        info!(
            "[PHASE: lifecycle] [STEP: backup] Backup of {} complete (duration_ms={})",
            db,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Restore `backup` into a new database `db` owned by `owner`.
    ///
    /// Fails with [`ProvisionError::DatabaseAlreadyExists`] before touching anything if `db`
    /// exists. Otherwise creates the database, its super extensions, then runs pg_restore.
    pub async fn restore_database(
        &self,
        conn: &ConnectionConfig,
        backup: &Path,
        db: &str,
        owner: &str,
    ) -> Result<()> {
        let exists = self.database_exists(conn, db).await?;
        info!(
            "[PHASE: lifecycle] [STEP: restore] Restore {} from {:?} (exists={})",
            db, backup, exists
        );
        if exists {
            return Err(ProvisionError::DatabaseAlreadyExists(db.to_string()));
        }

        self.create_database(conn, db, owner).await?;
        self.create_super_extensions(conn, [db], conn.super_extensions())
            .await?;

        let backup = files::absolutize(backup)?;
        let cmd = tools::pg_restore_command(conn, &backup, db, owner)?;
        let out = self.runner.run(&cmd).await?;
        if !out.success() || !out.is_silent() {
            return Err(cmd.failure(&out));
        }
        info!(
            "[PHASE: lifecycle] [STEP: restore] Restored {} from {:?}",
            db, backup
        );
        Ok(())
    }

    /// Back up `db` under the data backup folder, then force-drop it.
    /// The drop only runs after a successful backup. Returns the backup path.
    pub async fn backup_and_drop_database(&self, conn: &ConnectionConfig, db: &str) -> Result<PathBuf> {
        let parent = prepare_backup_parent(conn).await?;
        let destination = parent.join(format!("{}_{}.backup", db, files::backup_timestamp()));

        info!(
            "[PHASE: lifecycle] [STEP: backup_and_drop] Backing up {} before drop: {:?}",
            db, destination
        );
        self.backup_database(conn, db, &destination).await?;

        info!(
            "[PHASE: lifecycle] [STEP: backup_and_drop] Dropping {} after successful backup",
            db
        );
        self.risky_drop_database(conn, db).await?;
        Ok(destination)
    }

    /// Move the whole data directory to `<data>_backup/<data>_<ts>`. No-op when it is absent.
    pub async fn backup_all_db_data(&self, conn: &ConnectionConfig) -> Result<Option<PathBuf>> {
        let data = conn.data_path();
        if !files::path_exists(&data).await? {
            info!(
                "[PHASE: lifecycle] [STEP: backup_data] No data directory to back up: {:?}",
                data
            );
            return Ok(None);
        }

        let parent = prepare_backup_parent(conn).await?;
        let name = data
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "data".to_string());
        let destination = parent.join(format!("{}_{}", name, files::backup_timestamp()));

        info!(
            "[PHASE: lifecycle] [STEP: backup_data] Moving data directory to backup: {:?} -> {:?}",
            data, destination
        );
        files::move_path(&data, &destination).await?;
        Ok(Some(destination))
    }

    /// `DROP DATABASE ... WITH (FORCE)`, no existence check.
    pub async fn risky_drop_database(&self, conn: &ConnectionConfig, db: &str) -> Result<()> {
        validate_pg_identifier("database", db)?;
        warn!("[PHASE: lifecycle] [STEP: drop] Dropping database {}", db);
        let cmd = tools::psql_super_command(conn, &tools::drop_database_sql(db), "drop_database")?;
        self.run_psql(&cmd, PsqlOp::DropDatabase).await?;
        Ok(())
    }

    /// Stop (if running) and start the instance's service. The service must be registered.
    pub async fn restart_db_system(&self, conf: &InstallConfig) -> Result<()> {
        let name = conf.service_name();
        if !self.host.service_exists(&name).await? {
            return Err(ProvisionError::config(format!(
                "Cannot restart service '{}': it is not registered",
                name
            )));
        }
        if self.host.service_is_running(&name).await? {
            info!("[PHASE: lifecycle] [STEP: restart] Stopping service: {}", name);
            self.host.stop_service(&name).await?;
        }
        info!("[PHASE: lifecycle] [STEP: restart] Starting service: {}", name);
        self.host.start_service(&name).await
    }

    /// Restart only when the service exists and is running. Returns whether it restarted.
    pub async fn restart_db_system_if_running(&self, conf: &InstallConfig) -> Result<bool> {
        let name = conf.service_name();
        if !self.host.service_exists(&name).await? || !self.host.service_is_running(&name).await? {
            info!(
                "[PHASE: lifecycle] [STEP: restart] Service not running; restart skipped: {}",
                name
            );
            return Ok(false);
        }
        self.restart_db_system(conf).await?;
        Ok(true)
    }
}

/// `<data>_backup`, created if absent.
async fn prepare_backup_parent(conn: &ConnectionConfig) -> Result<PathBuf> {
    let parent = conn.data_backup_parent_path();
    if !files::ensure_dir(&parent).await? {
        debug!(
            "[PHASE: lifecycle] [STEP: backup_parent] Backup parent exists: {:?}",
            parent
        );
    }
    Ok(parent)
}
