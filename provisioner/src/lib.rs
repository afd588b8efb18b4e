// pg-provision
// Idempotent PostgreSQL instance provisioning and lifecycle management: library entry point.

pub mod config;
pub mod database;
pub mod diagnostics;
pub mod error;
pub mod installation;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use database::DbManager;
pub use error::{ProvisionError, Result};

use anyhow::Context;
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;

use installation::service::platform_host_control;
use installation::SystemCommandRunner;

/// Initialize logging with dual format (JSON + human-readable), optionally mirrored to stdout.
/// Returns the log directory.
pub fn init_logging(with_stdout: bool, log_dir: Option<&Path>) -> anyhow::Result<PathBuf> {
    let log_dir = utils::path_resolver::resolve_log_folder(log_dir)?;

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");

    // JSON log file for structured parsing
    let json_log_file = log_dir.join(format!("pg-provision-{}.log", timestamp));

    // Human-readable log file (.txt)
    let txt_log_file = log_dir.join(format!("pg-provision-{}.txt", timestamp));

    let mut dispatch = fern::Dispatch::new().level(log::LevelFilter::Debug);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", txt_line));
                })
                .chain(fern::log_file(txt_log_file)?),
        );

    dispatch.apply()?;

    info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(log_dir)
}

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Install,
    Uninstall,
    Backup { db: String, out: PathBuf },
    Restore { db: String, owner: String, from: PathBuf },
    BackupAndDrop { db: String },
    Drop { db: String },
    Restart { if_running: bool },
    Exists { db: String },
    CreateUsers,
    CreateDatabases,
    DetectRuntimes { needle: String },
    SampleConfig,
}

impl Action {
    pub fn needs_config(&self) -> bool {
        !matches!(self, Action::DetectRuntimes { .. } | Action::SampleConfig)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub verbose: bool,
    pub log_dir: Option<PathBuf>,
}

/// Run one action to completion on a current-thread runtime.
pub fn run_action(action: &Action, opts: &RunOptions) -> anyhow::Result<()> {
    if *action == Action::SampleConfig {
        print!("{}", config::render_sample_config()?);
        return Ok(());
    }

    let file = match (action.needs_config(), opts.config.as_deref()) {
        (false, _) => None,
        (true, Some(path)) => Some(
            config::load_config_file(path)
                .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        ),
        (true, None) => anyhow::bail!("--config <file> is required for this command"),
    };

    let log_dir = opts
        .log_dir
        .clone()
        .or_else(|| file.as_ref().and_then(|f| f.runtime.log_dir.clone()));
    if let Err(e) = init_logging(opts.verbose, log_dir.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    info!(
        "[PHASE: initialization] pg-provision {} starting: {:?}",
        env!("CARGO_PKG_VERSION"),
        action
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;

    let result = rt.block_on(async {
        match file {
            None => run_diagnostic(action).await,
            Some(file) => run_with_config(action, file).await,
        }
    });

    if let Err(e) = &result {
        error!(
            "[PHASE: shutdown] [STEP: error] Command exited with error: {:?}",
            e
        );
    }
    result
}

async fn run_diagnostic(action: &Action) -> anyhow::Result<()> {
    if let Action::DetectRuntimes { needle } = action {
        let runner = SystemCommandRunner::new();
        for library in diagnostics::detect_runtime_libraries(&runner, needle).await {
            println!("{}", library);
        }
    }
    Ok(())
}

async fn run_with_config(action: &Action, file: config::ConfigFile) -> anyhow::Result<()> {
    let runner = Arc::new(SystemCommandRunner::with_timeout(
        file.runtime.command_timeout_secs.map(Duration::from_secs),
    ));
    let conf = &file.install;
    let conn = conf.connection();
    let manager = DbManager::new(runner.clone(), platform_host_control(runner, conf));

    match action {
        Action::Install => manager.install(conf).await?,
        Action::Uninstall => manager.uninstall(conf).await?,
        Action::Backup { db, out } => manager.backup_database(conn, db, out).await?,
        Action::Restore { db, owner, from } => {
            manager.restore_database(conn, from, db, owner).await?
        }
        Action::BackupAndDrop { db } => {
            let backup = manager.backup_and_drop_database(conn, db).await?;
            println!("{}", backup.display());
        }
        Action::Drop { db } => manager.risky_drop_database(conn, db).await?,
        Action::Restart { if_running: true } => {
            let restarted = manager.restart_db_system_if_running(conf).await?;
            println!("{}", if restarted { "restarted" } else { "not running" });
        }
        Action::Restart { if_running: false } => manager.restart_db_system(conf).await?,
        Action::Exists { db } => println!("{}", manager.database_exists(conn, db).await?),
        Action::CreateUsers => {
            let created = manager.create_app_db_users(conn, conf.app_users()).await?;
            println!("created {} user(s)", created);
        }
        Action::CreateDatabases => {
            let created = manager
                .create_app_databases(conn, conf.app_databases())
                .await?;
            println!("created {} database(s)", created);
        }
        Action::DetectRuntimes { .. } | Action::SampleConfig => run_diagnostic(action).await?,
    }
    Ok(())
}
