use std::path::PathBuf;

use pg_provision::diagnostics::DEFAULT_RUNTIME_NEEDLE;
use pg_provision::{run_action, Action, RunOptions};

const USAGE: &str = "\
Usage: pg-provision <command> [options]

Commands:
  install            --config <file>
  uninstall          --config <file>
  backup             --config <file> --db <name> --out <path>
  restore            --config <file> --db <name> --owner <user> --from <path>
  backup-and-drop    --config <file> --db <name>
  drop               --config <file> --db <name> --yes
  restart            --config <file> [--if-running]
  exists             --config <file> --db <name>
  create-users       --config <file>
  create-databases   --config <file>
  detect-runtimes    [--needle <text>]
  sample-config

Options:
  --verbose          mirror logs to stdout
  --log-dir <dir>    write log files to <dir>
";

const VALUE_FLAGS: &[&str] = &[
    "--config", "--db", "--out", "--owner", "--from", "--log-dir", "--needle",
];

/// Value following `flag`, e.g. `--db app1`. `--db=app1` is accepted too.
fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let prefix = format!("{}=", flag);
    args.iter().enumerate().find_map(|(i, a)| {
        if a == flag {
            args.get(i + 1).filter(|v| !v.starts_with("--")).cloned()
        } else {
            a.strip_prefix(&prefix).map(str::to_string)
        }
    })
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn required(args: &[String], flag: &str) -> Result<String, String> {
    flag_value(args, flag)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| format!("missing required option {} <value>", flag))
}

fn parse_args(args: &[String]) -> Result<(Action, RunOptions), String> {
    let command = args
        .iter()
        .enumerate()
        .find(|(i, a)| {
            !a.starts_with("--")
                && !(*i > 0 && VALUE_FLAGS.contains(&args[*i - 1].as_str()))
        })
        .map(|(_, a)| a)
        .ok_or_else(|| "no command given".to_string())?;

    let action = match command.as_str() {
        "install" => Action::Install,
        "uninstall" => Action::Uninstall,
        "backup" => Action::Backup {
            db: required(args, "--db")?,
            out: PathBuf::from(required(args, "--out")?),
        },
        "restore" => Action::Restore {
            db: required(args, "--db")?,
            owner: required(args, "--owner")?,
            from: PathBuf::from(required(args, "--from")?),
        },
        "backup-and-drop" => Action::BackupAndDrop {
            db: required(args, "--db")?,
        },
        "drop" => {
            let db = required(args, "--db")?;
            if !has_flag(args, "--yes") {
                return Err(format!(
                    "refusing to drop database '{}' without --yes (use backup-and-drop to keep a copy)",
                    db
                ));
            }
            Action::Drop { db }
        }
        "restart" => Action::Restart {
            if_running: has_flag(args, "--if-running"),
        },
        "exists" => Action::Exists {
            db: required(args, "--db")?,
        },
        "create-users" => Action::CreateUsers,
        "create-databases" => Action::CreateDatabases,
        "detect-runtimes" => Action::DetectRuntimes {
            needle: flag_value(args, "--needle").unwrap_or_else(|| DEFAULT_RUNTIME_NEEDLE.to_string()),
        },
        "sample-config" => Action::SampleConfig,
        other => return Err(format!("unknown command '{}'", other)),
    };

    let opts = RunOptions {
        config: flag_value(args, "--config").map(PathBuf::from),
        verbose: has_flag(args, "--verbose"),
        log_dir: flag_value(args, "--log-dir").map(PathBuf::from),
    };
    if action.needs_config() && opts.config.is_none() {
        return Err("missing required option --config <file>".to_string());
    }
    Ok((action, opts))
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.is_empty() || has_flag(&args, "--help") || has_flag(&args, "-h") {
        print!("{}", USAGE);
        std::process::exit(if args.is_empty() { 2 } else { 0 });
    }

    let (action, opts) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(msg) => {
            eprintln!("pg-provision: {}\n\n{}", msg, USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = run_action(&action, &opts) {
        eprintln!("pg-provision error: {:#}", e);
        std::process::exit(1);
    }
}
