// PostgreSQL instance management
//
// `DbManager` owns the two host capabilities (a command runner for the toolchain, and a
// service + firewall controller) and exposes the lifecycle operations (`lifecycle.rs`) and the
// install/uninstall sequences (`provisioning.rs`). It never mutates configuration; every
// operation takes the configuration it needs by reference.

pub mod lifecycle;
pub mod markers;
pub mod provisioning;
pub mod tools;

use log::warn;

use crate::error::Result;
use crate::installation::service::{FirewallControl, ServiceControl};
use crate::installation::{CommandOutput, CommandRunner, CommandSpec};
use markers::PsqlOp;

pub struct DbManager<R, H> {
    runner: R,
    host: H,
}

impl<R, H> DbManager<R, H>
where
    R: CommandRunner,
    H: ServiceControl + FirewallControl,
{
    pub fn new(runner: R, host: H) -> Self {
        DbManager { runner, host }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Run a psql DDL command and require its success tag with empty stderr.
    async fn run_psql(&self, cmd: &CommandSpec, op: PsqlOp) -> Result<CommandOutput> {
        let out = self.runner.run(cmd).await?;
        if !markers::is_success(op, &out) {
            warn!(
                "[PHASE: psql] [STEP: {}] Unexpected psql result (exit_code={:?}, expected={:?})",
                op.label(),
                out.exit_code,
                op.expected_tags()
            );
            return Err(cmd.failure(&out));
        }
        Ok(out)
    }
}
