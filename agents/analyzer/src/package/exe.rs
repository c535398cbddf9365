//! Package that runs a target executable and monitors it.

use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use super::{AnalysisPackage, PackageContext, PackageError};

pub const NAME: &str = "exe";

type SharedChild = Arc<Mutex<Option<Child>>>;

/// Launch `package.target` with `package.args`.
///
/// The spawned process goes through the injection gateway like any announced
/// process. The check hook only reaps the child once it exits, so that the
/// registry sees it die; the run ends when every monitored process is gone,
/// not when the target alone exits.
///
/// The start hook blocks while the gateway attaches to the target.
pub fn load(ctx: &PackageContext) -> Result<AnalysisPackage, PackageError> {
    let target = ctx.config.target.clone().ok_or_else(|| PackageError::Config {
        name: NAME.to_string(),
        reason: "package.target is not set".to_string(),
    })?;
    let args = ctx.config.args.clone();
    let gateway = Arc::clone(&ctx.gateway);
    let child: SharedChild = Arc::new(Mutex::new(None));

    let start_child = Arc::clone(&child);
    let check_child = Arc::clone(&child);

    AnalysisPackage::builder(NAME)
        .on_start(move || {
            let spawned = Command::new(&target)
                .args(&args)
                .stdin(Stdio::null())
                .spawn()
                .map_err(|source| PackageError::Spawn {
                    program: target.clone(),
                    source,
                })?;
            let pid = spawned.id();
            *start_child.lock().unwrap_or_else(PoisonError::into_inner) = Some(spawned);
            info!(pid, target = %target.display(), "Target launched");

            match gateway.attach(pid) {
                Ok(tracked) => Ok(tracked),
                Err(e) => {
                    warn!(pid, error = %e, "Injection into target failed, monitoring it anyway");
                    Ok(vec![pid])
                }
            }
        })
        .on_check(move || {
            reap(&check_child);
            true
        })
        .on_finish(move || {
            if !reap(&child) {
                info!("Target still running at finish, leaving it alone");
            }
            Ok(())
        })
        .build()
}

/// Collect the child's exit status if it has exited. Returns `true` when no
/// child is left running.
fn reap(child: &SharedChild) -> bool {
    let mut guard = child.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(running) = guard.as_mut() else {
        return true;
    };

    match running.try_wait() {
        Ok(Some(status)) => {
            info!(pid = running.id(), %status, "Target exited");
            *guard = None;
            true
        }
        Ok(None) => false,
        Err(e) => {
            warn!(pid = running.id(), error = %e, "Could not query target status");
            false
        }
    }
}
