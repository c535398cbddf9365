//! Injection gateway: attaches instrumentation to announced processes.
//!
//! The agent does not implement injection itself. It either tracks announced
//! processes as they are ([`TrackOnlyGateway`]) or delegates to an external
//! injector program ([`CommandGateway`]).

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::{InjectorConfig, InjectorMode};
use crate::registry::ProcessId;

/// Placeholder in injector arguments replaced by the target pid.
pub const PID_PLACEHOLDER: &str = "{pid}";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to run injector {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("injector rejected pid {pid} ({status})")]
    Rejected { pid: ProcessId, status: String },

    #[error("injection into pid {pid} failed: {reason}")]
    Failed { pid: ProcessId, reason: String },
}

/// Attaches instrumentation to a process.
///
/// On success returns the ids that should be monitored from now on. They need
/// not include `pid`: an injector may hand back the process it actually
/// attached to.
///
/// Calls may block; callers on the async runtime run them on the blocking
/// pool.
pub trait InjectionGateway: Send + Sync {
    fn attach(&self, pid: ProcessId) -> Result<Vec<ProcessId>, GatewayError>;
}

/// Gateway that attaches nothing and monitors the announced process.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackOnlyGateway;

impl InjectionGateway for TrackOnlyGateway {
    fn attach(&self, pid: ProcessId) -> Result<Vec<ProcessId>, GatewayError> {
        Ok(vec![pid])
    }
}

/// Gateway that runs an external injector once per process.
///
/// The injector's exit status decides success. If it prints decimal pids on
/// stdout, one per line, those are monitored instead of the announced one.
#[derive(Debug, Clone)]
pub struct CommandGateway {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandGateway {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn render_args(&self, pid: ProcessId) -> Vec<String> {
        let pid = pid.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PID_PLACEHOLDER, &pid))
            .collect()
    }
}

impl InjectionGateway for CommandGateway {
    fn attach(&self, pid: ProcessId) -> Result<Vec<ProcessId>, GatewayError> {
        let output = Command::new(&self.program)
            .args(self.render_args(pid))
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|source| GatewayError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(GatewayError::Rejected {
                pid,
                status: output.status.to_string(),
            });
        }

        let reported: Vec<ProcessId> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect();

        debug!(pid, reported = ?reported, "Injector finished");

        if reported.is_empty() {
            Ok(vec![pid])
        } else {
            Ok(reported)
        }
    }
}

/// Build the gateway selected by the injector configuration.
pub fn from_config(config: &InjectorConfig) -> anyhow::Result<Arc<dyn InjectionGateway>> {
    match config.mode {
        InjectorMode::Track => Ok(Arc::new(TrackOnlyGateway)),
        InjectorMode::Command => {
            let program = config
                .command
                .clone()
                .ok_or_else(|| anyhow::anyhow!("injector.command is required in command mode"))?;
            Ok(Arc::new(CommandGateway::new(program, config.args.clone())))
        }
    }
}
