//! Run lifecycle: prepare, monitor, drain, finish.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::bootstrap::Bootstrap;
use crate::config::{ChannelConfig, PackageConfig};
use crate::error::AgentError;
use crate::events::{AgentEvent, EventSender};
use crate::gateway::InjectionGateway;
use crate::liveness::LivenessProbe;
use crate::package::{AnalysisPackage, PackageCatalog, PackageContext, PackageError};
use crate::protocol::{HandlerContext, Listener, ListenerHandle};
use crate::registry::ProcessRegistry;

pub mod watchdog;

pub use watchdog::Watchdog;

/// Lifecycle state of a run. Only the controller moves it forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Preparing,
    Running,
    Draining,
    Finished,
}

impl RunState {
    /// Whether `next` directly follows `self`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Preparing, Self::Running)
                | (Self::Preparing, Self::Finished)
                | (Self::Running, Self::Draining)
                | (Self::Draining, Self::Finished)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Why monitoring stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Every monitored process has exited.
    RegistryEmpty,
    /// The package's check hook asked to stop.
    PackageDeclined,
    /// The run's time budget ran out.
    WatchdogExpired,
    /// The command channel died.
    ListenerFailed,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistryEmpty => write!(f, "all monitored processes exited"),
            Self::PackageDeclined => write!(f, "package asked to stop"),
            Self::WatchdogExpired => write!(f, "timeout reached"),
            Self::ListenerFailed => write!(f, "command channel failed"),
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub error: Option<String>,
    pub termination: Option<TerminationReason>,
    pub package: Option<String>,
    pub history: Vec<RunState>,
}

impl RunReport {
    /// Report for a run that could not even be set up.
    pub fn aborted(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            termination: None,
            package: None,
            history: Vec::new(),
        }
    }

    pub fn reached(&self, state: RunState) -> bool {
        self.history.contains(&state)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "STATUS {}", self.success)?;
        write!(f, "ERROR {}", self.error.as_deref().unwrap_or("none"))
    }
}

/// Run parameters.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub channel: ChannelConfig,
    pub package: PackageConfig,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// External capabilities the controller drives.
pub struct Collaborators {
    pub bootstrap: Box<dyn Bootstrap>,
    pub catalog: PackageCatalog,
    pub gateway: Arc<dyn InjectionGateway>,
    pub liveness: Arc<dyn LivenessProbe>,
    pub events: EventSender,
}

/// Drives one analysis run from preparation to the final report.
pub struct RunController {
    settings: RunSettings,
    bootstrap: Box<dyn Bootstrap>,
    catalog: PackageCatalog,
    gateway: Arc<dyn InjectionGateway>,
    liveness: Arc<dyn LivenessProbe>,
    events: EventSender,
    registry: Arc<ProcessRegistry>,
    state: RunState,
    history: Vec<RunState>,
}

impl RunController {
    pub fn new(settings: RunSettings, collaborators: Collaborators) -> Self {
        Self {
            settings,
            bootstrap: collaborators.bootstrap,
            catalog: collaborators.catalog,
            gateway: collaborators.gateway,
            liveness: collaborators.liveness,
            events: collaborators.events,
            registry: Arc::new(ProcessRegistry::new()),
            state: RunState::Preparing,
            history: vec![RunState::Preparing],
        }
    }

    /// Registry shared with the connection handlers.
    pub fn registry(&self) -> Arc<ProcessRegistry> {
        Arc::clone(&self.registry)
    }

    /// Execute the run to completion.
    pub async fn run(mut self) -> RunReport {
        info!("Preparing analysis run");

        let mut listener = match self.prepare() {
            Ok(listener) => listener,
            Err(e) => return self.fail(e),
        };

        let mut package = match self.launch().await {
            Ok(package) => package,
            Err(e) => {
                if let Err(e) = listener.shutdown().await {
                    warn!(error = %e, "Command channel did not stop cleanly");
                }
                return self.fail(e);
            }
        };

        self.transition(RunState::Running);
        let watchdog = Watchdog::arm(self.settings.timeout);
        info!(
            package = package.name(),
            monitored = self.registry.len(),
            timeout_secs = self.settings.timeout.as_secs_f64(),
            "Monitoring started"
        );

        let (termination, failure) = self.monitor(&mut package, &mut listener, &watchdog).await;

        self.transition(RunState::Draining);
        info!(reason = %termination, "Monitoring stopped");

        if let Err(e) = package.finish() {
            warn!(error = %e, "Finish hook failed");
        }
        if let Err(e) = listener.shutdown().await {
            warn!(error = %e, "Command channel did not stop cleanly");
        }
        let name = package.name().to_string();
        drop(package);

        self.transition(RunState::Finished);

        RunReport {
            success: failure.is_none(),
            error: failure.map(|e| e.to_string()),
            termination: Some(termination),
            package: Some(name),
            history: self.history,
        }
    }

    /// Elevate, create folders and open the command channel.
    fn prepare(&mut self) -> Result<ListenerHandle, AgentError> {
        self.bootstrap.grant_privileges()?;
        self.bootstrap.create_folders()?;

        let listener = Listener::bind(&self.settings.channel)?;
        let ctx = HandlerContext::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.gateway),
            self.events.clone(),
        );
        Ok(listener.start(ctx))
    }

    /// Load the package and seed the registry with what it started.
    ///
    /// The start hook may block on the injector, so it runs on the blocking
    /// pool.
    async fn launch(&mut self) -> Result<AnalysisPackage, AgentError> {
        let ctx = PackageContext {
            config: self.settings.package.clone(),
            gateway: Arc::clone(&self.gateway),
        };
        let package = self.catalog.load(&self.settings.package.name, &ctx)?;
        info!(
            package = package.name(),
            check = package.has_check(),
            finish = package.has_finish(),
            "Package loaded"
        );

        let name = package.name().to_string();
        let (package, seed) = tokio::task::spawn_blocking(move || {
            let mut package = package;
            let seed = package.start();
            (package, seed)
        })
        .await
        .map_err(|e| PackageError::Start {
            name,
            reason: format!("start hook did not complete: {e}"),
        })?;
        let seed = seed?;
        info!(pids = ?seed, "Package started");
        self.registry.add_many(seed);

        Ok(package)
    }

    async fn monitor(
        &mut self,
        package: &mut AnalysisPackage,
        listener: &mut ListenerHandle,
        watchdog: &Watchdog,
    ) -> (TerminationReason, Option<AgentError>) {
        let liveness = Arc::clone(&self.liveness);
        let mut last_count = self.registry.len();

        loop {
            if watchdog.expired() {
                info!("Analysis timeout reached");
                return (TerminationReason::WatchdogExpired, None);
            }

            if let Some(e) = listener.failure().await {
                error!(error = %e, "Command channel failed during the run");
                return (TerminationReason::ListenerFailed, Some(e.into()));
            }

            let remaining = self.registry.remove_if_dead(|pid| liveness.is_alive(pid));
            if remaining < last_count {
                info!(remaining, "Monitored processes exited");
                self.events.emit(AgentEvent::ProcessesExited { remaining });
            }
            last_count = remaining;

            if remaining == 0 {
                info!("No monitored processes left");
                return (TerminationReason::RegistryEmpty, None);
            }

            if !package.should_continue() {
                info!("Package requested the end of the run");
                return (TerminationReason::PackageDeclined, None);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = watchdog.elapsed() => {}
            }
        }
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal run state transition {} -> {}",
            self.state,
            next
        );
        info!(from = %self.state, to = %next, "Run state changed");
        self.state = next;
        self.history.push(next);
        self.events.emit(AgentEvent::StateChanged {
            state: next.to_string(),
        });
    }

    /// End a run that never started monitoring.
    fn fail(mut self, error: AgentError) -> RunReport {
        error!(error = %error, "Analysis run aborted");
        self.transition(RunState::Finished);

        RunReport {
            history: self.history,
            ..RunReport::aborted(error.to_string())
        }
    }
}
