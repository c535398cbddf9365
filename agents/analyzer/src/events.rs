//! Lifecycle events emitted while a run is in progress.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::warn;

use crate::registry::ProcessId;

/// Capacity of the event channel between producers and the exporter task.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events reported by the command handlers and the run controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A monitored process announced a new process over the channel.
    ProcessAnnounced { pid: ProcessId },
    /// The gateway attached to an announced process.
    ProcessInjected {
        announced: ProcessId,
        tracked: Vec<ProcessId>,
    },
    /// The gateway failed; the process is not monitored.
    InjectionFailed { pid: ProcessId, reason: String },
    /// A monitored process announced a file. Recorded only.
    FileAnnounced { path: PathBuf },
    /// A connection delivered a payload that is not a command.
    MalformedCommand { len: usize },
    /// Tracked processes were found dead; `remaining` are still monitored.
    ProcessesExited { remaining: usize },
    /// The run reached a new state.
    StateChanged { state: String },
}

impl AgentEvent {
    /// Span name used when the event is exported.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessAnnounced { .. } => "process.announced",
            Self::ProcessInjected { .. } => "process.injected",
            Self::InjectionFailed { .. } => "process.injection_failed",
            Self::FileAnnounced { .. } => "file.announced",
            Self::MalformedCommand { .. } => "command.malformed",
            Self::ProcessesExited { .. } => "process.exited",
            Self::StateChanged { .. } => "run.state",
        }
    }
}

/// Cheap, cloneable handle used to emit events without blocking.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Option<mpsc::Sender<AgentEvent>>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sender that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue an event. Drops it when the exporter is behind or gone.
    pub fn emit(&self, event: AgentEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
            warn!(event = event.name(), "Event channel full, dropping event");
        }
    }
}

/// Create an event channel with the default capacity.
pub fn channel() -> (EventSender, mpsc::Receiver<AgentEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventSender::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_delivers_in_order() {
        let (events, mut rx) = channel();
        events.emit(AgentEvent::ProcessAnnounced { pid: 1 });
        events.emit(AgentEvent::FileAnnounced {
            path: PathBuf::from("/tmp/x"),
        });

        assert_eq!(rx.recv().await, Some(AgentEvent::ProcessAnnounced { pid: 1 }));
        assert_eq!(
            rx.recv().await,
            Some(AgentEvent::FileAnnounced {
                path: PathBuf::from("/tmp/x")
            })
        );
    }

    #[tokio::test]
    async fn test_emit_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let events = EventSender::new(tx);
        events.emit(AgentEvent::ProcessAnnounced { pid: 1 });
        events.emit(AgentEvent::ProcessAnnounced { pid: 2 });
        drop(events);

        assert_eq!(rx.recv().await, Some(AgentEvent::ProcessAnnounced { pid: 1 }));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_disabled_sender_is_silent() {
        EventSender::disabled().emit(AgentEvent::MalformedCommand { len: 3 });
    }
}
