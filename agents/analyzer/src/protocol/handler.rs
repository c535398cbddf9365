//! Per-connection command handling.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use super::{Command, MAX_MESSAGE_SIZE};
use crate::events::{AgentEvent, EventSender};
use crate::gateway::InjectionGateway;
use crate::registry::{ProcessId, ProcessRegistry};

/// Everything a connection handler needs, shared by all handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub registry: Arc<ProcessRegistry>,
    pub gateway: Arc<dyn InjectionGateway>,
    pub events: EventSender,
}

impl HandlerContext {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        gateway: Arc<dyn InjectionGateway>,
        events: EventSender,
    ) -> Self {
        Self {
            registry,
            gateway,
            events,
        }
    }
}

/// Serve one connection: read a single message, act on it, return.
///
/// Nothing is reported back to the caller; every failure ends here.
pub async fn handle_connection<S>(mut stream: S, ctx: HandlerContext)
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(MAX_MESSAGE_SIZE);

    // One read only. A short read is the whole message.
    let n = match stream.read(&mut buf).await {
        Ok(n) => n,
        Err(e) => {
            debug!(error = %e, "Connection broken before a command was read");
            return;
        }
    };

    if n == 0 {
        debug!("Connection closed without a command");
        return;
    }
    buf.truncate(n);

    let Some(command) = Command::decode(&buf) else {
        debug!("Ignoring empty command");
        return;
    };

    dispatch(command, n, &ctx).await;
}

async fn dispatch(command: Command, len: usize, ctx: &HandlerContext) {
    match command {
        Command::AnnounceProcess(pid) => announce_process(pid, ctx).await,
        Command::AnnounceFile(path) => {
            info!(path = %path.display(), "File announced");
            ctx.events.emit(AgentEvent::FileAnnounced { path });
        }
        Command::Malformed => {
            debug!(len, "Ignoring malformed command");
            ctx.events.emit(AgentEvent::MalformedCommand { len });
        }
    }
}

async fn announce_process(pid: ProcessId, ctx: &HandlerContext) {
    if ctx.registry.contains(pid) {
        debug!(pid, "Process already monitored");
        return;
    }

    info!(pid, "Process announced");
    ctx.events.emit(AgentEvent::ProcessAnnounced { pid });

    let gateway = Arc::clone(&ctx.gateway);
    let result = match tokio::task::spawn_blocking(move || gateway.attach(pid)).await {
        Ok(result) => result,
        Err(e) => {
            warn!(pid, error = %e, "Injection task did not complete");
            return;
        }
    };

    match result {
        Ok(tracked) => {
            info!(pid, tracked = ?tracked, "Process injected");
            ctx.registry.add_many(tracked.iter().copied());
            ctx.events.emit(AgentEvent::ProcessInjected {
                announced: pid,
                tracked,
            });
        }
        Err(e) => {
            warn!(pid, error = %e, "Injection failed, process will not be monitored");
            ctx.events.emit(AgentEvent::InjectionFailed {
                pid,
                reason: e.to_string(),
            });
        }
    }
}
