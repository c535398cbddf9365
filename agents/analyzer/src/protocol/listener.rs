//! Accept loop for the command channel.
//!
//! The channel is a Unix domain socket at a well-known path. Each accepted
//! connection is handed to its own task; the loop never waits for handlers.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::{handle_connection, HandlerContext};
use crate::config::ChannelConfig;
use crate::error::AgentError;

/// Fatal accept-loop failures.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("accept failed: {0}")]
    Fatal(#[source] io::Error),

    #[error("{count} consecutive accept failures, last: {last}")]
    TooManyFailures {
        count: u32,
        #[source]
        last: io::Error,
    },

    #[error("accept loop panicked")]
    Panicked,
}

/// A bound command channel that is not accepting yet.
#[derive(Debug)]
pub struct Listener {
    listener: UnixListener,
    path: PathBuf,
    max_failures: u32,
    backoff: Duration,
}

impl Listener {
    /// Create the command channel.
    ///
    /// Creates the parent directory if needed and replaces a stale socket left
    /// behind by a previous run. A non-socket file at the path is never
    /// removed.
    pub fn bind(config: &ChannelConfig) -> Result<Self, AgentError> {
        let path = config.path.clone();
        let channel_err = |source: io::Error| AgentError::Channel {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(channel_err)?;
        }
        remove_stale_socket(&path).map_err(channel_err)?;

        let listener = UnixListener::bind(&path).map_err(channel_err)?;
        set_socket_permissions(&path, config.mode).map_err(channel_err)?;

        info!(
            path = %path.display(),
            mode = %format!("{:o}", config.mode),
            "Command channel bound"
        );

        Ok(Self {
            listener,
            path,
            max_failures: config.max_consecutive_accept_errors,
            backoff: config.accept_backoff(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start accepting connections.
    ///
    /// Consumes the listener, so a channel can only be started once.
    pub fn start(self, ctx: HandlerContext) -> ListenerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let path = self.path.clone();
        let task = tokio::spawn(self.accept_loop(ctx, shutdown_rx));

        ListenerHandle {
            shutdown_tx,
            task: Some(task),
            path,
        }
    }

    async fn accept_loop(
        self,
        ctx: HandlerContext,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ListenerError> {
        let mut failures = FailureBudget::new(self.max_failures);

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = self.listener.accept() => result,
            };

            match accepted {
                Ok((stream, _addr)) => {
                    failures.reset();
                    debug!("Accepted command connection");
                    tokio::spawn(handle_connection(stream, ctx.clone()));
                }
                Err(e) => {
                    let reason = e.to_string();
                    match failures.charge(e) {
                        Ok(spent) => {
                            warn!(error = %reason, failures = spent, "Accept failed, retrying");
                            tokio::time::sleep(self.backoff).await;
                        }
                        Err(err) => {
                            error!(error = %err, "Command channel is no longer usable");
                            return Err(err);
                        }
                    }
                }
            }
        }

        debug!(path = %self.path.display(), "Accept loop stopped");
        Ok(())
    }
}

/// Handle to a running accept loop.
#[derive(Debug)]
pub struct ListenerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), ListenerError>>>,
    path: PathBuf,
}

impl ListenerHandle {
    /// Ask the accept loop to exit. Handlers already running are left alone.
    pub fn stop(&self) {
        // The loop may already be gone, in which case there is nobody to tell.
        let _ = self.shutdown_tx.send(true);
    }

    /// The fatal error of the accept loop, if it has died.
    ///
    /// Returns `None` while the loop is running. An error is returned once.
    pub async fn failure(&mut self) -> Option<ListenerError> {
        if !self.task.as_ref().is_some_and(JoinHandle::is_finished) {
            return None;
        }
        let task = self.task.take()?;
        join(task).await.err()
    }

    /// Stop the loop, wait for it and remove the socket file.
    pub async fn shutdown(mut self) -> Result<(), ListenerError> {
        self.stop();
        let result = match self.task.take() {
            Some(task) => join(task).await,
            None => Ok(()),
        };

        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove command channel");
            }
        }

        result
    }
}

/// Consecutive accept failures tolerated before the channel is given up.
#[derive(Debug)]
struct FailureBudget {
    max: u32,
    spent: u32,
}

impl FailureBudget {
    fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            spent: 0,
        }
    }

    fn reset(&mut self) {
        self.spent = 0;
    }

    /// Charge a failed accept. `Ok` carries the failures so far and means the
    /// loop should back off and retry.
    fn charge(&mut self, e: io::Error) -> Result<u32, ListenerError> {
        if !is_transient(&e) {
            return Err(ListenerError::Fatal(e));
        }
        self.spent += 1;
        if self.spent >= self.max {
            return Err(ListenerError::TooManyFailures {
                count: self.spent,
                last: e,
            });
        }
        Ok(self.spent)
    }
}

async fn join(task: JoinHandle<Result<(), ListenerError>>) -> Result<(), ListenerError> {
    task.await.unwrap_or(Err(ListenerError::Panicked))
}

/// Accept errors worth retrying: interrupted calls, peers that went away
/// before being accepted, and temporary resource exhaustion.
fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => true,
        _ => matches!(
            e.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO)
        ),
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    use std::os::unix::fs::FileTypeExt;
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }

    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "Removed stale socket");
    Ok(())
}

fn set_socket_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::gateway::TrackOnlyGateway;
    use crate::registry::ProcessRegistry;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    fn channel_config(path: PathBuf) -> ChannelConfig {
        ChannelConfig {
            path,
            mode: 0o600,
            max_consecutive_accept_errors: 4,
            accept_backoff_ms: 10,
        }
    }

    fn context() -> HandlerContext {
        HandlerContext::new(
            Arc::new(ProcessRegistry::new()),
            Arc::new(TrackOnlyGateway),
            events::EventSender::disabled(),
        )
    }

    async fn announce(path: &Path, payload: &[u8]) {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    async fn wait_for(registry: &ProcessRegistry, pid: u32) {
        for _ in 0..200 {
            if registry.contains(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pid {pid} was never registered");
    }

    #[tokio::test]
    async fn test_bind_creates_parent_and_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("agent.sock");
        let listener = Listener::bind(&channel_config(path.clone())).unwrap();

        assert_eq!(listener.path(), path);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("agent.sock");
        let stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        Listener::bind(&channel_config(path)).unwrap();
    }

    #[tokio::test]
    async fn test_bind_refuses_regular_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("agent.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        let err = Listener::bind(&channel_config(path.clone())).unwrap_err();

        assert!(matches!(err, AgentError::Channel { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"not a socket");
    }

    #[tokio::test]
    async fn test_bind_fails_when_parent_is_a_file() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let err = Listener::bind(&channel_config(blocker.join("agent.sock"))).unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[tokio::test]
    async fn test_accepts_many_connections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("agent.sock");
        let ctx = context();
        let registry = Arc::clone(&ctx.registry);

        let handle = Listener::bind(&channel_config(path.clone()))
            .unwrap()
            .start(ctx);

        for pid in 100..110u32 {
            announce(&path, format!("PID:{pid}").as_bytes()).await;
        }
        for pid in 100..110u32 {
            wait_for(&registry, pid).await;
        }

        handle.shutdown().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_idle_connection_does_not_block_accept() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("agent.sock");
        let ctx = context();
        let registry = Arc::clone(&ctx.registry);

        let mut handle = Listener::bind(&channel_config(path.clone()))
            .unwrap()
            .start(ctx);

        // Connected but silent: its handler waits on its own read.
        let _idle = UnixStream::connect(&path).await.unwrap();
        announce(&path, b"PID:7").await;
        wait_for(&registry, 7).await;

        assert!(handle.failure().await.is_none());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_ends_accept_loop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("agent.sock");
        let mut handle = Listener::bind(&channel_config(path))
            .unwrap()
            .start(context());

        handle.stop();
        for _ in 0..200 {
            if handle.task.as_ref().is_some_and(JoinHandle::is_finished) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // A clean stop is not a failure.
        assert!(handle.failure().await.is_none());
        assert!(handle.task.is_none());
    }

    #[test]
    fn test_transient_error_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EINVAL)));
    }

    #[test]
    fn test_failure_budget_gives_up_after_consecutive_errors() {
        let mut budget = FailureBudget::new(3);
        let transient = || io::Error::from_raw_os_error(libc::EMFILE);

        assert_eq!(budget.charge(transient()).unwrap(), 1);
        assert_eq!(budget.charge(transient()).unwrap(), 2);
        budget.reset();
        assert_eq!(budget.charge(transient()).unwrap(), 1);
        assert_eq!(budget.charge(transient()).unwrap(), 2);

        match budget.charge(transient()) {
            Err(ListenerError::TooManyFailures { count, last }) => {
                assert_eq!(count, 3);
                assert_eq!(last.raw_os_error(), Some(libc::EMFILE));
            }
            other => panic!("expected TooManyFailures, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_budget_zero_still_allows_one_failure() {
        let mut budget = FailureBudget::new(0);
        assert!(matches!(
            budget.charge(io::Error::from(io::ErrorKind::Interrupted)),
            Err(ListenerError::TooManyFailures { count: 1, .. })
        ));
    }

    #[test]
    fn test_failure_budget_non_transient_is_fatal() {
        let mut budget = FailureBudget::new(16);
        assert!(matches!(
            budget.charge(io::Error::from_raw_os_error(libc::EBADF)),
            Err(ListenerError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_unusable_socket_ends_loop_with_fatal_error() {
        use std::os::unix::io::AsRawFd;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("agent.sock");
        let listener = Listener::bind(&channel_config(path.clone())).unwrap();
        let fd = listener.listener.as_raw_fd();
        let mut handle = listener.start(context());

        // Swap the listening descriptor for /dev/null while a duplicate keeps
        // the socket and its reactor registration alive. The next connection
        // wakes the loop and accept fails with ENOTSOCK.
        let devnull = std::fs::File::open("/dev/null").unwrap();
        let keep = unsafe { libc::dup(fd) };
        assert!(keep >= 0);
        assert_eq!(unsafe { libc::dup2(devnull.as_raw_fd(), fd) }, fd);
        let _client = UnixStream::connect(&path).await.unwrap();

        let mut failure = None;
        for _ in 0..200 {
            failure = handle.failure().await;
            if failure.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        match failure {
            Some(ListenerError::Fatal(e)) => assert_eq!(e.raw_os_error(), Some(libc::ENOTSOCK)),
            other => panic!("expected a fatal accept error, got {other:?}"),
        }
        // Reported once.
        assert!(handle.failure().await.is_none());
        handle.shutdown().await.unwrap();
        unsafe { libc::close(keep) };
    }
}
