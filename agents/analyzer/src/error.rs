//! Error types for the analyzer agent.
//!
//! Setup failures are fatal and end the run before monitoring starts. Protocol
//! and injection failures never leave the connection handler, so they have no
//! variant here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::package::PackageError;
use crate::protocol::ListenerError;

/// Terminal error of an analysis run.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent could not obtain the privileges it needs.
    #[error("privilege grant failed: {0}")]
    Privilege(String),

    /// Working folders could not be created.
    #[error("failed to create folder {path}: {source}")]
    Bootstrap {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The command channel could not be created.
    #[error("failed to create command channel at {path}: {source}")]
    Channel {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Package(#[from] PackageError),

    /// The accept loop died while the run was in progress.
    #[error("command channel failed: {0}")]
    Listener(#[from] ListenerError),
}
