//! Command channel between monitored processes and the agent.
//!
//! Every monitored process opens one connection, writes one short ASCII
//! message and goes away:
//!
//! - `PID:<decimal digits>` announces a process to monitor.
//! - `FILE:<path>` announces a file. It is recorded and otherwise ignored.
//!
//! Anything else is dropped without a reply.

use std::path::PathBuf;

use crate::registry::ProcessId;

pub mod handler;
pub mod listener;

pub use handler::HandlerContext;
pub use listener::{Listener, ListenerError, ListenerHandle};

/// Upper bound on a single command message, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 512;

const PID_PREFIX: &[u8] = b"PID:";
const FILE_PREFIX: &[u8] = b"FILE:";

/// A decoded command message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AnnounceProcess(ProcessId),
    AnnounceFile(PathBuf),
    Malformed,
}

impl Command {
    /// Decode one raw message.
    ///
    /// The payload ends at the first NUL byte and surrounding ASCII whitespace
    /// is ignored. Returns `None` when nothing is left.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        let message = payload[..end].trim_ascii();

        if message.is_empty() {
            return None;
        }

        let command = if let Some(digits) = message.strip_prefix(PID_PREFIX) {
            parse_pid(digits).map_or(Self::Malformed, Self::AnnounceProcess)
        } else if let Some(path) = message.strip_prefix(FILE_PREFIX) {
            Self::AnnounceFile(PathBuf::from(String::from_utf8_lossy(path).into_owned()))
        } else {
            Self::Malformed
        };

        Some(command)
    }
}

fn parse_pid(digits: &[u8]) -> Option<ProcessId> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
