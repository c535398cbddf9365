//! Hard time budget of a run.

use std::time::Duration;

use tokio::time::Instant;

/// Stand-in deadline for budgets too large to represent, about 30 years out.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// A single, non-renewable deadline armed when monitoring starts.
///
/// The watchdog never interrupts anything. The controller checks it at the
/// top of every tick and wakes up for it when the deadline falls between
/// ticks.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    deadline: Instant,
}

impl Watchdog {
    pub fn arm(timeout: Duration) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Self { deadline }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Resolves once the deadline has passed.
    pub async fn elapsed(&self) {
        tokio::time::sleep_until(self.deadline).await;
    }
}
