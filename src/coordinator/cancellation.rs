use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct TokenState {
    cancelled: AtomicBool,
    parent: Option<CancellationToken>,
}

/// Token for cancelling a merge job or a single task attempt
///
/// A child token reports cancellation when it or any of its ancestors was cancelled;
/// cancelling a child leaves the parent untouched.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// Create a token that is also cancelled when `self` is
    pub fn child(&self) -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this token and every child derived from it
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
            || self
                .state
                .parent
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
    }

    /// Wait for cancellation or timeout
    pub fn wait_for_cancellation(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while !self.is_cancelled() && start.elapsed() < timeout {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.is_cancelled()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
