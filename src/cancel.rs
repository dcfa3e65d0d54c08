use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::UpdateError;

const OPEN: u8 = 0;
const CANCELLED: u8 = 1;
const SEALED: u8 = 2;

/// Cooperative cancellation flag shared between the host and the worker.
///
/// Once the worker [`seal`](CancelToken::seal)s the token, cancellation is
/// refused: installed files are being mutated and the session must run to
/// completion or failure.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Fails with [`UpdateError::CancelRefused`] after sealing.
    pub fn cancel(&self) -> Result<(), UpdateError> {
        match self
            .state
            .compare_exchange(OPEN, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(CANCELLED) => Ok(()),
            Err(_) => Err(UpdateError::CancelRefused),
        }
    }

    /// Forbid further cancellation. Returns `false` if cancellation already won.
    pub fn seal(&self) -> bool {
        match self
            .state
            .compare_exchange(OPEN, SEALED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(SEALED) => true,
            Err(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_sealed(&self) -> bool {
        self.state.load(Ordering::Acquire) == SEALED
    }

    /// `Err(Cancelled)` if cancellation was requested; for use between chunks.
    pub fn check(&self) -> Result<(), UpdateError> {
        if self.is_cancelled() {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }
}
