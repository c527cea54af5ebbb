//! Cooperative cancellation shared by every stage of a run
//!
//! A [`CancellationToken`] is cheap to clone and is polled at natural
//! boundaries (after an entry, after a chunk), never inside tight loops.
//!
//! State machine:
//!
//! ```text
//! Running --interrupt--> InterruptRequested --confirm--> Cancelled
//!    ^                          |    \
//!    +-------- decline ---------+     +--interrupt--> Cancelled (forced)
//! ```
//!
//! The token knows nothing about signals; the binary installs one adapter
//! that calls [`CancellationToken::interrupt`].

use crate::error::{Result, STarError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Where a run stands with respect to user interrupts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationState {
    Running,
    /// First interrupt seen, waiting for the next checkpoint to ask for confirmation
    InterruptRequested,
    /// Confirmed, or forced by a second interrupt; stages must unwind
    Cancelled { forced: bool },
}

/// Callback asked whether a pending interrupt should cancel the run
///
/// It runs on the blocking stage and may block, e.g. on a terminal prompt.
pub type ConfirmFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Confirmation used when the caller injects none: every interrupt cancels
pub fn always_confirm() -> ConfirmFn {
    Arc::new(|| true)
}

struct Inner {
    state: watch::Sender<CancellationState>,
    prompting: AtomicBool,
}

/// Process-wide cancellation handle passed into every long-running call
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("state", &self.state())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(CancellationState::Running);
        Self {
            inner: Arc::new(Inner {
                state,
                prompting: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> CancellationState {
        *self.inner.state.borrow()
    }

    /// Record an interrupt signal
    ///
    /// The first one requests confirmation; a second one arriving before that
    /// request is resolved forces cancellation.
    pub fn interrupt(&self) -> CancellationState {
        self.inner.state.send_if_modified(|state| match *state {
            CancellationState::Running => {
                *state = CancellationState::InterruptRequested;
                true
            }
            CancellationState::InterruptRequested => {
                *state = CancellationState::Cancelled { forced: true };
                true
            }
            CancellationState::Cancelled { forced: false } => {
                *state = CancellationState::Cancelled { forced: true };
                true
            }
            CancellationState::Cancelled { forced: true } => false,
        });
        let state = self.state();
        match state {
            CancellationState::InterruptRequested => tracing::debug!("interrupt requested"),
            CancellationState::Cancelled { forced: true } => tracing::warn!("forced abort"),
            _ => {}
        }
        state
    }

    /// Cancel without asking
    pub fn cancel(&self) {
        self.inner.state.send_if_modified(|state| {
            if matches!(*state, CancellationState::Cancelled { .. }) {
                return false;
            }
            *state = CancellationState::Cancelled { forced: false };
            true
        });
    }

    /// Back to `Running`, for reusing a token across runs
    pub fn reset(&self) {
        self.inner.state.send_replace(CancellationState::Running);
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), CancellationState::Cancelled { .. })
    }

    /// Fail with `Cancelled` if the run must unwind; never prompts
    pub fn check(&self) -> Result<()> {
        match self.state() {
            CancellationState::Cancelled { forced } => Err(STarError::Cancelled { forced }),
            _ => Ok(()),
        }
    }

    /// Checkpoint that resolves a pending interrupt through `confirm`
    ///
    /// Only one caller prompts at a time; concurrent callers carry on and see
    /// the outcome at their next checkpoint.
    pub fn checkpoint(&self, confirm: &ConfirmFn) -> Result<()> {
        if self.state() == CancellationState::InterruptRequested
            && self
                .inner
                .prompting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let cancel = confirm();
            self.inner.state.send_if_modified(|state| {
                if *state != CancellationState::InterruptRequested {
                    // A second interrupt won the race while we were asking.
                    return false;
                }
                *state = if cancel {
                    CancellationState::Cancelled { forced: false }
                } else {
                    CancellationState::Running
                };
                true
            });
            self.inner.prompting.store(false, Ordering::Release);
            if cancel {
                tracing::info!("cancellation confirmed");
            } else {
                tracing::info!("interrupt declined, resuming");
            }
        }
        self.check()
    }

    /// Resolves once the run has been forcibly aborted
    pub async fn forced(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx
            .wait_for(|state| *state == CancellationState::Cancelled { forced: true })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(answer: bool) -> (ConfirmFn, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let confirm: ConfirmFn = Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            answer
        });
        (confirm, calls)
    }

    #[test]
    fn test_declined_interrupt_resumes() {
        let token = CancellationToken::new();
        let (confirm, calls) = counting(false);

        assert_eq!(token.interrupt(), CancellationState::InterruptRequested);
        assert!(token.checkpoint(&confirm).is_ok());
        assert_eq!(token.state(), CancellationState::Running);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // nothing pending, no prompt
        assert!(token.checkpoint(&confirm).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_confirmed_interrupt_cancels() {
        let token = CancellationToken::new();
        let (confirm, _) = counting(true);

        token.interrupt();
        let err = token.checkpoint(&confirm).unwrap_err();
        assert!(matches!(err, STarError::Cancelled { forced: false }));
        assert!(token.check().is_err());
    }

    #[test]
    fn test_second_interrupt_forces() {
        let token = CancellationToken::new();
        let (confirm, calls) = counting(false);

        token.interrupt();
        assert_eq!(
            token.interrupt(),
            CancellationState::Cancelled { forced: true }
        );
        let err = token.checkpoint(&confirm).unwrap_err();
        assert!(matches!(err, STarError::Cancelled { forced: true }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_check_does_not_prompt() {
        let token = CancellationToken::new();
        token.interrupt();
        assert!(token.check().is_ok());
        assert_eq!(token.state(), CancellationState::InterruptRequested);

        token.reset();
        assert_eq!(token.state(), CancellationState::Running);
    }

    #[tokio::test]
    async fn test_forced_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.forced().await })
        };
        token.interrupt();
        token.interrupt();
        waiter.await.unwrap();
    }
}
