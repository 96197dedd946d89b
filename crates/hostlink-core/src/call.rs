//! Call: one request/response transaction, independent of backend.
//!
//! Externally a call moves `Submitted -> {Completed | FailedOverflow |
//! FailedIo}` and its completion is observable exactly once. Internally a
//! call may pass through a corrective-retry sub-state (a second host
//! transaction after an undersized write-back buffer) without exposing a
//! second completion.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::{CallTag, StatusCode};

/// Externally visible outcome of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Host produced a response; write-back contents follow.
    Completed(Vec<u8>),
    /// Host response did not fit and no corrective retry was possible.
    FailedOverflow { required: u32 },
    /// Underlying host call failed.
    FailedIo(StatusCode),
}

impl CallOutcome {
    pub fn into_result(self) -> crate::Result<Vec<u8>> {
        match self {
            CallOutcome::Completed(data) => Ok(data),
            CallOutcome::FailedOverflow { required } => {
                Err(crate::LinkError::buffer_too_small(required))
            }
            CallOutcome::FailedIo(code) => Err(crate::LinkError::new(
                code,
                "host transaction failed",
            )),
        }
    }
}

/// Hidden sub-state: which host transaction this call is currently riding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// First host transaction for this call.
    Primary = 0,
    /// Second transaction re-reading into a grown write-back buffer.
    CorrectiveRetry = 1,
}

/// One in-flight request/response transaction.
pub struct Call {
    tag: CallTag,
    phase: AtomicU8,
    done: AtomicBool,
    slot: Mutex<Option<CallOutcome>>,
    signal: Condvar,
}

impl Call {
    pub fn new(tag: CallTag) -> Self {
        Self {
            tag,
            phase: AtomicU8::new(CallPhase::Primary as u8),
            done: AtomicBool::new(false),
            slot: Mutex::new(None),
            signal: Condvar::new(),
        }
    }

    pub fn tag(&self) -> CallTag {
        self.tag
    }

    pub fn phase(&self) -> CallPhase {
        if self.phase.load(Ordering::Acquire) == CallPhase::CorrectiveRetry as u8 {
            CallPhase::CorrectiveRetry
        } else {
            CallPhase::Primary
        }
    }

    /// Enter the corrective-retry sub-state.
    ///
    /// Returns false if the call was already retrying; at most one
    /// corrective transaction is issued per call.
    pub fn begin_corrective_retry(&self) -> bool {
        self.phase
            .compare_exchange(
                CallPhase::Primary as u8,
                CallPhase::CorrectiveRetry as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Deliver the outcome and wake the waiter.
    ///
    /// Returns true if this delivery won; a second completion attempt (for
    /// example a late host notification after a corrective retry already
    /// finished) is dropped and returns false.
    pub fn complete(&self, outcome: CallOutcome) -> bool {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let mut slot = self.slot.lock();
        *slot = Some(outcome);
        self.signal.notify_all();
        true
    }

    /// Whether an outcome has been delivered.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Block until the outcome is delivered.
    pub fn wait(&self) -> CallOutcome {
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            self.signal.wait(&mut slot);
        }
    }

    /// Block until the outcome is delivered or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CallOutcome> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return Some(outcome);
            }
            if self.signal.wait_until(&mut slot, deadline).timed_out() {
                return slot.take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn complete_fires_exactly_once() {
        let call = Call::new(CallTag::new(1));
        assert!(call.complete(CallOutcome::Completed(vec![1])));
        assert!(!call.complete(CallOutcome::FailedIo(StatusCode::Io)));
        assert_eq!(call.wait(), CallOutcome::Completed(vec![1]));
    }

    #[test]
    fn corrective_retry_entered_once() {
        let call = Call::new(CallTag::new(2));
        assert_eq!(call.phase(), CallPhase::Primary);
        assert!(call.begin_corrective_retry());
        assert_eq!(call.phase(), CallPhase::CorrectiveRetry);
        assert!(!call.begin_corrective_retry());
    }

    #[test]
    fn waiter_wakes_from_other_thread() {
        let call = Arc::new(Call::new(CallTag::new(3)));
        let completer = call.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            completer.complete(CallOutcome::Completed(b"late".to_vec()));
        });
        assert_eq!(call.wait(), CallOutcome::Completed(b"late".to_vec()));
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires_without_outcome() {
        let call = Call::new(CallTag::new(4));
        assert!(call.wait_timeout(Duration::from_millis(5)).is_none());
    }
}
