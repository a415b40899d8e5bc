//! Transport context abstraction.
//!
//! The queue itself never blocks; waiting is confined to the transport's
//! progress entry point, which drives a caller condition until it reports
//! completion or the timeout expires. The wire protocol behind a real
//! transport is out of scope; the in-process implementation below is enough
//! for local completion traffic and for tests.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Progress driver shared by every queue created from one library instance.
///
/// `cond` returns a positive value to stop progressing, zero to keep going,
/// or a negative stable error code to fail the call.
pub trait Transport: Send + Sync {
    fn progress(&self, timeout_us: i64, cond: &mut dyn FnMut() -> i32) -> Result<()>;

    /// Wake blocked progress loops after posting a completion.
    fn kick(&self);
}

/// In-process transport: completions kick a condvar, progress sleeps on it.
pub struct LocalTransport {
    seq: Mutex<u64>,
    cv: Condvar,
}

impl LocalTransport {
    pub fn new() -> LocalTransport {
        LocalTransport {
            seq: Mutex::new(0),
            cv: Condvar::new(),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalTransport {
    fn progress(&self, timeout_us: i64, cond: &mut dyn FnMut() -> i32) -> Result<()> {
        let deadline =
            (timeout_us > 0).then(|| Instant::now() + Duration::from_micros(timeout_us as u64));
        loop {
            // remember the kick count before evaluating the condition, so a
            // completion racing in between does not get slept through
            let seen = *self.seq.lock();
            let rc = cond();
            if rc > 0 {
                return Ok(());
            }
            if rc < 0 {
                return Err(Error::from_code(rc).unwrap_or(Error::Inval));
            }
            if timeout_us == 0 {
                // a zero timeout is a single pass
                return Ok(());
            }

            let mut seq = self.seq.lock();
            if *seq != seen {
                continue;
            }
            match deadline {
                None => {
                    self.cv.wait(&mut seq);
                }
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self.cv.wait_until(&mut seq, deadline).timed_out()
                    {
                        drop(seq);
                        // one last harvest before giving up
                        let rc = cond();
                        if rc > 0 {
                            return Ok(());
                        }
                        if rc < 0 {
                            return Err(Error::from_code(rc).unwrap_or(Error::Inval));
                        }
                        return Err(Error::Timedout);
                    }
                }
            }
        }
    }

    fn kick(&self) {
        let mut seq = self.seq.lock();
        *seq = seq.wrapping_add(1);
        self.cv.notify_all();
    }
}
