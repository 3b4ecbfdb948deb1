//! Retransmit budget for UDPR waits.
//!
//! Every UDPR wait (CONACC after CONN, ACC after DATA, the next DATA on the
//! server) gets a fixed timeout.  When it expires the waiter resends its last
//! packet and waits again, up to `max_retransmits` times; one more expiry
//! ends the session with [`ConnError::Timeout`].  A wait therefore sends its
//! packet at most `1 + max_retransmits` times.
//!
//! The timer hands out absolute deadlines so a packet that is received and
//! ignored does not extend the wait.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::Config;
use crate::connection::ConnError;

#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    timeout: Duration,
    max_retransmits: u32,
    /// Retransmissions spent on the current wait.
    retransmits: u32,
    /// Retransmissions over the life of the session.
    total: u32,
}

impl RetransmitTimer {
    pub fn new(cfg: &Config) -> Self {
        Self {
            timeout: cfg.timeout,
            max_retransmits: cfg.max_retransmits,
            retransmits: 0,
            total: 0,
        }
    }

    /// Start a fresh timeout period from now and return its deadline.
    pub fn arm(&self) -> Instant {
        Instant::now() + self.timeout
    }

    /// Record an expired wait.
    ///
    /// Returns the retransmission number the caller should now perform, or
    /// [`ConnError::Timeout`] once the budget is spent.
    pub fn on_timeout(&mut self) -> Result<u32, ConnError> {
        if self.retransmits >= self.max_retransmits {
            return Err(ConnError::Timeout {
                retransmits: self.retransmits,
            });
        }
        self.retransmits += 1;
        self.total += 1;
        Ok(self.retransmits)
    }

    /// Begin a new wait with a full budget.
    pub fn reset(&mut self) {
        self.retransmits = 0;
    }

    pub fn total_retransmits(&self) -> u32 {
        self.total
    }
}
