//! QDX - Spin Polling
//!
//! Every wait in the exchange is an explicit poll loop. [`PollPolicy`] says
//! how hard to spin before backing off and, optionally, when to give up.

use crate::error::{Error, Result};
use crate::hal::Hal;
use serde::{Deserialize, Serialize};

/// How a poll loop spins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Failed polls between backoffs
    pub spin: u32,
    /// Backoff delay in microseconds (0 yields)
    pub backoff_us: u32,
    /// Give up after this many polls
    pub max_polls: Option<u64>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            spin: 16,
            backoff_us: 0,
            max_polls: None,
        }
    }
}

impl PollPolicy {
    /// Policy that gives up after `max_polls`
    pub fn bounded(max_polls: u64) -> Self {
        Self {
            max_polls: Some(max_polls),
            ..Self::default()
        }
    }
}

/// Progress of one poll loop
#[derive(Debug)]
pub struct Poller {
    policy: PollPolicy,
    what: &'static str,
    polls: u64,
}

impl Poller {
    /// Start waiting for `what`
    pub fn new(policy: PollPolicy, what: &'static str) -> Self {
        Self {
            policy,
            what,
            polls: 0,
        }
    }

    /// Record a failed poll and pause before the next one
    pub fn idle<H: Hal + ?Sized>(&mut self, hal: &H) -> Result<()> {
        self.polls += 1;
        if let Some(max) = self.policy.max_polls {
            if self.polls >= max {
                return Err(Error::Timeout {
                    what: self.what,
                    polls: self.polls,
                });
            }
        }
        if self.policy.spin == 0 || self.polls % self.policy.spin as u64 == 0 {
            hal.delay_us(self.policy.backoff_us);
        } else {
            hal.cpu_relax();
        }
        Ok(())
    }

    /// Failed polls so far
    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// What is being waited for
    pub fn what(&self) -> &'static str {
        self.what
    }
}

/// Poll `check` until it yields a value
pub fn spin_until<H, T>(
    hal: &H,
    policy: PollPolicy,
    what: &'static str,
    mut check: impl FnMut() -> Option<T>,
) -> Result<T>
where
    H: Hal + ?Sized,
{
    let mut poller = Poller::new(policy, what);
    loop {
        hal.memory_barrier();
        if let Some(value) = check() {
            return Ok(value);
        }
        poller.idle(hal)?;
    }
}
