//! Timing perturbation for host runs
//!
//! Threads on a host interleave far more regularly than cores racing on
//! real silicon. [`JitterHal`] adds random stalls to the poll loops so the
//! barriers get exercised under less friendly schedules.

use qdx::hal::hosted::ThreadHal;
use qdx::{CoreId, Hal, TimeUs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;

/// Hosted HAL with random stalls
pub struct JitterHal {
    inner: ThreadHal,
    rng: RefCell<StdRng>,
    max_stall_us: u32,
}

impl JitterHal {
    /// HAL for `core` stalling up to `max_stall_us`
    ///
    /// Each core derives its own stream from `seed`, so a run can be
    /// repeated with the same perturbation schedule per core.
    pub fn new(core: CoreId, seed: u64, max_stall_us: u32) -> Self {
        Self {
            inner: ThreadHal::new(core),
            rng: RefCell::new(StdRng::seed_from_u64(seed ^ ((core as u64) << 32))),
            max_stall_us,
        }
    }

    fn stall(&self) -> u32 {
        if self.max_stall_us == 0 {
            return 0;
        }
        self.rng.borrow_mut().gen_range(0..=self.max_stall_us)
    }
}

impl Hal for JitterHal {
    fn core_id(&self) -> CoreId {
        self.inner.core_id()
    }

    fn time_us(&self) -> TimeUs {
        self.inner.time_us()
    }

    fn delay_us(&self, us: u32) {
        self.inner.delay_us(us.saturating_add(self.stall()));
    }

    fn cpu_relax(&self) {
        // one spin in eight becomes a real stall
        if self.rng.borrow_mut().gen_ratio(1, 8) {
            self.inner.delay_us(self.stall());
        } else {
            self.inner.cpu_relax();
        }
    }

    fn memory_barrier(&self) {
        self.inner.memory_barrier();
    }

    fn platform_name(&self) -> &'static str {
        "hosted-jitter"
    }
}
