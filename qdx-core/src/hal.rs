//! QDX - Hardware Abstraction Layer
//!
//! The HAL is the per-core view of the platform:
//! - Core identity
//! - Time measurement
//! - Busy-wait delays used by poll backoff
//! - Memory barriers
//!
//! Queue manager, DMA and accumulator state live in [`crate::soc::Soc`]; the
//! HAL only covers what differs between cores and platforms.
//!
//! # Implementing a HAL
//!
//! ```ignore
//! struct C66xHal;
//!
//! impl Hal for C66xHal {
//!     fn core_id(&self) -> CoreId {
//!         // Read DNUM
//!     }
//!
//!     fn time_us(&self) -> TimeUs {
//!         // Read TSCL/TSCH
//!     }
//!
//!     // ... implement other methods
//! }
//! ```

use crate::types::*;

// ============================================================================
// HAL Trait
// ============================================================================

/// Hardware Abstraction Layer trait
pub trait Hal {
    /// Index of the core running this code
    fn core_id(&self) -> CoreId;

    /// Get current time in microseconds
    ///
    /// Must be monotonically increasing.
    fn time_us(&self) -> TimeUs;

    /// Get current time in milliseconds
    fn time_ms(&self) -> u32 {
        (self.time_us() / 1000) as u32
    }

    /// Busy-wait delay
    fn delay_us(&self, us: u32);

    /// Hint issued on every spin iteration that does not back off
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }

    /// Memory barrier
    fn memory_barrier(&self);

    /// Get platform name
    fn platform_name(&self) -> &'static str;
}

// ============================================================================
// No-op HAL (for testing)
// ============================================================================

/// Manually clocked HAL for deterministic tests
pub struct NoopHal {
    core: CoreId,
    time: core::sync::atomic::AtomicU64,
}

impl NoopHal {
    /// Create new no-op HAL for `core`
    pub fn new(core: CoreId) -> Self {
        Self {
            core,
            time: core::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Advance time (for testing)
    pub fn advance_time(&self, us: u64) {
        self.time.fetch_add(us, core::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for NoopHal {
    fn default() -> Self {
        Self::new(SYSINIT_CORE)
    }
}

impl Hal for NoopHal {
    fn core_id(&self) -> CoreId {
        self.core
    }

    fn time_us(&self) -> TimeUs {
        self.time.load(core::sync::atomic::Ordering::SeqCst)
    }

    fn delay_us(&self, us: u32) {
        self.advance_time(us as u64);
    }

    fn memory_barrier(&self) {}

    fn platform_name(&self) -> &'static str {
        "noop"
    }
}

// ============================================================================
// Hosted HAL (one OS thread per core)
// ============================================================================

/// Hosted HAL for threads standing in for cores
pub mod hosted {
    use super::*;
    use std::sync::atomic::{fence, Ordering};
    use std::time::{Duration, Instant};

    /// HAL for running a core as a host thread
    pub struct ThreadHal {
        start: Instant,
        core: CoreId,
    }

    impl ThreadHal {
        /// Create new hosted HAL for `core`
        pub fn new(core: CoreId) -> Self {
            Self {
                start: Instant::now(),
                core,
            }
        }
    }

    impl Hal for ThreadHal {
        fn core_id(&self) -> CoreId {
            self.core
        }

        fn time_us(&self) -> TimeUs {
            self.start.elapsed().as_micros() as TimeUs
        }

        fn delay_us(&self, us: u32) {
            if us == 0 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_micros(us as u64));
            }
        }

        fn memory_barrier(&self) {
            fence(Ordering::SeqCst);
        }

        fn platform_name(&self) -> &'static str {
            "hosted"
        }
    }
}
