//! QDX - Simulated SoC
//!
//! Everything the cores share: the queue manager with its descriptor memory,
//! the packet DMA, the accumulator firmware, the interrupt controller and the
//! shared flag words.
//!
//! The DMA and accumulator are autonomous on real silicon. Here they advance
//! when [`Soc::step`] is called, either from a dedicated hardware thread or
//! directly from a test.

use crate::accumulator::Accumulator;
use crate::dma::DmaEngine;
use crate::intc::InterruptController;
use crate::qm::QueueManager;
use crate::shared::SharedRegion;
use crate::types::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Work done by one [`Soc::step`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Tick the step ran at
    pub tick: Tick,
    /// Packets the DMA delivered
    pub transferred: usize,
    /// Interrupts the accumulator raised
    pub interrupts: usize,
}

impl StepReport {
    /// Whether anything moved
    pub fn is_idle(&self) -> bool {
        self.transferred == 0 && self.interrupts == 0
    }
}

/// Shared hardware
pub struct Soc {
    qm: QueueManager,
    dma: DmaEngine,
    accumulator: Accumulator,
    intc: InterruptController,
    shared: SharedRegion,
    tick: AtomicU64,
    halted: AtomicBool,
}

impl Default for Soc {
    fn default() -> Self {
        Self::new()
    }
}

impl Soc {
    /// SoC whose linking RAM indexes [`MAX_DESCRIPTORS`]
    pub fn new() -> Self {
        Self::with_max_descriptors(MAX_DESCRIPTORS)
    }

    /// SoC whose linking RAM indexes `max_descriptors`
    pub fn with_max_descriptors(max_descriptors: u32) -> Self {
        Self {
            qm: QueueManager::new(max_descriptors),
            dma: DmaEngine::new(),
            accumulator: Accumulator::new(),
            intc: InterruptController::new(),
            shared: SharedRegion::new(),
            tick: AtomicU64::new(0),
            halted: AtomicBool::new(false),
        }
    }

    /// Queue manager
    pub fn qm(&self) -> &QueueManager {
        &self.qm
    }

    /// Packet DMA
    pub fn dma(&self) -> &DmaEngine {
        &self.dma
    }

    /// Accumulator firmware
    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    /// Interrupt controller
    pub fn intc(&self) -> &InterruptController {
        &self.intc
    }

    /// Shared flag memory
    pub fn shared(&self) -> &SharedRegion {
        &self.shared
    }

    /// Ticks elapsed
    pub fn tick(&self) -> Tick {
        self.tick.load(Ordering::Acquire)
    }

    /// Stop every core at its next poll point
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            warn!("soc halted");
        }
    }

    /// Whether [`Soc::halt`] was called
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Advance the DMA and the accumulator by one tick
    pub fn step(&self) -> StepReport {
        let tick = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        let transferred = self.dma.service(&self.qm);
        let interrupts = self.accumulator.service(&self.qm, &self.intc);
        StepReport {
            tick,
            transferred,
            interrupts,
        }
    }

    /// Step until `stop` is set, sleeping `idle` after steps that moved nothing
    ///
    /// A panic while stepping halts the SoC before it unwinds.
    pub fn run_hardware(&self, stop: &AtomicBool, idle: Duration) -> Tick {
        let _halt = HaltOnUnwind(self);
        debug!("hardware thread running");
        while !stop.load(Ordering::Acquire) {
            if self.step().is_idle() {
                if idle.is_zero() {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(idle);
                }
            }
        }
        let ticks = self.tick();
        debug!(ticks, "hardware thread stopped");
        ticks
    }
}

/// Halts the SoC if dropped during a panic
struct HaltOnUnwind<'a>(&'a Soc);

impl Drop for HaltOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("hardware thread panicked");
            self.0.halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_step() {
        let soc = Soc::new();
        let report = soc.step();
        assert!(report.is_idle());
        assert_eq!(report.tick, 1);
        assert_eq!(soc.tick(), 1);
    }

    #[test]
    fn test_hardware_thread_stops() {
        let soc = Soc::new();
        let stop = AtomicBool::new(false);
        std::thread::scope(|s| {
            let hw = s.spawn(|| soc.run_hardware(&stop, Duration::from_micros(10)));
            std::thread::sleep(Duration::from_millis(5));
            stop.store(true, Ordering::Release);
            assert!(hw.join().unwrap() > 0);
        });
    }

    #[test]
    fn test_hardware_panic_halts() {
        let soc = Soc::new();
        let outcome = std::thread::scope(|s| {
            s.spawn(|| {
                let _halt = HaltOnUnwind(&soc);
                panic!("queue index out of range");
            })
            .join()
        });
        assert!(outcome.is_err());
        assert!(soc.is_halted());

        let quiet = Soc::new();
        drop(HaltOnUnwind(&quiet));
        assert!(!quiet.is_halted());
    }
}
