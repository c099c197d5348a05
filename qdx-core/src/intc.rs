//! QDX - Interrupt Controller
//!
//! Per-core event lines. The accumulator raises an event on the core that
//! owns the channel; the core services it at its next poll point through an
//! [`InterruptDispatcher`]. An event being serviced is not delivered again
//! until end-of-interrupt, and a masked core receives nothing.

use crate::error::{Error, Result};
use crate::types::*;
use heapless::Vec;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Event lines per core
pub const EVENTS_PER_CORE: usize = 64;

/// Handlers one core can register
pub const MAX_HANDLERS: usize = 16;

// ============================================================================
// Controller
// ============================================================================

#[derive(Default)]
struct CoreLines {
    pending: AtomicU64,
    enabled: AtomicU64,
    in_service: AtomicU64,
    mask_depth: AtomicU32,
}

/// Event lines for every core
pub struct InterruptController {
    cores: [CoreLines; NUM_CORES],
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController {
    /// All lines clear and disabled
    pub fn new() -> Self {
        Self {
            cores: Default::default(),
        }
    }

    fn lines(&self, core: CoreId, event: EventId) -> Result<(&CoreLines, u64)> {
        match self.cores.get(core as usize) {
            Some(lines) if (event as usize) < EVENTS_PER_CORE => Ok((lines, 1u64 << event)),
            _ => Err(Error::InvalidEvent { core, event }),
        }
    }

    /// Latch `event` on `core`
    pub fn raise(&self, core: CoreId, event: EventId) -> Result<()> {
        let (lines, bit) = self.lines(core, event)?;
        lines.pending.fetch_or(bit, Ordering::AcqRel);
        Ok(())
    }

    /// Clear a latched event without servicing it
    pub fn clear(&self, core: CoreId, event: EventId) -> Result<()> {
        let (lines, bit) = self.lines(core, event)?;
        lines.pending.fetch_and(!bit, Ordering::AcqRel);
        Ok(())
    }

    /// Allow delivery of `event`
    pub fn enable(&self, core: CoreId, event: EventId) -> Result<()> {
        let (lines, bit) = self.lines(core, event)?;
        lines.enabled.fetch_or(bit, Ordering::AcqRel);
        Ok(())
    }

    /// Stop delivery of `event`; latching continues
    pub fn disable(&self, core: CoreId, event: EventId) -> Result<()> {
        let (lines, bit) = self.lines(core, event)?;
        lines.enabled.fetch_and(!bit, Ordering::AcqRel);
        Ok(())
    }

    /// Whether `event` is latched on `core`
    pub fn is_pending(&self, core: CoreId, event: EventId) -> bool {
        self.lines(core, event)
            .map(|(lines, bit)| lines.pending.load(Ordering::Acquire) & bit != 0)
            .unwrap_or(false)
    }

    /// Claim the lowest deliverable event on `core`
    ///
    /// The event moves from pending to in-service.
    pub fn take_next(&self, core: CoreId) -> Option<EventId> {
        let lines = self.cores.get(core as usize)?;
        if lines.mask_depth.load(Ordering::Acquire) > 0 {
            return None;
        }
        loop {
            let pending = lines.pending.load(Ordering::Acquire);
            let ready = pending
                & lines.enabled.load(Ordering::Acquire)
                & !lines.in_service.load(Ordering::Acquire);
            if ready == 0 {
                return None;
            }
            let bit = ready & ready.wrapping_neg();
            if lines
                .pending
                .compare_exchange(pending, pending & !bit, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                lines.in_service.fetch_or(bit, Ordering::AcqRel);
                return Some(bit.trailing_zeros() as EventId);
            }
        }
    }

    /// Signal end-of-interrupt so `event` can be delivered again
    pub fn end_of_interrupt(&self, core: CoreId, event: EventId) {
        if let Ok((lines, bit)) = self.lines(core, event) {
            lines.in_service.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// Whether `event` is being serviced on `core`
    pub fn in_service(&self, core: CoreId, event: EventId) -> bool {
        self.lines(core, event)
            .map(|(lines, bit)| lines.in_service.load(Ordering::Acquire) & bit != 0)
            .unwrap_or(false)
    }

    /// Hold off delivery on `core` until the guard drops
    pub fn mask(&self, core: CoreId) -> InterruptMask<'_> {
        if let Some(lines) = self.cores.get(core as usize) {
            lines.mask_depth.fetch_add(1, Ordering::AcqRel);
        }
        InterruptMask { intc: self, core }
    }
}

/// Masks a core's interrupts while alive
#[must_use = "interrupts are unmasked as soon as the guard is dropped"]
pub struct InterruptMask<'a> {
    intc: &'a InterruptController,
    core: CoreId,
}

impl Drop for InterruptMask<'_> {
    fn drop(&mut self) {
        if let Some(lines) = self.intc.cores.get(self.core as usize) {
            lines.mask_depth.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// State handed to a handler
pub struct IsrContext<'a> {
    /// Interrupted core
    pub core: CoreId,
    /// Event being serviced
    pub event: EventId,
    /// The SoC the interrupt came from
    pub soc: &'a crate::soc::Soc,
    eoi_sent: core::cell::Cell<bool>,
}

impl IsrContext<'_> {
    /// Signal end-of-interrupt
    pub fn end_of_interrupt(&self) {
        self.soc.intc().end_of_interrupt(self.core, self.event);
        self.eoi_sent.set(true);
    }
}

/// Interrupt service routine
///
/// Handlers run to completion with the core's interrupts masked and never
/// fail; problems are logged.
pub trait IsrHandler: Send {
    /// Service one occurrence of the bound event
    fn handle(&mut self, isr: &IsrContext<'_>);
}

/// Per-core table binding events to handlers
pub struct InterruptDispatcher {
    core: CoreId,
    handlers: Vec<(EventId, Box<dyn IsrHandler>), MAX_HANDLERS>,
    serviced: u64,
}

impl InterruptDispatcher {
    /// Empty table for `core`
    pub fn new(core: CoreId) -> Self {
        Self {
            core,
            handlers: Vec::new(),
            serviced: 0,
        }
    }

    /// Bind `handler` to `event` and enable the line
    pub fn register(
        &mut self,
        intc: &InterruptController,
        event: EventId,
        handler: Box<dyn IsrHandler>,
    ) -> Result<()> {
        if self.handlers.iter().any(|(e, _)| *e == event) {
            return Err(Error::HandlerExists(event));
        }
        intc.lines(self.core, event)?;
        self.handlers
            .push((event, handler))
            .map_err(|_| Error::InvalidConfig(format!("more than {} handlers on core {}", MAX_HANDLERS, self.core)))?;
        intc.clear(self.core, event)?;
        intc.enable(self.core, event)?;
        debug!(core = self.core, event, "interrupt handler registered");
        Ok(())
    }

    /// Unbind `event` and disable the line; returns the handler
    pub fn unregister(&mut self, intc: &InterruptController, event: EventId) -> Option<Box<dyn IsrHandler>> {
        let position = self.handlers.iter().position(|(e, _)| *e == event)?;
        let _ = intc.disable(self.core, event);
        Some(self.handlers.swap_remove(position).1)
    }

    /// Whether a handler is bound to `event`
    pub fn is_registered(&self, event: EventId) -> bool {
        self.handlers.iter().any(|(e, _)| *e == event)
    }

    /// Run handlers for every deliverable event; returns how many ran
    pub fn service(&mut self, soc: &crate::soc::Soc) -> usize {
        let intc = soc.intc();
        let mut ran = 0;
        while let Some(event) = intc.take_next(self.core) {
            let _mask = intc.mask(self.core);
            let isr = IsrContext {
                core: self.core,
                event,
                soc,
                eoi_sent: core::cell::Cell::new(false),
            };
            match self.handlers.iter_mut().find(|(e, _)| *e == event) {
                Some((_, handler)) => handler.handle(&isr),
                None => warn!(core = self.core, event, "spurious interrupt"),
            }
            if !isr.eoi_sent.get() {
                intc.end_of_interrupt(self.core, event);
            }
            ran += 1;
        }
        self.serviced += ran as u64;
        ran
    }

    /// Interrupts serviced so far
    pub fn serviced(&self) -> u64 {
        self.serviced
    }
}
