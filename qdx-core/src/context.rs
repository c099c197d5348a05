//! QDX - Core Context
//!
//! Everything one core carries while it runs the exchange: its HAL, its view
//! of the shared flags through a private cache, and its interrupt table.
//! Waiting goes through [`CoreContext::spin_until`], which services pending
//! interrupts on every iteration the way an unmasked core would take them
//! between instructions.

use crate::error::{Error, Result};
use crate::hal::Hal;
use crate::intc::{InterruptDispatcher, InterruptMask, IsrHandler};
use crate::poll::{PollPolicy, Poller};
use crate::shared::FlagCache;
use crate::soc::Soc;
use crate::types::*;

/// Per-core execution state
pub struct CoreContext<'a, H: Hal> {
    core: CoreId,
    soc: &'a Soc,
    hal: H,
    cache: FlagCache<'a>,
    dispatcher: InterruptDispatcher,
    policy: PollPolicy,
}

impl<'a, H: Hal> CoreContext<'a, H> {
    /// Context for the core `hal` runs on
    pub fn new(soc: &'a Soc, hal: H, policy: PollPolicy) -> Self {
        let core = hal.core_id();
        Self {
            core,
            soc,
            hal,
            cache: FlagCache::new(soc.shared()),
            dispatcher: InterruptDispatcher::new(core),
            policy,
        }
    }

    /// Core index
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Whether this core initializes the system
    pub fn is_sysinit(&self) -> bool {
        self.core == SYSINIT_CORE
    }

    /// Shared hardware
    pub fn soc(&self) -> &'a Soc {
        self.soc
    }

    /// Platform layer
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// This core's cache of the shared flags
    pub fn cache(&mut self) -> &mut FlagCache<'a> {
        &mut self.cache
    }

    /// Poll policy in effect
    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Bind an interrupt handler to `event` on this core
    pub fn register_handler(&mut self, event: EventId, handler: Box<dyn IsrHandler>) -> Result<()> {
        self.dispatcher.register(self.soc.intc(), event, handler)
    }

    /// Run handlers for pending interrupts
    pub fn service_interrupts(&mut self) -> usize {
        self.dispatcher.service(self.soc)
    }

    /// Interrupts serviced so far
    pub fn interrupts_serviced(&self) -> u64 {
        self.dispatcher.serviced()
    }

    /// Hold off interrupts on this core until the guard drops
    pub fn mask_interrupts(&self) -> InterruptMask<'a> {
        self.soc.intc().mask(self.core)
    }

    /// Poll `check` until it yields, servicing interrupts in between
    pub fn spin_until<T>(
        &mut self,
        what: &'static str,
        mut check: impl FnMut(&mut Self) -> Option<T>,
    ) -> Result<T> {
        let mut poller = Poller::new(self.policy, what);
        loop {
            self.service_interrupts();
            self.hal.memory_barrier();
            if let Some(value) = check(self) {
                return Ok(value);
            }
            if self.soc.is_halted() {
                return Err(Error::Halted(what));
            }
            poller.idle(&self.hal)?;
        }
    }
}
