//! QDX - High-Priority Accumulator
//!
//! Firmware that watches a high-priority queue and collects the addresses of
//! arriving descriptors into a ping/pong list. Each page holds a count word
//! followed by up to `max_page_entries - 1` addresses. When a page fills, or
//! the pacing timer expires with something collected, the page is frozen, the
//! owning core is interrupted and collection moves to the other page.
//!
//! A frozen page stays frozen until the host acknowledges it. If both pages
//! are frozen, new arrivals wait in the queue.

use crate::descriptor::DescAddr;
use crate::error::{Error, Result};
use crate::intc::InterruptController;
use crate::qm::QueueManager;
use crate::types::*;
use heapless::Vec;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Addresses one page can hold
pub const PAGE_CAPACITY: usize = ACC_MAX_PAGE_ENTRIES - 1;

/// Interrupt pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingMode {
    /// Interrupt only on a full page
    #[default]
    None,
    /// Also interrupt when `timer_load_count` ticks pass since the last
    /// interrupt and the page is not empty
    SinceLastInterrupt,
}

/// Channel programming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorConfig {
    /// Accumulator channel
    pub channel: ChannelId,
    /// Monitored queue, must be the channel's high-priority queue
    pub queue: QueueNumber,
    /// Page size in words including the count word
    pub max_page_entries: usize,
    /// Pacing timer reload, in ticks
    pub timer_load_count: u32,
    /// Pacing mode
    pub pacing: PacingMode,
}

impl AccumulatorConfig {
    /// Full-page interrupts on `channel`'s high-priority queue
    pub fn for_channel(channel: ChannelId, max_page_entries: usize) -> Self {
        Self {
            channel,
            queue: high_priority_queue(channel),
            max_page_entries,
            timer_load_count: 0,
            pacing: PacingMode::None,
        }
    }
}

/// Frozen page contents handed to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    /// Channel the page belongs to
    pub channel: ChannelId,
    /// Ping (0) or pong (1)
    pub page: usize,
    /// Collected addresses in arrival order
    pub entries: Vec<DescAddr, PAGE_CAPACITY>,
}

impl PageSnapshot {
    /// Count word followed by the address words
    pub fn words(&self) -> Vec<u32, ACC_MAX_PAGE_ENTRIES> {
        let mut words = Vec::new();
        let _ = words.push(self.entries.len() as u32);
        for addr in &self.entries {
            let _ = words.push(addr.0);
        }
        words
    }

    /// Number of collected entries
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Default)]
struct Page {
    entries: Vec<DescAddr, PAGE_CAPACITY>,
    frozen: bool,
    taken: bool,
}

impl Page {
    fn release(&mut self) {
        self.entries.clear();
        self.frozen = false;
        self.taken = false;
    }
}

#[derive(Debug)]
struct AccChannel {
    config: AccumulatorConfig,
    pages: [Page; 2],
    active: usize,
    drain: usize,
    idle_ticks: u64,
    interrupts: u64,
}

impl AccChannel {
    fn threshold(&self) -> usize {
        self.config.max_page_entries - 1
    }

    fn freeze(&mut self, intc: &InterruptController) {
        let channel = self.config.channel;
        let page = &mut self.pages[self.active];
        page.frozen = true;
        trace!(channel, page = self.active, count = page.entries.len(), "page frozen");
        self.active ^= 1;
        self.idle_ticks = 0;
        self.interrupts += 1;
        if let Err(err) = intc.raise(channel_core(channel), channel_event(channel)) {
            warn!(channel, %err, "accumulator interrupt lost");
        }
    }
}

/// Status of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorStatus {
    /// Programming in effect
    pub config: AccumulatorConfig,
    /// Page being filled
    pub active_page: usize,
    /// Pages frozen and waiting for the host
    pub frozen_pages: usize,
    /// Interrupts raised since programming
    pub interrupts: u64,
}

// ============================================================================
// Accumulator
// ============================================================================

/// High-priority accumulator firmware
pub struct Accumulator {
    channels: Mutex<[Option<AccChannel>; ACC_CHANNELS]>,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator {
    /// Every channel disabled
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(core::array::from_fn(|_| None)),
        }
    }

    /// Enable a channel
    pub fn program(&self, config: AccumulatorConfig) -> Result<()> {
        let channel = config.channel;
        if channel as usize >= ACC_CHANNELS {
            return Err(Error::AccumulatorChannelOutOfRange(channel));
        }
        if config.queue != high_priority_queue(channel) {
            return Err(Error::AccumulatorQueueMismatch {
                channel,
                queue: config.queue,
            });
        }
        if !(2..=ACC_MAX_PAGE_ENTRIES).contains(&config.max_page_entries) {
            return Err(Error::InvalidPageSize(config.max_page_entries));
        }

        let mut channels = self.channels.lock();
        let slot = &mut channels[channel as usize];
        if slot.is_some() {
            return Err(Error::AccumulatorBusy(channel));
        }
        *slot = Some(AccChannel {
            config,
            pages: Default::default(),
            active: 0,
            drain: 0,
            idle_ticks: 0,
            interrupts: 0,
        });
        debug!(
            channel,
            queue = config.queue,
            max_page_entries = config.max_page_entries,
            "accumulator programmed"
        );
        Ok(())
    }

    /// Disable a channel
    ///
    /// Collected entries the host has not taken go back to the head of the
    /// monitored queue in arrival order. Returns how many went back.
    pub fn disable(&self, qm: &QueueManager, channel: ChannelId) -> Result<usize> {
        let state = {
            let mut channels = self.channels.lock();
            channels
                .get_mut(channel as usize)
                .ok_or(Error::AccumulatorChannelOutOfRange(channel))?
                .take()
                .ok_or(Error::AccumulatorIdle(channel))?
        };

        let mut returned: std::vec::Vec<DescAddr> = std::vec::Vec::new();
        for index in [state.drain, state.drain ^ 1] {
            let page = &state.pages[index];
            if !page.taken {
                returned.extend(page.entries.iter().copied());
            }
        }
        for addr in returned.iter().rev() {
            qm.push_addr(state.config.queue, *addr, 0, QueueLocation::Head);
        }
        debug!(channel, returned = returned.len(), "accumulator disabled");
        Ok(returned.len())
    }

    /// Whether `channel` is programmed
    pub fn is_enabled(&self, channel: ChannelId) -> bool {
        self.channels
            .lock()
            .get(channel as usize)
            .is_some_and(Option::is_some)
    }

    /// Status of `channel`
    pub fn status(&self, channel: ChannelId) -> Option<AccumulatorStatus> {
        let channels = self.channels.lock();
        let state = channels.get(channel as usize)?.as_ref()?;
        Some(AccumulatorStatus {
            config: state.config,
            active_page: state.active,
            frozen_pages: state.pages.iter().filter(|p| p.frozen).count(),
            interrupts: state.interrupts,
        })
    }

    /// Collect arrivals on every channel; returns interrupts raised
    pub fn service(&self, qm: &QueueManager, intc: &InterruptController) -> usize {
        let mut raised = 0;
        let mut channels = self.channels.lock();
        for state in channels.iter_mut().flatten() {
            loop {
                if state.pages[state.active].frozen {
                    break;
                }
                if state.pages[state.active].entries.len() >= state.threshold() {
                    state.freeze(intc);
                    raised += 1;
                    continue;
                }
                let Some(addr) = qm.pop_addr(state.config.queue) else {
                    break;
                };
                let active = state.active;
                if state.pages[active].entries.push(addr).is_err() {
                    qm.push_addr(state.config.queue, addr, 0, QueueLocation::Head);
                    break;
                }
            }

            state.idle_ticks += 1;
            let page = &state.pages[state.active];
            if state.config.pacing == PacingMode::SinceLastInterrupt
                && state.config.timer_load_count > 0
                && state.idle_ticks >= state.config.timer_load_count as u64
                && !page.frozen
                && !page.entries.is_empty()
            {
                state.freeze(intc);
                raised += 1;
            }
        }
        raised
    }

    /// Oldest frozen page of `channel`, if any
    ///
    /// The page stays frozen until [`Accumulator::ack`].
    pub fn take_page(&self, channel: ChannelId) -> Result<Option<PageSnapshot>> {
        let mut channels = self.channels.lock();
        let state = channels
            .get_mut(channel as usize)
            .ok_or(Error::AccumulatorChannelOutOfRange(channel))?
            .as_mut()
            .ok_or(Error::AccumulatorIdle(channel))?;
        let index = state.drain;
        let page = &mut state.pages[index];
        if !page.frozen {
            return Ok(None);
        }
        page.taken = true;
        Ok(Some(PageSnapshot {
            channel,
            page: index,
            entries: page.entries.clone(),
        }))
    }

    /// Return the oldest frozen page to the firmware
    pub fn ack(&self, channel: ChannelId) -> Result<()> {
        let mut channels = self.channels.lock();
        let state = channels
            .get_mut(channel as usize)
            .ok_or(Error::AccumulatorChannelOutOfRange(channel))?
            .as_mut()
            .ok_or(Error::AccumulatorIdle(channel))?;
        let index = state.drain;
        if !state.pages[index].frozen {
            warn!(channel, page = index, "ack without a frozen page");
            return Ok(());
        }
        state.pages[index].release();
        state.drain ^= 1;
        trace!(channel, page = index, "page acknowledged");
        Ok(())
    }
}
