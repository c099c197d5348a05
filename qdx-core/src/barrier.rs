//! QDX - Multicore Barriers
//!
//! # Startup
//!
//! The designated core initializes the queue manager, the DMA and the
//! descriptor pools, then publishes the init flag with a cache writeback.
//! Every other core polls the flag with an invalidate before each read and
//! only then attaches to the queue manager.
//!
//! # Rounds
//!
//! Sync tokens are plain descriptors cycling between three queues:
//!
//! ```text
//!   sync free (4000) --push--> sync cfg (2000)   configuration rendezvous
//!   sync free (4000) --push--> sync (3000)       round completion
//! ```
//!
//! Before a group of rounds every non-home core parks one token in the
//! config queue; the home core waits for all of them and returns them to the
//! free pool. When a round's data is processed the receiving core's
//! interrupt handler moves one token per core into the sync queue and then
//! bumps the round counter. Each core consumes one token per round, but only
//! once the counter shows the round completed, so a fast core cannot eat a
//! token belonging to a round it has not reached.

use crate::context::CoreContext;
use crate::error::Result;
use crate::hal::Hal;
use crate::qm::{QueueHandle, QueueManager};
use crate::shared::{FlagCache, SharedWord};
use crate::types::*;
use tracing::{debug, info, warn};

// ============================================================================
// Startup barrier
// ============================================================================

/// Clear both shared words (designated core, before initialization)
pub fn reset_flags<H: Hal>(ctx: &mut CoreContext<'_, H>) {
    for word in SharedWord::ALL {
        ctx.cache().publish(word, 0);
    }
    ctx.hal().memory_barrier();
}

/// Announce that initialization is complete
pub fn publish_init<H: Hal>(ctx: &mut CoreContext<'_, H>) {
    ctx.cache().publish(SharedWord::InitDone, 1);
    ctx.hal().memory_barrier();
    info!(core = ctx.core(), "init flag published");
}

/// Wait for the designated core to finish initialization
pub fn wait_init<H: Hal>(ctx: &mut CoreContext<'_, H>) -> Result<()> {
    debug!(core = ctx.core(), "waiting for init flag");
    ctx.spin_until("init flag", |ctx| {
        (ctx.cache().read_fresh(SharedWord::InitDone) == 1).then_some(())
    })?;
    info!(core = ctx.core(), "init flag observed");
    Ok(())
}

// ============================================================================
// Round barrier
// ============================================================================

/// Queues carrying sync tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncQueues {
    /// Configuration rendezvous
    pub cfg: QueueHandle,
    /// Round completion tokens
    pub sync: QueueHandle,
    /// Idle tokens
    pub free: QueueHandle,
}

impl SyncQueues {
    /// Open the three sync queues
    pub fn open(qm: &QueueManager) -> Result<Self> {
        Ok(Self {
            cfg: qm.open(QueueType::GeneralPurpose, SYNC_CFG_QUEUE)?,
            sync: qm.open(QueueType::GeneralPurpose, SYNC_QUEUE)?,
            free: qm.open(QueueType::GeneralPurpose, SYNC_FREE_QUEUE)?,
        })
    }
}

/// Token barrier shared by `cores` cores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundBarrier {
    queues: SyncQueues,
    cores: usize,
}

impl RoundBarrier {
    /// Barrier over `cores` cores
    pub fn new(queues: SyncQueues, cores: usize) -> Self {
        Self { queues, cores }
    }

    /// Token queues
    pub fn queues(&self) -> SyncQueues {
        self.queues
    }

    /// Participating cores
    pub fn cores(&self) -> usize {
        self.cores
    }

    /// Wait until every core has finished configuring
    pub fn rendezvous<H: Hal>(&self, ctx: &mut CoreContext<'_, H>) -> Result<()> {
        let qm = ctx.soc().qm();
        let peers = self.cores.saturating_sub(1);
        if ctx.is_sysinit() {
            ctx.spin_until("config tokens", |_| {
                (qm.occupancy(self.queues.cfg) >= peers).then_some(())
            })?;
            for _ in 0..peers {
                if let Some(token) = qm.pop(self.queues.cfg) {
                    qm.push(self.queues.free, token);
                }
            }
            debug!(core = ctx.core(), peers, "configuration rendezvous complete");
        } else {
            let token = ctx.spin_until("free sync token", |_| qm.pop(self.queues.free))?;
            qm.push(self.queues.cfg, token);
            debug!(core = ctx.core(), "configuration token parked");
        }
        Ok(())
    }

    /// Move one token per core into the sync queue; returns tokens moved
    ///
    /// An empty free pool is logged and skipped.
    pub fn signal(&self, qm: &QueueManager) -> usize {
        let mut moved = 0;
        for _ in 0..self.cores {
            match qm.pop(self.queues.free) {
                Some(token) => {
                    qm.push(self.queues.sync, token);
                    moved += 1;
                }
                None => warn!(queue = self.queues.free.number(), "no sync token available"),
            }
        }
        moved
    }

    /// Consume this core's token for `round` (0-based)
    pub fn wait_round<H: Hal>(&self, ctx: &mut CoreContext<'_, H>, round: u32) -> Result<()> {
        let qm = ctx.soc().qm();
        let token = ctx.spin_until("round token", |ctx| {
            if ctx.cache().read_fresh(SharedWord::RoundCount) <= round {
                return None;
            }
            qm.pop(self.queues.sync)
        })?;
        qm.push(self.queues.free, token);
        debug!(core = ctx.core(), round, "round token consumed");
        Ok(())
    }

    /// Wait for the round counter to reach `total`
    pub fn wait_all<H: Hal>(&self, ctx: &mut CoreContext<'_, H>, total: u32) -> Result<()> {
        ctx.spin_until("all rounds", |ctx| {
            (ctx.cache().read_fresh(SharedWord::RoundCount) == total).then_some(())
        })?;
        info!(core = ctx.core(), total, "all rounds complete");
        Ok(())
    }
}

/// Count one completed round; returns the new counter value
pub fn advance_round(cache: &mut FlagCache<'_>) -> u32 {
    cache.invalidate(SharedWord::RoundCount);
    let next = cache.read(SharedWord::RoundCount) + 1;
    cache.write(SharedWord::RoundCount, next);
    cache.writeback(SharedWord::RoundCount);
    next
}
