//! # QDX: Queue Descriptor Exchange
//!
//! Packet descriptor exchange between processor cores that share one
//! hardware queue manager, one packet DMA and a high-priority accumulator.
//!
//! ## Building Blocks
//!
//! ### 1. Hardware Queues
//!
//! Descriptors live in fixed memory regions and only ever move between
//! queues. A descriptor handle is consumed by every push, so exactly one
//! owner holds it at any time.
//!
//! ### 2. Infrastructure DMA
//!
//! A transmit channel drains its infrastructure queue, lands each payload in
//! an empty descriptor from the rx flow's refill queue and returns the
//! transmit descriptor to its return queue.
//!
//! ### 3. Accumulator Interrupts
//!
//! The accumulator collects arrivals on a high-priority queue into ping/pong
//! pages and interrupts the owning core. [`bridge::AccumulatorBridge`] drains
//! the page, recycles the descriptors and signals the application.
//!
//! ### 4. Token Barriers
//!
//! Cores agree on startup through a cache-flushed init flag and on round
//! completion through sync token descriptors plus a shared round counter.
//!
//! ## Quick Start
//!
//! ```ignore
//! use qdx::prelude::*;
//! use qdx::hal::hosted::ThreadHal;
//!
//! let config = ExchangeConfig::default();
//! let report = qdx::exchange::run_cluster(&config, ThreadHal::new)?;
//! assert_eq!(report.round_counter, config.rounds());
//! ```
//!
//! The hardware is simulated: every core is a thread and [`soc::Soc::step`]
//! advances the DMA and the accumulator.

#![warn(missing_docs)]

// Core modules
pub mod types;
pub mod error;
pub mod hal;
pub mod shared;
pub mod descriptor;
pub mod qm;
pub mod dma;
pub mod accumulator;
pub mod intc;
pub mod soc;
pub mod poll;
pub mod context;
pub mod bridge;
pub mod barrier;
pub mod config;
pub mod exchange;

// Re-exports for convenience
pub use types::*;
pub use error::{ChannelAction, ChannelKind, ChannelState, Error, ErrorClass, Result};
pub use hal::{Hal, NoopHal};
pub use shared::{FlagCache, SharedRegion, SharedWord};
pub use descriptor::{DescAddr, DescTag, DescriptorArena, DescriptorHeader, DescriptorRef, DescriptorView, FormatRequest};
pub use qm::{QueueEntry, QueueHandle, QueueManager};
pub use dma::{ChannelHandle, DmaEngine, DmaStats, FlowHandle, RxFlowConfig};
pub use accumulator::{Accumulator, AccumulatorConfig, PacingMode, PageSnapshot};
pub use intc::{InterruptController, InterruptDispatcher, InterruptMask, IsrContext, IsrHandler};
pub use soc::{Soc, StepReport};
pub use poll::{spin_until, PollPolicy};
pub use context::CoreContext;
pub use bridge::{AccumulatorBridge, AccumulatorMode, Batch, BatchItem, BatchSink};
pub use barrier::{RoundBarrier, SyncQueues};
pub use config::{ExchangeConfig, RegionConfig};
pub use exchange::{ClusterReport, CoreReport, RoundRecord, SystemQueues};

/// Prelude - commonly used items
pub mod prelude {
    pub use crate::types::*;
    pub use crate::error::{Error, Result};
    pub use crate::hal::Hal;
    pub use crate::qm::{QueueHandle, QueueManager};
    pub use crate::soc::Soc;
    pub use crate::context::CoreContext;
    pub use crate::config::ExchangeConfig;
}

// ============================================================================
// Version
// ============================================================================

/// Major version
pub const VERSION_MAJOR: u32 = 0;
/// Minor version
pub const VERSION_MINOR: u32 = 1;
/// Patch version
pub const VERSION_PATCH: u32 = 0;
/// Version string
pub const VERSION_STRING: &str = "0.1.0";
