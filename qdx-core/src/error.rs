//! QDX - Error types
//!
//! Every fallible operation returns [`Result`]. Errors fall into three
//! classes (see [`ErrorClass`]): configuration errors abort initialization,
//! transient conditions are expected and polled through, and protocol
//! violations are logic errors in the caller.

use crate::types::{ChannelId, CoreId, EventId, FlowId, QueueNumber, QueueType};
use thiserror::Error;

/// Result type for QDX operations
pub type Result<T> = core::result::Result<T, Error>;

/// DMA channel direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum ChannelKind {
    /// Transmit channel (reads an infrastructure queue)
    Tx,
    /// Receive channel (lands payloads through an rx flow)
    Rx,
}

impl core::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ChannelKind::Tx => write!(f, "tx"),
            ChannelKind::Rx => write!(f, "rx"),
        }
    }
}

/// Channel life-cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum ChannelState {
    /// Not opened
    #[default]
    Closed,
    /// Opened, not moving data
    OpenDisabled,
    /// Opened and moving data
    OpenEnabled,
}

/// Operation requested on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum ChannelAction {
    /// Open the channel (starts disabled)
    Open,
    /// Start moving data
    Enable,
    /// Stop moving data
    Disable,
    /// Release the channel
    Close,
}

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Resource in use, hardware maximum exceeded, memory insufficient.
    /// Fatal at startup, never retried.
    Configuration,
    /// Empty queue, exhausted pool, poll limit. Expected and non-fatal.
    Transient,
    /// Illegal state transition requested by the caller.
    Protocol,
}

/// Error codes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Queue manager used before the designated core initialized it
    #[error("queue manager subsystem is not initialized")]
    NotInitialized,

    /// Second initialization of the queue manager
    #[error("queue manager subsystem is already initialized")]
    AlreadyInitialized,

    /// Queue number does not belong to the requested queue type
    #[error("queue {queue} is outside the {kind:?} range")]
    QueueOutOfRange { queue: QueueNumber, kind: QueueType },

    /// Queue is already open as a different type
    #[error("queue {queue} is already owned as {owner:?}")]
    QueueTypeConflict { queue: QueueNumber, owner: QueueType },

    /// Close on a queue with no outstanding opens
    #[error("queue {0} is not open")]
    QueueNotOpen(QueueNumber),

    /// No unopened queue left in the requested range
    #[error("no free {0:?} queue")]
    NoFreeQueue(QueueType),

    /// Memory region table is full
    #[error("memory region table is full")]
    RegionTableFull,

    /// Memory region overlaps an already inserted region
    #[error("memory region at {base:#010x} overlaps region {other}")]
    RegionOverlap { base: u32, other: usize },

    /// Descriptor size not usable for a memory region
    #[error("invalid descriptor size {0}")]
    InvalidDescriptorSize(usize),

    /// Linking RAM cannot index this many descriptors
    #[error("descriptor limit exceeded: {requested} requested, {available} available")]
    DescriptorLimit { requested: u32, available: u32 },

    /// Region does not exist
    #[error("memory region {0} is not inserted")]
    UnknownRegion(usize),

    /// Region could not supply every requested descriptor
    #[error("memory region {region} exhausted: {requested} requested, {allocated} allocated")]
    RegionExhausted {
        region: usize,
        requested: u32,
        allocated: u32,
    },

    /// Payload does not fit in the descriptor
    #[error("payload of {len} bytes exceeds descriptor capacity {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },

    /// CPDMA instance not opened
    #[error("packet DMA is not open")]
    DmaNotOpen,

    /// Channel id beyond the hardware maximum
    #[error("{kind} channel {channel} is out of range")]
    ChannelOutOfRange { kind: ChannelKind, channel: ChannelId },

    /// Channel is already opened by someone else
    #[error("{kind} channel {channel} is already open")]
    ChannelInUse { kind: ChannelKind, channel: ChannelId },

    /// Illegal channel state transition
    #[error("{kind} channel {channel}: cannot {action:?} while {state:?}")]
    ChannelState {
        kind: ChannelKind,
        channel: ChannelId,
        state: ChannelState,
        action: ChannelAction,
    },

    /// Flow id beyond the hardware maximum
    #[error("rx flow {0} is out of range")]
    FlowOutOfRange(FlowId),

    /// Flow already configured
    #[error("rx flow {0} is already configured")]
    FlowInUse(FlowId),

    /// Flow not configured
    #[error("rx flow {0} is not configured")]
    FlowNotConfigured(FlowId),

    /// Accumulator channel beyond the firmware maximum
    #[error("accumulator channel {0} is out of range")]
    AccumulatorChannelOutOfRange(ChannelId),

    /// Accumulator channel already programmed
    #[error("accumulator channel {0} is already enabled")]
    AccumulatorBusy(ChannelId),

    /// Accumulator channel not programmed
    #[error("accumulator channel {0} is not enabled")]
    AccumulatorIdle(ChannelId),

    /// Page size outside what the list memory holds
    #[error("invalid accumulator page size {0}")]
    InvalidPageSize(usize),

    /// Monitored queue is not the channel's high-priority queue
    #[error("queue {queue} cannot be served by accumulator channel {channel}")]
    AccumulatorQueueMismatch { channel: ChannelId, queue: QueueNumber },

    /// Core or event outside the interrupt controller
    #[error("event {event} on core {core} does not exist")]
    InvalidEvent { core: CoreId, event: EventId },

    /// Handler already bound to this event
    #[error("event {0} already has a handler")]
    HandlerExists(EventId),

    /// Return queue beyond the queue manager
    #[error("return queue {0} does not exist")]
    InvalidReturnQueue(QueueNumber),

    /// Rejected configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be read or parsed
    #[error("configuration file: {0}")]
    ConfigFile(String),

    /// Queue was empty when a descriptor was required
    #[error("queue {0} is empty")]
    QueueEmpty(QueueNumber),

    /// Poll loop reached its configured limit
    #[error("gave up waiting for {what} after {polls} polls")]
    Timeout { what: &'static str, polls: u64 },

    /// Another core failed and the SoC was halted
    #[error("soc halted while waiting for {0}")]
    Halted(&'static str),

    /// A core thread terminated abnormally
    #[error("core {0} panicked")]
    CorePanicked(CoreId),

    /// The hardware thread panicked
    #[error("hardware thread panicked")]
    HardwarePanicked,
}

impl Error {
    /// Classify the error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::QueueEmpty(_) | Error::Timeout { .. } => ErrorClass::Transient,
            Error::ChannelState { .. }
            | Error::QueueNotOpen(_)
            | Error::AccumulatorIdle(_)
            | Error::Halted(_)
            | Error::CorePanicked(_)
            | Error::HardwarePanicked => ErrorClass::Protocol,
            _ => ErrorClass::Configuration,
        }
    }

    /// Whether the caller must abort instead of polling again
    pub fn is_fatal(&self) -> bool {
        self.class() != ErrorClass::Transient
    }
}
