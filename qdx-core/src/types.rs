//! QDX - Base types and hardware constants
//!
//! Queue numbering, channel routing and descriptor geometry are fixed at
//! compile time and must be agreed identically by every core.

// ============================================================================
// Cluster Constants
// ============================================================================

/// Cores sharing the queue manager
pub const NUM_CORES: usize = 4;

/// Core that performs system initialization and drives the transfers
pub const SYSINIT_CORE: CoreId = 0;

/// Queues exposed by the queue manager
pub const MAX_QUEUES: usize = 8192;

/// Descriptors the linking RAM can index
pub const MAX_DESCRIPTORS: u32 = 2048;

/// Descriptor memory regions
pub const MAX_MEMORY_REGIONS: usize = 20;

/// Packet DMA transmit/receive channels
pub const DMA_CHANNELS: usize = 32;

/// Packet DMA receive flows
pub const DMA_FLOWS: usize = 32;

/// High-priority accumulator channels
pub const ACC_CHANNELS: usize = 32;

/// Words per accumulator page, count word included
pub const ACC_MAX_PAGE_ENTRIES: usize = 33;

/// High-priority channels that share one interrupt event
pub const ACC_CHANNEL_GROUP: usize = 4;

/// First interrupt event of the high-priority accumulator
pub const HIGH_PRIORITY_EVENT_BASE: EventId = 48;

// ============================================================================
// Queue Map
// ============================================================================

/// First high-priority (accumulator-backed) queue
pub const HIGH_PRIORITY_QUEUE_BASE: QueueNumber = 704;

/// First infrastructure (DMA transmit) queue
pub const INFRASTRUCTURE_QUEUE_BASE: QueueNumber = 800;

/// Transmit free descriptor pool
pub const TX_FREE_QUEUE: QueueNumber = 736;

/// Receive free descriptor pool (rx flow refill source)
pub const RX_FREE_QUEUE: QueueNumber = 737;

/// Transmit descriptors return here after the DMA consumed them
pub const TX_COMPLETION_QUEUE: QueueNumber = 1000;

/// Configuration acknowledgements (round barrier)
pub const SYNC_CFG_QUEUE: QueueNumber = 2000;

/// Round-completion tokens
pub const SYNC_QUEUE: QueueNumber = 3000;

/// Free synchronization tokens
pub const SYNC_FREE_QUEUE: QueueNumber = 4000;

/// Transmit descriptors without a return queue end up here
pub const GARBAGE_QUEUE: QueueNumber = 5000;

// ============================================================================
// Descriptor Geometry
// ============================================================================

/// Monolithic descriptors (split evenly between tx and rx pools)
pub const NUM_MONOLITHIC_DESC: u32 = 64;

/// Monolithic descriptor size in bytes
pub const SIZE_MONOLITHIC_DESC: usize = 160;

/// Payload offset inside a monolithic descriptor
pub const MONOLITHIC_DESC_DATA_OFFSET: u16 = 16;

/// Synchronization token descriptors
pub const NUM_SYNC_DESC: u32 = 32;

/// Synchronization descriptor size in bytes
pub const SIZE_SYNC_DESC: usize = 32;

/// Payload bytes sent per packet
pub const SIZE_DATA_BUFFER: usize = 16;

/// Packets sent per round
pub const NUM_PACKETS: usize = 8;

/// Global address of the monolithic descriptor region
pub const MONOLITHIC_REGION_BASE: u32 = 0x1080_0000;

/// Global address of the synchronization descriptor region
pub const SYNC_REGION_BASE: u32 = 0x1084_0000;

// ============================================================================
// Basic Types
// ============================================================================

/// Core index
pub type CoreId = u8;

/// Queue number in the flat queue manager namespace
pub type QueueNumber = u16;

/// DMA or accumulator channel
pub type ChannelId = u8;

/// Receive flow identifier
pub type FlowId = u8;

/// Interrupt event identifier
pub type EventId = u8;

/// Timestamp in microseconds
pub type TimeUs = u64;

/// Hardware tick (one `Soc::step`)
pub type Tick = u64;

// ============================================================================
// Queue Types
// ============================================================================

/// Queue type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum QueueType {
    /// Plain FIFO usable by software
    GeneralPurpose,
    /// Feeds a DMA transmit channel
    Infrastructure,
    /// Monitored by a high-priority accumulator channel
    HighPriority,
}

impl QueueType {
    /// Queue numbers reserved for this type
    pub fn range(self) -> core::ops::Range<QueueNumber> {
        match self {
            QueueType::HighPriority => {
                HIGH_PRIORITY_QUEUE_BASE..HIGH_PRIORITY_QUEUE_BASE + ACC_CHANNELS as QueueNumber
            }
            QueueType::Infrastructure => {
                INFRASTRUCTURE_QUEUE_BASE..INFRASTRUCTURE_QUEUE_BASE + DMA_CHANNELS as QueueNumber
            }
            QueueType::GeneralPurpose => 0..MAX_QUEUES as QueueNumber,
        }
    }

    /// Type implied by a queue number
    pub fn of(queue: QueueNumber) -> QueueType {
        if QueueType::HighPriority.range().contains(&queue) {
            QueueType::HighPriority
        } else if QueueType::Infrastructure.range().contains(&queue) {
            QueueType::Infrastructure
        } else {
            QueueType::GeneralPurpose
        }
    }

    /// Check that `queue` may be opened as this type
    pub fn admits(self, queue: QueueNumber) -> bool {
        (queue as usize) < MAX_QUEUES && QueueType::of(queue) == self
    }
}

/// Where a push lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueLocation {
    /// Next to be popped
    Head,
    /// Last to be popped
    #[default]
    Tail,
}

// ============================================================================
// Routing
// ============================================================================

/// High-priority queue monitored by accumulator `channel`
pub const fn high_priority_queue(channel: ChannelId) -> QueueNumber {
    HIGH_PRIORITY_QUEUE_BASE + channel as QueueNumber
}

/// Infrastructure queue read by transmit `channel`
pub const fn infrastructure_queue(channel: ChannelId) -> QueueNumber {
    INFRASTRUCTURE_QUEUE_BASE + channel as QueueNumber
}

/// Core interrupted by high-priority `channel`
pub const fn channel_core(channel: ChannelId) -> CoreId {
    (channel as usize % ACC_CHANNEL_GROUP) as CoreId
}

/// Interrupt event raised by high-priority `channel`
pub const fn channel_event(channel: ChannelId) -> EventId {
    HIGH_PRIORITY_EVENT_BASE + (channel as usize / ACC_CHANNEL_GROUP) as EventId
}

/// High-priority channel behind `event` on `core`
pub fn event_channel(event: EventId, core: CoreId) -> Option<ChannelId> {
    let group = event.checked_sub(HIGH_PRIORITY_EVENT_BASE)? as usize;
    let channel = group * ACC_CHANNEL_GROUP + core as usize;
    if (core as usize) < ACC_CHANNEL_GROUP && channel < ACC_CHANNELS {
        Some(channel as ChannelId)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_ranges_disjoint() {
        let fixed = [
            TX_FREE_QUEUE,
            RX_FREE_QUEUE,
            TX_COMPLETION_QUEUE,
            SYNC_CFG_QUEUE,
            SYNC_QUEUE,
            SYNC_FREE_QUEUE,
            GARBAGE_QUEUE,
        ];
        for q in fixed {
            assert_eq!(QueueType::of(q), QueueType::GeneralPurpose, "queue {}", q);
        }
        let hp = QueueType::HighPriority.range();
        let infra = QueueType::Infrastructure.range();
        assert!(hp.end <= infra.start);
    }

    #[test]
    fn test_admits() {
        assert!(QueueType::HighPriority.admits(704));
        assert!(!QueueType::HighPriority.admits(800));
        assert!(QueueType::Infrastructure.admits(831));
        assert!(!QueueType::GeneralPurpose.admits(805));
        assert!(QueueType::GeneralPurpose.admits(8191));
        assert!(!QueueType::GeneralPurpose.admits(8192));
    }

    #[test]
    fn test_event_mapping() {
        assert_eq!(channel_event(0), 48);
        assert_eq!(channel_event(5), 49);
        assert_eq!(channel_core(5), 1);
        for channel in 0..ACC_CHANNELS as ChannelId {
            let event = channel_event(channel);
            assert_eq!(event_channel(event, channel_core(channel)), Some(channel));
        }
        assert_eq!(event_channel(47, 0), None);
        assert_eq!(event_channel(56, 0), None);
    }
}
