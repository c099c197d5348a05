//! QDX - Packet DMA
//!
//! Channel and flow bookkeeping for the queue manager's packet DMA, plus the
//! infrastructure-mode transfer the engine performs on its own.
//!
//! Transmit channel `c` reads infrastructure queue `800 + c`. Every
//! descriptor it finds is delivered on receive channel `c` through the rx
//! flow named by the descriptor's destination tag: an empty descriptor is
//! taken from the flow's refill queue, the payload, length and tag are copied
//! into it, and it is pushed to the flow's destination queue. The transmit
//! descriptor goes back to its return queue with its header reset.
//!
//! ```text
//!           open            enable
//! Closed ---------> OpenDisabled ---------> OpenEnabled
//!    ^                 |    ^                   |
//!    +-----------------+    +-------------------+
//!           close                 disable
//! ```

use crate::descriptor::{DescAddr, DescriptorHeader};
use crate::error::{ChannelAction, ChannelKind, ChannelState, Error, Result};
use crate::qm::{QueueHandle, QueueManager};
use crate::types::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

// ============================================================================
// Handles
// ============================================================================

/// Handle to an opened DMA channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    kind: ChannelKind,
    id: ChannelId,
}

impl ChannelHandle {
    /// Channel direction
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Channel number
    pub fn id(&self) -> ChannelId {
        self.id
    }
}

/// Handle to a configured rx flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowHandle {
    id: FlowId,
}

impl FlowHandle {
    /// Flow number
    pub fn id(&self) -> FlowId {
        self.id
    }
}

/// Receive flow configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxFlowConfig {
    /// Queue received descriptors land in
    pub dest_queue: QueueNumber,
    /// Queue empty receive descriptors are taken from
    pub free_queue: QueueNumber,
    /// Payload offset written into received descriptors
    pub data_offset: u16,
}

impl RxFlowConfig {
    /// Flow landing in `dest` and refilled from `free`
    pub fn new(dest: QueueHandle, free: QueueHandle, data_offset: u16) -> Self {
        Self {
            dest_queue: dest.number(),
            free_queue: free.number(),
            data_offset,
        }
    }
}

/// Transfer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaStats {
    /// Packets delivered
    pub transferred: u64,
    /// Transfers stalled on an empty refill queue
    pub starved: u64,
    /// Transfers stalled on a missing or disabled receive side
    pub stalled: u64,
    /// Transmit descriptors without a return queue
    pub orphaned: u64,
}

struct DmaState {
    open: bool,
    tx: [ChannelState; DMA_CHANNELS],
    rx: [ChannelState; DMA_CHANNELS],
    flows: [Option<RxFlowConfig>; DMA_FLOWS],
}

impl DmaState {
    fn channels(&mut self, kind: ChannelKind) -> &mut [ChannelState; DMA_CHANNELS] {
        match kind {
            ChannelKind::Tx => &mut self.tx,
            ChannelKind::Rx => &mut self.rx,
        }
    }
}

// ============================================================================
// DMA Engine
// ============================================================================

/// Packet DMA instance
pub struct DmaEngine {
    state: Mutex<DmaState>,
    transferred: AtomicU64,
    starved: AtomicU64,
    stalled: AtomicU64,
    orphaned: AtomicU64,
}

impl Default for DmaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaEngine {
    /// Closed DMA instance
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DmaState {
                open: false,
                tx: [ChannelState::Closed; DMA_CHANNELS],
                rx: [ChannelState::Closed; DMA_CHANNELS],
                flows: [None; DMA_FLOWS],
            }),
            transferred: AtomicU64::new(0),
            starved: AtomicU64::new(0),
            stalled: AtomicU64::new(0),
            orphaned: AtomicU64::new(0),
        }
    }

    /// Open the instance
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.open {
            return Err(Error::AlreadyInitialized);
        }
        state.open = true;
        info!("packet DMA opened");
        Ok(())
    }

    /// Close the instance; every channel and flow must be closed first
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::DmaNotOpen);
        }
        for kind in [ChannelKind::Tx, ChannelKind::Rx] {
            if let Some(channel) = state.channels(kind).iter().position(|s| *s != ChannelState::Closed) {
                return Err(Error::ChannelInUse {
                    kind,
                    channel: channel as ChannelId,
                });
            }
        }
        if let Some(flow) = state.flows.iter().position(Option::is_some) {
            return Err(Error::FlowInUse(flow as FlowId));
        }
        state.open = false;
        info!("packet DMA closed");
        Ok(())
    }

    /// Whether the instance is open
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    // ------------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------------

    /// Open transmit channel `id` (disabled)
    pub fn open_tx_channel(&self, id: ChannelId) -> Result<ChannelHandle> {
        self.open_channel(ChannelKind::Tx, id)
    }

    /// Open receive channel `id` (disabled)
    pub fn open_rx_channel(&self, id: ChannelId) -> Result<ChannelHandle> {
        self.open_channel(ChannelKind::Rx, id)
    }

    fn open_channel(&self, kind: ChannelKind, id: ChannelId) -> Result<ChannelHandle> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::DmaNotOpen);
        }
        let slot = state
            .channels(kind)
            .get_mut(id as usize)
            .ok_or(Error::ChannelOutOfRange { kind, channel: id })?;
        if *slot != ChannelState::Closed {
            return Err(Error::ChannelInUse { kind, channel: id });
        }
        *slot = ChannelState::OpenDisabled;
        debug!(%kind, channel = id, "channel opened");
        Ok(ChannelHandle { kind, id })
    }

    /// Start moving data
    pub fn enable(&self, channel: ChannelHandle) -> Result<()> {
        self.transition(channel, ChannelAction::Enable)
    }

    /// Stop moving data
    pub fn disable(&self, channel: ChannelHandle) -> Result<()> {
        self.transition(channel, ChannelAction::Disable)
    }

    /// Release a disabled channel
    pub fn close_channel(&self, channel: ChannelHandle) -> Result<()> {
        self.transition(channel, ChannelAction::Close)
    }

    /// Current state
    pub fn channel_state(&self, kind: ChannelKind, id: ChannelId) -> ChannelState {
        let mut state = self.state.lock();
        state
            .channels(kind)
            .get(id as usize)
            .copied()
            .unwrap_or_default()
    }

    fn transition(&self, channel: ChannelHandle, action: ChannelAction) -> Result<()> {
        let ChannelHandle { kind, id } = channel;
        let mut state = self.state.lock();
        let slot = state
            .channels(kind)
            .get_mut(id as usize)
            .ok_or(Error::ChannelOutOfRange { kind, channel: id })?;
        let next = match (*slot, action) {
            (ChannelState::OpenDisabled, ChannelAction::Enable) => ChannelState::OpenEnabled,
            (ChannelState::OpenEnabled, ChannelAction::Disable) => ChannelState::OpenDisabled,
            (ChannelState::OpenDisabled, ChannelAction::Close) => ChannelState::Closed,
            (current, action) => {
                return Err(Error::ChannelState {
                    kind,
                    channel: id,
                    state: current,
                    action,
                });
            }
        };
        *slot = next;
        debug!(%kind, channel = id, ?action, "channel transition");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Flows
    // ------------------------------------------------------------------------

    /// Configure rx flow `id`
    pub fn configure_rx_flow(&self, id: FlowId, config: RxFlowConfig) -> Result<FlowHandle> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::DmaNotOpen);
        }
        let slot = state
            .flows
            .get_mut(id as usize)
            .ok_or(Error::FlowOutOfRange(id))?;
        if slot.is_some() {
            return Err(Error::FlowInUse(id));
        }
        *slot = Some(config);
        debug!(
            flow = id,
            dest = config.dest_queue,
            free = config.free_queue,
            "rx flow configured"
        );
        Ok(FlowHandle { id })
    }

    /// Release an rx flow
    pub fn close_flow(&self, flow: FlowHandle) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state
            .flows
            .get_mut(flow.id as usize)
            .ok_or(Error::FlowOutOfRange(flow.id))?;
        if slot.take().is_none() {
            return Err(Error::FlowNotConfigured(flow.id));
        }
        debug!(flow = flow.id, "rx flow closed");
        Ok(())
    }

    /// Configuration of flow `id`
    pub fn flow(&self, id: FlowId) -> Option<RxFlowConfig> {
        self.state.lock().flows.get(id as usize).copied().flatten()
    }

    // ------------------------------------------------------------------------
    // Transfer engine
    // ------------------------------------------------------------------------

    /// Move every deliverable packet; returns how many were delivered
    pub fn service(&self, qm: &QueueManager) -> usize {
        let (enabled, flows) = {
            let state = self.state.lock();
            if !state.open {
                return 0;
            }
            let enabled: Vec<ChannelId> = (0..DMA_CHANNELS)
                .filter(|&c| {
                    state.tx[c] == ChannelState::OpenEnabled && state.rx[c] == ChannelState::OpenEnabled
                })
                .map(|c| c as ChannelId)
                .collect();
            (enabled, state.flows)
        };

        let mut delivered = 0;
        for channel in enabled {
            let queue = infrastructure_queue(channel);
            while let Some(addr) = qm.pop_addr(queue) {
                match self.transfer(qm, addr, &flows) {
                    Ok(()) => delivered += 1,
                    Err(addr) => {
                        qm.push_addr(queue, addr, 0, QueueLocation::Head);
                        break;
                    }
                }
            }
        }
        if delivered > 0 {
            trace!(delivered, "dma service");
        }
        delivered
    }

    fn transfer(
        &self,
        qm: &QueueManager,
        tx: DescAddr,
        flows: &[Option<RxFlowConfig>; DMA_FLOWS],
    ) -> core::result::Result<(), DescAddr> {
        let arena = qm.arena();
        let Some(mut tx_view) = arena.view_addr(tx) else {
            warn!(desc = %tx, "foreign address in transmit queue dropped");
            return Ok(());
        };
        let header = tx_view.header();

        let Some(flow) = flows.get(header.tag.dest as usize).copied().flatten() else {
            self.stalled.fetch_add(1, Ordering::Relaxed);
            debug!(desc = %tx, flow = header.tag.dest, "no rx flow for packet");
            return Err(tx);
        };
        let Some(rx) = qm.pop_addr(flow.free_queue) else {
            self.starved.fetch_add(1, Ordering::Relaxed);
            debug!(free = flow.free_queue, "rx refill queue starved");
            return Err(tx);
        };

        let Some(mut rx_view) = arena.view_addr(rx) else {
            self.orphaned.fetch_add(1, Ordering::Relaxed);
            warn!(desc = %rx, free = flow.free_queue, "foreign address in refill queue");
            qm.push_addr(GARBAGE_QUEUE, rx, 0, QueueLocation::Tail);
            return Err(tx);
        };
        let return_queue = rx_view.return_queue();
        rx_view.write_header(&DescriptorHeader {
            packet_len: 0,
            tag: header.tag,
            return_queue,
            data_offset: flow.data_offset,
        });
        let payload = tx_view.payload();
        let len = payload.len().min(rx_view.payload_capacity());
        if len < payload.len() {
            warn!(desc = %rx, len = payload.len(), kept = len, "payload truncated on receive");
        }
        if let Err(err) = rx_view.set_data(&payload[..len]) {
            warn!(desc = %rx, %err, "receive copy failed");
        }
        drop(rx_view);
        qm.push_addr(flow.dest_queue, rx, 0, QueueLocation::Tail);

        tx_view.reset();
        drop(tx_view);
        match header.return_queue {
            Some(queue) if (queue as usize) < MAX_QUEUES => {
                qm.push_addr(queue, tx, 0, QueueLocation::Tail)
            }
            queue => {
                self.orphaned.fetch_add(1, Ordering::Relaxed);
                warn!(desc = %tx, ?queue, "transmit descriptor has no usable return queue");
                qm.push_addr(GARBAGE_QUEUE, tx, 0, QueueLocation::Tail);
            }
        }
        self.transferred.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Transfer counters
    pub fn stats(&self) -> DmaStats {
        DmaStats {
            transferred: self.transferred.load(Ordering::Relaxed),
            starved: self.starved.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
        }
    }
}
