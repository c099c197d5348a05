//! QDX - Accumulator Interrupt Bridge
//!
//! Interrupt handler that turns a frozen accumulator page into a batch of
//! work. On every interrupt it:
//!
//! 1. reads the frozen count and addresses of the page,
//! 2. hands the batch to the application and recycles every descriptor to
//!    the free queue with its header reset,
//! 3. acknowledges the page and signals end-of-interrupt,
//! 4. disables the channel when running one-shot,
//! 5. runs the application's post-acknowledge signaling.
//!
//! The handler never fails. Anything unexpected is logged and the
//! acknowledgement still happens.

use crate::accumulator::PAGE_CAPACITY;
use crate::descriptor::{DescAddr, DescTag, DescriptorView};
use crate::intc::{IsrContext, IsrHandler};
use crate::qm::QueueHandle;
use crate::types::*;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// What happens to the channel after a page is drained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulatorMode {
    /// Disable the channel after the first page
    #[default]
    OneShot,
    /// Keep collecting
    Continuous,
}

/// One drained descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchItem {
    /// Descriptor address
    pub addr: DescAddr,
    /// Routing tag it arrived with
    pub tag: DescTag,
    /// Payload length it arrived with
    pub packet_len: u32,
}

/// Descriptors drained by one interrupt
pub type Batch = Vec<BatchItem, PAGE_CAPACITY>;

/// Application side of the bridge
pub trait BatchSink: Send {
    /// Inspect the received descriptors before they are recycled
    fn on_batch(&mut self, _isr: &IsrContext<'_>, _channel: ChannelId, _descriptors: &[DescriptorView<'_>]) {}

    /// Signal completion once the page is acknowledged
    fn after_ack(&mut self, isr: &IsrContext<'_>, channel: ChannelId, batch: &Batch);
}

/// Handler draining one accumulator channel
pub struct AccumulatorBridge<S: BatchSink> {
    channel: ChannelId,
    mode: AccumulatorMode,
    free_queue: QueueHandle,
    sink: S,
    batches: u64,
    descriptors: u64,
}

impl<S: BatchSink> AccumulatorBridge<S> {
    /// Drain `channel`, recycling into `free_queue`
    pub fn new(channel: ChannelId, mode: AccumulatorMode, free_queue: QueueHandle, sink: S) -> Self {
        Self {
            channel,
            mode,
            free_queue,
            sink,
            batches: 0,
            descriptors: 0,
        }
    }

    /// Channel served
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Pages drained so far
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Descriptors drained so far
    pub fn descriptors(&self) -> u64 {
        self.descriptors
    }

    /// Application sink
    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn drain(&mut self, isr: &IsrContext<'_>) -> Option<Batch> {
        let soc = isr.soc;
        let page = match soc.accumulator().take_page(self.channel) {
            Ok(Some(page)) => page,
            Ok(None) => {
                debug!(core = isr.core, channel = self.channel, "interrupt without a frozen page");
                return None;
            }
            Err(err) => {
                error!(core = isr.core, channel = self.channel, %err, "accumulator page unreadable");
                return None;
            }
        };

        let arena = soc.qm().arena();
        let mut views: std::vec::Vec<DescriptorView<'_>> = page
            .entries
            .iter()
            .filter_map(|&addr| {
                let view = arena.view_addr(addr);
                if view.is_none() {
                    warn!(core = isr.core, desc = %addr, "foreign address in accumulator list");
                }
                view
            })
            .collect();

        self.sink.on_batch(isr, self.channel, &views);

        let mut batch = Batch::new();
        for view in views.iter_mut() {
            let _ = batch.push(BatchItem {
                addr: view.addr(),
                tag: view.tag(),
                packet_len: view.packet_len(),
            });
            view.reset();
        }
        drop(views);

        for item in &batch {
            soc.qm()
                .push_addr(self.free_queue.number(), item.addr, 0, QueueLocation::Tail);
        }
        debug!(
            core = isr.core,
            channel = self.channel,
            count = batch.len(),
            "accumulator page drained"
        );
        Some(batch)
    }
}

impl<S: BatchSink> IsrHandler for AccumulatorBridge<S> {
    fn handle(&mut self, isr: &IsrContext<'_>) {
        let soc = isr.soc;
        if event_channel(isr.event, isr.core) != Some(self.channel) {
            warn!(
                core = isr.core,
                event = isr.event,
                channel = self.channel,
                "event does not belong to this channel"
            );
        }

        let batch = self.drain(isr);

        if let Err(err) = soc.accumulator().ack(self.channel) {
            warn!(core = isr.core, channel = self.channel, %err, "page acknowledge failed");
        }
        isr.end_of_interrupt();

        match self.mode {
            AccumulatorMode::OneShot => {
                if let Err(err) = soc.accumulator().disable(soc.qm(), self.channel) {
                    error!(core = isr.core, channel = self.channel, %err, "disabling accumulator failed");
                }
            }
            AccumulatorMode::Continuous => {
                // both pages may have frozen while this one was serviced
                let backlog = soc
                    .accumulator()
                    .status(self.channel)
                    .map_or(0, |status| status.frozen_pages);
                if backlog > 0 {
                    let _ = soc.intc().raise(isr.core, isr.event);
                }
            }
        }

        if let Some(batch) = batch {
            self.batches += 1;
            self.descriptors += batch.len() as u64;
            self.sink.after_ack(isr, self.channel, &batch);
        }
    }
}
