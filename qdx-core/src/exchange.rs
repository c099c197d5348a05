//! QDX - Descriptor Exchange
//!
//! The multicore program built from the pieces in this crate. Core 0 is the
//! producer: it initializes the system and, for every round, wires a DMA
//! channel to one consumer core and sends it a burst of packets. The consumer
//! is interrupted when its accumulator page fills, recycles the packets and
//! signals the round complete with sync tokens. Every core consumes one token
//! per round, and the run ends once the round counter shows every round done.
//!
//! Round `r` of group `g` (`r = g * cores + i`) uses channel `g * 4 + i`,
//! which the interrupt mapping routes to core `i`.
//!
//! ```text
//!  core 0                      hardware                      core i
//!  ------                      --------                      ------
//!  pop tx free (736)
//!  fill, tag, push infra 800+c
//!                       DMA: pop rx free (737), copy,
//!                            push high-priority 704+c,
//!                            tx desc -> completion (1000)
//!                       accumulator: page full, irq
//!                                                     drain page -> rx free
//!                                                     ack + EOI, disable
//!                                                     C tokens 4000 -> 3000
//!                                                     round counter += 1
//!  every core: wait counter > r, pop 3000 -> 4000
//!  core 0: divert 1000 -> 736, tear down channel
//! ```

use crate::accumulator::AccumulatorConfig;
use crate::barrier::{self, advance_round, RoundBarrier, SyncQueues};
use crate::bridge::{AccumulatorBridge, Batch, BatchSink};
use crate::config::ExchangeConfig;
use crate::context::CoreContext;
use crate::descriptor::{DescTag, DescriptorView, FormatRequest};
use crate::dma::{ChannelHandle, DmaStats, FlowHandle, RxFlowConfig};
use crate::error::{Error, Result};
use crate::hal::Hal;
use crate::intc::IsrContext;
use crate::qm::QueueHandle;
use crate::shared::FlagCache;
use crate::soc::Soc;
use crate::types::*;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};

// ============================================================================
// System queues
// ============================================================================

/// Queues every core opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemQueues {
    /// Transmit free pool
    pub tx_free: QueueHandle,
    /// Receive free pool
    pub rx_free: QueueHandle,
    /// Transmit completion (return) queue
    pub completion: QueueHandle,
    /// Sync token queues
    pub sync: SyncQueues,
}

impl SystemQueues {
    /// Named handles for statistics dumps
    pub fn named(&self) -> [(&'static str, QueueHandle); 6] {
        [
            ("tx free", self.tx_free),
            ("rx free", self.rx_free),
            ("tx completion", self.completion),
            ("sync cfg", self.sync.cfg),
            ("sync", self.sync.sync),
            ("sync free", self.sync.free),
        ]
    }
}

/// Initialize the queue manager, DMA and descriptor pools (designated core)
pub fn system_init<H: Hal>(ctx: &mut CoreContext<'_, H>, config: &ExchangeConfig) -> Result<SystemQueues> {
    config.validate()?;
    barrier::reset_flags(ctx);

    let soc = ctx.soc();
    let qm = soc.qm();
    qm.init()?;
    qm.start(ctx.core())?;
    soc.dma().open()?;

    let mono = config.monolithic;
    let mono_region = qm.insert_memory_region(mono.base, mono.desc_size, mono.count)?;
    let sync = config.sync;
    let sync_region = qm.insert_memory_region(sync.base, sync.desc_size, sync.count)?;

    let tx_free = qm.open(QueueType::GeneralPurpose, TX_FREE_QUEUE)?;
    qm.format_region(
        &FormatRequest {
            region: mono_region,
            count: config.pool_size(),
            return_queue: Some(TX_COMPLETION_QUEUE),
            data_offset: mono.data_offset,
        },
        tx_free,
    )?;

    let rx_free = qm.open(QueueType::GeneralPurpose, RX_FREE_QUEUE)?;
    qm.format_region(
        &FormatRequest {
            region: mono_region,
            count: config.pool_size(),
            return_queue: None,
            data_offset: mono.data_offset,
        },
        rx_free,
    )?;

    let sync_queues = SyncQueues::open(qm)?;
    qm.format_region(
        &FormatRequest {
            region: sync_region,
            count: sync.count,
            return_queue: None,
            data_offset: sync.data_offset,
        },
        sync_queues.free,
    )?;

    let completion = qm.open(QueueType::GeneralPurpose, TX_COMPLETION_QUEUE)?;
    let queues = SystemQueues {
        tx_free,
        rx_free,
        completion,
        sync: sync_queues,
    };

    barrier::publish_init(ctx);
    qm.log_queue_stats("after initialization", &queues.named());
    Ok(queues)
}

/// Wait for initialization and open the shared queues (other cores)
pub fn attach<H: Hal>(ctx: &mut CoreContext<'_, H>) -> Result<SystemQueues> {
    barrier::wait_init(ctx)?;
    let qm = ctx.soc().qm();
    qm.start(ctx.core())?;
    Ok(SystemQueues {
        rx_free: qm.open(QueueType::GeneralPurpose, RX_FREE_QUEUE)?,
        tx_free: qm.open(QueueType::GeneralPurpose, TX_FREE_QUEUE)?,
        completion: qm.open(QueueType::GeneralPurpose, TX_COMPLETION_QUEUE)?,
        sync: SyncQueues::open(qm)?,
    })
}

/// Close the shared queues and the DMA (designated core, after every round)
pub fn system_exit(soc: &Soc, queues: &SystemQueues) -> Result<()> {
    let qm = soc.qm();
    qm.log_queue_stats("before exit", &queues.named());
    for (name, handle) in queues.named() {
        qm.close_all(handle)?;
        debug!(queue = handle.number(), "{} closed", name);
    }
    soc.dma().close()?;
    qm.exit()?;
    info!("system deinitialized");
    Ok(())
}

// ============================================================================
// Transfers
// ============================================================================

/// Everything wired for one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// DMA and accumulator channel
    pub channel: ChannelId,
    /// Consuming core
    pub dest: CoreId,
    /// Transmit channel
    pub tx: ChannelHandle,
    /// Receive channel
    pub rx: ChannelHandle,
    /// Transmit (infrastructure) queue
    pub infra: QueueHandle,
    /// Receive (high-priority) queue
    pub hp: QueueHandle,
    /// Receive flow, numbered after the consumer
    pub flow: FlowHandle,
}

/// Open channels and queues, program the accumulator and the rx flow
pub fn open_transfer(
    soc: &Soc,
    config: &ExchangeConfig,
    queues: &SystemQueues,
    channel: ChannelId,
) -> Result<Transfer> {
    let dest = channel_core(channel);
    let dma = soc.dma();
    let qm = soc.qm();

    let tx = dma.open_tx_channel(channel)?;
    let rx = dma.open_rx_channel(channel)?;
    let infra = qm.open(QueueType::Infrastructure, infrastructure_queue(channel))?;
    let hp = qm.open(QueueType::HighPriority, high_priority_queue(channel))?;

    soc.accumulator()
        .program(AccumulatorConfig::for_channel(channel, config.max_page_entries()))?;

    let flow = dma.configure_rx_flow(
        dest,
        RxFlowConfig::new(hp, queues.rx_free, config.monolithic.data_offset),
    )?;

    dma.enable(tx)?;
    dma.enable(rx)?;
    info!(channel, dest, infra = infra.number(), hp = hp.number(), "transfer opened");
    Ok(Transfer {
        channel,
        dest,
        tx,
        rx,
        infra,
        hp,
        flow,
    })
}

/// Payload carried by every packet of `round`
pub fn packet_payload(round: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (round as u8).wrapping_add(i as u8)).collect()
}

/// Whether `payload` was produced by [`packet_payload`]
pub fn payload_is_intact(payload: &[u8]) -> bool {
    payload
        .windows(2)
        .all(|pair| pair[1] == pair[0].wrapping_add(1))
}

/// Push `count` packets from the tx free pool to the transfer's queue
pub fn send_packets(
    soc: &Soc,
    queues: &SystemQueues,
    transfer: &Transfer,
    producer: CoreId,
    round: u32,
    count: usize,
    payload_len: usize,
) -> Result<usize> {
    let qm = soc.qm();
    let payload = packet_payload(round, payload_len);
    for _ in 0..count {
        let desc = qm
            .pop(queues.tx_free)
            .ok_or(Error::QueueEmpty(queues.tx_free.number()))?;
        let data_offset = {
            let mut view = qm.view(&desc);
            if let Err(err) = view.set_data(&payload) {
                drop(view);
                qm.push_head(queues.tx_free, desc);
                return Err(err);
            }
            view.set_tag(DescTag {
                src: producer as u16,
                dest: transfer.dest as u16,
            });
            view.data_offset() as u32
        };
        qm.push_sized(transfer.infra, desc, data_offset, QueueLocation::Tail);
    }
    info!(channel = transfer.channel, dest = transfer.dest, count, "packets sent");
    Ok(count)
}

/// Tear down everything [`open_transfer`] set up
pub fn close_transfer(soc: &Soc, transfer: &Transfer) -> Result<()> {
    let qm = soc.qm();
    let dma = soc.dma();
    if soc.accumulator().is_enabled(transfer.channel) {
        soc.accumulator().disable(qm, transfer.channel)?;
    }
    qm.close(transfer.hp)?;
    qm.close(transfer.infra)?;
    dma.disable(transfer.tx)?;
    dma.disable(transfer.rx)?;
    dma.close_channel(transfer.tx)?;
    dma.close_channel(transfer.rx)?;
    dma.close_flow(transfer.flow)?;
    debug!(channel = transfer.channel, "transfer closed");
    Ok(())
}

// ============================================================================
// Round signaling
// ============================================================================

/// One drained accumulator page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoundRecord {
    /// Round counter value after this page (1-based round number)
    pub round: u32,
    /// Core whose handler drained the page
    pub core: CoreId,
    /// Accumulator channel
    pub channel: ChannelId,
    /// Descriptors drained
    pub packets: usize,
    /// Sync tokens pushed
    pub tokens: usize,
    /// Every payload arrived unaltered
    pub payload_intact: bool,
    /// Every tag named this core as destination
    pub routed: bool,
    /// SoC tick at completion
    pub tick: Tick,
}

/// Pages drained on one core
pub type RoundLedger = Arc<Mutex<Vec<RoundRecord>>>;

/// Batch sink completing a round: tokens to every core, then the counter
pub struct RoundSignaler {
    barrier: RoundBarrier,
    ledger: RoundLedger,
    payload_intact: bool,
}

impl RoundSignaler {
    /// Signal through `barrier`, recording into `ledger`
    pub fn new(barrier: RoundBarrier, ledger: RoundLedger) -> Self {
        Self {
            barrier,
            ledger,
            payload_intact: true,
        }
    }
}

impl BatchSink for RoundSignaler {
    fn on_batch(&mut self, _isr: &IsrContext<'_>, _channel: ChannelId, descriptors: &[DescriptorView<'_>]) {
        self.payload_intact = descriptors
            .iter()
            .all(|view| payload_is_intact(view.payload()));
    }

    fn after_ack(&mut self, isr: &IsrContext<'_>, channel: ChannelId, batch: &Batch) {
        let tokens = self.barrier.signal(isr.soc.qm());
        if tokens < self.barrier.cores() {
            warn!(core = isr.core, tokens, "round signaled with missing tokens");
        }
        let round = advance_round(&mut FlagCache::new(isr.soc.shared()));
        let routed = batch.iter().all(|item| item.tag.dest == isr.core as u16);
        info!(core = isr.core, channel, round, packets = batch.len(), "round complete");
        self.ledger.lock().push(RoundRecord {
            round,
            core: isr.core,
            channel,
            packets: batch.len(),
            tokens,
            payload_intact: self.payload_intact,
            routed,
            tick: isr.soc.tick(),
        });
    }
}

// ============================================================================
// Per-core program
// ============================================================================

/// What one core did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreReport {
    /// Core index
    pub core: CoreId,
    /// Round tokens consumed
    pub rounds: u32,
    /// Interrupts serviced
    pub interrupts: u64,
    /// Pages this core drained
    pub batches: Vec<RoundRecord>,
    /// Packets this core sent
    pub packets_sent: usize,
    /// Wall time in microseconds
    pub elapsed_us: u64,
}

/// Run the exchange on one core
pub fn run_core<H: Hal>(soc: &Soc, hal: H, config: &ExchangeConfig) -> Result<CoreReport> {
    let started = hal.time_us();
    let mut ctx = CoreContext::new(soc, hal, config.poll);
    let core = ctx.core();
    let span = info_span!("core", core);
    let _enter = span.enter();

    let queues = if ctx.is_sysinit() {
        system_init(&mut ctx, config)?
    } else {
        attach(&mut ctx)?
    };
    let barrier = RoundBarrier::new(queues.sync, config.cores);
    let ledger: RoundLedger = Arc::default();
    let mut rounds = 0;
    let mut packets_sent = 0;

    for group in 0..config.iterations {
        let base = (group * ACC_CHANNEL_GROUP) as ChannelId;
        let own = base + core;
        ctx.register_handler(
            channel_event(own),
            Box::new(AccumulatorBridge::new(
                own,
                config.mode,
                queues.rx_free,
                RoundSignaler::new(barrier, ledger.clone()),
            )),
        )?;
        barrier.rendezvous(&mut ctx)?;

        for index in 0..config.cores {
            let round = (group * config.cores + index) as u32;
            let channel = base + index as ChannelId;

            let transfer = if ctx.is_sysinit() {
                let transfer = open_transfer(soc, config, &queues, channel)?;
                packets_sent += send_packets(
                    soc,
                    &queues,
                    &transfer,
                    core,
                    round,
                    config.packets_per_round,
                    config.payload_len,
                )?;
                soc.qm().log_queue_stats("before packet processing", &queues.named());
                Some(transfer)
            } else {
                None
            };

            barrier.wait_round(&mut ctx, round)?;
            rounds += 1;

            if let Some(transfer) = transfer {
                soc.qm().divert(queues.completion, queues.tx_free, QueueLocation::Tail);
                close_transfer(soc, &transfer)?;
                soc.qm().log_queue_stats("after packet processing", &queues.named());
            }
        }
    }

    barrier.wait_all(&mut ctx, config.rounds())?;
    if ctx.is_sysinit() {
        system_exit(soc, &queues)?;
    }

    let batches = ledger.lock().clone();
    Ok(CoreReport {
        core,
        rounds,
        interrupts: ctx.interrupts_serviced(),
        batches,
        packets_sent,
        elapsed_us: ctx.hal().time_us().saturating_sub(started),
    })
}

// ============================================================================
// Whole cluster
// ============================================================================

/// Occupancy of every queue that holds descriptors at rest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCensus {
    /// Transmit free pool
    pub tx_free: usize,
    /// Receive free pool
    pub rx_free: usize,
    /// Transmit completion queue
    pub completion: usize,
    /// Sync config queue
    pub sync_cfg: usize,
    /// Sync queue
    pub sync: usize,
    /// Sync token free pool
    pub sync_free: usize,
    /// Descriptors returned without a return queue
    pub garbage: usize,
}

impl PoolCensus {
    /// Read the queues directly
    pub fn take(soc: &Soc) -> Self {
        let qm = soc.qm();
        Self {
            tx_free: qm.occupancy_of(TX_FREE_QUEUE),
            rx_free: qm.occupancy_of(RX_FREE_QUEUE),
            completion: qm.occupancy_of(TX_COMPLETION_QUEUE),
            sync_cfg: qm.occupancy_of(SYNC_CFG_QUEUE),
            sync: qm.occupancy_of(SYNC_QUEUE),
            sync_free: qm.occupancy_of(SYNC_FREE_QUEUE),
            garbage: qm.occupancy_of(GARBAGE_QUEUE),
        }
    }
}

/// DMA counters in report form
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DmaSummary {
    /// Packets delivered
    pub transferred: u64,
    /// Refill starvation events
    pub starved: u64,
    /// Transfers held on a missing receive side
    pub stalled: u64,
    /// Transmit descriptors without a return queue
    pub orphaned: u64,
}

impl From<DmaStats> for DmaSummary {
    fn from(stats: DmaStats) -> Self {
        Self {
            transferred: stats.transferred,
            starved: stats.starved,
            stalled: stats.stalled,
            orphaned: stats.orphaned,
        }
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct ClusterReport {
    /// Configuration used
    pub config: ExchangeConfig,
    /// Per-core results, by core index
    pub cores: Vec<CoreReport>,
    /// Final round counter
    pub round_counter: u32,
    /// Queue occupancy after exit
    pub pools: PoolCensus,
    /// DMA counters
    pub dma: DmaSummary,
    /// Hardware ticks
    pub ticks: Tick,
}

impl ClusterReport {
    /// Pages drained across all cores
    pub fn batches(&self) -> impl Iterator<Item = &RoundRecord> {
        self.cores.iter().flat_map(|core| core.batches.iter())
    }

    /// Packets delivered to consumers across all cores
    pub fn packets_received(&self) -> usize {
        self.batches().map(|batch| batch.packets).sum()
    }
}

/// Run the exchange on `config.cores` threads plus a hardware thread
///
/// `make_hal` is called on each core's thread with its index.
pub fn run_cluster<H, F>(config: &ExchangeConfig, make_hal: F) -> Result<ClusterReport>
where
    H: Hal,
    F: Fn(CoreId) -> H + Sync,
{
    config.validate()?;
    let soc = Soc::new();
    let stop = AtomicBool::new(false);
    info!(cores = config.cores, rounds = config.rounds(), "starting exchange");

    let (results, hardware) = std::thread::scope(|s| {
        let hardware = s.spawn(|| soc.run_hardware(&stop, Duration::from_micros(20)));

        let workers: Vec<_> = (0..config.cores as CoreId)
            .map(|core| {
                let soc = &soc;
                let make_hal = &make_hal;
                s.spawn(move || {
                    let result = run_core(soc, make_hal(core), config);
                    if let Err(err) = &result {
                        error!(core, %err, "core failed");
                        soc.halt();
                    }
                    result
                })
            })
            .collect();

        let results: Vec<Result<CoreReport>> = workers
            .into_iter()
            .enumerate()
            .map(|(core, worker)| {
                worker.join().unwrap_or_else(|_| {
                    soc.halt();
                    Err(Error::CorePanicked(core as CoreId))
                })
            })
            .collect();

        stop.store(true, Ordering::Release);
        let hardware = hardware.join().map_err(|_| Error::HardwarePanicked);
        (results, hardware)
    });
    let ticks = hardware?;

    let mut cores = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        match result {
            Ok(report) => cores.push(report),
            Err(err) => {
                // a halted core is a consequence; report the cause
                if first_error.is_none() || matches!(first_error, Some(Error::Halted(_))) {
                    first_error = Some(err);
                }
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    let report = ClusterReport {
        config: config.clone(),
        cores,
        round_counter: soc.shared().peek(crate::shared::SharedWord::RoundCount),
        pools: PoolCensus::take(&soc),
        dma: soc.dma().stats().into(),
        ticks,
    };
    info!(
        rounds = report.round_counter,
        received = report.packets_received(),
        ticks,
        "exchange finished"
    );
    Ok(report)
}

/// Mode-independent check that a finished run left every pool whole
pub fn pools_restored(report: &ClusterReport) -> bool {
    let config = &report.config;
    let pools = report.pools;
    pools.tx_free == config.pool_size() as usize
        && pools.rx_free == config.pool_size() as usize
        && pools.sync_free == config.sync.count as usize
        && pools.completion == 0
        && pools.sync == 0
        && pools.sync_cfg == 0
        && pools.garbage == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::AccumulatorMode;
    use crate::hal::NoopHal;
    use crate::poll::PollPolicy;

    #[test]
    fn test_payload_pattern() {
        let payload = packet_payload(3, 16);
        assert_eq!(payload[0], 3);
        assert_eq!(payload[15], 18);
        assert!(payload_is_intact(&payload));
        assert!(!payload_is_intact(&[1, 2, 4]));
        assert!(payload_is_intact(&packet_payload(250, 16)));
    }

    #[test]
    fn test_single_core_round_by_hand() {
        let soc = Soc::new();
        let config = ExchangeConfig {
            cores: 1,
            poll: PollPolicy::bounded(1_000),
            ..ExchangeConfig::default()
        };
        let mut ctx = CoreContext::new(&soc, NoopHal::new(0), config.poll);
        let queues = system_init(&mut ctx, &config).unwrap();
        let barrier = RoundBarrier::new(queues.sync, 1);
        let ledger: RoundLedger = Arc::default();
        ctx.register_handler(
            channel_event(0),
            Box::new(AccumulatorBridge::new(
                0,
                AccumulatorMode::OneShot,
                queues.rx_free,
                RoundSignaler::new(barrier, ledger.clone()),
            )),
        )
        .unwrap();

        let transfer = open_transfer(&soc, &config, &queues, 0).unwrap();
        send_packets(&soc, &queues, &transfer, 0, 0, 8, 16).unwrap();
        assert_eq!(soc.qm().occupancy(transfer.infra), 8);

        let report = soc.step();
        assert_eq!(report.transferred, 8);
        assert_eq!(report.interrupts, 1);

        barrier.wait_round(&mut ctx, 0).unwrap();
        let records = ledger.lock().clone();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].packets, 8);
        assert!(records[0].payload_intact);
        assert!(records[0].routed);
        assert!(!soc.accumulator().is_enabled(0));

        assert_eq!(soc.qm().occupancy(queues.completion), 8);
        soc.qm().divert(queues.completion, queues.tx_free, QueueLocation::Tail);
        close_transfer(&soc, &transfer).unwrap();
        system_exit(&soc, &queues).unwrap();

        let pools = PoolCensus::take(&soc);
        assert_eq!(pools.tx_free, 32);
        assert_eq!(pools.rx_free, 32);
        assert_eq!(pools.sync_free, 32);
    }

    #[test]
    fn test_send_requires_free_descriptors() {
        let soc = Soc::new();
        let config = ExchangeConfig {
            cores: 1,
            ..ExchangeConfig::default()
        };
        let mut ctx = CoreContext::new(&soc, NoopHal::new(0), config.poll);
        let queues = system_init(&mut ctx, &config).unwrap();
        let transfer = open_transfer(&soc, &config, &queues, 0).unwrap();
        assert_eq!(
            send_packets(&soc, &queues, &transfer, 0, 0, 1, 200),
            Err(Error::PayloadTooLarge { len: 200, capacity: 144 })
        );
        assert_eq!(soc.qm().occupancy(queues.tx_free), 32);
        assert_eq!(
            send_packets(&soc, &queues, &transfer, 0, 0, 33, 16),
            Err(Error::QueueEmpty(TX_FREE_QUEUE))
        );
    }

    #[test]
    fn test_transfer_conflicts_are_configuration_errors() {
        let soc = Soc::new();
        let config = ExchangeConfig::default();
        let mut ctx = CoreContext::new(&soc, NoopHal::new(0), config.poll);
        let queues = system_init(&mut ctx, &config).unwrap();
        open_transfer(&soc, &config, &queues, 1).unwrap();
        let err = open_transfer(&soc, &config, &queues, 1).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Configuration);
    }
}
