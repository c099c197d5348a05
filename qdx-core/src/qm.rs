//! QDX - Queue Manager
//!
//! Hardware FIFOs holding descriptor addresses. Push and pop are atomic per
//! queue; occupancy is maintained by the queue itself. Queues are the only
//! primitive cores use to talk to each other.
//!
//! Opening is reference counted: every core opens the shared queues it uses
//! and the queue is released when the last open is closed. Descriptors left
//! in a released queue stay there, as they would in hardware.

use crate::descriptor::{DescAddr, DescriptorArena, DescriptorRef, DescriptorView, FormatRequest};
use crate::error::{Error, Result};
use crate::types::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

// ============================================================================
// Handles
// ============================================================================

/// Handle to an opened queue
///
/// Push, pop and occupancy address the queue by number and do not check the
/// open count, as the hardware does not. A handle kept past the last close
/// still reaches the same queue; [`QueueManager::is_open`] tells the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    number: QueueNumber,
}

impl QueueHandle {
    /// Queue number
    pub fn number(&self) -> QueueNumber {
        self.number
    }
}

/// One queued descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    /// Descriptor address
    pub addr: DescAddr,
    /// Size hint given on push
    pub size_hint: u32,
}

#[derive(Debug, Default)]
struct HwQueue {
    entries: VecDeque<QueueEntry>,
    owner: Option<QueueType>,
    opens: u32,
}

// ============================================================================
// Queue Manager
// ============================================================================

/// Queue manager subsystem
pub struct QueueManager {
    arena: DescriptorArena,
    queues: Box<[Mutex<HwQueue>]>,
    initialized: AtomicBool,
}

impl QueueManager {
    /// Create an uninitialized queue manager able to index `max_descriptors`
    pub fn new(max_descriptors: u32) -> Self {
        Self {
            arena: DescriptorArena::new(max_descriptors),
            queues: (0..MAX_QUEUES).map(|_| Mutex::new(HwQueue::default())).collect(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Initialize the subsystem (once, on the designated core)
    pub fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyInitialized);
        }
        info!("queue manager initialized");
        Ok(())
    }

    /// Attach a core to an initialized subsystem
    pub fn start(&self, core: CoreId) -> Result<()> {
        self.ensure_initialized()?;
        debug!(core, "queue manager started");
        Ok(())
    }

    /// Shut the subsystem down
    ///
    /// Queues still open are reported and left as they are.
    pub fn exit(&self) -> Result<()> {
        self.ensure_initialized()?;
        let still_open: Vec<QueueNumber> = (0..MAX_QUEUES)
            .filter(|&q| self.queues[q].lock().opens > 0)
            .map(|q| q as QueueNumber)
            .collect();
        if !still_open.is_empty() {
            warn!(queues = ?still_open, "queue manager exit with queues still open");
        }
        self.initialized.store(false, Ordering::Release);
        info!("queue manager exited");
        Ok(())
    }

    /// Whether [`QueueManager::init`] has run
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    // ------------------------------------------------------------------------
    // Open / close
    // ------------------------------------------------------------------------

    /// Open `number` as `kind`
    pub fn open(&self, kind: QueueType, number: QueueNumber) -> Result<QueueHandle> {
        self.ensure_initialized()?;
        if !kind.admits(number) {
            return Err(Error::QueueOutOfRange { queue: number, kind });
        }
        let mut queue = self.queues[number as usize].lock();
        match queue.owner {
            Some(owner) if owner != kind => {
                return Err(Error::QueueTypeConflict { queue: number, owner });
            }
            _ => {}
        }
        queue.owner = Some(kind);
        queue.opens += 1;
        debug!(queue = number, ?kind, opens = queue.opens, "queue opened");
        Ok(QueueHandle { number })
    }

    /// Open the first unopened queue of `kind`
    pub fn open_any(&self, kind: QueueType) -> Result<QueueHandle> {
        self.ensure_initialized()?;
        for number in kind.range().filter(|&q| kind.admits(q)) {
            let mut queue = self.queues[number as usize].lock();
            if queue.opens == 0 {
                queue.owner = Some(kind);
                queue.opens = 1;
                debug!(queue = number, ?kind, "queue allocated");
                return Ok(QueueHandle { number });
            }
        }
        Err(Error::NoFreeQueue(kind))
    }

    /// Drop one open; returns the remaining reference count
    pub fn close(&self, handle: QueueHandle) -> Result<u32> {
        let mut queue = self.queues[handle.number as usize].lock();
        if queue.opens == 0 {
            return Err(Error::QueueNotOpen(handle.number));
        }
        queue.opens -= 1;
        if queue.opens == 0 {
            queue.owner = None;
            if !queue.entries.is_empty() {
                debug!(
                    queue = handle.number,
                    left = queue.entries.len(),
                    "queue released with descriptors"
                );
            }
        }
        Ok(queue.opens)
    }

    /// Close until the reference count drops to zero
    pub fn close_all(&self, handle: QueueHandle) -> Result<()> {
        while self.close(handle)? > 0 {}
        Ok(())
    }

    /// Whether `handle`'s queue still has an outstanding open
    pub fn is_open(&self, handle: QueueHandle) -> bool {
        self.open_count(handle.number) > 0
    }

    /// Outstanding opens of `number`
    pub fn open_count(&self, number: QueueNumber) -> u32 {
        self.queues
            .get(number as usize)
            .map_or(0, |queue| queue.lock().opens)
    }

    // ------------------------------------------------------------------------
    // Push / pop
    // ------------------------------------------------------------------------

    /// Push to the tail
    pub fn push(&self, queue: QueueHandle, desc: DescriptorRef) {
        self.push_sized(queue, desc, 0, QueueLocation::Tail);
    }

    /// Push to the head, so it is popped next
    pub fn push_head(&self, queue: QueueHandle, desc: DescriptorRef) {
        self.push_sized(queue, desc, 0, QueueLocation::Head);
    }

    /// Push with a size hint at `location`
    pub fn push_sized(
        &self,
        queue: QueueHandle,
        desc: DescriptorRef,
        size_hint: u32,
        location: QueueLocation,
    ) {
        self.push_addr(queue.number, desc.into_addr(), size_hint, location);
    }

    /// Pop from the head; `None` when empty
    pub fn pop(&self, queue: QueueHandle) -> Option<DescriptorRef> {
        self.pop_addr(queue.number).map(DescriptorRef::from_hardware)
    }

    /// Entry count
    pub fn occupancy(&self, queue: QueueHandle) -> usize {
        self.occupancy_of(queue.number)
    }

    /// Move every entry of `src` to `dst` in one operation
    pub fn divert(&self, src: QueueHandle, dst: QueueHandle, location: QueueLocation) -> usize {
        if src.number == dst.number {
            return 0;
        }
        let moved: Vec<QueueEntry> = self.queues[src.number as usize].lock().entries.drain(..).collect();
        let count = moved.len();
        let mut target = self.queues[dst.number as usize].lock();
        match location {
            QueueLocation::Tail => target.entries.extend(moved),
            QueueLocation::Head => {
                for entry in moved.into_iter().rev() {
                    target.entries.push_front(entry);
                }
            }
        }
        debug!(src = src.number, dst = dst.number, count, "queue diverted");
        count
    }

    /// Snapshot of the queued entries, head first
    pub fn contents(&self, queue: QueueHandle) -> Vec<QueueEntry> {
        self.queues[queue.number as usize]
            .lock()
            .entries
            .iter()
            .copied()
            .collect()
    }

    /// Queues currently holding `addr`
    pub fn holders(&self, addr: DescAddr) -> Vec<QueueNumber> {
        (0..MAX_QUEUES)
            .filter(|&q| self.queues[q].lock().entries.iter().any(|e| e.addr == addr))
            .map(|q| q as QueueNumber)
            .collect()
    }

    /// Log occupancy of the named queues
    pub fn log_queue_stats(&self, label: &str, queues: &[(&str, QueueHandle)]) {
        info!("queue stats: {}", label);
        for (name, handle) in queues {
            info!(queue = handle.number, entries = self.occupancy(*handle), "  {}", name);
        }
    }

    pub(crate) fn push_addr(
        &self,
        number: QueueNumber,
        addr: DescAddr,
        size_hint: u32,
        location: QueueLocation,
    ) {
        let entry = QueueEntry { addr, size_hint };
        let mut queue = self.queues[number as usize].lock();
        match location {
            QueueLocation::Tail => queue.entries.push_back(entry),
            QueueLocation::Head => queue.entries.push_front(entry),
        }
    }

    pub(crate) fn pop_addr(&self, number: QueueNumber) -> Option<DescAddr> {
        self.queues[number as usize]
            .lock()
            .entries
            .pop_front()
            .map(|entry| entry.addr)
    }

    pub(crate) fn occupancy_of(&self, number: QueueNumber) -> usize {
        self.queues[number as usize].lock().entries.len()
    }

    // ------------------------------------------------------------------------
    // Descriptor memory
    // ------------------------------------------------------------------------

    /// Register a descriptor memory region; returns its index
    pub fn insert_memory_region(&self, base: u32, desc_size: usize, count: u32) -> Result<usize> {
        self.ensure_initialized()?;
        let index = self.arena.insert_region(base, desc_size, count)?;
        info!(region = index, base = format_args!("{:#010x}", base), desc_size, count, "memory region inserted");
        Ok(index)
    }

    /// Format descriptors out of a region and push them all to `dest`
    ///
    /// Returns the number pushed. A short region still pushes what it had
    /// and reports [`Error::RegionExhausted`].
    pub fn format_region(&self, request: &FormatRequest, dest: QueueHandle) -> Result<u32> {
        self.ensure_initialized()?;
        let addrs = self.arena.format(request)?;
        let allocated = addrs.len() as u32;
        for addr in addrs {
            self.push_addr(dest.number, addr, 0, QueueLocation::Tail);
        }
        info!(
            region = request.region,
            requested = request.count,
            allocated,
            queue = dest.number,
            "descriptors formatted"
        );
        if allocated < request.count {
            return Err(Error::RegionExhausted {
                region: request.region,
                requested: request.count,
                allocated,
            });
        }
        Ok(allocated)
    }

    /// Descriptor memory
    pub fn arena(&self) -> &DescriptorArena {
        &self.arena
    }

    /// Lock an owned descriptor
    pub fn view(&self, desc: &DescriptorRef) -> DescriptorView<'_> {
        self.arena.view(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescTag;

    fn manager() -> QueueManager {
        let qm = QueueManager::new(MAX_DESCRIPTORS);
        qm.init().unwrap();
        qm
    }

    fn pool(qm: &QueueManager, count: u32) -> QueueHandle {
        let free = qm.open(QueueType::GeneralPurpose, TX_FREE_QUEUE).unwrap();
        let region = qm.insert_memory_region(MONOLITHIC_REGION_BASE, 64, count).unwrap();
        let request = FormatRequest {
            region,
            count,
            return_queue: Some(TX_COMPLETION_QUEUE),
            data_offset: 16,
        };
        qm.format_region(&request, free).unwrap();
        free
    }

    #[test]
    fn test_open_before_init() {
        let qm = QueueManager::new(16);
        assert_eq!(qm.open(QueueType::GeneralPurpose, 10), Err(Error::NotInitialized));
        assert_eq!(qm.start(1), Err(Error::NotInitialized));
        assert_eq!(qm.insert_memory_region(0x1000, 32, 4), Err(Error::NotInitialized));
    }

    #[test]
    fn test_double_init() {
        let qm = manager();
        assert_eq!(qm.init(), Err(Error::AlreadyInitialized));
    }

    #[test]
    fn test_open_type_checks() {
        let qm = manager();
        assert!(matches!(
            qm.open(QueueType::HighPriority, 800),
            Err(Error::QueueOutOfRange { queue: 800, .. })
        ));
        assert!(matches!(
            qm.open(QueueType::GeneralPurpose, 704),
            Err(Error::QueueOutOfRange { .. })
        ));
        let hp = qm.open(QueueType::HighPriority, 705).unwrap();
        assert_eq!(hp.number(), 705);
    }

    #[test]
    fn test_refcount() {
        let qm = manager();
        let a = qm.open(QueueType::GeneralPurpose, SYNC_QUEUE).unwrap();
        let b = qm.open(QueueType::GeneralPurpose, SYNC_QUEUE).unwrap();
        assert_eq!(a, b);
        assert_eq!(qm.open_count(SYNC_QUEUE), 2);
        assert_eq!(qm.close(a), Ok(1));
        assert_eq!(qm.close(b), Ok(0));
        assert_eq!(qm.close(a), Err(Error::QueueNotOpen(SYNC_QUEUE)));
    }

    #[test]
    fn test_handle_after_close() {
        let qm = manager();
        let free = pool(&qm, 2);
        let q = qm.open(QueueType::GeneralPurpose, 100).unwrap();
        assert!(qm.is_open(q));
        let desc = qm.pop(free).unwrap();
        qm.push(q, desc);

        qm.close(q).unwrap();
        assert!(!qm.is_open(q));
        assert_eq!(qm.occupancy(q), 1);
        let desc = qm.pop(q).unwrap();
        qm.push(free, desc);
        assert_eq!(qm.occupancy(free), 2);
    }

    #[test]
    fn test_open_any() {
        let qm = manager();
        let first = qm.open_any(QueueType::Infrastructure).unwrap();
        let second = qm.open_any(QueueType::Infrastructure).unwrap();
        assert_eq!(first.number(), INFRASTRUCTURE_QUEUE_BASE);
        assert_eq!(second.number(), INFRASTRUCTURE_QUEUE_BASE + 1);
        for _ in 2..DMA_CHANNELS {
            qm.open_any(QueueType::Infrastructure).unwrap();
        }
        assert_eq!(
            qm.open_any(QueueType::Infrastructure),
            Err(Error::NoFreeQueue(QueueType::Infrastructure))
        );
    }

    #[test]
    fn test_fifo_and_head() {
        let qm = manager();
        let free = pool(&qm, 4);
        let q = qm.open(QueueType::GeneralPurpose, 100).unwrap();

        let a = qm.pop(free).unwrap();
        let b = qm.pop(free).unwrap();
        let c = qm.pop(free).unwrap();
        let (a_addr, b_addr, c_addr) = (a.addr(), b.addr(), c.addr());
        qm.push(q, a);
        qm.push(q, b);
        qm.push_head(q, c);

        assert_eq!(qm.occupancy(q), 3);
        assert_eq!(qm.pop(q).unwrap().addr(), c_addr);
        assert_eq!(qm.pop(q).unwrap().addr(), a_addr);
        assert_eq!(qm.pop(q).unwrap().addr(), b_addr);
        assert!(qm.pop(q).is_none());
    }

    #[test]
    fn test_divert() {
        let qm = manager();
        let free = pool(&qm, 6);
        let other = qm.open(QueueType::GeneralPurpose, TX_COMPLETION_QUEUE).unwrap();
        assert_eq!(qm.divert(free, other, QueueLocation::Tail), 6);
        assert_eq!(qm.occupancy(free), 0);
        assert_eq!(qm.occupancy(other), 6);
        let addr = qm.contents(other)[0].addr;
        assert_eq!(qm.holders(addr), vec![TX_COMPLETION_QUEUE]);
    }

    #[test]
    fn test_format_exhausted() {
        let qm = manager();
        let free = qm.open(QueueType::GeneralPurpose, RX_FREE_QUEUE).unwrap();
        let region = qm.insert_memory_region(SYNC_REGION_BASE, 32, 4).unwrap();
        let request = FormatRequest {
            region,
            count: 6,
            return_queue: None,
            data_offset: 16,
        };
        assert_eq!(
            qm.format_region(&request, free),
            Err(Error::RegionExhausted { region, requested: 6, allocated: 4 })
        );
        assert_eq!(qm.occupancy(free), 4);
    }

    #[test]
    fn test_formatted_header() {
        let qm = manager();
        let free = pool(&qm, 1);
        let desc = qm.pop(free).unwrap();
        {
            let view = qm.view(&desc);
            assert_eq!(view.return_queue(), Some(TX_COMPLETION_QUEUE));
            assert_eq!(view.data_offset(), 16);
            assert_eq!(view.packet_len(), 0);
            assert_eq!(view.tag(), DescTag::default());
        }
        qm.push(free, desc);
    }
}
