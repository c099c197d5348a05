//! QDX - Descriptor Pool
//!
//! Descriptors are fixed-size records carved out of registered memory
//! regions. They are never allocated or freed individually: a descriptor
//! changes owner only by moving between queues, DMA channels and accumulator
//! pages.
//!
//! Software holds a descriptor through [`DescriptorRef`], which is neither
//! `Copy` nor `Clone`. Pushing it to a queue consumes it, popping produces a
//! new one, so the previous owner cannot touch it after handing it on.
//!
//! # Layout
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 4    | payload length |
//! | 4      | 2    | source tag |
//! | 6      | 2    | destination tag |
//! | 8      | 2    | return queue (`0xFFFF` = none) |
//! | 10     | 2    | payload offset |
//! | 12     | 4    | reserved |

use crate::error::{Error, Result};
use crate::types::*;
use core::fmt;
use parking_lot::{Mutex, MutexGuard};
use std::sync::OnceLock;

/// Bytes of header at the start of every descriptor
pub const DESC_HEADER_SIZE: usize = 16;

/// Descriptor size and region base alignment
pub const DESC_ALIGN: usize = 16;

/// First address past the 32-bit global address space
pub const ADDRESS_SPACE_END: u64 = 1 << 32;

const OFF_PACKET_LEN: usize = 0;
const OFF_SRC_TAG: usize = 4;
const OFF_DEST_TAG: usize = 6;
const OFF_RETURN_QUEUE: usize = 8;
const OFF_DATA_OFFSET: usize = 10;

const NO_RETURN_QUEUE: u16 = 0xFFFF;

// ============================================================================
// Addresses and handles
// ============================================================================

/// Global address of a descriptor, as stored in queues and accumulator lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescAddr(pub u32);

impl fmt::Display for DescAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Owning handle to one descriptor
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a descriptor handle leaks the descriptor out of every queue"]
pub struct DescriptorRef {
    addr: DescAddr,
}

impl DescriptorRef {
    /// Address of the descriptor
    pub fn addr(&self) -> DescAddr {
        self.addr
    }

    /// Take ownership of a descriptor handed over by hardware
    pub(crate) fn from_hardware(addr: DescAddr) -> Self {
        Self { addr }
    }

    /// Give the descriptor to hardware
    pub(crate) fn into_addr(self) -> DescAddr {
        self.addr
    }
}

// ============================================================================
// Header
// ============================================================================

/// Routing tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescTag {
    /// Producing core
    pub src: u16,
    /// Consuming core; selects the receive flow
    pub dest: u16,
}

/// Decoded descriptor header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorHeader {
    /// Payload length in bytes
    pub packet_len: u32,
    /// Routing tag
    pub tag: DescTag,
    /// Queue the DMA returns the descriptor to after transmission
    pub return_queue: Option<QueueNumber>,
    /// Payload offset from the descriptor start
    pub data_offset: u16,
}

impl DescriptorHeader {
    /// Decode from descriptor bytes
    pub fn decode(bytes: &[u8]) -> Self {
        let return_queue = read_u16(bytes, OFF_RETURN_QUEUE);
        Self {
            packet_len: read_u32(bytes, OFF_PACKET_LEN),
            tag: DescTag {
                src: read_u16(bytes, OFF_SRC_TAG),
                dest: read_u16(bytes, OFF_DEST_TAG),
            },
            return_queue: (return_queue != NO_RETURN_QUEUE).then_some(return_queue),
            data_offset: read_u16(bytes, OFF_DATA_OFFSET),
        }
    }

    /// Encode into descriptor bytes
    pub fn encode(&self, bytes: &mut [u8]) {
        bytes[..DESC_HEADER_SIZE].fill(0);
        write_u32(bytes, OFF_PACKET_LEN, self.packet_len);
        write_u16(bytes, OFF_SRC_TAG, self.tag.src);
        write_u16(bytes, OFF_DEST_TAG, self.tag.dest);
        write_u16(bytes, OFF_RETURN_QUEUE, self.return_queue.unwrap_or(NO_RETURN_QUEUE));
        write_u16(bytes, OFF_DATA_OFFSET, self.data_offset);
    }

    /// Header as left by formatting: only return queue and payload offset set
    pub fn formatted(return_queue: Option<QueueNumber>, data_offset: u16) -> Self {
        Self {
            return_queue,
            data_offset,
            ..Default::default()
        }
    }
}

fn check_return_queue(queue: Option<QueueNumber>) -> Result<()> {
    match queue {
        Some(queue) if queue as usize >= MAX_QUEUES => Err(Error::InvalidReturnQueue(queue)),
        _ => Ok(()),
    }
}

fn read_u16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn write_u16(bytes: &mut [u8], off: usize, value: u16) {
    bytes[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(bytes: &mut [u8], off: usize, value: u32) {
    bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

// ============================================================================
// Descriptor View
// ============================================================================

/// Exclusive access to one descriptor's bytes
pub struct DescriptorView<'a> {
    addr: DescAddr,
    bytes: MutexGuard<'a, Box<[u8]>>,
}

impl<'a> DescriptorView<'a> {
    /// Address of the descriptor
    pub fn addr(&self) -> DescAddr {
        self.addr
    }

    /// Descriptor size in bytes
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Decode the header
    pub fn header(&self) -> DescriptorHeader {
        DescriptorHeader::decode(&self.bytes)
    }

    /// Payload length
    pub fn packet_len(&self) -> u32 {
        read_u32(&self.bytes, OFF_PACKET_LEN)
    }

    /// Set payload length
    pub fn set_packet_len(&mut self, len: u32) {
        write_u32(&mut self.bytes, OFF_PACKET_LEN, len);
    }

    /// Routing tag
    pub fn tag(&self) -> DescTag {
        self.header().tag
    }

    /// Set routing tag
    pub fn set_tag(&mut self, tag: DescTag) {
        write_u16(&mut self.bytes, OFF_SRC_TAG, tag.src);
        write_u16(&mut self.bytes, OFF_DEST_TAG, tag.dest);
    }

    /// Return queue
    pub fn return_queue(&self) -> Option<QueueNumber> {
        self.header().return_queue
    }

    /// Set return queue; numbers beyond the queue manager are refused
    pub fn set_return_queue(&mut self, queue: Option<QueueNumber>) -> Result<()> {
        check_return_queue(queue)?;
        write_u16(&mut self.bytes, OFF_RETURN_QUEUE, queue.unwrap_or(NO_RETURN_QUEUE));
        Ok(())
    }

    /// Payload offset
    pub fn data_offset(&self) -> usize {
        read_u16(&self.bytes, OFF_DATA_OFFSET) as usize
    }

    /// Bytes available for payload
    pub fn payload_capacity(&self) -> usize {
        self.size().saturating_sub(self.data_offset())
    }

    /// Payload bytes (`packet_len` of them, clamped to the capacity)
    pub fn payload(&self) -> &[u8] {
        let start = self.data_offset().min(self.size());
        let len = (self.packet_len() as usize).min(self.payload_capacity());
        &self.bytes[start..start + len]
    }

    /// Copy `data` into the payload region and set the packet length
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        let capacity = self.payload_capacity();
        if data.len() > capacity {
            return Err(Error::PayloadTooLarge {
                len: data.len(),
                capacity,
            });
        }
        let start = self.data_offset().min(self.size());
        self.bytes[start..start + data.len()].copy_from_slice(data);
        self.set_packet_len(data.len() as u32);
        Ok(())
    }

    pub(crate) fn write_header(&mut self, header: &DescriptorHeader) {
        header.encode(&mut self.bytes);
    }

    /// Restore the formatted header, keeping return queue and payload offset
    pub fn reset(&mut self) {
        let header = self.header();
        DescriptorHeader::formatted(header.return_queue, header.data_offset).encode(&mut self.bytes);
    }
}

impl fmt::Debug for DescriptorView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorView")
            .field("addr", &self.addr)
            .field("header", &self.header())
            .finish()
    }
}

// ============================================================================
// Memory Regions
// ============================================================================

/// Public summary of an inserted region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegionInfo {
    /// Region index
    pub index: usize,
    /// Global base address
    pub base: u32,
    /// Descriptor size
    pub desc_size: usize,
    /// Descriptors the region memory holds
    pub count: u32,
    /// Descriptors already formatted
    pub formatted: u32,
}

struct MemoryRegion {
    base: u32,
    desc_size: usize,
    slots: Box<[Mutex<Box<[u8]>>]>,
    formatted: Mutex<u32>,
}

impl MemoryRegion {
    fn end(&self) -> u64 {
        self.base as u64 + (self.desc_size * self.slots.len()) as u64
    }

    fn contains(&self, addr: DescAddr) -> Option<usize> {
        let addr = addr.0 as u64;
        if addr < self.base as u64 || addr >= self.end() {
            return None;
        }
        let offset = (addr - self.base as u64) as usize;
        (offset % self.desc_size == 0).then_some(offset / self.desc_size)
    }

    fn addr_of(&self, slot: usize) -> DescAddr {
        DescAddr(self.base + (slot * self.desc_size) as u32)
    }
}

/// Request to format part of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    /// Region to carve
    pub region: usize,
    /// Descriptors wanted
    pub count: u32,
    /// Return queue baked into every descriptor
    pub return_queue: Option<QueueNumber>,
    /// Payload offset baked into every descriptor
    pub data_offset: u16,
}

struct InsertState {
    next: usize,
    total: u32,
}

/// All descriptor memory known to the queue manager
pub struct DescriptorArena {
    regions: [OnceLock<MemoryRegion>; MAX_MEMORY_REGIONS],
    insert: Mutex<InsertState>,
    max_descriptors: u32,
}

impl DescriptorArena {
    /// Empty arena indexing at most `max_descriptors`
    pub fn new(max_descriptors: u32) -> Self {
        Self {
            regions: core::array::from_fn(|_| OnceLock::new()),
            insert: Mutex::new(InsertState { next: 0, total: 0 }),
            max_descriptors,
        }
    }

    /// Register `count` descriptors of `desc_size` bytes at `base`
    ///
    /// Returns the region index.
    pub fn insert_region(&self, base: u32, desc_size: usize, count: u32) -> Result<usize> {
        if desc_size < DESC_HEADER_SIZE || desc_size % DESC_ALIGN != 0 {
            return Err(Error::InvalidDescriptorSize(desc_size));
        }
        if base as usize % DESC_ALIGN != 0 {
            return Err(Error::InvalidConfig(format!(
                "region base {:#010x} is not {}-byte aligned",
                base, DESC_ALIGN
            )));
        }

        let mut state = self.insert.lock();
        if state.next >= MAX_MEMORY_REGIONS {
            return Err(Error::RegionTableFull);
        }
        let available = self.max_descriptors - state.total;
        if count > available {
            return Err(Error::DescriptorLimit {
                requested: count,
                available,
            });
        }

        let end = u64::from(base) + desc_size as u64 * u64::from(count);
        if end > ADDRESS_SPACE_END {
            return Err(Error::InvalidConfig(format!(
                "region at {:#010x} of {} x {} bytes runs past the 32-bit address space",
                base, count, desc_size
            )));
        }
        for (index, region) in self.regions().enumerate() {
            if (base as u64) < region.end() && end > region.base as u64 {
                return Err(Error::RegionOverlap { base, other: index });
            }
        }

        let slots = (0..count)
            .map(|_| Mutex::new(vec![0u8; desc_size].into_boxed_slice()))
            .collect();
        let region = MemoryRegion {
            base,
            desc_size,
            slots,
            formatted: Mutex::new(0),
        };

        let index = state.next;
        if self.regions[index].set(region).is_err() {
            return Err(Error::RegionTableFull);
        }
        state.next += 1;
        state.total += count;
        Ok(index)
    }

    /// Summary of region `index`
    pub fn region_info(&self, index: usize) -> Option<MemoryRegionInfo> {
        let region = self.regions.get(index)?.get()?;
        Some(MemoryRegionInfo {
            index,
            base: region.base,
            desc_size: region.desc_size,
            count: region.slots.len() as u32,
            formatted: *region.formatted.lock(),
        })
    }

    /// Carve unformatted slots and initialize their headers
    ///
    /// Returns the formatted addresses; fewer than requested when the
    /// region runs out of memory.
    pub(crate) fn format(&self, request: &FormatRequest) -> Result<Vec<DescAddr>> {
        let region = self
            .regions
            .get(request.region)
            .and_then(OnceLock::get)
            .ok_or(Error::UnknownRegion(request.region))?;
        check_return_queue(request.return_queue)?;

        let data_offset = request.data_offset as usize;
        if data_offset < DESC_HEADER_SIZE || data_offset > region.desc_size {
            return Err(Error::InvalidConfig(format!(
                "payload offset {} outside descriptor of {} bytes",
                data_offset, region.desc_size
            )));
        }

        let mut formatted = region.formatted.lock();
        let first = *formatted as usize;
        let allocated = (request.count as usize).min(region.slots.len() - first);
        let header = DescriptorHeader::formatted(request.return_queue, request.data_offset);

        let addrs = (first..first + allocated)
            .map(|slot| {
                let mut bytes = region.slots[slot].lock();
                bytes.fill(0);
                header.encode(&mut bytes);
                region.addr_of(slot)
            })
            .collect();
        *formatted += allocated as u32;
        Ok(addrs)
    }

    /// Whether `addr` is a descriptor of this arena
    pub fn contains(&self, addr: DescAddr) -> bool {
        self.locate(addr).is_some()
    }

    /// Lock an owned descriptor for reading and writing
    ///
    /// # Panics
    /// If the handle was not produced by this arena's queue manager.
    pub fn view(&self, desc: &DescriptorRef) -> DescriptorView<'_> {
        self.view_addr(desc.addr())
            .unwrap_or_else(|| panic!("descriptor {} is outside every memory region", desc.addr()))
    }

    pub(crate) fn view_addr(&self, addr: DescAddr) -> Option<DescriptorView<'_>> {
        let (region, slot) = self.locate(addr)?;
        Some(DescriptorView {
            addr,
            bytes: region.slots[slot].lock(),
        })
    }

    fn locate(&self, addr: DescAddr) -> Option<(&MemoryRegion, usize)> {
        self.regions()
            .find_map(|region| region.contains(addr).map(|slot| (region, slot)))
    }

    fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().map_while(OnceLock::get)
    }
}
