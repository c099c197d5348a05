//! Property tests for descriptor pools
//!
//! Tests memory region invariants for:
//! - Carving: formatted counts never exceed the region
//! - Formatting: headers carry return queue and payload offset
//! - Regions: overlaps and bad sizes are rejected
//! - Recycling: headers come back formatted after any number of transfers

use proptest::prelude::*;
use qdx::descriptor::FormatRequest;
use qdx::*;

const POOL: u32 = 16;

// ============================================================================
// Strategies
// ============================================================================

fn desc_size() -> impl Strategy<Value = usize> {
    (1usize..=16).prop_map(|units| units * 16)
}

fn return_queue() -> impl Strategy<Value = Option<QueueNumber>> {
    prop_oneof![Just(None), (0u16..700).prop_map(Some)]
}

fn ready() -> (QueueManager, QueueHandle) {
    let qm = QueueManager::new(MAX_DESCRIPTORS);
    qm.init().unwrap();
    let free = qm.open(QueueType::GeneralPurpose, 4000).unwrap();
    (qm, free)
}

// ============================================================================
// Carving Property Tests
// ============================================================================

proptest! {
    /// CORE INVARIANT: repeated carving hands out each slot once
    #[test]
    fn carving_never_exceeds_region(
        count in 1u32..64,
        requests in prop::collection::vec(1u32..24, 1..8)
    ) {
        let (qm, free) = ready();
        let region = qm.insert_memory_region(MONOLITHIC_REGION_BASE, 32, count).unwrap();

        let mut handed_out = 0u32;
        for wanted in requests {
            let request = FormatRequest {
                region,
                count: wanted,
                return_queue: None,
                data_offset: 16,
            };
            let expected = wanted.min(count - handed_out);
            match qm.format_region(&request, free) {
                Ok(allocated) => prop_assert_eq!(allocated, wanted),
                Err(Error::RegionExhausted { allocated, requested, .. }) => {
                    prop_assert_eq!(requested, wanted);
                    prop_assert_eq!(allocated, expected);
                    prop_assert!(allocated < wanted);
                }
                Err(other) => prop_assert!(false, "unexpected {}", other),
            }
            handed_out += expected;
            prop_assert_eq!(qm.occupancy(free), handed_out as usize);
        }

        let info = qm.arena().region_info(region).unwrap();
        prop_assert_eq!(info.formatted, handed_out);
        prop_assert!(info.formatted <= info.count);
    }

    /// Formatted headers are clean apart from return queue and offset
    #[test]
    fn formatted_headers(
        size in desc_size(),
        count in 1u32..16,
        ret in return_queue(),
        offset_units in 1u16..=16
    ) {
        let (qm, free) = ready();
        let data_offset = (offset_units * 16).min(size as u16);
        let region = qm.insert_memory_region(SYNC_REGION_BASE, size, count).unwrap();
        qm.format_region(
            &FormatRequest { region, count, return_queue: ret, data_offset },
            free,
        )
        .unwrap();

        while let Some(desc) = qm.pop(free) {
            let view = qm.view(&desc);
            prop_assert_eq!(view.header(), DescriptorHeader::formatted(ret, data_offset));
            prop_assert_eq!(view.size(), size);
            prop_assert_eq!(view.payload_capacity(), size - data_offset as usize);
            prop_assert!(view.payload().is_empty());
        }
    }

    /// Payloads beyond the capacity are refused without side effects
    #[test]
    fn payload_capacity_enforced(len in 0usize..200) {
        let (qm, free) = ready();
        let region = qm.insert_memory_region(SYNC_REGION_BASE, 64, 1).unwrap();
        qm.format_region(
            &FormatRequest { region, count: 1, return_queue: None, data_offset: 16 },
            free,
        )
        .unwrap();
        let desc = qm.pop(free).unwrap();
        let mut view = qm.view(&desc);
        let data = vec![0xA5u8; len];
        if len <= 48 {
            prop_assert!(view.set_data(&data).is_ok());
            prop_assert_eq!(view.packet_len(), len as u32);
            prop_assert_eq!(view.payload(), &data[..]);
        } else {
            prop_assert_eq!(
                view.set_data(&data),
                Err(Error::PayloadTooLarge { len, capacity: 48 })
            );
            prop_assert_eq!(view.packet_len(), 0);
        }
    }
}

// ============================================================================
// Region Table Property Tests
// ============================================================================

proptest! {
    /// Overlapping regions are rejected, disjoint ones accepted
    #[test]
    fn overlap_detected(
        first_count in 1u32..32,
        gap_slots in -40i64..40,
        second_count in 1u32..32
    ) {
        let (qm, _free) = ready();
        let base = 0x2000_0000u32;
        qm.insert_memory_region(base, 32, first_count).unwrap();

        let first_end = base as i64 + 32 * first_count as i64;
        let second_base = (first_end + gap_slots * 32) as u32;
        let second_end = second_base as i64 + 32 * second_count as i64;
        let overlaps = (second_base as i64) < first_end && second_end > base as i64;

        let result = qm.insert_memory_region(second_base, 32, second_count);
        if overlaps {
            prop_assert_eq!(result, Err(Error::RegionOverlap { base: second_base, other: 0 }));
        } else {
            prop_assert_eq!(result, Ok(1));
        }
    }

    /// Descriptor sizes must be whole 16-byte units
    #[test]
    fn descriptor_size_checked(size in 0usize..300) {
        let (qm, _free) = ready();
        let result = qm.insert_memory_region(SYNC_REGION_BASE, size, 4);
        if size >= 16 && size % 16 == 0 {
            prop_assert!(result.is_ok());
        } else {
            prop_assert_eq!(result, Err(Error::InvalidDescriptorSize(size)));
        }
    }

    /// The descriptor budget spans every region
    #[test]
    fn descriptor_budget(max in 4u32..64, first in 1u32..64) {
        let qm = QueueManager::new(max);
        qm.init().unwrap();
        let result = qm.insert_memory_region(SYNC_REGION_BASE, 16, first);
        if first <= max {
            prop_assert!(result.is_ok());
            let rest = max - first;
            prop_assert_eq!(
                qm.insert_memory_region(MONOLITHIC_REGION_BASE, 16, rest + 1),
                Err(Error::DescriptorLimit { requested: rest + 1, available: rest })
            );
        } else {
            prop_assert_eq!(
                result,
                Err(Error::DescriptorLimit { requested: first, available: max })
            );
        }
    }
}

// ============================================================================
// Recycling Property Tests
// ============================================================================

struct Loop {
    qm: QueueManager,
    dma: DmaEngine,
    tx_free: QueueHandle,
    rx_free: QueueHandle,
    completion: QueueHandle,
    infra: QueueHandle,
    hp: QueueHandle,
}

fn transfer_loop() -> Loop {
    let qm = QueueManager::new(MAX_DESCRIPTORS);
    qm.init().unwrap();
    let tx_free = qm.open(QueueType::GeneralPurpose, TX_FREE_QUEUE).unwrap();
    let rx_free = qm.open(QueueType::GeneralPurpose, RX_FREE_QUEUE).unwrap();
    let completion = qm.open(QueueType::GeneralPurpose, TX_COMPLETION_QUEUE).unwrap();
    let infra = qm.open(QueueType::Infrastructure, infrastructure_queue(0)).unwrap();
    let hp = qm.open(QueueType::HighPriority, high_priority_queue(0)).unwrap();

    let region = qm
        .insert_memory_region(MONOLITHIC_REGION_BASE, SIZE_MONOLITHIC_DESC, 2 * POOL)
        .unwrap();
    let mut request = FormatRequest {
        region,
        count: POOL,
        return_queue: Some(TX_COMPLETION_QUEUE),
        data_offset: MONOLITHIC_DESC_DATA_OFFSET,
    };
    qm.format_region(&request, tx_free).unwrap();
    request.return_queue = None;
    qm.format_region(&request, rx_free).unwrap();

    let dma = DmaEngine::new();
    dma.open().unwrap();
    let tx = dma.open_tx_channel(0).unwrap();
    let rx = dma.open_rx_channel(0).unwrap();
    dma.configure_rx_flow(0, RxFlowConfig::new(hp, rx_free, MONOLITHIC_DESC_DATA_OFFSET))
        .unwrap();
    dma.enable(tx).unwrap();
    dma.enable(rx).unwrap();

    Loop { qm, dma, tx_free, rx_free, completion, infra, hp }
}

/// Rotate through `queue` once, checking every header
fn pool_formatted(
    qm: &QueueManager,
    queue: QueueHandle,
    return_queue: Option<QueueNumber>,
) -> bool {
    let expected = DescriptorHeader::formatted(return_queue, MONOLITHIC_DESC_DATA_OFFSET);
    let mut clean = true;
    for _ in 0..qm.occupancy(queue) {
        let desc = qm.pop(queue).unwrap();
        clean &= qm.view(&desc).header() == expected;
        qm.push(queue, desc);
    }
    clean
}

proptest! {
    /// CORE INVARIANT: a descriptor sent through the DMA and recycled comes
    /// back with a formatted header, however many times it goes round
    #[test]
    fn headers_survive_transfer_cycles(
        cycles in prop::collection::vec((1u32..=POOL, 0usize..=144, 0u16..4), 1..10)
    ) {
        let l = transfer_loop();
        for (packets, len, src) in cycles {
            let payload: Vec<u8> = (0..len).map(|i| i as u8 ^ 0x5A).collect();
            for _ in 0..packets {
                let desc = l.qm.pop(l.tx_free).unwrap();
                {
                    let mut view = l.qm.view(&desc);
                    view.set_data(&payload).unwrap();
                    view.set_tag(DescTag { src, dest: 0 });
                }
                l.qm.push(l.infra, desc);
            }

            prop_assert_eq!(l.dma.service(&l.qm), packets as usize);
            prop_assert_eq!(l.qm.occupancy(l.hp), packets as usize);
            prop_assert_eq!(l.qm.occupancy(l.completion), packets as usize);

            while let Some(desc) = l.qm.pop(l.hp) {
                {
                    let mut view = l.qm.view(&desc);
                    prop_assert_eq!(view.payload(), &payload[..]);
                    prop_assert_eq!(view.tag(), DescTag { src, dest: 0 });
                    view.reset();
                }
                l.qm.push(l.rx_free, desc);
            }
            l.qm.divert(l.completion, l.tx_free, QueueLocation::Tail);

            prop_assert_eq!(l.qm.occupancy(l.tx_free), POOL as usize);
            prop_assert_eq!(l.qm.occupancy(l.rx_free), POOL as usize);
            prop_assert!(pool_formatted(&l.qm, l.tx_free, Some(TX_COMPLETION_QUEUE)));
            prop_assert!(pool_formatted(&l.qm, l.rx_free, None));
        }
        prop_assert_eq!(l.dma.stats().orphaned, 0);
    }
}
