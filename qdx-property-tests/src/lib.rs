//! QDX Property-Based Tests
//!
//! Test suite using proptest for the invariants of the queue manager, the
//! descriptor pools, the DMA channel state machine, the accumulator and the
//! shared flag cache.
//!
//! # Usage
//!
//! ```bash
//! cargo test -p qdx-property-tests            # Run all property tests
//! cargo test -p qdx-property-tests queue      # Run only queue tests
//! PROPTEST_CASES=1000 cargo test -p qdx-property-tests
//! ```
//!
//! # Test Modules
//!
//! - `queue`: FIFO order, head pushes, divert, single ownership
//! - `pool`: Region carving, formatting, overlap rejection
//! - `channel`: Channel life-cycle transitions
//! - `accumulator`: Page thresholds, entry conservation
//! - `shared`: Cache visibility of the shared flags

// Re-export for convenience in tests
pub use qdx::*;

use qdx::descriptor::FormatRequest;

/// Initialized queue manager with `count` formatted sync-sized descriptors
/// on the general-purpose queue `free`
pub fn formatted_pool(count: u32, free: QueueNumber) -> (QueueManager, QueueHandle) {
    let qm = QueueManager::new(MAX_DESCRIPTORS);
    qm.init().expect("fresh queue manager");
    let handle = qm
        .open(QueueType::GeneralPurpose, free)
        .expect("general-purpose queue");
    let region = qm
        .insert_memory_region(SYNC_REGION_BASE, SIZE_SYNC_DESC, count)
        .expect("region fits");
    qm.format_region(
        &FormatRequest {
            region,
            count,
            return_queue: None,
            data_offset: 16,
        },
        handle,
    )
    .expect("whole region formatted");
    (qm, handle)
}
