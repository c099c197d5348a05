//! Property tests for the shared flag cache
//!
//! Tests coherence invariants for:
//! - A valid line hides later writebacks from other cores
//! - Invalidate-then-read always sees memory
//! - Unflushed writes never reach memory

use proptest::prelude::*;
use qdx::barrier::advance_round;
use qdx::*;

fn word() -> impl Strategy<Value = SharedWord> {
    prop_oneof![Just(SharedWord::InitDone), Just(SharedWord::RoundCount)]
}

proptest! {
    /// CORE INVARIANT: stale until invalidated
    #[test]
    fn stale_until_invalidated(word in word(), first in any::<u32>(), second in any::<u32>()) {
        let region = SharedRegion::new();
        let mut writer = FlagCache::new(&region);
        let mut reader = FlagCache::new(&region);

        writer.publish(word, first);
        prop_assert_eq!(reader.read(word), first);

        writer.publish(word, second);
        prop_assert_eq!(reader.read(word), first);
        prop_assert_eq!(reader.read_fresh(word), second);
        prop_assert_eq!(region.peek(word), second);
    }

    /// Writes stay private until written back
    #[test]
    fn write_needs_writeback(word in word(), value in 1u32..=u32::MAX) {
        let region = SharedRegion::new();
        let mut writer = FlagCache::new(&region);
        let mut reader = FlagCache::new(&region);

        writer.write(word, value);
        prop_assert_eq!(writer.read(word), value);
        prop_assert_eq!(reader.read_fresh(word), 0);

        writer.writeback(word);
        prop_assert_eq!(reader.read_fresh(word), value);
    }

    /// Invalidating a dirty line drops the write
    #[test]
    fn invalidate_discards(word in word(), value in 1u32..=u32::MAX) {
        let region = SharedRegion::new();
        let mut cache = FlagCache::new(&region);
        cache.write(word, value);
        cache.invalidate(word);
        cache.writeback(word);
        prop_assert_eq!(region.peek(word), 0);
        prop_assert_eq!(cache.read(word), 0);
    }

    /// Serialized round advances from any mix of cores count every round
    #[test]
    fn round_counter_counts(cores in prop::collection::vec(0usize..4, 1..40)) {
        let region = SharedRegion::new();
        let mut caches: Vec<FlagCache<'_>> = (0..4).map(|_| FlagCache::new(&region)).collect();
        // warm every cache so stale lines are in play
        for cache in caches.iter_mut() {
            cache.read(SharedWord::RoundCount);
        }
        for (n, core) in cores.iter().enumerate() {
            prop_assert_eq!(advance_round(&mut caches[*core]), n as u32 + 1);
        }
        prop_assert_eq!(region.peek(SharedWord::RoundCount), cores.len() as u32);
    }
}
