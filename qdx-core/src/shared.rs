//! QDX - Shared Flag Store
//!
//! Process-wide words in shared memory (MSMC) visible to every core. Each
//! core reaches them through its own [`FlagCache`]: a read is served from the
//! core's cache line until the line is invalidated, and a write stays in the
//! cache until it is written back. Pollers must invalidate before every read
//! and writers must write back after every write.
//!
//! Every word has exactly one writer per phase, so invalidate/writeback is
//! enough and no lock is needed.

use core::sync::atomic::{AtomicU32, Ordering};

/// Base address of the shared flag words
pub const SHARED_REGION_BASE: u32 = 0x0C00_0000;

/// Number of shared words
pub const SHARED_WORD_COUNT: usize = 2;

/// A word of the shared flag store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[repr(usize)]
pub enum SharedWord {
    /// 0 until the designated core finished initialization, then 1
    InitDone = 0,
    /// Completed rounds across the cluster
    RoundCount = 1,
}

impl SharedWord {
    /// All words
    pub const ALL: [SharedWord; SHARED_WORD_COUNT] = [SharedWord::InitDone, SharedWord::RoundCount];

    /// Fixed shared address of the word
    pub const fn address(self) -> u32 {
        SHARED_REGION_BASE + 4 * self as u32
    }
}

// ============================================================================
// Shared Region
// ============================================================================

/// Backing memory of the shared words
#[derive(Debug, Default)]
pub struct SharedRegion {
    words: [AtomicU32; SHARED_WORD_COUNT],
}

impl SharedRegion {
    /// Zeroed region
    pub fn new() -> Self {
        Self::default()
    }

    /// Read memory directly, bypassing every cache (debugger view)
    pub fn peek(&self, word: SharedWord) -> u32 {
        self.words[word as usize].load(Ordering::Acquire)
    }

    fn load(&self, word: SharedWord) -> u32 {
        self.words[word as usize].load(Ordering::Acquire)
    }

    fn store(&self, word: SharedWord, value: u32) {
        self.words[word as usize].store(value, Ordering::Release);
    }
}

// ============================================================================
// Per-core cache
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct CacheLine {
    value: u32,
    valid: bool,
    dirty: bool,
}

/// One core's cached view of the shared region
#[derive(Debug)]
pub struct FlagCache<'a> {
    region: &'a SharedRegion,
    lines: [CacheLine; SHARED_WORD_COUNT],
}

impl<'a> FlagCache<'a> {
    /// Cold cache over `region`
    pub fn new(region: &'a SharedRegion) -> Self {
        Self {
            region,
            lines: [CacheLine::default(); SHARED_WORD_COUNT],
        }
    }

    /// Read through the cache
    ///
    /// A cold line is filled from memory; a valid line is returned as is,
    /// even if another core has written back a newer value since.
    pub fn read(&mut self, word: SharedWord) -> u32 {
        let line = &mut self.lines[word as usize];
        if !line.valid {
            line.value = self.region.load(word);
            line.valid = true;
            line.dirty = false;
        }
        line.value
    }

    /// Write into the cache only
    pub fn write(&mut self, word: SharedWord, value: u32) {
        let line = &mut self.lines[word as usize];
        line.value = value;
        line.valid = true;
        line.dirty = true;
    }

    /// Discard the cached line; the next read goes to memory
    ///
    /// Unwritten data in the line is lost, as on hardware.
    pub fn invalidate(&mut self, word: SharedWord) {
        self.lines[word as usize] = CacheLine::default();
    }

    /// Flush a dirty line to memory
    pub fn writeback(&mut self, word: SharedWord) {
        let line = &mut self.lines[word as usize];
        if line.valid && line.dirty {
            self.region.store(word, line.value);
            line.dirty = false;
        }
    }

    /// Invalidate then read
    pub fn read_fresh(&mut self, word: SharedWord) -> u32 {
        self.invalidate(word);
        self.read(word)
    }

    /// Write then write back
    pub fn publish(&mut self, word: SharedWord, value: u32) {
        self.write(word, value);
        self.writeback(word);
    }

    /// Region behind this cache
    pub fn region(&self) -> &'a SharedRegion {
        self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_until_invalidate() {
        let region = SharedRegion::new();
        let mut writer = FlagCache::new(&region);
        let mut reader = FlagCache::new(&region);

        assert_eq!(reader.read(SharedWord::InitDone), 0);

        writer.write(SharedWord::InitDone, 1);
        assert_eq!(region.peek(SharedWord::InitDone), 0);

        writer.writeback(SharedWord::InitDone);
        assert_eq!(region.peek(SharedWord::InitDone), 1);

        // Reader still holds the old line
        assert_eq!(reader.read(SharedWord::InitDone), 0);
        assert_eq!(reader.read_fresh(SharedWord::InitDone), 1);
    }

    #[test]
    fn test_invalidate_discards_unwritten() {
        let region = SharedRegion::new();
        let mut cache = FlagCache::new(&region);
        cache.write(SharedWord::RoundCount, 7);
        cache.invalidate(SharedWord::RoundCount);
        assert_eq!(cache.read(SharedWord::RoundCount), 0);
    }

    #[test]
    fn test_addresses() {
        assert_eq!(SharedWord::InitDone.address(), 0x0C00_0000);
        assert_eq!(SharedWord::RoundCount.address(), 0x0C00_0004);
    }
}
