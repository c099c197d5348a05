//! QDX - Exchange Configuration
//!
//! Every knob of the exchange with the reference values as defaults. A JSON
//! file may override any subset of fields; missing fields keep their
//! defaults. A configuration is validated before any hardware is touched,
//! and a rejected configuration aborts startup.

use crate::accumulator::PAGE_CAPACITY;
use crate::bridge::AccumulatorMode;
use crate::descriptor::{ADDRESS_SPACE_END, DESC_ALIGN, DESC_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::poll::PollPolicy;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One descriptor memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Global base address
    pub base: u32,
    /// Descriptor size in bytes
    pub desc_size: usize,
    /// Number of descriptors
    pub count: u32,
    /// Payload offset inside each descriptor
    pub data_offset: u16,
}

impl RegionConfig {
    /// Packet descriptors
    pub fn monolithic() -> Self {
        Self {
            base: MONOLITHIC_REGION_BASE,
            desc_size: SIZE_MONOLITHIC_DESC,
            count: NUM_MONOLITHIC_DESC,
            data_offset: MONOLITHIC_DESC_DATA_OFFSET,
        }
    }

    /// Sync token descriptors
    pub fn sync() -> Self {
        Self {
            base: SYNC_REGION_BASE,
            desc_size: SIZE_SYNC_DESC,
            count: NUM_SYNC_DESC,
            data_offset: DESC_HEADER_SIZE as u16,
        }
    }

    fn end(&self) -> u64 {
        u64::from(self.base) + self.desc_size as u64 * u64::from(self.count)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.desc_size < DESC_HEADER_SIZE || self.desc_size % DESC_ALIGN != 0 {
            return Err(Error::InvalidDescriptorSize(self.desc_size));
        }
        let offset = self.data_offset as usize;
        if offset < DESC_HEADER_SIZE || offset > self.desc_size {
            return Err(Error::InvalidConfig(format!(
                "{} payload offset {} outside {}-byte descriptor",
                name, offset, self.desc_size
            )));
        }
        if self.end() > ADDRESS_SPACE_END {
            return Err(Error::InvalidConfig(format!(
                "{} region at {:#010x} runs past the 32-bit address space",
                name, self.base
            )));
        }
        Ok(())
    }
}

/// Exchange configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Participating cores
    pub cores: usize,
    /// Groups of rounds; each group runs one round per core
    pub iterations: usize,
    /// Packets sent per round
    pub packets_per_round: usize,
    /// Payload bytes per packet
    pub payload_len: usize,
    /// Packet descriptor memory, split evenly between tx and rx pools
    pub monolithic: RegionConfig,
    /// Sync token memory
    pub sync: RegionConfig,
    /// Whether the interrupt handler disables the channel after one page
    pub mode: AccumulatorMode,
    /// Poll loop behavior
    pub poll: PollPolicy,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            cores: NUM_CORES,
            iterations: 1,
            packets_per_round: NUM_PACKETS,
            payload_len: SIZE_DATA_BUFFER,
            monolithic: RegionConfig::monolithic(),
            sync: RegionConfig::sync(),
            mode: AccumulatorMode::OneShot,
            poll: PollPolicy::default(),
        }
    }
}

impl ExchangeConfig {
    /// Load and validate a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigFile(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::ConfigFile(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::ConfigFile(e.to_string()))
    }

    /// Rounds in the whole run
    pub fn rounds(&self) -> u32 {
        (self.iterations * self.cores) as u32
    }

    /// Accumulator page size: one round's packets plus the count word
    pub fn max_page_entries(&self) -> usize {
        self.packets_per_round + 1
    }

    /// Descriptors in each of the tx and rx pools
    pub fn pool_size(&self) -> u32 {
        self.monolithic.count / 2
    }

    /// Reject anything the hardware cannot do
    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 || self.cores > NUM_CORES {
            return Err(Error::InvalidConfig(format!(
                "{} cores requested, 1..={} supported",
                self.cores, NUM_CORES
            )));
        }
        let groups = DMA_CHANNELS / ACC_CHANNEL_GROUP;
        if self.iterations == 0 || self.iterations > groups {
            return Err(Error::InvalidConfig(format!(
                "{} iterations requested, 1..={} supported",
                self.iterations, groups
            )));
        }
        if self.packets_per_round == 0 || self.packets_per_round > PAGE_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "{} packets per round, 1..={} fit an accumulator page",
                self.packets_per_round, PAGE_CAPACITY
            )));
        }

        self.monolithic.validate("monolithic")?;
        self.sync.validate("sync")?;
        if u64::from(self.monolithic.base) < self.sync.end()
            && u64::from(self.sync.base) < self.monolithic.end()
        {
            return Err(Error::InvalidConfig("descriptor regions overlap".into()));
        }

        let capacity = self.monolithic.desc_size - self.monolithic.data_offset as usize;
        if self.payload_len > capacity {
            return Err(Error::PayloadTooLarge {
                len: self.payload_len,
                capacity,
            });
        }
        if (self.pool_size() as usize) < self.packets_per_round {
            return Err(Error::InvalidConfig(format!(
                "{} packet descriptors cannot carry {} packets per round",
                self.monolithic.count, self.packets_per_round
            )));
        }
        if (self.sync.count as usize) < 2 * self.cores {
            return Err(Error::InvalidConfig(format!(
                "{} sync descriptors, at least {} needed",
                self.sync.count,
                2 * self.cores
            )));
        }
        let total = self.monolithic.count as u64 + self.sync.count as u64;
        if total > MAX_DESCRIPTORS as u64 {
            return Err(Error::DescriptorLimit {
                requested: total.min(u32::MAX as u64) as u32,
                available: MAX_DESCRIPTORS,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = ExchangeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rounds(), 4);
        assert_eq!(config.max_page_entries(), 9);
        assert_eq!(config.pool_size(), 32);
    }

    #[test]
    fn test_rejects() {
        let mut config = ExchangeConfig::default();
        config.cores = 5;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = ExchangeConfig::default();
        config.packets_per_round = 33;
        assert!(config.validate().is_err());

        let mut config = ExchangeConfig::default();
        config.payload_len = 145;
        assert_eq!(
            config.validate(),
            Err(Error::PayloadTooLarge { len: 145, capacity: 144 })
        );

        let mut config = ExchangeConfig::default();
        config.sync.base = MONOLITHIC_REGION_BASE + 160;
        assert!(config.validate().is_err());

        let mut config = ExchangeConfig::default();
        config.iterations = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_region_past_address_space() {
        let mut config = ExchangeConfig::default();
        config.monolithic.base = 0xFFFF_F000;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        // 64 * 160 bytes end exactly at 4 GiB
        config.monolithic.base = 0xFFFF_D800;
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "cores": 2, "iterations": 3, "poll": {{ "max_polls": 5000 }},
                 "mode": "continuous" }}"#
        )
        .unwrap();

        let config = ExchangeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.cores, 2);
        assert_eq!(config.rounds(), 6);
        assert_eq!(config.packets_per_round, NUM_PACKETS);
        assert_eq!(config.poll.max_polls, Some(5000));
        assert_eq!(config.poll.spin, PollPolicy::default().spin);
        assert_eq!(config.mode, AccumulatorMode::Continuous);
    }

    #[test]
    fn test_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ \"cores\": 0 }}").unwrap();
        assert!(matches!(
            ExchangeConfig::from_json_file(file.path()),
            Err(Error::InvalidConfig(_))
        ));

        let missing = ExchangeConfig::from_json_file("/nonexistent/qdx.json");
        assert!(matches!(missing, Err(Error::ConfigFile(_))));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = ExchangeConfig::default();
        let text = config.to_json().unwrap();
        let back: ExchangeConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
