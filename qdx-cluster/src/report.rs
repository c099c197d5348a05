//! Run reports
//!
//! A finished run is checked against what the configuration promises and
//! written out as JSON together with when and how it ran.

use chrono::{DateTime, Utc};
use qdx::exchange::{pools_restored, ClusterReport};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Why a run is not accepted
#[derive(Debug, Error)]
pub enum RunError {
    /// The exchange itself failed
    #[error("exchange failed: {0}")]
    Exchange(#[from] qdx::Error),

    /// The exchange finished but its accounting is off
    #[error("verification failed: {0}")]
    Verification(String),

    /// Report could not be written
    #[error("report: {0}")]
    Io(#[from] std::io::Error),

    /// Report could not be encoded
    #[error("report encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything written for one run
#[derive(Debug, Serialize)]
pub struct RunSummary {
    /// Wall clock at start
    pub started_at: DateTime<Utc>,
    /// Wall clock at end
    pub finished_at: DateTime<Utc>,
    /// HAL the cores ran on
    pub platform: &'static str,
    /// Jitter seed, when jitter was on
    pub seed: Option<u64>,
    /// Whether every pool ended whole
    pub pools_restored: bool,
    /// Exchange outcome
    pub report: ClusterReport,
}

impl RunSummary {
    /// Wrap a finished report
    pub fn new(
        started_at: DateTime<Utc>,
        platform: &'static str,
        seed: Option<u64>,
        report: ClusterReport,
    ) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            platform,
            seed,
            pools_restored: pools_restored(&report),
            report,
        }
    }

    /// Check rounds, packets and pools
    pub fn verify(&self) -> Result<(), RunError> {
        let config = &self.report.config;
        let rounds = config.rounds();
        if self.report.round_counter != rounds {
            return Err(RunError::Verification(format!(
                "round counter {} after {} rounds",
                self.report.round_counter, rounds
            )));
        }
        let expected = rounds as usize * config.packets_per_round;
        let received = self.report.packets_received();
        if received != expected {
            return Err(RunError::Verification(format!(
                "{} packets received, {} sent",
                received, expected
            )));
        }
        if let Some(bad) = self
            .report
            .batches()
            .find(|batch| !batch.payload_intact || !batch.routed)
        {
            return Err(RunError::Verification(format!(
                "round {} on core {} arrived damaged or misrouted",
                bad.round, bad.core
            )));
        }
        if !self.pools_restored {
            return Err(RunError::Verification(format!(
                "descriptor pools not restored: {:?}",
                self.report.pools
            )));
        }
        Ok(())
    }

    /// Pretty JSON to `path`
    pub fn write(&self, path: &Path) -> Result<(), RunError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Human summary on stdout
    pub fn print(&self) {
        let report = &self.report;
        let elapsed = self.finished_at - self.started_at;
        println!("\nExchange Summary:");
        println!("  Cores: {}  Rounds: {}", report.config.cores, report.round_counter);
        println!("  Packets received: {}", report.packets_received());
        println!(
            "  DMA transferred/starved/stalled: {}/{}/{}",
            report.dma.transferred, report.dma.starved, report.dma.stalled
        );
        println!("  Hardware ticks: {}", report.ticks);
        println!("  Wall time: {} ms", elapsed.num_milliseconds());
        for core in &report.cores {
            println!(
                "  core {}: {} rounds, {} interrupts, {} pages, {} us",
                core.core,
                core.rounds,
                core.interrupts,
                core.batches.len(),
                core.elapsed_us
            );
        }
        println!("  Pools restored: {}", self.pools_restored);
    }
}
