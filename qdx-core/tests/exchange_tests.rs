//! End-to-end exchange tests on host threads

use qdx::bridge::AccumulatorMode;
use qdx::exchange::{pools_restored, run_cluster};
use qdx::hal::hosted::ThreadHal;
use qdx::poll::PollPolicy;
use qdx::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn guarded(config: ExchangeConfig) -> ExchangeConfig {
    init_tracing();
    ExchangeConfig {
        poll: PollPolicy::bounded(50_000_000),
        ..config
    }
}

#[test]
fn test_default_exchange() {
    let config = guarded(ExchangeConfig::default());
    let report = run_cluster(&config, ThreadHal::new).unwrap();

    assert_eq!(report.round_counter, 4);
    assert_eq!(report.cores.len(), 4);
    assert_eq!(report.packets_received(), 4 * NUM_PACKETS);
    assert_eq!(report.dma.transferred, (4 * NUM_PACKETS) as u64);
    assert_eq!(report.dma.orphaned, 0);
    assert!(pools_restored(&report));

    for core in &report.cores {
        assert_eq!(core.rounds, 4);
        assert_eq!(core.batches.len(), 1, "core {} drains its own round", core.core);
        let batch = core.batches[0];
        assert_eq!(batch.core, core.core);
        assert_eq!(batch.channel, core.core);
        assert_eq!(batch.packets, NUM_PACKETS);
        assert_eq!(batch.tokens, 4);
        assert!(batch.payload_intact);
        assert!(batch.routed);
    }
    assert_eq!(report.cores[0].packets_sent, 4 * NUM_PACKETS);
}

#[test]
fn test_rounds_complete_in_order() {
    let config = guarded(ExchangeConfig::default());
    let report = run_cluster(&config, ThreadHal::new).unwrap();

    let mut records: Vec<_> = report.batches().copied().collect();
    records.sort_by_key(|record| record.round);
    let rounds: Vec<u32> = records.iter().map(|record| record.round).collect();
    assert_eq!(rounds, vec![1, 2, 3, 4]);
    for (index, record) in records.iter().enumerate() {
        assert_eq!(record.core as usize, index);
    }
}

#[test]
fn test_several_iterations() {
    let config = guarded(ExchangeConfig {
        iterations: 3,
        ..ExchangeConfig::default()
    });
    let report = run_cluster(&config, ThreadHal::new).unwrap();

    assert_eq!(report.round_counter, 12);
    assert_eq!(report.packets_received(), 12 * NUM_PACKETS);
    assert!(pools_restored(&report));
    for core in &report.cores {
        let channels: Vec<ChannelId> = core.batches.iter().map(|b| b.channel).collect();
        assert_eq!(channels, vec![core.core, core.core + 4, core.core + 8]);
    }
}

#[test]
fn test_continuous_mode() {
    let config = guarded(ExchangeConfig {
        mode: AccumulatorMode::Continuous,
        packets_per_round: 4,
        ..ExchangeConfig::default()
    });
    let report = run_cluster(&config, ThreadHal::new).unwrap();

    assert_eq!(report.round_counter, 4);
    assert_eq!(report.packets_received(), 16);
    assert!(pools_restored(&report));
}

#[test]
fn test_two_cores_full_page() {
    let config = guarded(ExchangeConfig {
        cores: 2,
        packets_per_round: 32,
        payload_len: 144,
        ..ExchangeConfig::default()
    });
    let report = run_cluster(&config, ThreadHal::new).unwrap();

    assert_eq!(report.round_counter, 2);
    assert_eq!(report.packets_received(), 64);
    assert!(report.batches().all(|batch| batch.payload_intact && batch.tokens == 2));
    assert!(pools_restored(&report));
}

#[test]
fn test_single_core() {
    let config = guarded(ExchangeConfig {
        cores: 1,
        iterations: 2,
        ..ExchangeConfig::default()
    });
    let report = run_cluster(&config, ThreadHal::new).unwrap();
    assert_eq!(report.round_counter, 2);
    assert_eq!(report.cores[0].batches.len(), 2);
    assert!(pools_restored(&report));
}

#[test]
fn test_invalid_config_touches_nothing() {
    let config = ExchangeConfig {
        cores: 0,
        ..ExchangeConfig::default()
    };
    let err = run_cluster(&config, ThreadHal::new).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn test_region_past_address_space_rejected() {
    let mut config = ExchangeConfig::default();
    config.monolithic.base = 0xFFFF_F000;
    let err = run_cluster(&config, ThreadHal::new).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}
