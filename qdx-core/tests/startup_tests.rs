//! Startup barrier and attach tests

use qdx::exchange::{attach, system_exit, system_init};
use qdx::hal::hosted::ThreadHal;
use qdx::poll::PollPolicy;
use qdx::prelude::*;
use qdx::SharedWord;
use std::time::Duration;

#[test]
fn test_queue_open_before_init_fails() {
    let soc = Soc::new();
    assert_eq!(
        soc.qm().open(QueueType::GeneralPurpose, TX_FREE_QUEUE),
        Err(Error::NotInitialized)
    );
    assert_eq!(soc.qm().start(1), Err(Error::NotInitialized));
}

#[test]
fn test_peers_attach_after_init() {
    let soc = Soc::new();
    let config = ExchangeConfig::default();

    std::thread::scope(|s| {
        let peers: Vec<_> = (1..4)
            .map(|core| {
                let soc = &soc;
                s.spawn(move || {
                    let mut ctx = CoreContext::new(soc, ThreadHal::new(core), PollPolicy::bounded(50_000_000));
                    attach(&mut ctx)
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(5));
        let mut home = CoreContext::new(&soc, ThreadHal::new(0), config.poll);
        let queues = system_init(&mut home, &config).unwrap();

        for peer in peers {
            let attached = peer.join().unwrap().unwrap();
            assert_eq!(attached, queues);
        }
        assert_eq!(soc.shared().peek(SharedWord::InitDone), 1);
        assert_eq!(soc.qm().open_count(TX_FREE_QUEUE), 4);
        assert_eq!(soc.qm().occupancy(queues.tx_free), 32);
        assert_eq!(soc.qm().occupancy(queues.rx_free), 32);
        assert_eq!(soc.qm().occupancy(queues.sync.free), 32);

        system_exit(&soc, &queues).unwrap();
        assert!(!soc.qm().is_initialized());
    });
}

#[test]
fn test_halt_releases_waiting_peer() {
    let soc = Soc::new();
    std::thread::scope(|s| {
        let peer = s.spawn(|| {
            let mut ctx = CoreContext::new(&soc, ThreadHal::new(2), PollPolicy::default());
            attach(&mut ctx)
        });
        std::thread::sleep(Duration::from_millis(5));
        soc.halt();
        assert_eq!(peer.join().unwrap(), Err(Error::Halted("init flag")));
    });
}

#[test]
fn test_second_init_rejected() {
    let soc = Soc::new();
    let config = ExchangeConfig::default();
    let mut home = CoreContext::new(&soc, ThreadHal::new(0), config.poll);
    system_init(&mut home, &config).unwrap();
    let err = system_init(&mut home, &config).unwrap_err();
    assert_eq!(err, Error::AlreadyInitialized);
    assert!(err.is_fatal());
}
