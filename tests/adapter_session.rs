// Full implicit-connection cycle against a mock adapter on loopback:
// Register Session, Forward Open with a size-negotiation retry, output
// seeding from an explicit read, cyclic T->O delivery, and Forward Close.

mod common;

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::timeout;

use common::MockAdapter;
use eip_scan::{ConnectionState, EipEngine, EngineConfig, ImplicitConfig};

const PRODUCED_DATA: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];
const SEED_DATA: [u8; 4] = [1, 2, 3, 4];

#[tokio::test]
async fn implicit_connection_full_cycle() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let stats = MockAdapter {
        addr: Ipv4Addr::LOCALHOST,
        seed: SEED_DATA.to_vec(),
        produced: PRODUCED_DATA.to_vec(),
        reject_first_open: true,
        ..MockAdapter::default()
    }
    .spawn()
    .await;

    let engine = EipEngine::new(EngineConfig::default());
    let target = Ipv4Addr::LOCALHOST;

    let mut inputs = engine
        .implicit_open(ImplicitConfig {
            target,
            consumed_instance: 100,
            produced_instance: 101,
            consumed_size: Some(4),
            produced_size: Some(PRODUCED_DATA.len()),
            rpi_ms: 50,
            exclusive_owner: true,
        })
        .await
        .unwrap();

    // The first Forward Open was rejected with extended status 0x0315 and
    // retried with the next size interpretation.
    assert_eq!(stats.forward_opens.load(Ordering::SeqCst), 2);
    assert_eq!(
        engine.implicit_state(target).await,
        Some(ConnectionState::Open)
    );

    // Output image was seeded from the explicit read.
    assert_eq!(engine.implicit_read_output(target).await.unwrap(), SEED_DATA);

    // A short write is zero-padded to the negotiated size.
    engine.implicit_write_data(target, &[9, 9]).await.unwrap();
    assert_eq!(
        engine.implicit_read_output(target).await.unwrap(),
        vec![9, 9, 0, 0]
    );

    // Cyclic T->O frames arrive on the delivery queue with framing
    // stripped.
    let frame = timeout(Duration::from_secs(2), inputs.recv())
        .await
        .expect("no T->O frame within 2 s")
        .expect("delivery queue closed");
    assert_eq!(frame, PRODUCED_DATA);

    engine.implicit_close(target).await.unwrap();
    assert_eq!(stats.forward_closes.load(Ordering::SeqCst), 1);
    assert_eq!(engine.implicit_state(target).await, None);

    // The slot is free again for the same target.
    assert!(matches!(
        engine.implicit_write_data(target, &[0]).await,
        Err(eip_scan::EipError::NotConnected(_))
    ));
}
