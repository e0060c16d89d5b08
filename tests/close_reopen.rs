// Teardown keeps the connection slot claimed: while Forward Close is in
// flight an open to the same target is rejected, and once close returns
// the slot is reusable.

mod common;

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use common::MockAdapter;
use eip_scan::{ConnectionState, EipEngine, EipError, EngineConfig, ImplicitConfig};

fn implicit_config(target: Ipv4Addr) -> ImplicitConfig {
    ImplicitConfig {
        target,
        consumed_instance: 100,
        produced_instance: 101,
        consumed_size: Some(4),
        produced_size: Some(4),
        rpi_ms: 50,
        exclusive_owner: true,
    }
}

#[tokio::test]
async fn open_during_close_is_rejected_until_teardown_completes() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let target = Ipv4Addr::LOCALHOST;
    let stats = MockAdapter {
        addr: target,
        // Slow Forward Close answer widens the teardown window.
        forward_close_delay: Duration::from_millis(400),
        ..MockAdapter::default()
    }
    .spawn()
    .await;

    let engine = Arc::new(EipEngine::new(EngineConfig::default()));
    engine.implicit_open(implicit_config(target)).await.unwrap();

    let closer = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.implicit_close(target).await })
    };

    // Wait until teardown is underway.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if engine.implicit_state(target).await == Some(ConnectionState::Closing) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "close never reached the Closing state"
        );
        sleep(Duration::from_millis(10)).await;
    }

    // The slot stays claimed through teardown; a concurrent open to the
    // same target must not negotiate a second connection.
    assert!(matches!(
        engine.implicit_open(implicit_config(target)).await,
        Err(EipError::AlreadyOpen(_))
    ));

    timeout(Duration::from_secs(5), closer)
        .await
        .expect("close did not finish")
        .unwrap()
        .unwrap();
    assert_eq!(stats.forward_closes.load(Ordering::SeqCst), 1);
    assert_eq!(engine.implicit_state(target).await, None);

    // Once teardown completes the target can be opened again.
    engine.implicit_open(implicit_config(target)).await.unwrap();
    assert_eq!(
        engine.implicit_state(target).await,
        Some(ConnectionState::Open)
    );
    engine.implicit_close(target).await.unwrap();
    assert_eq!(stats.forward_closes.load(Ordering::SeqCst), 2);
}
