//! Session engine integration tests against the scripted mock backend:
//! correlation ordering, read/notification disambiguation, teardown
//! guarantees, the connect race and scan-session behavior.

use anyhow::Result;
use bluelink_core::backend::SessionEvent;
use bluelink_core::mock::{ConnectBehavior, IssuedOp, MockBackend};
use bluelink_core::{
    AdapterState, AdvertisementData, AttributeHandle, BleUuid, Central, CentralConfig,
    Characteristic, CharacteristicProperties, Connection, ConnectionState, DeviceId, Error,
    NotificationStream, PreferredPhy, ScanFilter, WriteKind,
};
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn characteristic(handle: u64, uuid: u16) -> Characteristic {
    Characteristic {
        uuid: BleUuid::uuid16(uuid),
        handle: AttributeHandle::new(handle),
        service: BleUuid::uuid16(0x180D),
        properties: CharacteristicProperties {
            read: true,
            write: true,
            notify: true,
            ..Default::default()
        },
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}

/// Backend with one manual peer, a connected session and its inbox handle.
async fn connected_session() -> Result<(MockBackend, Central, Connection, DeviceId)> {
    init_tracing();
    let backend = MockBackend::new();
    let device = DeviceId::new("peer-a");
    backend.add_peer(
        device.clone(),
        AdvertisementData::with_local_name("Peer"),
        -40,
    );
    let central = Central::new(
        Arc::new(backend.clone()),
        CentralConfig::default().with_connect_timeout(Duration::from_secs(5)),
    )?;
    let connection = central.connect(&device).await?;
    Ok((backend, central, connection, device))
}

fn set_notify_count(backend: &MockBackend, device: &DeviceId, enabled: bool) -> usize {
    backend
        .issued_ops(device)
        .iter()
        .filter(|op| matches!(op, IssuedOp::SetNotify(_, e) if *e == enabled))
        .count()
}

async fn subscribe(
    connection: &Connection,
    backend: &MockBackend,
    device: &DeviceId,
    ch: &Characteristic,
) -> NotificationStream {
    let inbox = backend.session_inbox(device).unwrap();
    let prior = set_notify_count(backend, device, true);
    let subscribe = connection.notifications(ch);
    let inject = async {
        wait_until(|| set_notify_count(backend, device, true) > prior).await;
        inbox
            .send(SessionEvent::NotifyConfigCompleted {
                attribute: ch.handle,
                result: Ok(()),
            })
            .unwrap();
    };
    let (stream, ()) = tokio::join!(subscribe, inject);
    stream.unwrap()
}

#[tokio::test]
async fn test_fifo_correlation_resolves_reads_in_issue_order() -> Result<()> {
    let (backend, _central, connection, device) = connected_session().await?;
    let inbox = backend.session_inbox(&device).unwrap();
    let ch = characteristic(7, 0x2A37);

    let reads = async {
        tokio::join!(
            connection.read(&ch),
            connection.read(&ch),
            connection.read(&ch),
        )
    };
    let inject = async {
        wait_until(|| {
            backend
                .issued_ops(&device)
                .iter()
                .filter(|op| matches!(op, IssuedOp::Read(_)))
                .count()
                == 3
        })
        .await;
        for payload in [vec![1], vec![2], vec![3]] {
            inbox
                .send(SessionEvent::ValueChanged {
                    attribute: ch.handle,
                    result: Ok(payload),
                })
                .unwrap();
        }
    };
    let ((first, second, third), ()) = tokio::join!(reads, inject);

    assert_eq!(first?, vec![1]);
    assert_eq!(second?, vec![2]);
    assert_eq!(third?, vec![3]);
    Ok(())
}

#[tokio::test]
async fn test_value_update_with_pending_read_resolves_read_not_notification() -> Result<()> {
    let (backend, _central, connection, device) = connected_session().await?;
    let inbox = backend.session_inbox(&device).unwrap();
    let ch = characteristic(7, 0x2A37);

    let mut stream = subscribe(&connection, &backend, &device, &ch).await;

    let read = connection.read(&ch);
    let inject = async {
        wait_until(|| {
            backend
                .issued_ops(&device)
                .contains(&IssuedOp::Read(ch.handle))
        })
        .await;
        inbox
            .send(SessionEvent::ValueChanged {
                attribute: ch.handle,
                result: Ok(vec![9]),
            })
            .unwrap();
    };
    let (read_result, ()) = tokio::join!(read, inject);
    assert_eq!(read_result?, vec![9]);

    // The solicited update never leaked into the notification stream.
    assert!(stream.next().now_or_never().is_none());

    // With no pending read, the same event kind is a notification.
    inbox
        .send(SessionEvent::ValueChanged {
            attribute: ch.handle,
            result: Ok(vec![7]),
        })
        .unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await?
        .unwrap();
    assert_eq!(payload, vec![7]);

    // No pending read and no subscription for another attribute: the event
    // is discarded without failing anything.
    inbox
        .send(SessionEvent::ValueChanged {
            attribute: AttributeHandle::new(99),
            result: Ok(vec![1]),
        })
        .unwrap();
    Ok(())
}

#[tokio::test]
async fn test_teardown_fails_all_pending_operations_and_channels() -> Result<()> {
    let (backend, _central, connection, device) = connected_session().await?;
    let inbox = backend.session_inbox(&device).unwrap();
    let ch_a = characteristic(7, 0x2A37);
    let ch_b = characteristic(8, 0x2A38);

    let mut channel = connection.open_channel(0x0081).await?;

    let operations = async {
        tokio::join!(
            connection.read(&ch_a),
            connection.read(&ch_b),
            connection.write(&ch_a, b"x", WriteKind::WithResponse),
            connection.read_rssi(),
        )
    };
    let inject = async {
        wait_until(|| backend.issued_ops(&device).len() >= 5).await;
        inbox
            .send(SessionEvent::Disconnected {
                reason: "supervision timeout".to_string(),
            })
            .unwrap();
    };
    let ((read_a, read_b, write_a, rssi), ()) = tokio::join!(operations, inject);

    for error in [
        read_a.unwrap_err(),
        read_b.unwrap_err(),
        write_a.unwrap_err(),
        rssi.unwrap_err(),
    ] {
        assert!(matches!(error, Error::ConnectionFailed(_)), "{error}");
    }

    // The open channel is finished and failed as well.
    assert!(channel.recv().await.is_none());
    assert!(channel.is_closed());
    assert!(matches!(
        channel.send(b"y").await.unwrap_err(),
        Error::ConnectionFailed(_)
    ));

    assert_eq!(
        connection.state(),
        ConnectionState::Disconnected("supervision timeout".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn test_teardown_runs_exactly_once_for_both_directions() -> Result<()> {
    let (backend, _central, connection, device) = connected_session().await?;
    let inbox = backend.session_inbox(&device).unwrap();

    let mut states = connection.state_stream();
    assert_eq!(*states.borrow(), ConnectionState::Connected);

    // Native-initiated teardown, twice, plus a caller-initiated disconnect.
    inbox
        .send(SessionEvent::Disconnected {
            reason: "gone first".to_string(),
        })
        .unwrap();
    let _ = inbox.send(SessionEvent::Disconnected {
        reason: "gone second".to_string(),
    });

    states.changed().await?;
    assert_eq!(
        *states.borrow(),
        ConnectionState::Disconnected("gone first".to_string())
    );

    connection.disconnect().await;

    // Exactly one terminal state event: nothing further arrives.
    let further = tokio::time::timeout(Duration::from_millis(50), states.changed()).await;
    assert!(further.is_err());
    assert_eq!(
        connection.state(),
        ConnectionState::Disconnected("gone first".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn test_request_against_torn_down_session_fails_immediately() -> Result<()> {
    let (backend, _central, connection, device) = connected_session().await?;
    let inbox = backend.session_inbox(&device).unwrap();
    let ch = characteristic(7, 0x2A37);

    inbox
        .send(SessionEvent::Disconnected {
            reason: "link lost".to_string(),
        })
        .unwrap();
    let mut states = connection.state_stream();
    wait_until(|| connection.state().is_terminal()).await;
    assert!(states.borrow_and_update().is_terminal());

    assert!(matches!(
        connection.read(&ch).await.unwrap_err(),
        Error::ConnectionFailed(_)
    ));
    assert!(matches!(
        connection.discover_services().await.unwrap_err(),
        Error::ConnectionFailed(_)
    ));
    assert!(matches!(
        connection.open_channel(0x0081).await.unwrap_err(),
        Error::ConnectionFailed(_)
    ));
    assert!(matches!(
        connection.notifications(&ch).await.unwrap_err(),
        Error::ConnectionFailed(_)
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_converts_to_connection_failed_and_cancels() -> Result<()> {
    init_tracing();
    let backend = MockBackend::new();
    let device = DeviceId::new("peer-a");
    backend.add_peer(device.clone(), AdvertisementData::default(), -40);
    backend.set_connect_behavior(ConnectBehavior::Hang);

    let central = Central::new(
        Arc::new(backend.clone()),
        CentralConfig::default().with_connect_timeout(Duration::from_millis(100)),
    )?;

    let error = central.connect(&device).await.unwrap_err();
    assert!(matches!(error, Error::ConnectionFailed(_)), "{error}");
    assert_eq!(backend.cancelled_connects(), vec![device]);
    Ok(())
}

#[tokio::test]
async fn test_connect_success_and_failure_resolve_exactly_once() -> Result<()> {
    init_tracing();
    let backend = MockBackend::new();
    let device = DeviceId::new("peer-a");
    backend.add_peer(device.clone(), AdvertisementData::default(), -40);
    let central = Central::new(Arc::new(backend.clone()), CentralConfig::default())?;

    let connection = central.connect(&device).await?;
    assert!(connection.is_connected());
    assert!(backend.cancelled_connects().is_empty());

    backend.set_connect_behavior(ConnectBehavior::Fail(Error::ConnectionFailed(
        "refused".to_string(),
    )));
    let error = central.connect(&device).await.unwrap_err();
    assert_eq!(error, Error::ConnectionFailed("refused".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_scan_name_prefix_filter() -> Result<()> {
    init_tracing();
    let backend = MockBackend::new();
    backend.add_peer(
        DeviceId::new("demo"),
        AdvertisementData::with_local_name("DemoDevice"),
        -40,
    );
    backend.add_peer(
        DeviceId::new("other"),
        AdvertisementData::with_local_name("Other"),
        -50,
    );
    let central = Central::new(Arc::new(backend.clone()), CentralConfig::default())?;

    let mut scan = central
        .scan(ScanFilter::new().with_name_prefix("Demo"))
        .await?;
    let result = scan.recv().await.unwrap();
    assert_eq!(result.advertisement.local_name.as_deref(), Some("DemoDevice"));

    // "Other" was filtered; stopping ends the sequence.
    scan.stop();
    assert!(scan.recv().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_scan_known_name_matches_nameless_advertisement() -> Result<()> {
    init_tracing();
    let backend = MockBackend::new();
    backend.add_peer(
        DeviceId::new("demo"),
        AdvertisementData::with_local_name("DemoDevice"),
        -40,
    );
    let central = Central::new(Arc::new(backend.clone()), CentralConfig::default())?;
    let mut scan = central
        .scan(ScanFilter::new().with_name_prefix("Demo"))
        .await?;
    assert!(scan.recv().await.is_some());

    // A follow-up advertisement without a name still matches through the
    // already-known name.
    backend.emit_scan_result(bluelink_core::ScanResult {
        device: DeviceId::new("demo"),
        advertisement: AdvertisementData::default(),
        rssi: -41,
    });
    let result = tokio::time::timeout(Duration::from_secs(1), scan.recv())
        .await?
        .unwrap();
    assert_eq!(result.rssi, -41);
    Ok(())
}

#[tokio::test]
async fn test_single_active_scan_and_stop_exactly_once() -> Result<()> {
    init_tracing();
    let backend = MockBackend::new();
    let central = Central::new(Arc::new(backend.clone()), CentralConfig::default())?;

    let mut scan = central.scan(ScanFilter::new()).await?;
    let error = central.scan(ScanFilter::new()).await.unwrap_err();
    assert!(matches!(error, Error::InvalidState(_)));

    // Explicit stop then drop: the native handle is closed exactly once.
    scan.stop();
    drop(scan);
    assert_eq!(backend.scan_stop_count(), 1);

    // The slot is free again; dropping without stop also closes once.
    let scan = central.scan(ScanFilter::new()).await?;
    drop(scan);
    assert_eq!(backend.scan_stop_count(), 2);
    assert!(!backend.scan_active());
    Ok(())
}

#[tokio::test]
async fn test_second_notification_stream_is_invalid_state() -> Result<()> {
    let (backend, _central, connection, device) = connected_session().await?;
    let ch = characteristic(7, 0x2A37);

    let stream = subscribe(&connection, &backend, &device, &ch).await;

    let error = connection.notifications(&ch).await.unwrap_err();
    assert!(matches!(error, Error::InvalidState(_)), "{error}");

    // Explicit unsubscribe frees the slot.
    let inbox = backend.session_inbox(&device).unwrap();
    let unsubscribe = stream.unsubscribe();
    let inject = async {
        wait_until(|| {
            backend
                .issued_ops(&device)
                .contains(&IssuedOp::SetNotify(ch.handle, false))
        })
        .await;
        inbox
            .send(SessionEvent::NotifyConfigCompleted {
                attribute: ch.handle,
                result: Ok(()),
            })
            .unwrap();
    };
    let (unsubscribed, ()) = tokio::join!(unsubscribe, inject);
    unsubscribed?;

    let stream = subscribe(&connection, &backend, &device, &ch).await;
    drop(stream);
    // Dropping releases the registration synchronously as well.
    let _stream = subscribe(&connection, &backend, &device, &ch).await;
    Ok(())
}

#[tokio::test]
async fn test_notification_stream_terminates_on_teardown() -> Result<()> {
    let (backend, _central, connection, device) = connected_session().await?;
    let inbox = backend.session_inbox(&device).unwrap();
    let ch = characteristic(7, 0x2A37);

    let mut stream = subscribe(&connection, &backend, &device, &ch).await;
    inbox
        .send(SessionEvent::Disconnected {
            reason: "link lost".to_string(),
        })
        .unwrap();
    assert!(stream.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_write_without_response_returns_after_issue() -> Result<()> {
    let (backend, _central, connection, device) = connected_session().await?;
    let ch = characteristic(7, 0x2A37);

    connection
        .write(&ch, b"fire-and-forget", WriteKind::WithoutResponse)
        .await?;
    assert!(backend.issued_ops(&device).contains(&IssuedOp::Write(
        ch.handle,
        b"fire-and-forget".to_vec(),
        WriteKind::WithoutResponse
    )));
    Ok(())
}

#[tokio::test]
async fn test_rssi_read_resolves_from_completion() -> Result<()> {
    let (backend, _central, connection, device) = connected_session().await?;
    let inbox = backend.session_inbox(&device).unwrap();

    let rssi = connection.read_rssi();
    let inject = async {
        wait_until(|| backend.issued_ops(&device).contains(&IssuedOp::ReadRssi)).await;
        inbox
            .send(SessionEvent::RssiRead { result: Ok(-67) })
            .unwrap();
    };
    let (rssi, ()) = tokio::join!(rssi, inject);
    assert_eq!(rssi?, -67);
    Ok(())
}

#[tokio::test]
async fn test_unsupported_capability_surfaces_immediately() -> Result<()> {
    let (backend, _central, connection, _device) = connected_session().await?;
    backend.set_phy_unsupported(true);
    let error = connection
        .set_preferred_phy(PreferredPhy::Le2M)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::NotSupported(_)));
    Ok(())
}

#[tokio::test]
async fn test_operations_refused_while_adapter_not_ready() -> Result<()> {
    init_tracing();
    let backend = MockBackend::new();
    backend.set_adapter_state(AdapterState::PoweredOff);
    let central = Central::new(Arc::new(backend.clone()), CentralConfig::default())?;

    assert_eq!(
        central.scan(ScanFilter::new()).await.unwrap_err(),
        Error::NotReady
    );
    assert_eq!(
        central.connect(&DeviceId::new("x")).await.unwrap_err(),
        Error::NotReady
    );

    // State changes reach subscribers.
    let mut events = central.adapter_events();
    backend.set_adapter_state(AdapterState::PoweredOn);
    assert_eq!(events.recv().await, Some(AdapterState::PoweredOn));
    Ok(())
}

#[tokio::test]
async fn test_discovery_against_unknown_parent_fails_not_found() -> Result<()> {
    let (_backend, _central, connection, _device) = connected_session().await?;
    let error = connection
        .discover_characteristics(BleUuid::uuid16(0x180D))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::NotFound(_)));

    let error = connection
        .discover_descriptors(BleUuid::uuid16(0x2A37))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn test_channel_send_backpressure_is_typed() -> Result<()> {
    let (backend, _central, connection, _device) = connected_session().await?;
    let channel = connection.open_channel(0x0081).await?;
    backend.set_channel_backpressure(true);
    assert_eq!(channel.send(b"x").await.unwrap_err(), Error::Backpressure);
    backend.set_channel_backpressure(false);
    channel.send(b"x").await?;
    Ok(())
}
