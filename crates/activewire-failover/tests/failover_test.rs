//! End-to-end behavior of the failover transport over mock transports.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use url::Url;

use activewire_failover::FailoverTransport;
use activewire_mock::{MockNetwork, MockTransportFactory};
use activewire_transport_traits::{
    Command, CommandKind, ConnectionControl, Transport, TransportError, TransportListener,
    TransportRegistry,
};

#[derive(Default)]
struct RecordingListener {
    commands: Mutex<Vec<Command>>,
    exceptions: Mutex<Vec<TransportError>>,
    interrupted: AtomicUsize,
    resumed: AtomicUsize,
}

impl TransportListener for RecordingListener {
    fn on_command(&self, command: Command) {
        self.commands.lock().push(command);
    }

    fn on_exception(&self, error: TransportError) {
        self.exceptions.lock().push(error);
    }

    fn transport_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::SeqCst);
    }

    fn transport_resumed(&self) {
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    network: Arc<MockNetwork>,
    transport: Arc<FailoverTransport>,
    listener: Arc<RecordingListener>,
}

fn harness(uri: &str) -> Harness {
    harness_on(MockNetwork::new(), uri)
}

fn harness_on(network: Arc<MockNetwork>, uri: &str) -> Harness {
    let registry = Arc::new(
        TransportRegistry::new()
            .with_factory(Arc::new(MockTransportFactory::new(Arc::clone(&network)))),
    );
    let transport = Arc::new(FailoverTransport::from_uri(uri, registry).unwrap());
    let listener = Arc::new(RecordingListener::default());
    transport.set_listener(Arc::clone(&listener) as Arc<dyn TransportListener>);
    Harness {
        network,
        transport,
        listener,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn message(id: u32) -> Command {
    Command::new(
        id,
        CommandKind::Message {
            producer_id: "p1".into(),
            destination: "queue://orders".into(),
            message_id: format!("m{id}"),
        },
    )
    .with_payload(format!("body-{id}"))
}

fn session_state() -> Vec<Command> {
    vec![
        Command::new(
            1,
            CommandKind::ConnectionInfo {
                connection_id: "c1".into(),
            },
        ),
        Command::new(
            2,
            CommandKind::SessionInfo {
                session_id: "s1".into(),
            },
        ),
        Command::new(
            3,
            CommandKind::ConsumerInfo {
                consumer_id: "k1".into(),
                session_id: "s1".into(),
                destination: "queue://orders".into(),
            },
        ),
    ]
}

fn ids(commands: &[Command]) -> Vec<u32> {
    commands.iter().map(|c| c.command_id).collect()
}

fn control(control: ConnectionControl) -> Command {
    Command::new(0, CommandKind::ConnectionControl(control))
}

#[tokio::test]
async fn test_connects_to_single_uri() {
    let h = harness("failover:(mock://a)?randomize=false");
    h.transport.start().await.unwrap();

    let transport = Arc::clone(&h.transport);
    eventually("connection", || {
        let transport = Arc::clone(&transport);
        async move { transport.is_connected() }
    })
    .await;
    assert_eq!(h.transport.connected_uri().unwrap().as_str(), "mock://a");
    let listener = Arc::clone(&h.listener);
    eventually("resumed notice", || {
        let listener = Arc::clone(&listener);
        async move { listener.resumed.load(Ordering::SeqCst) == 1 }
    })
    .await;
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_send_fails_when_startup_attempts_exhausted() {
    let h = harness(
        "failover:(mock://a?failOnCreate=true)?maxReconnectAttempts=3&startupMaxReconnectAttempts=3&initialReconnectDelay=1",
    );
    h.transport.start().await.unwrap();

    let err = h.transport.oneway(message(1)).await.unwrap_err();
    assert!(
        matches!(err, TransportError::ReconnectExhausted { attempts: 4, .. }),
        "unexpected error: {err:?}"
    );
    assert!(!h.transport.is_connected());
    assert!(h.transport.is_failed());
    let listener = Arc::clone(&h.listener);
    eventually("failure notice", || {
        let listener = Arc::clone(&listener);
        async move { listener.exceptions.lock().len() == 1 }
    })
    .await;
}

#[tokio::test]
async fn test_falls_over_to_working_uri_with_backup() {
    let h = harness("failover:(mock://a?failOnCreate=true,mock://b)?backup=true&initialReconnectDelay=1");
    h.transport.start().await.unwrap();

    let transport = Arc::clone(&h.transport);
    eventually("connection via b", || {
        let transport = Arc::clone(&transport);
        async move { transport.is_connected() }
    })
    .await;
    assert_eq!(h.transport.connected_uri().unwrap().as_str(), "mock://b");
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_thousand_commands_arrive_in_order() {
    let h = harness("failover:(mock://a)?startupSync=true");
    h.transport.start().await.unwrap();

    for id in 1..=1000 {
        h.transport.oneway(message(id)).await.unwrap();
    }

    let received = h.network.received("a");
    assert_eq!(received.len(), 1000);
    assert_eq!(ids(&received), (1..=1000).collect::<Vec<_>>());
    assert_eq!(h.transport.failover_metrics().commands_sent, 1000);
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_all_uris_failing_on_create() {
    let h = harness(
        "failover:(mock://a?failOnCreate=true,mock://b?failOnCreate=true)?maxReconnectAttempts=2&initialReconnectDelay=1",
    );
    h.transport.start().await.unwrap();

    assert!(h.transport.oneway(message(1)).await.is_err());
    assert!(!h.transport.is_connected());
    assert_eq!(h.network.create_count("a"), 3);
    assert_eq!(h.network.create_count("b"), 3);
}

#[tokio::test]
async fn test_reaches_the_only_reachable_uri() {
    let network = MockNetwork::new();
    for name in ["a", "b", "c"] {
        network.set_available(name, false);
    }
    let h = harness_on(
        network,
        "failover:(mock://a,mock://b,mock://c,mock://d)?randomize=true&initialReconnectDelay=1",
    );
    h.transport.start().await.unwrap();

    for id in 1..=10 {
        h.transport.oneway(message(id)).await.unwrap();
    }
    assert_eq!(h.transport.connected_uri().unwrap().as_str(), "mock://d");
    assert_eq!(ids(&h.network.received("d")), (1..=10).collect::<Vec<_>>());
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_state_is_replayed_before_new_traffic() {
    let h = harness("failover:(mock://a,mock://b)?startupSync=true&initialReconnectDelay=1");
    h.transport.start().await.unwrap();
    for command in session_state() {
        h.transport.oneway(command).await.unwrap();
    }
    assert_eq!(h.transport.tracked_command_count(), 3);

    h.network.set_available("a", false);
    h.network.fail_connections("a");
    h.transport.oneway(message(4)).await.unwrap();

    assert_eq!(h.transport.connected_uri().unwrap().as_str(), "mock://b");
    assert_eq!(ids(&h.network.received("b")), vec![1, 2, 3, 4]);
    assert_eq!(h.transport.failover_metrics().replayed_commands, 3);

    let listener = Arc::clone(&h.listener);
    eventually("interruption and resumption", || {
        let listener = Arc::clone(&listener);
        async move {
            listener.interrupted.load(Ordering::SeqCst) == 1
                && listener.resumed.load(Ordering::SeqCst) == 2
        }
    })
    .await;
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_failure_during_replay_moves_to_next_uri() {
    let h = harness(
        "failover:(mock://a,mock://b?failOnSendMessage=true&numSentMessageBeforeFail=1,mock://c)?startupSync=true&initialReconnectDelay=1",
    );
    h.transport.start().await.unwrap();
    for command in session_state() {
        h.transport.oneway(command).await.unwrap();
    }

    h.network.set_available("a", false);
    h.network.fail_connections("a");
    h.transport.oneway(message(9)).await.unwrap();

    assert_eq!(h.transport.connected_uri().unwrap().as_str(), "mock://c");
    assert_eq!(ids(&h.network.received("b")), vec![1]);
    assert_eq!(ids(&h.network.received("c")), vec![1, 2, 3, 9]);
    assert_eq!(h.network.create_count("b"), 1);
    assert_eq!(h.network.active_connections("b"), 0);
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_cached_messages_are_replayed() {
    let h = harness(
        "failover:(mock://a,mock://b)?startupSync=true&trackMessages=true&maxCacheSize=2&initialReconnectDelay=1",
    );
    h.transport.start().await.unwrap();
    for id in 1..=3 {
        h.transport.oneway(message(id)).await.unwrap();
    }

    h.network.set_available("a", false);
    h.network.fail_connections("a");
    h.transport.oneway(message(4)).await.unwrap();

    assert_eq!(ids(&h.network.received("b")), vec![2, 3, 4]);
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_exact_number_of_attempts() {
    for retries in [0_u64, 1, 3] {
        let h = harness(&format!(
            "failover:(mock://a?failOnCreate=true)?maxReconnectAttempts={retries}&initialReconnectDelay=1"
        ));
        h.transport.start().await.unwrap();

        let err = h.transport.oneway(message(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::ReconnectExhausted { .. }));
        assert_eq!(h.network.create_count("a"), retries + 1, "maxReconnectAttempts={retries}");
        assert_eq!(h.transport.failover_metrics().connect_failures, retries + 1);
    }
}

#[tokio::test]
async fn test_startup_limit_applies_before_first_connection() {
    let h = harness(
        "failover:(mock://a?failOnCreate=true)?maxReconnectAttempts=5&startupMaxReconnectAttempts=0",
    );
    h.transport.start().await.unwrap();
    assert!(h.transport.oneway(message(1)).await.is_err());
    assert_eq!(h.network.create_count("a"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_grow_exponentially() {
    let h = harness(
        "failover:(mock://a?failOnCreate=true)?maxReconnectAttempts=3&initialReconnectDelay=100&backOffMultiplier=2&maxReconnectDelay=10000",
    );
    let started = tokio::time::Instant::now();
    h.transport.start().await.unwrap();
    assert!(h.transport.oneway(message(1)).await.is_err());

    // 100 + 200 + 400
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delay_is_capped() {
    let h = harness(
        "failover:(mock://a?failOnCreate=true)?maxReconnectAttempts=4&initialReconnectDelay=100&backOffMultiplier=3&maxReconnectDelay=500",
    );
    let started = tokio::time::Instant::now();
    h.transport.start().await.unwrap();
    assert!(h.transport.oneway(message(1)).await.is_err());

    // 100 + 300 + 500 + 500
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1400), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn test_fails_back_to_priority_uri() {
    let network = MockNetwork::new();
    network.set_available("a", false);
    let h = harness_on(
        network,
        "failover:(mock://a,mock://b)?priorityBackup=true&backupPollInterval=50&initialReconnectDelay=1&startupSync=true",
    );
    h.transport.start().await.unwrap();
    assert_eq!(h.transport.connected_uri().unwrap().as_str(), "mock://b");

    h.network.set_available("a", true);
    let transport = Arc::clone(&h.transport);
    eventually("failback to a", || {
        let transport = Arc::clone(&transport);
        async move { transport.connected_uri().is_some_and(|uri| uri.as_str() == "mock://a") }
    })
    .await;

    let network = Arc::clone(&h.network);
    eventually("b released", || {
        let network = Arc::clone(&network);
        async move { network.active_connections("b") == 0 }
    })
    .await;
    h.transport.oneway(message(1)).await.unwrap();
    assert_eq!(ids(&h.network.received("a")), vec![1]);
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_backup_is_promoted_without_new_connect() {
    let h = harness("failover:(mock://a,mock://b)?backup=true&backupPollInterval=20&startupSync=true");
    h.transport.start().await.unwrap();

    let transport = Arc::clone(&h.transport);
    eventually("backup started", || {
        let transport = Arc::clone(&transport);
        async move { transport.backup_count() == 1 }
    })
    .await;
    assert_eq!(h.network.create_count("b"), 1);

    h.network.set_available("a", false);
    h.network.fail_connections("a");
    h.transport.oneway(message(1)).await.unwrap();

    assert_eq!(h.transport.connected_uri().unwrap().as_str(), "mock://b");
    assert_eq!(h.network.create_count("b"), 1);
    let transport = Arc::clone(&h.transport);
    eventually("promotion counted", || {
        let transport = Arc::clone(&transport);
        async move { transport.failover_metrics().backups_promoted == 1 }
    })
    .await;
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_priority_failback_with_full_backup_pool() {
    let network = MockNetwork::new();
    network.set_available("a", false);
    let h = harness_on(
        network,
        "failover:(mock://a,mock://b,mock://c)?priorityBackup=true&backup=true&backupPoolSize=1&backupPollInterval=20&initialReconnectDelay=1&startupSync=true",
    );
    h.transport.start().await.unwrap();
    assert_eq!(h.transport.connected_uri().unwrap().as_str(), "mock://b");

    let transport = Arc::clone(&h.transport);
    eventually("backup to c", || {
        let transport = Arc::clone(&transport);
        async move { transport.backup_count() == 1 }
    })
    .await;
    assert_eq!(h.network.active_connections("c"), 1);

    h.network.set_available("a", true);
    let transport = Arc::clone(&h.transport);
    eventually("failback to a", || {
        let transport = Arc::clone(&transport);
        async move { transport.connected_uri().is_some_and(|uri| uri.as_str() == "mock://a") }
    })
    .await;

    let network = Arc::clone(&h.network);
    eventually("b released", || {
        let network = Arc::clone(&network);
        async move { network.active_connections("b") == 0 }
    })
    .await;
    assert_eq!(h.transport.backup_count(), 1);
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_broker_reconnect_target_wins_over_backup() {
    let h = harness("failover:(mock://a,mock://c)?backup=true&backupPollInterval=20&startupSync=true");
    h.transport.start().await.unwrap();

    let transport = Arc::clone(&h.transport);
    eventually("backup to c", || {
        let transport = Arc::clone(&transport);
        async move { transport.backup_count() == 1 }
    })
    .await;

    h.network.inject(
        "a",
        control(ConnectionControl {
            reconnect_to: Some("mock://b".into()),
            ..ConnectionControl::default()
        }),
    );
    let transport = Arc::clone(&h.transport);
    eventually("reconnect to b", || {
        let transport = Arc::clone(&transport);
        async move { transport.connected_uri().is_some_and(|uri| uri.as_str() == "mock://b") }
    })
    .await;
    assert_eq!(h.network.create_count("b"), 1);
    assert_eq!(h.transport.failover_metrics().backups_promoted, 0);
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_application_reconnect_target_promotes_matching_backup() {
    let h = harness("failover:(mock://a,mock://b)?backup=true&backupPollInterval=20&startupSync=true");
    h.transport.start().await.unwrap();

    let transport = Arc::clone(&h.transport);
    eventually("backup to b", || {
        let transport = Arc::clone(&transport);
        async move { transport.backup_count() == 1 }
    })
    .await;

    h.transport.reconnect_to(Url::parse("mock://b").unwrap()).unwrap();
    let transport = Arc::clone(&h.transport);
    eventually("moved to b", || {
        let transport = Arc::clone(&transport);
        async move {
            transport.connected_uri().is_some_and(|uri| uri.as_str() == "mock://b")
                && transport.failover_metrics().backups_promoted == 1
        }
    })
    .await;
    assert_eq!(h.network.create_count("b"), 1);
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_dropping_transport_closes_children() {
    let h = harness("failover:(mock://a,mock://b)?backup=true&backupPollInterval=20&startupSync=true");
    h.transport.start().await.unwrap();

    let transport = Arc::clone(&h.transport);
    eventually("backup to b", || {
        let transport = Arc::clone(&transport);
        async move { transport.backup_count() == 1 }
    })
    .await;

    let Harness {
        network, transport, ..
    } = h;
    drop(transport);

    eventually("children stopped", || {
        let network = Arc::clone(&network);
        async move { network.active_connections("a") == 0 && network.active_connections("b") == 0 }
    })
    .await;
}

#[tokio::test]
async fn test_request_is_correlated() {
    let h = harness("failover:(mock://a)?startupSync=true");
    h.transport.start().await.unwrap();

    let response = h
        .transport
        .request(message(42), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(response.correlation_id(), Some(42));
    assert!(h.listener.commands.lock().is_empty());
    assert_eq!(h.transport.tracked_command_count(), 0);
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_exception_response_becomes_error() {
    let h = harness("failover:(mock://a?autoRespond=false)?startupSync=true");
    h.transport.start().await.unwrap();

    let transport = Arc::clone(&h.transport);
    let pending = tokio::spawn(async move { transport.request(message(7), None).await });

    let network = Arc::clone(&h.network);
    eventually("request delivery", || {
        let network = Arc::clone(&network);
        async move { !network.received("a").is_empty() }
    })
    .await;
    h.network.inject(
        "a",
        Command::new(
            0,
            CommandKind::ExceptionResponse {
                correlation_id: 7,
                message: "queue full".into(),
            },
        ),
    );

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, TransportError::RemoteException("queue full".into()));
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_request_times_out() {
    let h = harness("failover:(mock://a?autoRespond=false)?startupSync=true");
    h.transport.start().await.unwrap();

    let err = h
        .transport
        .request(message(9), Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::RequestTimeout { command_id: 9, .. }));
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_wakes_blocked_callers() {
    let network = MockNetwork::new();
    network.set_available("a", false);
    let h = harness_on(network, "failover:(mock://a)?initialReconnectDelay=1&maxReconnectDelay=10");
    h.transport.start().await.unwrap();

    let transport = Arc::clone(&h.transport);
    let blocked = tokio::spawn(async move { transport.oneway(message(1)).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!blocked.is_finished());

    h.transport.stop().await.unwrap();
    let err = blocked.await.unwrap().unwrap_err();
    assert!(err.is_closed());
    assert!(h.transport.is_closed());
    assert!(h.transport.oneway(message(2)).await.unwrap_err().is_closed());
}

#[tokio::test]
async fn test_stop_wakes_pending_requests() {
    let h = harness("failover:(mock://a?autoRespond=false)?startupSync=true");
    h.transport.start().await.unwrap();

    let transport = Arc::clone(&h.transport);
    let pending = tokio::spawn(async move { transport.request(message(5), None).await });
    let network = Arc::clone(&h.network);
    eventually("request delivery", || {
        let network = Arc::clone(&network);
        async move { !network.received("a").is_empty() }
    })
    .await;

    h.transport.stop().await.unwrap();
    assert!(pending.await.unwrap().unwrap_err().is_closed());
    assert_eq!(h.network.active_connections("a"), 0);
}

#[tokio::test]
async fn test_zero_timeout_fails_fast() {
    let network = MockNetwork::new();
    network.set_available("a", false);
    let h = harness_on(network, "failover:(mock://a)?timeout=0");
    h.transport.start().await.unwrap();

    let err = h.transport.oneway(message(1)).await.unwrap_err();
    assert_eq!(err, TransportError::FailoverTimeout(Duration::ZERO));
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_bounded_timeout_expires() {
    let network = MockNetwork::new();
    network.set_available("a", false);
    let h = harness_on(network, "failover:(mock://a)?timeout=50");
    h.transport.start().await.unwrap();

    let err = h.transport.oneway(message(1)).await.unwrap_err();
    assert!(matches!(err, TransportError::FailoverTimeout(_)));
    assert!(!h.transport.is_failed());
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_removal_while_disconnected_is_not_replayed() {
    let h = harness("failover:(mock://a)?startupSync=true&initialReconnectDelay=1&maxReconnectDelay=20");
    h.transport.start().await.unwrap();
    for command in session_state() {
        h.transport.oneway(command).await.unwrap();
    }

    h.network.set_available("a", false);
    h.network.fail_connections("a");
    let transport = Arc::clone(&h.transport);
    eventually("disconnect", || {
        let transport = Arc::clone(&transport);
        async move { !transport.is_connected() }
    })
    .await;

    let removal = Command::new(
        10,
        CommandKind::RemoveInfo {
            object_id: "c1".into(),
        },
    );
    let response = h.transport.request(removal, None).await.unwrap();
    assert_eq!(response.correlation_id(), Some(10));
    assert_eq!(h.transport.tracked_command_count(), 0);

    h.network.clear_received("a");
    h.network.set_available("a", true);
    h.transport.oneway(message(11)).await.unwrap();
    assert_eq!(ids(&h.network.received("a")), vec![11]);
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_broker_requested_reconnect() {
    let h = harness("failover:(mock://a)?startupSync=true");
    h.transport.start().await.unwrap();

    h.network.inject(
        "a",
        control(ConnectionControl {
            reconnect_to: Some("mock://b".into()),
            ..ConnectionControl::default()
        }),
    );
    let transport = Arc::clone(&h.transport);
    eventually("reconnect to b", || {
        let transport = Arc::clone(&transport);
        async move { transport.connected_uri().is_some_and(|uri| uri.as_str() == "mock://b") }
    })
    .await;
    assert_eq!(h.network.active_connections("a"), 0);
    assert!(h.listener.commands.lock().is_empty());
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_broker_updates_uri_list() {
    let h = harness("failover:(mock://a)?startupSync=true");
    h.transport.start().await.unwrap();

    h.network.inject(
        "a",
        control(ConnectionControl {
            connected_brokers: vec!["mock://c".into(), "mock://d".into()],
            ..ConnectionControl::default()
        }),
    );
    let transport = Arc::clone(&h.transport);
    eventually("updated candidates", || {
        let transport = Arc::clone(&transport);
        async move { transport.candidate_uris().len() == 2 }
    })
    .await;
    let candidates: Vec<String> = h.transport.candidate_uris().iter().map(Url::to_string).collect();
    assert_eq!(candidates, vec!["mock://c", "mock://d"]);
    assert_eq!(h.transport.connected_uri().unwrap().as_str(), "mock://a");
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_broker_requested_rebalance() {
    let h = harness("failover:(mock://a)?startupSync=true");
    h.transport.start().await.unwrap();

    h.network.inject(
        "a",
        control(ConnectionControl {
            connected_brokers: vec!["mock://b".into(), "mock://a".into()],
            rebalance: true,
            ..ConnectionControl::default()
        }),
    );
    let transport = Arc::clone(&h.transport);
    eventually("rebalanced onto b", || {
        let transport = Arc::clone(&transport);
        async move { transport.connected_uri().is_some_and(|uri| uri.as_str() == "mock://b") }
    })
    .await;
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_control_ignored_when_unsupported() {
    let h = harness("failover:(mock://a)?startupSync=true&reconnectSupported=false");
    h.transport.start().await.unwrap();

    h.network.inject(
        "a",
        control(ConnectionControl {
            reconnect_to: Some("mock://b".into()),
            ..ConnectionControl::default()
        }),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.connected_uri().unwrap().as_str(), "mock://a");
    assert_eq!(h.network.create_count("b"), 0);
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_application_reconnect_to() {
    let h = harness("failover:(mock://a,mock://b)?startupSync=true");
    h.transport.start().await.unwrap();
    h.transport.oneway(session_state().remove(0)).await.unwrap();

    h.transport.reconnect_to(Url::parse("mock://b").unwrap()).unwrap();
    h.transport.oneway(message(2)).await.unwrap();

    let transport = Arc::clone(&h.transport);
    eventually("moved to b", || {
        let transport = Arc::clone(&transport);
        async move { transport.connected_uri().is_some_and(|uri| uri.as_str() == "mock://b") }
    })
    .await;
    let received_b = ids(&h.network.received("b"));
    assert_eq!(received_b.first(), Some(&1));
    h.transport.stop().await.unwrap();
}

#[tokio::test]
async fn test_inbound_commands_reach_listener() {
    let h = harness("failover:(mock://a)?startupSync=true");
    h.transport.start().await.unwrap();

    h.network.inject("a", message(77));
    let listener = Arc::clone(&h.listener);
    eventually("inbound message", || {
        let listener = Arc::clone(&listener);
        async move { listener.commands.lock().len() == 1 }
    })
    .await;
    assert_eq!(h.listener.commands.lock()[0].command_id, 77);
    assert_eq!(h.transport.failover_metrics().commands_received, 1);
    h.transport.stop().await.unwrap();
}
