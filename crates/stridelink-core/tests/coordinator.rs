//! End-to-end coordinator behavior against the scripted transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use stridelink_core::{
    Coordinator, CoordinatorConfig, DualState, FakePeripheral, FakeTransport, ScanMode,
    MEASURE_COMMAND, RESET_COMMAND, START_COMMAND, STOP_COMMAND,
};

const LEFT: &str = "ESP32-S3 BLE left shoes";
const RIGHT: &str = "ESP32-S3 BLE right shoes";

fn test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.scan_timeout_ms = 100;
    config.sequential_grace_ms = 20;
    config.command_interval_ms = 20;
    config
}

fn transport_with_both(config: &CoordinatorConfig) -> FakeTransport {
    let transport = FakeTransport::new();
    transport.add_peripheral(FakePeripheral::matching(&config.left));
    transport.add_peripheral(FakePeripheral::matching(&config.right));
    transport
}

async fn wait_for(
    rx: &mut watch::Receiver<DualState>,
    what: &str,
    predicate: impl Fn(&DualState) -> bool,
) -> DualState {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            {
                let state = rx.borrow();
                if predicate(&state) {
                    return state.clone();
                }
            }
            rx.changed().await.expect("coordinator state channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

fn count_payload(writes: &[Vec<u8>], payload: &[u8]) -> usize {
    writes.iter().filter(|w| w.as_slice() == payload).count()
}

#[tokio::test]
async fn both_roles_reach_ready_on_first_attempt() {
    let config = test_config();
    let transport = transport_with_both(&config);
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    let state = wait_for(&mut states, "both ready", DualState::both_connected).await;

    assert!(state.measuring);
    assert!(state.failure.is_none());
    assert_eq!(transport.scan_start_count(), 1);
    assert_eq!(count_payload(&transport.writes_for(LEFT), START_COMMAND), 1);
    assert_eq!(count_payload(&transport.writes_for(RIGHT), START_COMMAND), 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn unmatched_advertised_names_are_ignored() {
    let config = test_config();
    let transport = transport_with_both(&config);
    // Close-but-not-exact names never match.
    transport.add_peripheral(FakePeripheral::new(
        "ESP32-S3 BLE left",
        config.left.service,
        vec![config.left.notify],
    ));
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    wait_for(&mut states, "both ready", DualState::both_connected).await;

    assert!(transport.writes_for("ESP32-S3 BLE left").is_empty());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn retries_until_the_missing_role_appears() {
    let config = test_config();
    let transport = transport_with_both(&config);
    transport.set_advertising(RIGHT, false);
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    // Let the first attempt elapse, then bring the right shoe up.
    tokio::time::sleep(Duration::from_millis(150)).await;
    transport.set_advertising(RIGHT, true);

    let state = wait_for(&mut states, "both ready", DualState::both_connected).await;
    assert!(state.failure.is_none());
    assert!(
        transport.scan_start_count() >= 2,
        "a retry scan must have started"
    );
    coordinator.shutdown().await;
}

#[tokio::test]
async fn budget_exhaustion_is_terminal() {
    let config = test_config();
    let transport = transport_with_both(&config);
    transport.set_advertising(RIGHT, false);
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    let state = wait_for(&mut states, "terminal failure", |s| s.failure.is_some()).await;

    assert!(!state.measuring);
    assert!(state.failure.as_deref().unwrap().contains("3 scan attempts"));
    assert_eq!(transport.scan_start_count(), 3);
    // The connected left session was torn down gracefully. Teardown runs
    // on the session's driver task; give it a moment to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count_payload(&transport.writes_for(LEFT), STOP_COMMAND), 1);

    // Terminal means terminal: no fourth attempt on its own.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.scan_start_count(), 3);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn explicit_restart_recovers_from_terminal_failure() {
    let config = test_config();
    let transport = transport_with_both(&config);
    transport.set_advertising(RIGHT, false);
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    wait_for(&mut states, "terminal failure", |s| s.failure.is_some()).await;

    transport.set_advertising(RIGHT, true);
    coordinator.start_measurement().await.unwrap();
    let state = wait_for(&mut states, "both ready", DualState::both_connected).await;

    assert!(state.measuring);
    assert!(state.failure.is_none(), "restart must clear the failure");
    coordinator.shutdown().await;
}

#[tokio::test]
async fn sequential_mode_connects_left_before_right() {
    let mut config = test_config();
    config.scan_mode = ScanMode::Sequential;
    let transport = transport_with_both(&config);
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    wait_for(&mut states, "both ready", DualState::both_connected).await;

    // Left completes its handshake (start write) strictly before right
    // begins; the recorded write order proves the staging.
    let writes = transport.writes();
    let left_start = writes
        .iter()
        .position(|w| w.peripheral == LEFT && w.payload == START_COMMAND)
        .expect("left start write");
    let right_start = writes
        .iter()
        .position(|w| w.peripheral == RIGHT && w.payload == START_COMMAND)
        .expect("right start write");
    assert!(left_start < right_start);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn frames_merge_additively_per_role() {
    let config = test_config();
    let transport = transport_with_both(&config);
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    wait_for(&mut states, "both ready", DualState::both_connected).await;

    transport.push_notification(LEFT, b"{\"roll\": 3.5}").await;
    wait_for(&mut states, "left roll", |s| s.left.frame.roll.is_some()).await;
    transport
        .push_notification(LEFT, b"{\"yaw_angle\": -12.0}")
        .await;
    let state = wait_for(&mut states, "left yaw", |s| {
        s.left.frame.yaw_angle.is_some()
    })
    .await;

    // The second frame omitted roll; the earlier value survives.
    assert_eq!(state.left.frame.roll, Some(3.5));
    assert_eq!(state.left.frame.yaw_angle, Some(-12.0));
    assert!(state.right.frame.is_empty());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn stop_tears_down_and_retains_last_values() {
    let config = test_config();
    let transport = transport_with_both(&config);
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    wait_for(&mut states, "both ready", DualState::both_connected).await;
    transport.push_notification(LEFT, b"{\"roll\": 7.25}").await;
    wait_for(&mut states, "left roll", |s| s.left.frame.roll.is_some()).await;

    coordinator.stop_measurement().await.unwrap();
    let state = wait_for(&mut states, "stopped", |s| {
        !s.measuring && !s.left.is_connected() && !s.right.is_connected()
    })
    .await;

    // Sensor values reflect hardware, not this session; they survive stop.
    assert_eq!(state.left.frame.roll, Some(7.25));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count_payload(&transport.writes_for(LEFT), STOP_COMMAND), 1);
    assert_eq!(count_payload(&transport.writes_for(RIGHT), STOP_COMMAND), 1);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn command_pump_polls_both_roles_until_stopped() {
    let mut config = test_config();
    config.command_pump = true;
    let transport = transport_with_both(&config);
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    wait_for(&mut states, "both ready", DualState::both_connected).await;

    tokio::time::sleep(Duration::from_millis(110)).await;
    assert!(count_payload(&transport.writes_for(LEFT), MEASURE_COMMAND) >= 2);
    assert!(count_payload(&transport.writes_for(RIGHT), MEASURE_COMMAND) >= 2);

    coordinator.stop_measurement().await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let after_stop = count_payload(&transport.writes_for(LEFT), MEASURE_COMMAND);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(
        count_payload(&transport.writes_for(LEFT), MEASURE_COMMAND),
        after_stop,
        "pump kept writing after stop"
    );
    coordinator.shutdown().await;
}

#[tokio::test]
async fn peer_disconnect_hits_only_that_role() {
    let config = test_config();
    let transport = transport_with_both(&config);
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    wait_for(&mut states, "both ready", DualState::both_connected).await;

    transport.drop_connection(LEFT, "supervision timeout").await;
    let state = wait_for(&mut states, "left disconnected", |s| {
        !s.left.is_connected()
    })
    .await;

    assert!(state.left.last_error.is_some());
    assert!(state.right.is_connected(), "right must be unaffected");
    assert!(state.measuring);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn reset_command_reaches_both_roles() {
    let config = test_config();
    let transport = transport_with_both(&config);
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    wait_for(&mut states, "both ready", DualState::both_connected).await;

    coordinator.reset_angles().await.unwrap();
    // Delivery runs on the session driver tasks.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count_payload(&transport.writes_for(LEFT), RESET_COMMAND), 1);
    assert_eq!(count_payload(&transport.writes_for(RIGHT), RESET_COMMAND), 1);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_never_break_the_session() {
    let config = test_config();
    let transport = transport_with_both(&config);
    let coordinator = Coordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut states = coordinator.subscribe();

    coordinator.start_measurement().await.unwrap();
    wait_for(&mut states, "both ready", DualState::both_connected).await;

    transport.push_notification(LEFT, b"{\"roll\": garbage}").await;
    transport.push_notification(LEFT, b"not json at all").await;
    transport.push_notification(LEFT, b"{\"roll\": 1.5}}}}").await;

    let state = wait_for(&mut states, "valid frame", |s| s.left.frame.roll.is_some()).await;
    assert_eq!(state.left.frame.roll, Some(1.5));
    assert!(state.left.is_connected());
    coordinator.shutdown().await;
}
