use energy_agent::backend::MeasurementPush;
use energy_agent::config::NetworkConfig;
use energy_agent::connectivity::{ConnectivityManager, SimulatedRadio};
use energy_agent::domain::{
    DeviceIdentity, InboundEvent, Measurement, SkipReason, StreamMessage, SyncOutcome,
};
use energy_agent::meter::MeasurementSource;
use energy_agent::realtime::RealtimeSync;
use energy_agent::status::AgentCommand;
use energy_agent::storage::{EnergyAccumulator, KeyValueStore, MemoryStore};
use energy_agent::{AgentError, AgentSettings, Result, TelemetryAgent};

use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

// ==============================================================================
// fakes
// ==============================================================================

#[derive(Clone, Default)]
struct FakePush {
    totals: Arc<Mutex<Vec<f64>>>,
    pushed_at: Arc<Mutex<Vec<Instant>>>,
    fail: bool,
}

impl MeasurementPush for FakePush {
    async fn send(
        &self,
        _device: &DeviceIdentity,
        _voltage: f64,
        _current: f64,
        _power: f64,
        energy_total: f64,
    ) -> SyncOutcome {
        self.totals.lock().unwrap().push(energy_total);
        self.pushed_at.lock().unwrap().push(Instant::now());
        if self.fail {
            SyncOutcome::TransportError { code: None, reason: "connection refused".into() }
        } else {
            SyncOutcome::Success { status: Some(200) }
        }
    }
}

#[derive(Default)]
struct RealtimeLog {
    begins: u32,
    listens: u32,
    shutdowns: u32,
    totals: Vec<f64>,
}

#[derive(Clone, Default)]
struct FakeRealtime {
    log: Arc<Mutex<RealtimeLog>>,
    fail: bool,
    /// sign-in hangs this long and then fails
    broken_auth: Option<Duration>,
}

impl RealtimeSync for FakeRealtime {
    async fn begin(&mut self) -> Result<()> {
        self.log.lock().unwrap().begins += 1;
        if let Some(hang) = self.broken_auth {
            tokio::time::sleep(hang).await;
            return Err(AgentError::Auth("sign-in timed out".into()));
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.log.lock().unwrap().shutdowns += 1;
    }

    async fn send_realtime(
        &mut self,
        _voltage: f64,
        _current: f64,
        _power: f64,
        energy_total: f64,
    ) -> SyncOutcome {
        self.log.lock().unwrap().totals.push(energy_total);
        if self.fail {
            SyncOutcome::TransportError { code: Some(401), reason: "Permission denied".into() }
        } else {
            SyncOutcome::Success { status: Some(200) }
        }
    }

    async fn listen_for_events(&mut self) -> Result<()> {
        self.log.lock().unwrap().listens += 1;
        Ok(())
    }
}

struct ConstantMeter(Measurement);

impl MeasurementSource for ConstantMeter {
    fn next_measurement(&mut self) -> Measurement {
        self.0
    }
}

// ==============================================================================
// helpers
// ==============================================================================

type TestAgent = TelemetryAgent<SimulatedRadio, MemoryStore, FakePush, FakeRealtime>;

fn settings() -> AgentSettings {
    AgentSettings {
        tick_interval: Duration::from_secs(1),
        save_interval_ticks: 10,
        realtime_enabled: true,
        realtime_retry_interval: Duration::from_secs(5),
        show_measurements: false,
    }
}

fn build(
    radio: SimulatedRadio,
    store: MemoryStore,
    push: FakePush,
    realtime: FakeRealtime,
    settings: AgentSettings,
) -> TestAgent {
    let network = NetworkConfig {
        ssid: "plant-wifi".into(),
        password: "secret".into(),
        connect_timeout_ms: 1_000,
        poll_interval_ms: 500,
        retry_interval_ms: 5_000,
        ..Default::default()
    };
    TelemetryAgent::new(
        DeviceIdentity::new("dev1"),
        ConnectivityManager::new(radio, &network),
        EnergyAccumulator::new(store, "energyData", "energy_generated"),
        push,
        realtime,
        settings,
        Instant::now(),
    )
}

fn sample(delta: f64) -> Measurement {
    Measurement { voltage: 230.0, current: 1.0, power: 230.0, energy_delta: delta }
}

fn online() -> SimulatedRadio {
    SimulatedRadio::new(true, Duration::ZERO)
}

// ==============================================================================
// sink independence
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn primary_failure_does_not_suppress_realtime() {
    let push = FakePush { fail: true, ..Default::default() };
    let realtime = FakeRealtime::default();
    let log = realtime.log.clone();
    let mut agent = build(online(), MemoryStore::new(), push.clone(), realtime, settings());

    agent.start().await;
    let report = agent.tick(sample(0.5)).await;

    assert!(matches!(report.primary, SyncOutcome::TransportError { code: None, .. }));
    assert_eq!(report.realtime, SyncOutcome::Success { status: Some(200) });
    assert_eq!(*push.totals.lock().unwrap(), vec![0.5]);
    assert_eq!(log.lock().unwrap().totals, vec![0.5]);
}

#[tokio::test(start_paused = true)]
async fn realtime_failure_does_not_suppress_primary() {
    let push = FakePush::default();
    let realtime = FakeRealtime { fail: true, ..Default::default() };
    let log = realtime.log.clone();
    let mut agent = build(online(), MemoryStore::new(), push.clone(), realtime, settings());

    agent.start().await;
    for _ in 0..3 {
        let report = agent.tick(sample(0.5)).await;
        assert_eq!(report.primary, SyncOutcome::Success { status: Some(200) });
        assert_eq!(
            report.realtime,
            SyncOutcome::TransportError { code: Some(401), reason: "Permission denied".into() }
        );
    }
    assert_eq!(*push.totals.lock().unwrap(), vec![0.5, 1.0, 1.5]);
    assert_eq!(log.lock().unwrap().totals.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn both_sinks_see_the_same_total() {
    let push = FakePush::default();
    let realtime = FakeRealtime::default();
    let log = realtime.log.clone();
    let mut agent = build(online(), MemoryStore::new(), push.clone(), realtime, settings());

    agent.start().await;
    agent.tick(sample(0.25)).await;
    agent.tick(sample(0.25)).await;
    assert_eq!(*push.totals.lock().unwrap(), log.lock().unwrap().totals);
}

#[tokio::test(start_paused = true)]
async fn realtime_auth_outage_does_not_delay_primary() {
    let push = FakePush::default();
    let realtime = FakeRealtime { broken_auth: Some(Duration::from_secs(10)), ..Default::default() };
    let log = realtime.log.clone();
    let mut agent = build(online(), MemoryStore::new(), push.clone(), realtime, settings());

    agent.start().await;
    let window = Instant::now();
    let mut tick_starts = Vec::new();
    while window.elapsed() < Duration::from_secs(40) {
        tick_starts.push(Instant::now());
        let report = agent.tick(sample(0.1)).await;
        assert!(report.primary.is_success());
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    // every push goes out the moment its tick starts
    assert_eq!(*push.pushed_at.lock().unwrap(), tick_starts);
    // failed sign-ins are spaced by the retry interval plus the hang itself
    let begins = log.lock().unwrap().begins;
    assert!(begins >= 2, "sign-in never retried");
    assert!(begins <= 4, "{} sign-in attempts", begins);
}

#[tokio::test(start_paused = true)]
async fn failed_sign_in_is_retried_after_retry_interval() {
    let realtime = FakeRealtime { broken_auth: Some(Duration::ZERO), ..Default::default() };
    let log = realtime.log.clone();
    let mut agent = build(online(), MemoryStore::new(), FakePush::default(), realtime, settings());

    agent.start().await;
    for _ in 0..4 {
        tokio::time::advance(Duration::from_secs(1)).await;
        let report = agent.tick(sample(0.1)).await;
        assert!(report.primary.is_success());
    }
    assert_eq!(log.lock().unwrap().begins, 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    agent.tick(sample(0.1)).await;
    assert_eq!(log.lock().unwrap().begins, 2);
}

// ==============================================================================
// tick policy
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn offline_ticks_skip_sync_but_keep_counting() {
    let push = FakePush::default();
    let realtime = FakeRealtime::default();
    let log = realtime.log.clone();
    let radio = SimulatedRadio::new(false, Duration::ZERO);
    let mut agent = build(radio, MemoryStore::new(), push.clone(), realtime, settings());

    agent.start().await;
    let report = agent.tick(sample(0.5)).await;

    assert!(!report.connected);
    assert_eq!(report.primary, SyncOutcome::skipped(SkipReason::Offline));
    assert_eq!(report.realtime, SyncOutcome::skipped(SkipReason::Offline));
    assert_eq!(report.total, 0.5);
    assert!(push.totals.lock().unwrap().is_empty());
    assert_eq!(log.lock().unwrap().begins, 0);
}

#[tokio::test(start_paused = true)]
async fn session_opens_once_link_comes_up() {
    let realtime = FakeRealtime::default();
    let log = realtime.log.clone();
    let radio = SimulatedRadio::new(false, Duration::ZERO);
    let mut agent = build(radio.clone(), MemoryStore::new(), FakePush::default(), realtime, settings());

    agent.start().await;
    radio.set_reachable(true);
    tokio::time::advance(Duration::from_secs(5)).await;
    let report = agent.tick(sample(0.5)).await;

    assert!(report.connected);
    assert!(report.primary.is_success());
    let log = log.lock().unwrap();
    assert_eq!(log.begins, 1);
    assert_eq!(log.listens, 1);
}

#[tokio::test(start_paused = true)]
async fn disabled_realtime_is_skipped_without_session() {
    let realtime = FakeRealtime::default();
    let log = realtime.log.clone();
    let settings = AgentSettings { realtime_enabled: false, ..settings() };
    let mut agent = build(online(), MemoryStore::new(), FakePush::default(), realtime, settings);

    agent.start().await;
    let report = agent.tick(sample(0.5)).await;
    assert!(report.primary.is_success());
    assert_eq!(report.realtime, SyncOutcome::skipped(SkipReason::NoSession));
    assert_eq!(log.lock().unwrap().begins, 0);
}

#[tokio::test(start_paused = true)]
async fn total_is_saved_every_tenth_tick() {
    let store = MemoryStore::new();
    let mut agent = build(online(), store.clone(), FakePush::default(), FakeRealtime::default(), settings());
    agent.start().await;

    let mut saved_on = Vec::new();
    for _ in 0..25 {
        let report = agent.tick(sample(0.5)).await;
        if report.saved {
            saved_on.push(report.tick);
        }
    }
    assert_eq!(saved_on, vec![10, 20]);
    assert_eq!(agent.total(), 12.5);

    // reboot: ticks 21..25 were never saved
    let mut rebooted = EnergyAccumulator::new(store, "energyData", "energy_generated");
    assert_eq!(rebooted.load(), 10.0);
}

#[tokio::test(start_paused = true)]
async fn resumes_from_stored_total() {
    let mut store = MemoryStore::new();
    store.put_f64("energyData", "energy_generated", 42.0).unwrap();
    let mut agent = build(online(), store, FakePush::default(), FakeRealtime::default(), settings());

    assert_eq!(agent.start().await, 42.0);
    let report = agent.tick(sample(0.5)).await;
    assert_eq!(report.total, 42.5);
}

#[tokio::test(start_paused = true)]
async fn invalid_deltas_are_ignored() {
    let mut agent = build(online(), MemoryStore::new(), FakePush::default(), FakeRealtime::default(), settings());
    agent.start().await;

    agent.tick(sample(1.0)).await;
    agent.tick(sample(-3.0)).await;
    agent.tick(sample(f64::NAN)).await;
    agent.tick(sample(f64::INFINITY)).await;
    let report = agent.tick(sample(0.5)).await;

    assert_eq!(report.total, 1.5);
    assert_eq!(report.tick, 5);
}

#[tokio::test(start_paused = true)]
async fn clear_command_resets_total_and_store() {
    let store = MemoryStore::new();
    let mut agent = build(online(), store.clone(), FakePush::default(), FakeRealtime::default(), settings());
    agent.start().await;
    for _ in 0..10 {
        agent.tick(sample(1.0)).await;
    }
    assert_eq!(agent.status().read().await.last_saved_kwh, Some(10.0));

    agent.handle_command(AgentCommand::ClearEnergy).await;
    assert_eq!(agent.total(), 0.0);
    assert_eq!(agent.status().read().await.energy_total_kwh, 0.0);

    let mut rebooted = EnergyAccumulator::new(store, "energyData", "energy_generated");
    assert_eq!(rebooted.load(), 0.0);

    let report = agent.tick(sample(0.5)).await;
    assert_eq!(report.total, 0.5);
}

#[tokio::test(start_paused = true)]
async fn zero_intervals_are_clamped_instead_of_panicking() {
    let store = MemoryStore::new();
    let settings = AgentSettings {
        tick_interval: Duration::ZERO,
        save_interval_ticks: 0,
        ..settings()
    };
    let mut agent = build(online(), store.clone(), FakePush::default(), FakeRealtime::default(), settings);
    agent.start().await;

    let report = agent.tick(sample(0.5)).await;
    assert!(report.saved);

    let mut meter = ConstantMeter(sample(0.5));
    let shutdown = tokio::time::sleep(Duration::from_millis(5));
    agent.run(&mut meter, None, None, shutdown).await.unwrap();
    assert!(agent.ticks() > 1);
}

// ==============================================================================
// inbound stream
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn timeout_rearms_subscription() {
    let realtime = FakeRealtime::default();
    let log = realtime.log.clone();
    let mut agent = build(online(), MemoryStore::new(), FakePush::default(), realtime, settings());
    agent.start().await;
    assert_eq!(log.lock().unwrap().listens, 1);

    agent.handle_stream(StreamMessage::Timeout).await;
    agent.handle_stream(StreamMessage::Timeout).await;

    assert_eq!(log.lock().unwrap().listens, 3);
    assert_eq!(log.lock().unwrap().begins, 1);
    assert_eq!(agent.status().read().await.stream_resubscribes, 3);
}

#[tokio::test(start_paused = true)]
async fn revoked_auth_signs_in_again_on_next_tick() {
    let realtime = FakeRealtime::default();
    let log = realtime.log.clone();
    let mut agent = build(online(), MemoryStore::new(), FakePush::default(), realtime, settings());
    agent.start().await;

    agent.handle_stream(StreamMessage::Closed("auth_revoked".into())).await;
    agent.tick(sample(0.1)).await;

    let log = log.lock().unwrap();
    assert_eq!(log.begins, 2);
    assert_eq!(log.listens, 2);
}

#[tokio::test(start_paused = true)]
async fn refused_stream_is_reopened_after_retry_interval() {
    let realtime = FakeRealtime::default();
    let log = realtime.log.clone();
    let mut agent = build(online(), MemoryStore::new(), FakePush::default(), realtime, settings());
    agent.start().await;

    agent.handle_stream(StreamMessage::Closed("Permission denied".into())).await;
    for _ in 0..4 {
        tokio::time::advance(Duration::from_secs(1)).await;
        agent.tick(sample(0.1)).await;
    }
    assert_eq!(log.lock().unwrap().listens, 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    agent.tick(sample(0.1)).await;
    assert_eq!(log.lock().unwrap().listens, 2);
    assert_eq!(log.lock().unwrap().begins, 1);
}

#[tokio::test(start_paused = true)]
async fn events_are_recorded_in_status() {
    let mut agent = build(online(), MemoryStore::new(), FakePush::default(), FakeRealtime::default(), settings());
    agent.start().await;

    let event = InboundEvent {
        event_type: "put".into(),
        data: r#"{"path":"/","data":{"sender":"grid","receiver":"dev1","energy_units":2,"rate_per_unit":"0.5"}}"#.into(),
    };
    agent.handle_stream(StreamMessage::Event(event.clone())).await;
    assert_eq!(agent.status().read().await.last_event, Some(event));
}

// ==============================================================================
// run loop
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn run_ticks_until_shutdown_then_flushes() {
    let store = MemoryStore::new();
    let realtime = FakeRealtime::default();
    let log = realtime.log.clone();
    let mut agent = build(online(), store.clone(), FakePush::default(), realtime, settings());
    agent.start().await;

    let mut meter = ConstantMeter(sample(0.5));
    let shutdown = tokio::time::sleep(Duration::from_millis(3_500));
    agent.run(&mut meter, None, None, shutdown).await.unwrap();

    // ticks at 0s, 1s, 2s and 3s
    assert_eq!(agent.ticks(), 4);
    assert_eq!(agent.total(), 2.0);
    let mut rebooted = EnergyAccumulator::new(store, "energyData", "energy_generated");
    assert_eq!(rebooted.load(), 2.0);
    assert_eq!(log.lock().unwrap().shutdowns, 1);
}

#[tokio::test(start_paused = true)]
async fn run_drains_events_and_commands() {
    let realtime = FakeRealtime::default();
    let log = realtime.log.clone();
    let mut agent = build(online(), MemoryStore::new(), FakePush::default(), realtime, settings());
    agent.start().await;

    let (event_tx, event_rx) = mpsc::channel(4);
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    event_tx.send(StreamMessage::Timeout).await.unwrap();
    cmd_tx.send(AgentCommand::ClearEnergy).await.unwrap();
    drop(event_tx);
    drop(cmd_tx);

    let mut meter = ConstantMeter(sample(0.5));
    let shutdown = tokio::time::sleep(Duration::from_millis(1_500));
    agent.run(&mut meter, Some(event_rx), Some(cmd_rx), shutdown).await.unwrap();

    assert_eq!(log.lock().unwrap().listens, 2);
    assert_eq!(agent.ticks(), 2);
}
