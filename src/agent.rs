//! ==============================================================================
//! agent.rs - telemetry orchestrator
//! ==============================================================================
//!
//! purpose:
//!     the integration point. every tick it folds the new sample into the
//!     running total, saves it on a fixed cadence, keeps wifi up, and fans the
//!     sample out to both sinks. between ticks it drains inbound stream events
//!     and local commands.
//!
//! tick policy:
//!     1. total += energy_delta (negative / non-finite deltas are dropped)
//!     2. every `save_interval_ticks` ticks: accumulator.save(total)
//!     3. connectivity.maintain()   (may suspend up to the connect timeout)
//!     4. if connected: primary.send() then realtime.send_realtime(), both
//!        always attempted; one failing never suppresses the other
//!
//! realtime upkeep:
//!     session sign-in and stream subscription happen after the primary push,
//!     so a realtime outage never delays it. a failed sign-in/subscribe, or a
//!     stream the server closed on us, is retried no sooner than
//!     `realtime_retry_interval` later. an idle-stream timeout re-arms at once.
//!
//! concurrency:
//!     single control flow. the stream listener runs as a task on the same
//!     current-thread runtime and only talks to us through a channel, so the
//!     accumulator, the running total and the radio are never touched from
//!     two places at once.
//!
//! ==============================================================================

use crate::backend::MeasurementPush;
use crate::config::AgentConfig;
use crate::connectivity::{ConnectivityManager, Radio};
use crate::domain::{
    ConnectivityState, DeviceIdentity, Measurement, SkipReason, StreamMessage, SyncOutcome,
};
use crate::error::Result;
use crate::meter::MeasurementSource;
use crate::realtime::RealtimeSync;
use crate::status::{AgentCommand, AgentStatus, SharedStatus};
use crate::storage::{EnergyAccumulator, KeyValueStore};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

// interval() panics on a zero period
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// knobs the orchestrator needs from the config
#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub tick_interval: Duration,
    pub save_interval_ticks: u64,
    pub realtime_enabled: bool,
    /// minimum gap between failed realtime sign-in / subscribe attempts
    pub realtime_retry_interval: Duration,
    pub show_measurements: bool,
}

impl AgentSettings {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(cfg.telemetry.tick_interval_ms),
            save_interval_ticks: cfg.telemetry.save_interval_ticks,
            realtime_enabled: cfg.realtime.enabled,
            realtime_retry_interval: cfg.network.retry_interval(),
            show_measurements: cfg.logging.show_measurements,
        }
        .sanitized()
    }

    /// clamp values the tick loop cannot run with
    pub fn sanitized(mut self) -> Self {
        if self.save_interval_ticks == 0 {
            warn!("save_interval_ticks of 0 clamped to 1");
            self.save_interval_ticks = 1;
        }
        if self.tick_interval < MIN_TICK_INTERVAL {
            warn!(interval_ms = self.tick_interval.as_millis() as u64, "tick interval clamped to 1ms");
            self.tick_interval = MIN_TICK_INTERVAL;
        }
        self
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// what happened during one tick
#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub total: f64,
    pub saved: bool,
    pub connected: bool,
    pub primary: SyncOutcome,
    pub realtime: SyncOutcome,
}

pub struct TelemetryAgent<R, S, P, D> {
    device: DeviceIdentity,
    connectivity: ConnectivityManager<R>,
    accumulator: EnergyAccumulator<S>,
    primary: P,
    realtime: D,
    settings: AgentSettings,
    total: f64,
    tick: u64,
    realtime_started: bool,
    resubscribe_pending: bool,
    /// no realtime sign-in / subscribe before this instant
    realtime_retry_at: Option<Instant>,
    status: SharedStatus,
    booted_at: Instant,
}

impl<R, S, P, D> TelemetryAgent<R, S, P, D>
where
    R: Radio,
    S: KeyValueStore,
    P: MeasurementPush,
    D: RealtimeSync,
{
    pub fn new(
        device: DeviceIdentity,
        connectivity: ConnectivityManager<R>,
        accumulator: EnergyAccumulator<S>,
        primary: P,
        realtime: D,
        settings: AgentSettings,
        booted_at: Instant,
    ) -> Self {
        let status = Arc::new(RwLock::new(AgentStatus::new(device.as_str())));
        Self {
            device,
            connectivity,
            accumulator,
            primary,
            realtime,
            settings: settings.sanitized(),
            total: 0.0,
            tick: 0,
            realtime_started: false,
            resubscribe_pending: false,
            realtime_retry_at: None,
            status,
            booted_at,
        }
    }

    /// handle for the status api
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn connectivity(&self) -> &ConnectivityManager<R> {
        &self.connectivity
    }

    pub fn realtime(&self) -> &D {
        &self.realtime
    }

    /// boot sequence: re-sync the total from storage, first wifi attempt,
    /// open the realtime session if we got a link
    pub async fn start(&mut self) -> f64 {
        self.total = self.accumulator.load();
        self.connectivity.connect().await;
        if self.connectivity.is_connected() {
            self.ensure_realtime().await;
        }
        self.publish(None).await;
        self.total
    }

    pub async fn tick(&mut self, m: Measurement) -> TickReport {
        self.tick += 1;

        if m.energy_delta.is_finite() && m.energy_delta >= 0.0 {
            self.total += m.energy_delta;
        } else {
            warn!(delta = m.energy_delta, "ignoring invalid energy delta");
        }
        if self.settings.show_measurements {
            info!(
                voltage = m.voltage,
                current = m.current,
                power = m.power,
                total_kwh = self.total,
                "[Meter] sample"
            );
        }

        let saved = if self.tick % self.settings.save_interval_ticks == 0 {
            self.save_total()
        } else {
            false
        };

        if self.connectivity.reconnect_due() {
            self.status.write().await.connectivity = ConnectivityState::Connecting;
        }
        self.connectivity.maintain().await;
        let connected = self.connectivity.is_connected();

        let (primary, realtime) = if connected {
            let primary = self
                .primary
                .send(&self.device, m.voltage, m.current, m.power, self.total)
                .await;
            self.ensure_realtime().await;
            let realtime = if self.settings.realtime_enabled {
                self.realtime
                    .send_realtime(m.voltage, m.current, m.power, self.total)
                    .await
            } else {
                SyncOutcome::skipped(SkipReason::NoSession)
            };
            (primary, realtime)
        } else {
            debug!("offline, skipping sync");
            (
                SyncOutcome::skipped(SkipReason::Offline),
                SyncOutcome::skipped(SkipReason::Offline),
            )
        };

        let report = TickReport {
            tick: self.tick,
            total: self.total,
            saved,
            connected,
            primary,
            realtime,
        };
        self.publish(Some(&report)).await;
        report
    }

    /// react to something the realtime listener delivered
    pub async fn handle_stream(&mut self, msg: StreamMessage) {
        match msg {
            StreamMessage::Event(event) => {
                info!(event = %event.event_type, data = %event.data, "[Stream] event");
                if let Some(tx) = event.transaction() {
                    info!(
                        sender = %tx.sender,
                        receiver = %tx.receiver,
                        energy_units = tx.energy_units,
                        total_cost = tx.total_cost(),
                        "[Stream] transaction command"
                    );
                }
                self.status.write().await.last_event = Some(event);
            }
            StreamMessage::Timeout => {
                info!("[Stream] re-arming subscription after timeout");
                self.resubscribe_pending = true;
                if self.connectivity.is_connected() {
                    self.ensure_realtime().await;
                }
            }
            StreamMessage::Closed(reason) => {
                warn!(%reason, "[Stream] subscription closed");
                if reason == "auth_revoked" {
                    // needs a fresh sign-in, not just a new stream
                    self.realtime_started = false;
                } else {
                    self.resubscribe_pending = true;
                    self.defer_realtime();
                }
            }
        }
    }

    pub async fn handle_command(&mut self, cmd: AgentCommand) {
        match cmd {
            AgentCommand::ClearEnergy => {
                if let Err(e) = self.clear_energy() {
                    warn!(error = %e, "clear failed");
                }
                self.publish(None).await;
            }
        }
    }

    /// wipe the durable total and restart counting from zero
    pub fn clear_energy(&mut self) -> Result<()> {
        self.accumulator.clear()?;
        self.total = 0.0;
        info!("energy total reset");
        Ok(())
    }

    /// persist the running total now, outside the save cadence
    pub fn flush(&mut self) -> Result<()> {
        self.accumulator.save(self.total)
    }

    /// tick until `shutdown` resolves, then flush and close the session
    pub async fn run<M, F>(
        &mut self,
        source: &mut M,
        events: Option<mpsc::Receiver<StreamMessage>>,
        commands: Option<mpsc::Receiver<AgentCommand>>,
        shutdown: F,
    ) -> Result<()>
    where
        M: MeasurementSource,
        F: Future<Output = ()>,
    {
        let mut events = events;
        let mut commands = commands;
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        // maintain() can hold a tick for the whole connect timeout
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            device_id = %self.device,
            interval_ms = self.settings.tick_interval.as_millis() as u64,
            "telemetry loop started"
        );
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                msg = recv_or_pending(&mut events) => match msg {
                    Some(msg) => self.handle_stream(msg).await,
                    None => events = None,
                },
                cmd = recv_or_pending(&mut commands) => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => commands = None,
                },
                _ = ticker.tick() => {
                    let m = source.next_measurement();
                    self.tick(m).await;
                }
            }
        }

        self.flush()?;
        self.realtime.shutdown();
        info!(total_kwh = self.total, "final total saved");
        Ok(())
    }

    fn save_total(&mut self) -> bool {
        match self.accumulator.save(self.total) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "[Storage] save failed");
                false
            }
        }
    }

    /// open the realtime session / stream if it is not up yet
    async fn ensure_realtime(&mut self) {
        if !self.settings.realtime_enabled {
            return;
        }
        if self.realtime_started && !self.resubscribe_pending {
            return;
        }
        if let Some(at) = self.realtime_retry_at {
            if Instant::now() < at {
                return;
            }
        }
        if !self.realtime_started {
            if let Err(e) = self.realtime.begin().await {
                warn!(error = %e, "[Realtime] could not start session");
                self.defer_realtime();
                return;
            }
            self.realtime_started = true;
            self.resubscribe_pending = true;
        }
        match self.realtime.listen_for_events().await {
            Ok(()) => {
                self.resubscribe_pending = false;
                self.realtime_retry_at = None;
                self.status.write().await.stream_resubscribes += 1;
            }
            Err(e) => {
                warn!(error = %e, "[Stream] could not subscribe");
                self.defer_realtime();
            }
        }
    }

    fn defer_realtime(&mut self) {
        let at = Instant::now() + self.settings.realtime_retry_interval;
        debug!(
            retry_in_ms = self.settings.realtime_retry_interval.as_millis() as u64,
            "[Realtime] retry deferred"
        );
        self.realtime_retry_at = Some(at);
    }

    async fn publish(&self, report: Option<&TickReport>) {
        let mut s = self.status.write().await;
        s.connectivity = self.connectivity.state();
        s.energy_total_kwh = self.total;
        s.last_saved_kwh = self.accumulator.last_saved();
        s.ticks = self.tick;
        s.uptime_ms = self.booted_at.elapsed().as_millis() as u64;
        if let Some(r) = report {
            s.primary = Some(r.primary.clone());
            s.realtime = Some(r.realtime.clone());
        }
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
