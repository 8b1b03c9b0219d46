//! ==============================================================================
//! realtime.rs - secondary sink: realtime database
//! ==============================================================================
//!
//! purpose:
//!     pushes each sample to `/devices/{id}/data` and listens on
//!     `/devices/{id}/transactions` for externally issued commands.
//!
//! session:
//!     begin() signs in with email/password against the identity endpoint and
//!     keeps the id token. an expired token is refreshed on the next request,
//!     so the session heals itself after long outages. shutdown() drops it.
//!
//! inbound stream:
//!     the database's server-sent event stream is read on a spawned task and
//!     forwarded through an mpsc channel owned by this sink. the orchestrator
//!     takes the receiver once and drains it from its own loop. when the
//!     stream goes idle past `stream_timeout` the task reports Timeout and
//!     exits; calling listen_for_events() again re-arms it on the same channel.
//!
//! relationships:
//!     - used by: agent.rs (send_realtime per tick, listen_for_events on start
//!       and after a timeout)
//!
//! ==============================================================================

use crate::config::RealtimeConfig;
use crate::domain::{DeviceIdentity, InboundEvent, SkipReason, StreamMessage, SyncOutcome};
use crate::error::{AgentError, Result};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_IDENTITY_URL: &str = "https://identitytoolkit.googleapis.com";
const EVENT_CHANNEL_CAPACITY: usize = 32;
// refresh a little before the server says the token dies
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// record written to `/devices/{id}/data`
#[derive(Debug, Serialize)]
pub struct RealtimeRecord {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy_generated: f64,
    /// milliseconds since the agent booted
    pub timestamp: u64,
}

/// the seam the orchestrator drives the realtime database through
#[allow(async_fn_in_trait)]
pub trait RealtimeSync {
    /// establish the authenticated session; required before send/listen
    async fn begin(&mut self) -> Result<()>;

    /// drop the session and stop the listener
    fn shutdown(&mut self);

    async fn send_realtime(
        &mut self,
        voltage: f64,
        current: f64,
        power: f64,
        energy_total: f64,
    ) -> SyncOutcome;

    /// (re)open the inbound subscription; safe to call repeatedly
    async fn listen_for_events(&mut self) -> Result<()>;
}

struct Session {
    /// None when no credentials are configured (open rules / emulator)
    id_token: Option<String>,
    expires_at: Option<Instant>,
}

impl Session {
    fn expired(&self) -> bool {
        self.expires_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
    expires_in: String,
}

pub struct RealtimeSink {
    device: DeviceIdentity,
    api_key: String,
    credentials: Credentials,
    database_url: String,
    identity_url: String,
    client: reqwest::Client,
    stream_client: reqwest::Client,
    stream_timeout: Duration,
    booted_at: Instant,
    session: Option<Session>,
    events_tx: mpsc::Sender<StreamMessage>,
    events_rx: Option<mpsc::Receiver<StreamMessage>>,
    listener: Option<JoinHandle<()>>,
}

impl RealtimeSink {
    /// configure auth and the database location for `project_id`
    pub fn initialize(
        device: DeviceIdentity,
        api_key: impl Into<String>,
        credentials: Credentials,
        project_id: &str,
        booted_at: Instant,
    ) -> Result<Self> {
        let cfg = RealtimeConfig {
            api_key: api_key.into(),
            email: credentials.email,
            password: credentials.password,
            project_id: project_id.to_string(),
            ..Default::default()
        };
        Self::from_config(device, &cfg, booted_at)
    }

    pub fn from_config(device: DeviceIdentity, cfg: &RealtimeConfig, booted_at: Instant) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()?;
        // the stream is long-lived; only the connect phase gets a deadline
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            device,
            api_key: cfg.api_key.clone(),
            credentials: Credentials {
                email: cfg.email.clone(),
                password: cfg.password.clone(),
            },
            database_url: cfg.database_url(),
            identity_url: cfg
                .identity_url
                .clone()
                .unwrap_or_else(|| DEFAULT_IDENTITY_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            client,
            stream_client,
            stream_timeout: Duration::from_millis(cfg.stream_timeout_ms),
            booted_at,
            session: None,
            events_tx,
            events_rx: Some(events_rx),
            listener: None,
        })
    }

    /// hand the inbound channel to the consumer; only the first call gets it
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<StreamMessage>> {
        self.events_rx.take()
    }

    pub fn is_started(&self) -> bool {
        self.session.is_some()
    }

    pub fn data_path(&self) -> String {
        format!("devices/{}/data", self.device)
    }

    pub fn transactions_path(&self) -> String {
        format!("devices/{}/transactions", self.device)
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}.json", self.database_url, path)
    }

    async fn sign_in(&self) -> Result<Session> {
        if self.credentials.email.is_empty() {
            debug!("[Realtime] no credentials configured, using unauthenticated session");
            return Ok(Session { id_token: None, expires_at: None });
        }

        let url = format!("{}/v1/accounts:signInWithPassword", self.identity_url);
        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&SignInRequest {
                email: &self.credentials.email,
                password: &self.credentials.password,
                return_secure_token: true,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Auth(format!("sign-in returned {}: {}", status, body)));
        }

        let parsed: SignInResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::Auth(format!("bad sign-in response: {}", e)))?;
        let lifetime = parsed
            .expires_in
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| AgentError::Auth(format!("bad expiresIn: {}", e)))?;

        Ok(Session {
            id_token: Some(parsed.id_token),
            expires_at: Some(Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN)),
        })
    }

    /// current token, signing in again when the old one has expired
    async fn token(&mut self) -> Result<Option<String>> {
        match &self.session {
            None => Err(AgentError::Realtime("session not started".into())),
            Some(s) if !s.expired() => Ok(s.id_token.clone()),
            Some(_) => {
                info!("[Realtime] token expired, signing in again");
                let fresh = self.sign_in().await?;
                let token = fresh.id_token.clone();
                self.session = Some(fresh);
                Ok(token)
            }
        }
    }

    fn uptime_ms(&self) -> u64 {
        self.booted_at.elapsed().as_millis() as u64
    }
}

impl RealtimeSync for RealtimeSink {
    async fn begin(&mut self) -> Result<()> {
        let session = self.sign_in().await?;
        self.session = Some(session);
        info!(device_id = %self.device, url = %self.database_url, "[Realtime] session started");
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
        if self.session.take().is_some() {
            info!("[Realtime] session closed");
        }
    }

    async fn send_realtime(
        &mut self,
        voltage: f64,
        current: f64,
        power: f64,
        energy_total: f64,
    ) -> SyncOutcome {
        if self.session.is_none() {
            return SyncOutcome::skipped(SkipReason::NoSession);
        }
        let token = match self.token().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "[Realtime] upload failed");
                return SyncOutcome::TransportError { code: None, reason: e.to_string() };
            }
        };

        let record = RealtimeRecord {
            voltage,
            current,
            power,
            energy_generated: energy_total,
            timestamp: self.uptime_ms(),
        };
        let mut req = self.client.put(self.url_for(&self.data_path())).json(&record);
        if let Some(t) = &token {
            req = req.query(&[("auth", t.as_str())]);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("[Realtime] data sent successfully");
                SyncOutcome::Success { status: Some(resp.status().as_u16()) }
            }
            Ok(resp) => {
                let code = resp.status().as_u16();
                let reason = error_reason(resp).await;
                warn!(status = code, %reason, "[Realtime] upload failed");
                SyncOutcome::TransportError { code: Some(code), reason }
            }
            Err(e) => {
                warn!(error = %e, "[Realtime] upload failed");
                SyncOutcome::TransportError { code: None, reason: e.to_string() }
            }
        }
    }

    async fn listen_for_events(&mut self) -> Result<()> {
        let token = self.token().await?;
        if let Some(old) = self.listener.take() {
            old.abort();
        }

        let url = self.url_for(&self.transactions_path());
        let task = StreamTask {
            client: self.stream_client.clone(),
            url,
            token,
            idle_timeout: self.stream_timeout,
            tx: self.events_tx.clone(),
        };
        self.listener = Some(tokio::spawn(task.run()));
        info!(path = %self.transactions_path(), "[Stream] listening");
        Ok(())
    }
}

impl Drop for RealtimeSink {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
    }
}

/// the database answers errors as `{"error": "..."}`
async fn error_reason(resp: reqwest::Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}", status))
}

// ==============================================================================
// stream listener
// ==============================================================================

struct StreamTask {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    idle_timeout: Duration,
    tx: mpsc::Sender<StreamMessage>,
}

impl StreamTask {
    async fn run(self) {
        let mut req = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(t) = &self.token {
            req = req.query(&[("auth", t.as_str())]);
        }

        let resp = match tokio::time::timeout(self.idle_timeout, req.send()).await {
            Err(_) => return self.timed_out().await,
            Ok(Err(e)) => return self.closed(e.to_string()).await,
            Ok(Ok(resp)) => resp,
        };
        if !resp.status().is_success() {
            let reason = error_reason(resp).await;
            return self.closed(reason).await;
        }

        let mut body = resp.bytes_stream();
        let mut parser = SseParser::default();
        loop {
            let chunk = match tokio::time::timeout(self.idle_timeout, body.next()).await {
                Err(_) => return self.timed_out().await,
                Ok(None) => return self.closed("stream ended".into()).await,
                Ok(Some(Err(e))) => return self.closed(e.to_string()).await,
                Ok(Some(Ok(chunk))) => chunk,
            };

            for SseFrame { event, data } in parser.push(&chunk) {
                if event == "keep-alive" {
                    debug!("[Stream] keep-alive");
                    continue;
                }
                if event == "cancel" || event == "auth_revoked" {
                    return self.closed(event).await;
                }
                debug!(event = %event, "[Stream] event");
                let msg = StreamMessage::Event(InboundEvent { event_type: event, data });
                if self.tx.send(msg).await.is_err() {
                    // consumer is gone
                    return;
                }
            }
        }
    }

    async fn timed_out(&self) {
        warn!("[Stream] timeout, reconnecting...");
        let _ = self.tx.send(StreamMessage::Timeout).await;
    }

    async fn closed(&self, reason: String) {
        warn!(%reason, "[Stream] closed");
        let _ = self.tx.send(StreamMessage::Closed(reason)).await;
    }
}

/// one dispatched server-sent event
#[derive(Debug, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// incremental text/event-stream decoder; chunks may split lines anywhere
#[derive(Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if self.event.is_some() || !self.data.is_empty() {
                    frames.push(SseFrame {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        frames
    }
}
