//! ==============================================================================
//! backend.rs - primary sink: REST push
//! ==============================================================================
//!
//! one POST per tick with a fixed-schema json body. no retry and no buffering:
//! a failed send is logged and that tick's sample is gone from this sink (the
//! energy total is still durable in storage). the sink does not check
//! connectivity itself, the orchestrator only calls it while connected.
//!
//! ==============================================================================

use crate::config::BackendConfig;
use crate::domain::{DeviceIdentity, SyncOutcome};
use crate::error::Result;

use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// wire body; field order is part of the contract
#[derive(Debug, Serialize)]
pub struct BackendPayload<'a> {
    pub device_id: &'a str,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy_generated: f64,
}

/// the seam the orchestrator pushes through
#[allow(async_fn_in_trait)]
pub trait MeasurementPush {
    async fn send(
        &self,
        device: &DeviceIdentity,
        voltage: f64,
        current: f64,
        power: f64,
        energy_total: f64,
    ) -> SyncOutcome;
}

pub struct RestSink {
    client: reqwest::Client,
    url: String,
}

impl RestSink {
    pub fn new(cfg: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()?;
        Ok(Self { client, url: cfg.url.clone() })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl MeasurementPush for RestSink {
    async fn send(
        &self,
        device: &DeviceIdentity,
        voltage: f64,
        current: f64,
        power: f64,
        energy_total: f64,
    ) -> SyncOutcome {
        let payload = BackendPayload {
            device_id: device.as_str(),
            voltage,
            current,
            power,
            energy_generated: energy_total,
        };

        // .json() sets Content-Type: application/json
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    info!(status = status.as_u16(), "[Backend] response");
                    SyncOutcome::Success { status: Some(status.as_u16()) }
                } else {
                    warn!(status = status.as_u16(), "[Backend] rejected");
                    SyncOutcome::TransportError {
                        code: Some(status.as_u16()),
                        reason: status
                            .canonical_reason()
                            .unwrap_or("unexpected status")
                            .to_string(),
                    }
                }
            }
            Err(e) => {
                let reason = describe(&e);
                warn!(%reason, "[Backend] error");
                SyncOutcome::TransportError { code: None, reason }
            }
        }
    }
}

fn describe(e: &reqwest::Error) -> String {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection refused"
    } else if e.is_request() {
        "request failed"
    } else {
        "transport error"
    };
    format!("{}: {}", kind, e)
}
