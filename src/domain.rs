use serde::{Deserialize, Serialize};
use std::fmt;

/// one sample from the measurement front-end
///
/// produced once per tick and consumed within the same tick.
/// `energy_delta` is in kWh, the same unit as the running total.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy_delta: f64,
}

/// radio association state as seen by the connectivity manager
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// opaque device id, used to namespace the REST payload and database paths
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// why a sink was not attempted this tick
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    NoSession,
}

/// per-sink result of one push; never persisted
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// the backend accepted the write (`status` is the HTTP code when there is one)
    Success { status: Option<u16> },
    /// `code` is set when the server answered with a non-success status,
    /// absent when the transport failed before any status came back
    TransportError { code: Option<u16>, reason: String },
    Skipped { reason: SkipReason },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success { .. })
    }

    pub fn skipped(reason: SkipReason) -> Self {
        SyncOutcome::Skipped { reason }
    }
}

/// one change observed on the inbound transactions stream
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InboundEvent {
    pub event_type: String,
    pub data: String,
}

impl InboundEvent {
    /// try to read the payload as an energy trade issued by the trading backend
    ///
    /// the stream wraps changes as `{"path": ..., "data": ...}`; both the
    /// wrapped and the bare form are accepted.
    pub fn transaction(&self) -> Option<EnergyTransaction> {
        let value: serde_json::Value = serde_json::from_str(&self.data).ok()?;
        let inner = match value.get("data") {
            Some(d) if d.is_object() => d.clone(),
            _ => value,
        };
        serde_json::from_value(inner).ok()
    }
}

/// what the listener hands to the orchestrator
#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessage {
    Event(InboundEvent),
    /// no bytes arrived within the stream timeout; re-arm the subscription
    Timeout,
    /// the server closed the stream (cancel, revoked auth, or eof)
    Closed(String),
}

/// energy trade between two participants
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnergyTransaction {
    pub sender: String,
    pub receiver: String,
    #[serde(deserialize_with = "number_or_string")]
    pub energy_units: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub rate_per_unit: f64,
}

impl EnergyTransaction {
    pub fn total_cost(&self) -> f64 {
        self.energy_units * self.rate_per_unit
    }
}

// the trading backend serialises decimals as strings
fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_from_wrapped_stream_payload() {
        let ev = InboundEvent {
            event_type: "put".into(),
            data: r#"{"path":"/tx1","data":{"sender":"alice","receiver":"bob","energy_units":"2.5","rate_per_unit":0.4}}"#.into(),
        };
        let tx = ev.transaction().expect("should parse");
        assert_eq!(tx.sender, "alice");
        assert_eq!(tx.receiver, "bob");
        assert!((tx.total_cost() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn non_transaction_payload_is_none() {
        let ev = InboundEvent {
            event_type: "put".into(),
            data: r#"{"path":"/","data":null}"#.into(),
        };
        assert!(ev.transaction().is_none());

        let raw = InboundEvent { event_type: "patch".into(), data: "hello".into() };
        assert!(raw.transaction().is_none());
    }

    #[test]
    fn outcome_serialises_with_tag() {
        let json = serde_json::to_value(SyncOutcome::skipped(SkipReason::Offline)).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["reason"], "offline");
    }
}
