//! Telemetry relay: clients broadcast reports into the mesh, the gateway
//! pushes its own and forwarded reports to a collection server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use swarm_core::{Event, EventBus, NodeId, Role, SwarmError};
use tracing::{info, warn};

/// Metrics plus a state snapshot for one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryReport {
    pub name: String,
    pub uptime: u64,
    pub heap_free: u64,
    pub peer_count: usize,
    pub role: Role,
    pub firmware: String,
    pub state: BTreeMap<String, String>,
}

impl TelemetryReport {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Destination for telemetry reports. Submission is fire-and-forget.
pub trait TelemetrySink: Send + Sync {
    fn submit(&self, node_id: NodeId, payload: Value);
}

/// Posts reports as JSON to `{base}/api/v1/nodes/{id:x}/telemetry`.
#[derive(Clone)]
pub struct HttpTelemetrySink {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    events: Option<EventBus>,
}

impl HttpTelemetrySink {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> swarm_core::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SwarmError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            events: None,
        })
    }

    /// Publish delivery results on the given bus.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn endpoint(&self, node_id: NodeId) -> String {
        format!("{}/api/v1/nodes/{:x}/telemetry", self.base_url, node_id)
    }

    /// Send one report and log the outcome.
    pub async fn post(&self, node_id: NodeId, payload: Value) -> bool {
        let url = self.endpoint(node_id);
        let mut request = self.client.post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let failure = match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(node = %format!("{node_id:x}"), status = %resp.status(), "telemetry delivered");
                None
            }
            Ok(resp) => Some(format!("server returned {}", resp.status())),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                if let Some(bus) = &self.events {
                    bus.publish(Event::TelemetryDelivered { node_id });
                }
                true
            }
            Some(reason) => {
                warn!(node = %format!("{node_id:x}"), url = %url, reason = %reason, "telemetry push failed");
                if let Some(bus) = &self.events {
                    bus.publish(Event::TelemetryFailed { node_id, reason });
                }
                false
            }
        }
    }
}

impl TelemetrySink for HttpTelemetrySink {
    fn submit(&self, node_id: NodeId, payload: Value) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let sink = self.clone();
                handle.spawn(async move {
                    sink.post(node_id, payload).await;
                });
            }
            Err(_) => warn!("no async runtime available, telemetry dropped"),
        }
    }
}

/// How this node takes part in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Broadcast reports into the mesh for a gateway to pick up.
    Client,
    /// Submit own reports and forward received ones to the sink.
    Gateway,
}

/// Telemetry timer and sink bookkeeping owned by the node.
pub struct TelemetryRelay {
    enabled: bool,
    mode: RelayMode,
    interval: Duration,
    last_push: Instant,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl TelemetryRelay {
    pub fn new(enabled: bool, mode: RelayMode, interval: Duration, now: Instant) -> Self {
        Self {
            enabled,
            mode,
            interval,
            last_push: now,
            sink: None,
        }
    }

    pub fn set_sink(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sink = Some(sink);
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_gateway(&self) -> bool {
        self.mode == RelayMode::Gateway
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.enabled && now.saturating_duration_since(self.last_push) >= self.interval
    }

    pub fn mark_pushed(&mut self, now: Instant) {
        self.last_push = now;
    }

    /// Hand a report to the sink. Returns false when no sink is configured.
    pub fn deliver(&self, node_id: NodeId, payload: Value) -> bool {
        match &self.sink {
            Some(sink) => {
                sink.submit(node_id, payload);
                true
            }
            None => {
                warn!(node = %format!("{node_id:x}"), "no telemetry sink configured, cannot push");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_uses_lowercase_hex() {
        let sink =
            HttpTelemetrySink::new("http://collector:8000/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            sink.endpoint(0xAB12),
            "http://collector:8000/api/v1/nodes/ab12/telemetry"
        );
    }

    #[test]
    fn test_report_field_names() {
        let report = TelemetryReport {
            name: "Light".into(),
            uptime: 30,
            heap_free: 1024,
            peer_count: 2,
            role: Role::Peer,
            firmware: "1.0.0".into(),
            state: BTreeMap::from([("light".to_string(), "400".to_string())]),
        };
        let v = report.to_value();
        assert_eq!(v["heap_free"], 1024);
        assert_eq!(v["peer_count"], 2);
        assert_eq!(v["role"], "PEER");
        assert_eq!(v["state"]["light"], "400");
    }

    #[test]
    fn test_relay_timer() {
        let start = Instant::now();
        let mut relay =
            TelemetryRelay::new(true, RelayMode::Client, Duration::from_secs(30), start);
        assert!(!relay.is_due(start + Duration::from_secs(29)));
        assert!(relay.is_due(start + Duration::from_secs(30)));
        relay.mark_pushed(start + Duration::from_secs(30));
        assert!(!relay.is_due(start + Duration::from_secs(31)));
    }

    #[test]
    fn test_disabled_relay_is_never_due() {
        let start = Instant::now();
        let relay = TelemetryRelay::new(false, RelayMode::Gateway, Duration::from_secs(1), start);
        assert!(!relay.is_due(start + Duration::from_secs(60)));
        assert!(!relay.deliver(1, Value::Null));
    }
}
