//! Anonymous connect telemetry
//!
//! The Manager reports successful connects through [`Telemetry`] and never
//! waits for the result. Delivery happens on a spawned task and failures only
//! show up in debug logs.

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

pub const TELEMETRY_ENDPOINT: &str = "https://telemetry.tundler.com";
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// One-way sink for connect events
pub trait Telemetry: Send + Sync {
    fn record_connect(&self, provider: &str, location: &str, ip: Option<&str>);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn record_connect(&self, _provider: &str, _location: &str, _ip: Option<&str>) {}
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub provider: String,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn_ip: Option<String>,
    pub timestamp: i64,
    pub os: &'static str,
    pub arch: &'static str,
}

impl ConnectEvent {
    pub fn new(provider: &str, location: &str, ip: Option<&str>) -> Self {
        Self {
            kind: "connect",
            provider: provider.to_string(),
            location: location.to_string(),
            vpn_ip: ip.filter(|ip| !ip.is_empty()).map(str::to_string),
            timestamp: Utc::now().timestamp(),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }
}

/// Posts events as JSON to a collector
#[derive(Debug, Clone)]
pub struct HttpTelemetry {
    client: Client,
    endpoint: String,
}

impl HttpTelemetry {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

impl Default for HttpTelemetry {
    fn default() -> Self {
        Self::new(TELEMETRY_ENDPOINT)
    }
}

impl Telemetry for HttpTelemetry {
    fn record_connect(&self, provider: &str, location: &str, ip: Option<&str>) {
        let event = ConnectEvent::new(provider, location, ip);

        // Outside a runtime there is nowhere to send from
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("Telemetry: no runtime, dropping event");
            return;
        };

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        handle.spawn(async move {
            match client.post(&endpoint).json(&event).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("Telemetry: event sent ({})", resp.status());
                }
                Ok(resp) => debug!("Telemetry: collector returned {}", resp.status()),
                Err(e) => debug!("Telemetry: send failed: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_shape() {
        let event = ConnectEvent::new("mullvad", "se", Some("185.65.134.1"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "connect");
        assert_eq!(json["provider"], "mullvad");
        assert_eq!(json["location"], "se");
        assert_eq!(json["vpn_ip"], "185.65.134.1");
        assert_eq!(json["os"], std::env::consts::OS);
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_missing_ip_is_omitted() {
        let event = ConnectEvent::new("nordvpn", "", Some(""));
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("vpn_ip").is_none());
    }

    #[test]
    fn test_record_outside_runtime_is_dropped() {
        HttpTelemetry::new("http://127.0.0.1:9").record_connect("mullvad", "se", None);
    }

    #[tokio::test]
    async fn test_record_does_not_block_on_unreachable_collector() {
        let telemetry = HttpTelemetry::new("http://127.0.0.1:9");
        let started = std::time::Instant::now();
        telemetry.record_connect("mullvad", "se", Some("10.0.0.1"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
