//! Per-cycle reading and its outbound JSON contract.
//!
//! Published once per successful cycle to `<namespace>/<id>/data`:
//!
//! ```json
//! {"id":"1","raw":18250.4,"volts":2.2813,"percent_raw":55.35,"percent_v":55.35}
//! ```

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

use crate::mapper::Percentages;

/// One validated measurement. Built once per successful cycle.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reading {
    pub id: String,
    pub raw_mean: f64,
    pub volts: f64,
    pub percent_raw: f64,
    pub percent_voltage: f64,
    pub timestamp: OffsetDateTime,
}

impl Reading {
    pub(crate) fn new(id: &str, raw_mean: f64, p: Percentages) -> Self {
        Self {
            id: id.to_string(),
            raw_mean,
            volts: p.volts,
            percent_raw: p.percent_raw,
            percent_voltage: p.percent_voltage,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct TelemetryPayload {
    pub id: String,
    pub raw: f64,
    pub volts: f64,
    pub percent_raw: f64,
    pub percent_v: f64,
}

impl From<&Reading> for TelemetryPayload {
    fn from(r: &Reading) -> Self {
        Self {
            id: r.id.clone(),
            raw: round_to(r.raw_mean, 2),
            volts: round_to(r.volts, 4),
            percent_raw: round_to(r.percent_raw, 2),
            percent_v: round_to(r.percent_voltage, 2),
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

pub(crate) trait TelemetrySink {
    async fn publish(&mut self, payload: &TelemetryPayload) -> anyhow::Result<()>;
}

/// Publishes payloads through the node's MQTT client.
pub(crate) struct MqttTelemetry {
    client: AsyncClient,
    topic: String,
}

impl MqttTelemetry {
    pub(crate) fn new(client: AsyncClient, topic: String) -> Self {
        Self { client, topic }
    }
}

impl TelemetrySink for MqttTelemetry {
    async fn publish(&mut self, payload: &TelemetryPayload) -> anyhow::Result<()> {
        let body = serde_json::to_vec(payload)?;
        self.client
            .publish(&self.topic, QoS::AtLeastOnce, false, body)
            .await?;
        info!(topic = %self.topic, payload = ?payload, "telemetry published");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> Reading {
        Reading {
            id: "1".into(),
            raw_mean: 18250.4444,
            volts: 2.281305556,
            percent_raw: 55.35396,
            percent_voltage: 55.35404,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn payload_rounds_fields() {
        let p = TelemetryPayload::from(&reading());
        assert_eq!(p.raw, 18250.44);
        assert_eq!(p.volts, 2.2813);
        assert_eq!(p.percent_raw, 55.35);
        assert_eq!(p.percent_v, 55.35);
    }

    #[test]
    fn payload_serializes_with_contract_field_names() {
        let json = serde_json::to_value(TelemetryPayload::from(&reading())).unwrap();

        assert_eq!(json["id"], "1");
        assert_eq!(json["raw"], 18250.44);
        assert_eq!(json["volts"], 2.2813);
        assert_eq!(json["percent_raw"], 55.35);
        assert_eq!(json["percent_v"], 55.35);
        // Exactly these five fields, no timestamp leaks into the contract.
        assert_eq!(json.as_object().unwrap().len(), 5);
    }

    #[test]
    fn id_is_a_string_even_when_numeric() {
        let json = serde_json::to_value(TelemetryPayload::from(&reading())).unwrap();
        assert!(json["id"].is_string());
    }

    #[test]
    fn round_to_handles_halves_away_from_zero() {
        assert_eq!(round_to(0.125, 2), 0.13);
        assert_eq!(round_to(-1.5, 0), -2.0);
    }

    #[tokio::test]
    async fn mqtt_publish_queues_without_broker() {
        // The event loop is never polled; the request just sits in its queue.
        let opts = rumqttc::MqttOptions::new("test-telemetry", "127.0.0.1", 1883);
        let (client, _eventloop) = AsyncClient::new(opts, 10);
        let mut sink = MqttTelemetry::new(client, "planta/1/data".into());

        sink.publish(&TelemetryPayload::from(&reading())).await.unwrap();
    }
}
