//! Forwarding samples to a time-series database.
//!
//! The ingestion client itself lives outside this crate behind the
//! [`CloudSink`] trait. [`CloudForwarder`] sits between the notification path
//! and that sink: `forward` only enqueues, and every write runs in its own
//! task so a slow or failing sink never holds up BLE traffic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::data::measurement::{Measurement, Sample};
use crate::error::Result;

#[cfg(test)]
use mockall::automock;

/// A field value in a time-series point.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Floating point value.
    Float(f64),
    /// Signed integer value.
    Integer(i64),
    /// Boolean value.
    Boolean(bool),
    /// String value.
    Text(String),
}

/// One time-series point: measurement name, tags, fields and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Measurement name.
    pub measurement: String,
    /// Indexed tags.
    pub tags: BTreeMap<String, String>,
    /// Field values.
    pub fields: BTreeMap<String, FieldValue>,
    /// Time of the observation.
    pub timestamp: DateTime<Utc>,
}

impl Point {
    /// Create an empty point.
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    /// Add a tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a field.
    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Build the point for a sample.
    ///
    /// The measurement is named after the sample's kind, tagged with the
    /// device address (and name when known), and carries a single `value`
    /// field.
    pub fn from_sample(sample: &Sample) -> Self {
        let value = match sample.measurement {
            Measurement::BatteryLevel(m) => FieldValue::Integer(m.percent as i64),
            // Values have hundredths resolution; round away the f32 widening noise.
            other => FieldValue::Float((other.value() as f64 * 100.0).round() / 100.0),
        };

        let mut point = Self::new(sample.kind().name(), sample.timestamp)
            .tag("device", sample.peripheral.as_str())
            .field("value", value);

        if let Some(name) = &sample.peripheral_name {
            point = point.tag("name", name.as_str());
        }

        point
    }

    /// Render the point in InfluxDB line protocol.
    ///
    /// # Example
    ///
    /// ```
    /// use ble_relay::cloud::{FieldValue, Point};
    /// use chrono::{TimeZone, Utc};
    ///
    /// let point = Point::new("temperature", Utc.timestamp_opt(1, 0).unwrap())
    ///     .tag("device", "AA:BB")
    ///     .field("value", FieldValue::Float(29.52));
    /// assert_eq!(
    ///     point.to_line_protocol(),
    ///     "temperature,device=AA:BB value=29.52 1000000000"
    /// );
    /// ```
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    FieldValue::Float(v) => v.to_string(),
                    FieldValue::Integer(v) => format!("{}i", v),
                    FieldValue::Boolean(v) => v.to_string(),
                    FieldValue::Text(v) => format!("\"{}\"", escape(v, &['"', '\\'])),
                };
                format!("{}={}", escape(key, &[',', '=', ' ']), value)
            })
            .collect();

        line.push(' ');
        line.push_str(&fields.join(","));

        if let Some(nanos) = self.timestamp.timestamp_nanos_opt() {
            line.push(' ');
            line.push_str(&nanos.to_string());
        }

        line
    }
}

fn escape(input: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Destination for time-series points.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudSink: Send + Sync + 'static {
    /// Write a single point. Best-effort; the caller does not retry.
    async fn write_point(&self, point: Point) -> Result<()>;
}

/// A sink that only logs each point's line protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl CloudSink for LoggingSink {
    async fn write_point(&self, point: Point) -> Result<()> {
        info!("{}", point.to_line_protocol());
        Ok(())
    }
}

/// Fire-and-forget hand-off from the notification path to a [`CloudSink`].
#[derive(Debug, Clone)]
pub struct CloudForwarder {
    tx: mpsc::UnboundedSender<Sample>,
}

impl CloudForwarder {
    /// Start the forwarding task for a sink.
    ///
    /// Aborting the returned handle also aborts any writes in flight.
    pub fn spawn(sink: Arc<dyn CloudSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Sample>();

        let handle = tokio::spawn(async move {
            let mut writes = JoinSet::new();

            loop {
                tokio::select! {
                    Some(sample) = rx.recv() => {
                        let sink = sink.clone();
                        let point = Point::from_sample(&sample);
                        writes.spawn(async move {
                            if let Err(e) = sink.write_point(point).await {
                                warn!("Cloud write failed, dropping point: {}", e);
                            }
                        });
                    }
                    Some(result) = writes.join_next(), if !writes.is_empty() => {
                        if let Err(e) = result {
                            warn!("Cloud write task failed: {}", e);
                        }
                    }
                    else => break,
                }
            }

            debug!("Cloud forwarder stopped");
        });

        (Self { tx }, handle)
    }

    /// Queue a sample for the sink. Never blocks.
    pub fn forward(&self, sample: Sample) {
        if self.tx.send(sample).is_err() {
            debug!("Cloud forwarder stopped, dropping sample");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::platform::PeripheralAddress;
    use crate::data::measurement::MeasurementKind;
    use crate::error::Error;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn sample(kind: MeasurementKind, value: f32) -> Sample {
        Sample {
            measurement: Measurement::new(kind, value),
            peripheral: PeripheralAddress::new("AA:BB:CC:DD:EE:FF"),
            peripheral_name: Some("Kitchen Sensor".to_string()),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_point_from_temperature_sample() {
        let point = Point::from_sample(&sample(MeasurementKind::Temperature, 29.52));
        assert_eq!(point.measurement, "temperature");
        assert_eq!(point.fields["value"], FieldValue::Float(29.52));
        assert_eq!(
            point.to_line_protocol(),
            "temperature,device=AA:BB:CC:DD:EE:FF,name=Kitchen\\ Sensor value=29.52 1700000000000000000"
        );
    }

    #[test]
    fn test_point_from_battery_sample() {
        let point = Point::from_sample(&sample(MeasurementKind::BatteryLevel, 87.0));
        assert_eq!(
            point.to_line_protocol(),
            "battery_level,device=AA:BB:CC:DD:EE:FF,name=Kitchen\\ Sensor value=87i 1700000000000000000"
        );
    }

    #[test]
    fn test_line_protocol_escaping() {
        let point = Point::new("my measurement", Utc.timestamp_opt(0, 0).unwrap())
            .tag("a,b", "c=d")
            .field("note", FieldValue::Text("say \"hi\"".to_string()))
            .field("ok", FieldValue::Boolean(true));
        assert_eq!(
            point.to_line_protocol(),
            "my\\ measurement,a\\,b=c\\=d note=\"say \\\"hi\\\"\",ok=true 0"
        );
    }

    #[tokio::test]
    async fn test_forwarder_writes_points() {
        let mut sink = MockCloudSink::new();
        sink.expect_write_point()
            .withf(|p| p.measurement == "humidity")
            .times(2)
            .returning(|_| Ok(()));

        let (forwarder, handle) = CloudForwarder::spawn(Arc::new(sink));
        forwarder.forward(sample(MeasurementKind::Humidity, 40.0));
        forwarder.forward(sample(MeasurementKind::Humidity, 41.0));
        drop(forwarder);

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_forwarder_survives_sink_failures() {
        let mut sink = MockCloudSink::new();
        sink.expect_write_point()
            .times(3)
            .returning(|_| Err(Error::Sink("unreachable".to_string())));

        let (forwarder, handle) = CloudForwarder::spawn(Arc::new(sink));
        for value in [1.0, 2.0, 3.0] {
            forwarder.forward(sample(MeasurementKind::Temperature, value));
        }
        drop(forwarder);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_forward_after_stop_is_silent() {
        let (forwarder, handle) = CloudForwarder::spawn(Arc::new(LoggingSink));
        handle.abort();
        let _ = handle.await;
        forwarder.forward(sample(MeasurementKind::Temperature, 1.0));
    }
}
