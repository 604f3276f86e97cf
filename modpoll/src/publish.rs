//! Turns device state into MQTT messages, the terminal snapshot and the
//! export file.

use std::path::Path;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use serde_json::{json, Map, Value as Json};

use crate::{
    modbus::{Device, Reference},
    mqtt::Message,
    topic::TopicRouter,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TimestampPrecision {
    /// `timestamp`: fractional unix seconds
    #[default]
    Seconds,
    /// `timestamp_ms`: integer unix milliseconds
    Milliseconds,
}

#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    /// One message per reference instead of one per device.
    pub single: bool,
    /// Only include references whose value changed in the last poll.
    pub on_change: bool,
    pub timestamp: Option<TimestampPrecision>,
}

fn insert_timestamp(
    payload: &mut Map<String, Json>,
    precision: TimestampPrecision,
    now: DateTime<Utc>,
) {
    match precision {
        TimestampPrecision::Seconds => {
            payload.insert(
                "timestamp".into(),
                json!(now.timestamp_micros() as f64 / 1_000_000.0),
            );
        }
        TimestampPrecision::Milliseconds => {
            payload.insert("timestamp_ms".into(), json!(now.timestamp_millis()));
        }
    }
}

fn publishable<'d>(device: &'d Device, on_change: bool) -> impl Iterator<Item = &'d Reference> {
    device
        .references
        .iter()
        .filter(move |r| r.value.is_some() && (!on_change || r.changed()))
}

/// The aggregate payload of a device: `{"<name>[|<unit>]": value, ...}`.
///
/// `None` when there is nothing to report.
pub fn device_payload(
    device: &Device,
    options: &PublishOptions,
    now: DateTime<Utc>,
) -> Option<Map<String, Json>> {
    let mut payload: Map<String, Json> = publishable(device, options.on_change)
        .filter_map(|r| Some((r.key(), r.value.as_ref()?.to_json())))
        .collect();
    if payload.is_empty() {
        return None;
    }
    if let Some(precision) = options.timestamp {
        insert_timestamp(&mut payload, precision, now);
    }
    Some(payload)
}

/// Every message a device publishes after a poll cycle.
pub fn device_messages(
    device: &Device,
    router: &TopicRouter,
    options: &PublishOptions,
    now: DateTime<Utc>,
) -> crate::Result<Vec<Message>> {
    let topic = router.publish.expand(&device.name);

    if !options.single {
        return Ok(match device_payload(device, options, now) {
            Some(payload) => vec![Message::new(topic, serde_json::to_vec(&payload)?)],
            None => vec![],
        });
    }

    let mut messages = vec![];
    for reference in publishable(device, options.on_change) {
        let Some(value) = &reference.value else {
            continue;
        };
        let topic = format!("{}/{}", topic, reference.name);
        match value.elements() {
            Some(elements) => {
                for (i, element) in elements.iter().enumerate() {
                    let payload = serde_json::to_vec(element)?;
                    messages.push(Message::new(format!("{topic}/{i}"), payload));
                }
            }
            None => messages.push(Message::new(topic, serde_json::to_vec(&value.to_json())?)),
        }
    }
    Ok(messages)
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct Diagnostics {
    pub poll_count: u64,
    pub error_count: u64,
    pub last_poll_success: bool,
}

impl From<&Device> for Diagnostics {
    fn from(device: &Device) -> Self {
        Self {
            poll_count: device.poll_count,
            error_count: device.error_count,
            last_poll_success: device.last_poll_success,
        }
    }
}

pub fn diagnostics_message(device: &Device, router: &TopicRouter) -> crate::Result<Message> {
    Ok(Message::new(
        router.diagnostics.expand(&device.name),
        serde_json::to_vec(&Diagnostics::from(device))?,
    ))
}

/// Human-readable table of every reference value, one block per device.
pub fn snapshot(devices: &[Device]) -> String {
    devices
        .iter()
        .map(|device| {
            let rows: Vec<[String; 3]> = device
                .references
                .iter()
                .map(|r| {
                    [
                        r.name.clone(),
                        r.value.as_ref().map(ToString::to_string).unwrap_or_default(),
                        r.unit.clone().unwrap_or_default(),
                    ]
                })
                .collect();

            let header = ["Reference", "Value", "Unit"].map(String::from);
            let widths: Vec<usize> = (0..3)
                .map(|col| {
                    rows.iter()
                        .chain(std::iter::once(&header))
                        .map(|row| row[col].chars().count())
                        .max()
                        .unwrap_or_default()
                })
                .collect();
            let line = |row: &[String; 3]| {
                row.iter()
                    .zip(&widths)
                    .map(|(cell, width)| format!("{cell:<width$}"))
                    .join(" | ")
                    .trim_end()
                    .to_owned()
            };
            let rule = widths.iter().map(|w| "-".repeat(*w)).join("-+-");

            std::iter::once(format!("{} (unit {})", device.name, device.unit))
                .chain([line(&header), rule])
                .chain(rows.iter().map(line))
                .join("\n")
        })
        .join("\n\n")
}

/// Writes every device's current values to `path` as pretty JSON.
pub fn export(
    devices: &[Device],
    path: &Path,
    timestamp: Option<TimestampPrecision>,
    now: DateTime<Utc>,
) -> crate::Result<()> {
    let mut document = Map::new();
    for device in devices {
        let mut values: Map<String, Json> = device
            .references
            .iter()
            .filter_map(|r| Some((r.name.clone(), r.value.as_ref()?.to_json())))
            .collect();
        if let Some(precision) = timestamp {
            insert_timestamp(&mut values, precision, now);
        }
        document.insert(device.name.clone(), Json::Object(values));
    }
    std::fs::write(path, serde_json::to_vec_pretty(&document)?)?;
    Ok(())
}

#[cfg(test)]
use crate::modbus::{Access, DataType, EndianMode, FunctionCode, Poller, Value};
#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn meter() -> Device {
    let mut device = Device::new("Meter1", 1);
    device.pollers.push(Poller::new(
        FunctionCode::ReadHoldingRegisters,
        100,
        4,
        EndianMode::BigBig,
    ));
    let mut voltage = Reference::new("Voltage", 100, DataType::Float32, Access::Read);
    voltage.unit = Some("V".into());
    voltage.scale = Some(1.0);
    let mut current = Reference::new("Current", 102, DataType::Float32, Access::Read);
    current.unit = Some("A".into());
    current.scale = Some(0.1);
    device.attach(0, voltage);
    device.attach(0, current);
    device.references[0].update_value(Value::Float(200.0));
    device.references[1].update_value(Value::Float(25.0));
    device
}

#[cfg(test)]
fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_250).unwrap()
}

#[test]
fn aggregate_payload_uses_unit_keys_and_rounds() {
    let payload = device_payload(&meter(), &PublishOptions::default(), epoch()).unwrap();
    assert_eq!(Json::Object(payload), json!({"Voltage|V": 200.0, "Current|A": 2.5}));
}

#[test]
fn aggregate_message_goes_to_the_publish_topic() {
    let messages =
        device_messages(&meter(), &TopicRouter::default(), &PublishOptions::default(), epoch())
            .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "modpoll/Meter1/data");
    let body: Json = serde_json::from_slice(&messages[0].payload).unwrap();
    assert_eq!(body, json!({"Voltage|V": 200.0, "Current|A": 2.5}));
}

#[test]
fn timestamps() {
    let seconds = PublishOptions {
        timestamp: Some(TimestampPrecision::Seconds),
        ..Default::default()
    };
    let payload = device_payload(&meter(), &seconds, epoch()).unwrap();
    assert_eq!(payload["timestamp"], json!(1_700_000_000.25));

    let millis = PublishOptions {
        timestamp: Some(TimestampPrecision::Milliseconds),
        ..Default::default()
    };
    let payload = device_payload(&meter(), &millis, epoch()).unwrap();
    assert_eq!(payload["timestamp_ms"], json!(1_700_000_000_250i64));
    assert!(!payload.contains_key("timestamp"));
}

#[test]
fn on_change_only_reports_changed_values() {
    let mut device = meter();
    device.references[0].update_value(Value::Float(200.0));
    device.references[1].update_value(Value::Float(26.0));
    let options = PublishOptions {
        on_change: true,
        timestamp: Some(TimestampPrecision::Seconds),
        ..Default::default()
    };

    let payload = device_payload(&device, &options, epoch()).unwrap();
    assert_eq!(payload.keys().collect::<Vec<_>>(), vec!["Current|A", "timestamp"]);

    device.references[1].update_value(Value::Float(26.0));
    assert_eq!(device_payload(&device, &options, epoch()), None);
    let messages = device_messages(&device, &TopicRouter::default(), &options, epoch()).unwrap();
    assert!(messages.is_empty());
}

#[test]
fn single_mode_publishes_per_reference_and_per_bit() {
    let mut device = meter();
    device.pollers.push(Poller::new(FunctionCode::ReadCoils, 0, 8, EndianMode::default()));
    device.attach(1, Reference::new("Flags", 0, DataType::Bool8, Access::Read));
    let bits = vec![true, false, false, false, false, false, false, true];
    device.references[2].update_value(Value::Bits(bits));

    let options = PublishOptions {
        single: true,
        ..Default::default()
    };
    let messages = device_messages(&device, &TopicRouter::default(), &options, epoch()).unwrap();
    let topics: Vec<_> = messages.iter().map(|m| m.topic.as_str()).collect();
    assert_eq!(
        topics,
        vec![
            "modpoll/Meter1/data/Voltage",
            "modpoll/Meter1/data/Current",
            "modpoll/Meter1/data/Flags/0",
            "modpoll/Meter1/data/Flags/1",
            "modpoll/Meter1/data/Flags/2",
            "modpoll/Meter1/data/Flags/3",
            "modpoll/Meter1/data/Flags/4",
            "modpoll/Meter1/data/Flags/5",
            "modpoll/Meter1/data/Flags/6",
            "modpoll/Meter1/data/Flags/7",
        ]
    );
    assert_eq!(&messages[1].payload[..], b"2.5");
    assert_eq!(&messages[2].payload[..], b"true");
}

#[test]
fn diagnostics_are_cumulative_counters() {
    let mut device = meter();
    device.record_poll(0, true);
    device.record_poll(0, false);
    let message = diagnostics_message(&device, &TopicRouter::default()).unwrap();
    assert_eq!(message.topic, "modpoll/Meter1/diagnostics");
    let body: Json = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(
        body,
        json!({"poll_count": 2, "error_count": 1, "last_poll_success": false})
    );
}

#[test]
fn snapshot_table() {
    let mut device = meter();
    device.attach(0, Reference::new("Setpoint", 101, DataType::UInt16, Access::Write));
    assert_eq!(
        snapshot(&[device]),
        "\
Meter1 (unit 1)
Reference | Value | Unit
----------+-------+-----
Voltage   | 200   | V
Current   | 2.5   | A
Setpoint  |       |"
    );
}

#[test]
fn export_writes_all_devices() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.json");
    export(&[meter()], &path, None, epoch()).unwrap();

    let written: Json = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(written, json!({"Meter1": {"Voltage": 200.0, "Current": 2.5}}));
}
