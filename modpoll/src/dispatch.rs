//! Routes inbound write commands to the right device.

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    modbus::{Device, ModbusTransport, TransportError},
    topic::TopicPattern,
};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Topic {0:?} does not match the subscribe pattern")]
    TopicMismatch(String),

    #[error("Device {0:?} not found")]
    DeviceNotFound(String),

    #[error("Malformed write command: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Writing to {0:?} is not supported")]
    UnsupportedObjectType(String),

    #[error("Value {0} does not fit in a register")]
    ValueOutOfRange(i64),

    #[error("Write failed: {0}")]
    Transport(#[from] TransportError),
}

/// A single value or a run of consecutive values starting at `address`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum WriteValue {
    Scalar(i64),
    Vector(Vec<i64>),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WriteCommand {
    pub object_type: String,
    pub address: u16,
    pub value: WriteValue,
}

impl WriteCommand {
    pub fn parse(payload: &[u8]) -> Result<Self, DispatchError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

fn register(value: i64) -> Result<u16, DispatchError> {
    u16::try_from(value).map_err(|_| DispatchError::ValueOutOfRange(value))
}

/// Performs `command` on `device`, connecting for the duration of the write.
#[tracing::instrument(level = "debug", skip(device, transport), fields(device = %device.name))]
pub async fn write<T>(
    device: &Device,
    command: &WriteCommand,
    transport: &mut T,
) -> Result<(), DispatchError>
where
    T: ModbusTransport + ?Sized,
{
    let unit = device.unit;
    let address = command.address;

    // Validate everything before touching the bus.
    enum Request {
        Coil(bool),
        Coils(Vec<bool>),
        Register(u16),
        Registers(Vec<u16>),
    }
    let request = match (command.object_type.as_str(), &command.value) {
        ("coil", WriteValue::Scalar(v)) => Request::Coil(*v != 0),
        ("coil", WriteValue::Vector(vs)) => Request::Coils(vs.iter().map(|v| *v != 0).collect()),
        ("holding_register", WriteValue::Scalar(v)) => Request::Register(register(*v)?),
        ("holding_register", WriteValue::Vector(vs)) => {
            Request::Registers(vs.iter().copied().map(register).collect::<Result<_, _>>()?)
        }
        (other, _) => return Err(DispatchError::UnsupportedObjectType(other.to_owned())),
    };

    transport.connect().await?;
    let result = match &request {
        Request::Coil(v) => transport.write_coil(unit, address, *v).await,
        Request::Coils(vs) => transport.write_coils(unit, address, vs).await,
        Request::Register(v) => transport.write_register(unit, address, *v).await,
        Request::Registers(vs) => transport.write_registers(unit, address, vs).await,
    };
    transport.close().await;
    result?;

    info!(object_type = %command.object_type, address, "Write succeeded");
    Ok(())
}

/// Handles one inbound message end to end: topic, device lookup, payload,
/// write. Every failure is logged and returned; none is fatal.
pub async fn dispatch<T>(
    devices: &[Device],
    subscribe: &TopicPattern,
    topic: &str,
    payload: &[u8],
    transport: &mut T,
) -> Result<(), DispatchError>
where
    T: ModbusTransport + ?Sized,
{
    let result: Result<(), DispatchError> = async {
        let name = subscribe
            .match_device(topic)
            .ok_or_else(|| DispatchError::TopicMismatch(topic.to_owned()))?;
        let device = devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| DispatchError::DeviceNotFound(name.to_owned()))?;
        let command = WriteCommand::parse(payload)?;
        write(device, &command, transport).await
    }
    .await;

    if let Err(error) = &result {
        warn!(topic, %error, "Write command rejected");
    }
    result
}

#[cfg(test)]
use crate::modbus::transport::fake::{Call, FakeTransport};
#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn devices() -> Vec<Device> {
    vec![Device::new("Meter1", 1), Device::new("Pump", 7)]
}

#[cfg(test)]
fn pattern() -> TopicPattern {
    TopicPattern::new("modpoll/{{device_name}}/set").unwrap()
}

#[tokio::test]
async fn coil_write_reaches_the_device_once() {
    let mut transport = FakeTransport::default();
    dispatch(
        &devices(),
        &pattern(),
        "modpoll/Meter1/set",
        br#"{"object_type":"coil","address":5,"value":1}"#,
        &mut transport,
    )
    .await
    .unwrap();

    assert_eq!(
        transport.calls,
        vec![Call::Connect, Call::WriteCoil(1, 5, true), Call::Close]
    );
}

#[tokio::test]
async fn register_writes() {
    let mut transport = FakeTransport::default();
    dispatch(
        &devices(),
        &pattern(),
        "modpoll/Pump/set",
        br#"{"object_type":"holding_register","address":40,"value":[1,2,65535]}"#,
        &mut transport,
    )
    .await
    .unwrap();
    dispatch(
        &devices(),
        &pattern(),
        "modpoll/Pump/set",
        br#"{"object_type":"holding_register","address":41,"value":300}"#,
        &mut transport,
    )
    .await
    .unwrap();
    dispatch(
        &devices(),
        &pattern(),
        "modpoll/Pump/set",
        br#"{"object_type":"coil","address":0,"value":[0,2]}"#,
        &mut transport,
    )
    .await
    .unwrap();

    let writes: Vec<_> = transport
        .calls
        .into_iter()
        .filter(|c| !matches!(c, Call::Connect | Call::Close))
        .collect();
    assert_eq!(
        writes,
        vec![
            Call::WriteRegisters(7, 40, vec![1, 2, 65535]),
            Call::WriteRegister(7, 41, 300),
            Call::WriteCoils(7, 0, vec![false, true]),
        ]
    );
}

#[tokio::test]
async fn rejected_commands_never_touch_the_transport() {
    let mut transport = FakeTransport::default();
    let cases: [(&str, &[u8]); 6] = [
        ("modpoll/Meter1/data", br#"{"object_type":"coil","address":5,"value":1}"#),
        ("modpoll/Nope/set", br#"{"object_type":"coil","address":5,"value":1}"#),
        ("modpoll/Meter1/set", br#"{"object_type":"coil","value":1}"#),
        ("modpoll/Meter1/set", b"not json"),
        ("modpoll/Meter1/set", br#"{"object_type":"input_register","address":5,"value":1}"#),
        ("modpoll/Meter1/set", br#"{"object_type":"holding_register","address":5,"value":-1}"#),
    ];

    let mut errors = vec![];
    for (topic, payload) in cases {
        errors.push(
            dispatch(&devices(), &pattern(), topic, payload, &mut transport)
                .await
                .unwrap_err(),
        );
    }

    assert!(matches!(errors[0], DispatchError::TopicMismatch(_)));
    assert!(matches!(&errors[1], DispatchError::DeviceNotFound(name) if name == "Nope"));
    assert!(matches!(errors[2], DispatchError::Malformed(_)));
    assert!(matches!(errors[3], DispatchError::Malformed(_)));
    assert!(matches!(&errors[4], DispatchError::UnsupportedObjectType(t) if t == "input_register"));
    assert!(matches!(errors[5], DispatchError::ValueOutOfRange(-1)));
    assert!(transport.calls.is_empty());
}

#[tokio::test]
async fn transport_failures_are_reported() {
    let mut transport = FakeTransport {
        fail_writes: true,
        ..Default::default()
    };
    let result = dispatch(
        &devices(),
        &pattern(),
        "modpoll/Meter1/set",
        br#"{"object_type":"coil","address":5,"value":0}"#,
        &mut transport,
    )
    .await;

    assert!(matches!(result, Err(DispatchError::Transport(TransportError::Exception(_)))));
    assert_eq!(
        transport.calls,
        vec![Call::Connect, Call::WriteCoil(1, 5, false), Call::Close]
    );
}
