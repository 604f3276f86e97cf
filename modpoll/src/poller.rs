use tracing::{debug, warn};

use crate::modbus::{
    decode::Decoded, DataType, Decoder, Device, ModbusTransport, RawData,
};

/// Decodes one read into the references of `device.pollers[poller]`.
///
/// References are visited in address order. Decoding stops at the first one
/// the data can't cover; it and everything after it keep their last value.
pub fn decode_into(device: &mut Device, poller: usize, data: &RawData) {
    let Some(window) = device.pollers.get(poller) else {
        return;
    };
    let start = window.start_address;
    let units = usize::from(window.effective_units());
    let mut decoder = Decoder::new(data, window.endian);

    for &index in &window.readable {
        let reference = &mut device.references[index];
        let Some(offset) = reference.address.checked_sub(start).map(usize::from) else {
            continue;
        };
        if offset + usize::from(reference.width()) > units {
            warn!(
                reference = %reference.name,
                "Reference lies past the end of the window, stopping decode"
            );
            break;
        }

        decoder.seek(offset);
        match decoder.decode(&reference.dtype) {
            Decoded::Value(value) => {
                debug!(reference = %reference.name, %value, "Decoded");
                reference.update_value(value);
            }
            Decoded::Skipped => match reference.dtype {
                DataType::Unknown(ref name) => {
                    debug!(
                        reference = %reference.name,
                        dtype = %name,
                        "Unknown data type, skipping"
                    );
                }
                ref dtype => {
                    warn!(
                        reference = %reference.name,
                        %dtype,
                        "Data type can't be read from this object type, skipping"
                    );
                }
            },
            Decoded::Exhausted => {
                warn!(
                    reference = %reference.name,
                    received = decoder.units(),
                    "Short response, stopping decode"
                );
                break;
            }
        }
    }
}

/// Issues the read for `device.pollers[poller]` and decodes the result.
///
/// Returns whether the read succeeded. Either way the outcome is recorded in
/// the device statistics; a failure never propagates further.
#[tracing::instrument(level = "debug", skip_all, fields(device = %device.name, poller = poller))]
pub async fn poll<T>(device: &mut Device, poller: usize, transport: &mut T) -> bool
where
    T: ModbusTransport + ?Sized,
{
    let Some(window) = device.pollers.get(poller) else {
        return false;
    };
    let (function, start, quantity) = (window.function, window.start_address, window.quantity);

    debug!(%function, start, quantity, "Reading");
    match transport.read(device.unit, function, start, quantity).await {
        Ok(data) => {
            decode_into(device, poller, &data);
            device.record_poll(poller, true);
            true
        }
        Err(error) => {
            warn!(device = %device.name, %function, start, quantity, %error, "Read failed");
            device.record_poll(poller, false);
            false
        }
    }
}

#[cfg(test)]
use crate::modbus::{
    transport::{fake::FakeTransport, TransportError},
    Access, EndianMode, FunctionCode, Poller, Reference, Value,
};
#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn meter() -> Device {
    crate::config::parse_rows(
        crate::config::tokenize(
            "device,Meter1,1
poll,holding_register,100,4,BE_BE
ref,Voltage,100,float32,r,V,1.0
ref,Current,102,float32,r,A,0.1
",
        )
        .unwrap(),
    )
    .remove(0)
}

#[tokio::test]
async fn poll_decodes_and_scales() {
    let mut device = meter();
    let mut transport = FakeTransport::default()
        .respond(Ok(RawData::Words(vec![0x4348, 0x0000, 0x41C8, 0x0000])));

    assert!(poll(&mut device, 0, &mut transport).await);

    assert_eq!(
        device.reference("Voltage").unwrap().value,
        Some(Value::Float(200.0))
    );
    let Some(Value::Float(current)) = device.reference("Current").unwrap().value else {
        panic!("expected a float");
    };
    assert!((current - 2.5).abs() < 1e-9);
    assert_eq!((device.poll_count, device.error_count), (1, 0));
    assert!(device.last_poll_success);
}

#[tokio::test]
async fn failed_reads_are_counted_and_keep_values() {
    let mut device = meter();
    let mut transport = FakeTransport::default()
        .respond(Ok(RawData::Words(vec![0x4348, 0x0000, 0x41C8, 0x0000])))
        .respond(Err(TransportError::Exception("IllegalDataAddress".into())))
        .respond(Err(TransportError::Timeout));

    assert!(poll(&mut device, 0, &mut transport).await);
    assert!(!poll(&mut device, 0, &mut transport).await);
    assert!(!poll(&mut device, 0, &mut transport).await);

    assert_eq!((device.poll_count, device.error_count), (3, 2));
    assert_eq!(device.pollers[0].consecutive_failures, 2);
    assert!(!device.last_poll_success);
    assert_eq!(
        device.reference("Voltage").unwrap().value,
        Some(Value::Float(200.0))
    );
}

#[test]
fn short_response_stops_decoding() {
    let mut device = meter();
    decode_into(&mut device, 0, &RawData::Words(vec![0x4348, 0x0000, 0x41C8]));
    assert_eq!(
        device.reference("Voltage").unwrap().value,
        Some(Value::Float(200.0))
    );
    assert_eq!(device.reference("Current").unwrap().value, None);
}

#[test]
fn unknown_types_do_not_abort_the_poll() {
    let mut device = Device::new("d", 1);
    device.pollers.push(Poller::new(
        FunctionCode::ReadInputRegisters,
        0,
        3,
        EndianMode::BigBig,
    ));
    device.attach(0, Reference::new("a", 0, DataType::parse("decimal128"), Access::Read));
    device.attach(0, Reference::new("b", 1, DataType::UInt16, Access::Read));
    device.attach(0, Reference::new("c", 2, DataType::Int16, Access::Read));

    decode_into(&mut device, 0, &RawData::Words(vec![9, 7, 0xFFFF]));

    assert_eq!(device.reference("a").unwrap().value, None);
    assert_eq!(device.reference("b").unwrap().value, Some(Value::UInt(7)));
    assert_eq!(device.reference("c").unwrap().value, Some(Value::Int(-1)));
}

#[test]
fn gaps_between_references_are_skipped() {
    let mut device = Device::new("d", 1);
    device.pollers.push(Poller::new(
        FunctionCode::ReadHoldingRegisters,
        10,
        6,
        EndianMode::BigBig,
    ));
    device.attach(0, Reference::new("late", 15, DataType::UInt16, Access::Read));
    device.attach(0, Reference::new("early", 11, DataType::UInt32, Access::Read));

    decode_into(&mut device, 0, &RawData::Words(vec![0, 1, 0, 0, 0, 42]));

    assert_eq!(device.reference("early").unwrap().value, Some(Value::UInt(0x10000)));
    assert_eq!(device.reference("late").unwrap().value, Some(Value::UInt(42)));
}

#[tokio::test]
async fn coils_decode_into_bit_sequences() {
    let mut device = Device::new("d", 3);
    device.pollers.push(Poller::new(
        FunctionCode::ReadCoils,
        0,
        12,
        EndianMode::default(),
    ));
    device.attach(0, Reference::new("low", 0, DataType::Bool8, Access::Read));
    device.attach(0, Reference::new("high", 1, DataType::Bool, Access::Read));

    let mut coils = vec![false; 12];
    coils[0] = true;
    coils[10] = true;
    let mut transport = FakeTransport::default().respond(Ok(RawData::Bits(coils)));

    assert!(poll(&mut device, 0, &mut transport).await);
    assert_eq!(
        transport.calls,
        vec![crate::modbus::transport::fake::Call::Read(3, FunctionCode::ReadCoils, 0, 12)]
    );

    let Some(Value::Bits(low)) = &device.reference("low").unwrap().value else {
        panic!("expected bits");
    };
    assert!(low[0] && !low[1]);
    let Some(Value::Bits(high)) = &device.reference("high").unwrap().value else {
        panic!("expected bits");
    };
    assert_eq!(high.len(), 8);
    assert!(high[2] && !high[4]);
}
