//! The capability the poller and dispatcher need from a Modbus master.

use async_trait::async_trait;
use thiserror::Error;

use super::{FunctionCode, UnitId};

/// Raw payload of one read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawData {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

#[derive(Error, Debug)]
pub enum TransportError {
    /// The device answered with a Modbus exception.
    #[error("Modbus exception: {0}")]
    Exception(String),

    /// The request never got a valid answer.
    #[error("{0}")]
    Io(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Not connected")]
    NotConnected,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A Modbus master connection. Calls are exclusive: the caller holds `&mut`
/// for the duration of each request.
#[async_trait]
pub trait ModbusTransport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn read_coils(
        &mut self,
        unit: UnitId,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_discrete_inputs(
        &mut self,
        unit: UnitId,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn read_input_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_coil(
        &mut self,
        unit: UnitId,
        address: u16,
        value: bool,
    ) -> Result<(), TransportError>;

    async fn write_coils(
        &mut self,
        unit: UnitId,
        address: u16,
        values: &[bool],
    ) -> Result<(), TransportError>;

    async fn write_register(
        &mut self,
        unit: UnitId,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError>;

    async fn write_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError>;

    async fn close(&mut self);

    /// Issues the read selected by `function`.
    async fn read(
        &mut self,
        unit: UnitId,
        function: FunctionCode,
        address: u16,
        quantity: u16,
    ) -> Result<RawData, TransportError> {
        use FunctionCode::*;

        Ok(match function {
            ReadCoils => RawData::Bits(self.read_coils(unit, address, quantity).await?),
            ReadDiscreteInputs => {
                RawData::Bits(self.read_discrete_inputs(unit, address, quantity).await?)
            }
            ReadHoldingRegisters => {
                RawData::Words(self.read_holding_registers(unit, address, quantity).await?)
            }
            ReadInputRegisters => {
                RawData::Words(self.read_input_registers(unit, address, quantity).await?)
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted transport shared by the poller, dispatcher and bridge tests.

    use std::collections::VecDeque;

    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Call {
        Connect,
        Read(UnitId, FunctionCode, u16, u16),
        WriteCoil(UnitId, u16, bool),
        WriteCoils(UnitId, u16, Vec<bool>),
        WriteRegister(UnitId, u16, u16),
        WriteRegisters(UnitId, u16, Vec<u16>),
        Close,
    }

    /// Answers reads from a queue of scripted responses (an empty queue
    /// answers with an I/O error) and records every call.
    #[derive(Default)]
    pub struct FakeTransport {
        pub calls: Vec<Call>,
        pub responses: VecDeque<Result<RawData, TransportError>>,
        pub fail_writes: bool,
    }

    impl FakeTransport {
        pub fn respond(mut self, response: Result<RawData, TransportError>) -> Self {
            self.responses.push_back(response);
            self
        }

        pub fn reads(&self) -> usize {
            self.calls
                .iter()
                .filter(|c| matches!(c, Call::Read(..)))
                .count()
        }

        fn next(&mut self, call: Call) -> Result<RawData, TransportError> {
            self.calls.push(call);
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Io("no response scripted".into())))
        }

        fn write(&mut self, call: Call) -> Result<(), TransportError> {
            self.calls.push(call);
            if self.fail_writes {
                Err(TransportError::Exception("IllegalDataAddress".into()))
            } else {
                Ok(())
            }
        }
    }

    fn bits(data: RawData) -> Result<Vec<bool>, TransportError> {
        match data {
            RawData::Bits(bits) => Ok(bits),
            RawData::Words(_) => Err(TransportError::Io("scripted words for a bit read".into())),
        }
    }

    fn words(data: RawData) -> Result<Vec<u16>, TransportError> {
        match data {
            RawData::Words(words) => Ok(words),
            RawData::Bits(_) => Err(TransportError::Io("scripted bits for a word read".into())),
        }
    }

    #[async_trait]
    impl ModbusTransport for FakeTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            self.calls.push(Call::Connect);
            Ok(())
        }

        async fn read_coils(
            &mut self,
            unit: UnitId,
            address: u16,
            quantity: u16,
        ) -> Result<Vec<bool>, TransportError> {
            bits(self.next(Call::Read(unit, FunctionCode::ReadCoils, address, quantity))?)
        }

        async fn read_discrete_inputs(
            &mut self,
            unit: UnitId,
            address: u16,
            quantity: u16,
        ) -> Result<Vec<bool>, TransportError> {
            bits(self.next(Call::Read(unit, FunctionCode::ReadDiscreteInputs, address, quantity))?)
        }

        async fn read_holding_registers(
            &mut self,
            unit: UnitId,
            address: u16,
            quantity: u16,
        ) -> Result<Vec<u16>, TransportError> {
            let call = Call::Read(unit, FunctionCode::ReadHoldingRegisters, address, quantity);
            words(self.next(call)?)
        }

        async fn read_input_registers(
            &mut self,
            unit: UnitId,
            address: u16,
            quantity: u16,
        ) -> Result<Vec<u16>, TransportError> {
            let call = Call::Read(unit, FunctionCode::ReadInputRegisters, address, quantity);
            words(self.next(call)?)
        }

        async fn write_coil(
            &mut self,
            unit: UnitId,
            address: u16,
            value: bool,
        ) -> Result<(), TransportError> {
            self.write(Call::WriteCoil(unit, address, value))
        }

        async fn write_coils(
            &mut self,
            unit: UnitId,
            address: u16,
            values: &[bool],
        ) -> Result<(), TransportError> {
            self.write(Call::WriteCoils(unit, address, values.to_vec()))
        }

        async fn write_register(
            &mut self,
            unit: UnitId,
            address: u16,
            value: u16,
        ) -> Result<(), TransportError> {
            self.write(Call::WriteRegister(unit, address, value))
        }

        async fn write_registers(
            &mut self,
            unit: UnitId,
            address: u16,
            values: &[u16],
        ) -> Result<(), TransportError> {
            self.write(Call::WriteRegisters(unit, address, values.to_vec()))
        }

        async fn close(&mut self) {
            self.calls.push(Call::Close);
        }
    }
}
