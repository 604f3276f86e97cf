use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tokio_modbus::client::Context as ModbusClient;
#[cfg(feature = "rtu")]
use tokio_modbus::client::rtu;
#[cfg(feature = "tcp")]
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::{Reader, SlaveContext, Writer};
use tracing::{debug, error};

use super::transport::{ModbusTransport, TransportError};
use super::{Unit, UnitId};
use crate::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// How to reach the Modbus network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModbusProto {
    Tcp {
        host: String,
        port: u16,
    },
    Udp {
        host: String,
        port: u16,
    },
    Rtu {
        tty: String,
        baud_rate: u32,
        parity: Parity,
    },
}

impl ModbusProto {
    /// Fails for protocols this build can't speak, so misconfiguration is
    /// caught before the first poll.
    pub fn check_supported(&self) -> crate::Result<()> {
        match self {
            #[cfg(feature = "tcp")]
            ModbusProto::Tcp { .. } => Ok(()),
            #[cfg(feature = "rtu")]
            ModbusProto::Rtu { .. } => Ok(()),
            #[cfg(not(feature = "tcp"))]
            ModbusProto::Tcp { .. } => Err(Error::UnsupportedTransport("tcp")),
            #[cfg(not(feature = "rtu"))]
            ModbusProto::Rtu { .. } => Err(Error::UnsupportedTransport("rtu")),
            // tokio-modbus has no UDP client.
            ModbusProto::Udp { .. } => Err(Error::UnsupportedTransport("udp")),
        }
    }

    async fn connect(&self) -> crate::Result<ModbusClient> {
        // The unit is set per request, so start with the broadcast address.
        let unit = Unit::broadcast();
        let client = match *self {
            #[cfg(feature = "tcp")]
            ModbusProto::Tcp { ref host, port } => {
                let socket_addr = tokio::net::lookup_host((host.as_str(), port))
                    .await?
                    .next()
                    .ok_or_else(|| Error::from(format!("{host} did not resolve to an address")))?;
                tcp::connect_slave(socket_addr, unit).await?
            }

            #[cfg(feature = "rtu")]
            ModbusProto::Rtu {
                ref tty,
                baud_rate,
                ref parity,
            } => {
                let parity = match parity {
                    Parity::None => tokio_serial::Parity::None,
                    Parity::Odd => tokio_serial::Parity::Odd,
                    Parity::Even => tokio_serial::Parity::Even,
                };
                let builder = tokio_serial::new(tty, baud_rate)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .flow_control(tokio_serial::FlowControl::None)
                    .parity(parity)
                    .stop_bits(tokio_serial::StopBits::One);
                let port = tokio_serial::SerialStream::open(&builder)?;
                rtu::attach_slave(port, unit)
            }

            _ => {
                error!(proto = ?self, "Unsupported protocol");
                self.check_supported()?;
                Err(Error::UnsupportedTransport("unknown"))?
            }
        };
        Ok(client)
    }
}

/// A [`ModbusTransport`] backed by a tokio-modbus client context.
///
/// The context is opened by `connect` and dropped by `close`; every request
/// is bounded by `timeout`.
pub struct Connection {
    proto: ModbusProto,
    timeout: Duration,
    client: Option<ModbusClient>,
}

impl Connection {
    pub fn new(proto: ModbusProto, timeout: Duration) -> Self {
        Self {
            proto,
            timeout,
            client: None,
        }
    }

    /// Runs one request against the open context, addressed to `unit`.
    async fn call<'a, T, F, Fut>(
        &'a mut self,
        unit: UnitId,
        request: F,
    ) -> Result<T, TransportError>
    where
        F: FnOnce(&'a mut ModbusClient) -> Fut,
        Fut: Future<Output = tokio_modbus::Result<T>> + 'a,
    {
        let timeout = self.timeout;
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client.set_slave(tokio_modbus::prelude::Slave(unit));

        match tokio::time::timeout(timeout, request(client)).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(error)) => Err(TransportError::Io(error.to_string())),
            Ok(Ok(Err(exception))) => Err(TransportError::Exception(format!("{exception:?}"))),
            Ok(Ok(Ok(response))) => Ok(response),
        }
    }
}

#[async_trait]
impl ModbusTransport for Connection {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.client.is_some() {
            return Ok(());
        }
        debug!(proto = ?self.proto, "Connecting");
        match tokio::time::timeout(self.timeout, self.proto.connect()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(error)) => Err(TransportError::Io(error.to_string())),
            Ok(Ok(client)) => {
                self.client = Some(client);
                Ok(())
            }
        }
    }

    async fn read_coils(
        &mut self,
        unit: UnitId,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.call(unit, |c| c.read_coils(address, quantity)).await
    }

    async fn read_discrete_inputs(
        &mut self,
        unit: UnitId,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.call(unit, |c| c.read_discrete_inputs(address, quantity)).await
    }

    async fn read_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.call(unit, |c| c.read_holding_registers(address, quantity)).await
    }

    async fn read_input_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.call(unit, |c| c.read_input_registers(address, quantity)).await
    }

    async fn write_coil(
        &mut self,
        unit: UnitId,
        address: u16,
        value: bool,
    ) -> Result<(), TransportError> {
        self.call(unit, |c| c.write_single_coil(address, value)).await
    }

    async fn write_coils(
        &mut self,
        unit: UnitId,
        address: u16,
        values: &[bool],
    ) -> Result<(), TransportError> {
        self.call(unit, |c| c.write_multiple_coils(address, values)).await
    }

    async fn write_register(
        &mut self,
        unit: UnitId,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        self.call(unit, |c| c.write_single_register(address, value)).await
    }

    async fn write_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        self.call(unit, |c| c.write_multiple_registers(address, values)).await
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            debug!(proto = ?self.proto, "Disconnected");
        }
    }
}

pub fn default_modbus_port() -> u16 {
    502
}

#[test]
fn udp_is_rejected_up_front() {
    let proto = ModbusProto::Udp {
        host: "127.0.0.1".into(),
        port: default_modbus_port(),
    };
    assert!(matches!(
        proto.check_supported(),
        Err(Error::UnsupportedTransport("udp"))
    ));
}

#[cfg(feature = "tcp")]
#[test]
fn tcp_is_supported() {
    let proto = ModbusProto::Tcp {
        host: "127.0.0.1".into(),
        port: 502,
    };
    assert!(proto.check_supported().is_ok());
}

#[tokio::test]
async fn requests_before_connect_fail() {
    let mut connection = Connection::new(
        ModbusProto::Tcp {
            host: "127.0.0.1".into(),
            port: 502,
        },
        Duration::from_millis(10),
    );
    assert!(matches!(
        connection.read_holding_registers(1, 0, 1).await,
        Err(TransportError::NotConnected)
    ));
}

#[cfg(feature = "tcp")]
#[tokio::test]
async fn tcp_hosts_are_resolved_by_name() {
    let Some(local) = tokio::net::lookup_host(("localhost", 0)).await.unwrap().next() else {
        return;
    };
    let listener = tokio::net::TcpListener::bind(local).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

    let mut connection = Connection::new(
        ModbusProto::Tcp {
            host: "localhost".into(),
            port,
        },
        Duration::from_secs(2),
    );
    connection.connect().await.unwrap();
    accept.await.unwrap().unwrap();
    connection.close().await;
}

#[tokio::test]
async fn unresolvable_hosts_fail_to_connect() {
    let mut connection = Connection::new(
        ModbusProto::Tcp {
            host: "plc.invalid".into(),
            port: 502,
        },
        Duration::from_secs(2),
    );
    assert!(connection.connect().await.is_err());
    assert!(matches!(
        connection.read_coils(1, 0, 1).await,
        Err(TransportError::NotConnected)
    ));
}
