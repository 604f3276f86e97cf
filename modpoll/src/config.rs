//! Builds the device graph from configuration rows.
//!
//! Rows are `device,<name>,<unit>`, `poll,<object type>,<start>,<quantity>,<endian>`
//! and `ref,<name>,<address>,<dtype>,<rw>[,<unit>[,<scale>]]`. A bad row is
//! logged and skipped; it never aborts the parse.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::modbus::{Access, DataType, Device, EndianMode, FunctionCode, Poller, Reference};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("Invalid {kind} row: {reason}")]
    Invalid { kind: &'static str, reason: String },

    #[error("Device {0:?} is already defined")]
    DuplicateDevice(String),

    #[error("No device to add poller to")]
    OrphanPoller,

    #[error("No device/poller for reference {0:?}")]
    OrphanReference(String),

    #[error("Unknown function code ({0}), ignoring poller")]
    UnknownFunctionCode(String),

    #[error("Too many {function} objects (max. {max}): {quantity}, ignoring poller")]
    PollerRangeExceeded {
        function: FunctionCode,
        quantity: u16,
        max: u16,
    },

    #[error("Reference {0:?} is already added, ignoring it")]
    ReferenceDuplicate(String),

    #[error("Reference {0:?} failed to pass sanity check, ignoring it")]
    ReferenceOutOfRange(String),
}

fn invalid(kind: &'static str, reason: impl Into<String>) -> RowError {
    RowError::Invalid {
        kind,
        reason: reason.into(),
    }
}

/// A rejected row, with its 1-based row number (comments and blank lines
/// are not counted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub line: usize,
    pub error: RowError,
}

/// Incremental parser: rows may come from several sources, in order.
#[derive(Debug, Default)]
pub struct Parser {
    devices: Vec<Device>,
    /// Whether the last `device` row was accepted. Rows following a rejected
    /// device have nowhere to go.
    device_open: bool,
    /// Index of the current poller within the last device.
    poller: Option<usize>,
    rejected: Vec<Rejected>,
    line: usize,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_rows<I, R, S>(&mut self, rows: I)
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[S]>,
        S: AsRef<str>,
    {
        for row in rows {
            self.line += 1;
            let row: Vec<&str> = row.as_ref().iter().map(|c| c.as_ref().trim()).collect();
            if let Err(error) = self.push_row(&row) {
                warn!(line = self.line, %error, "Skipping configuration row");
                self.rejected.push(Rejected {
                    line: self.line,
                    error,
                });
            }
        }
    }

    pub fn rejected(&self) -> &[Rejected] {
        &self.rejected
    }

    pub fn finish(self) -> Vec<Device> {
        self.devices
    }

    fn push_row(&mut self, row: &[&str]) -> Result<(), RowError> {
        let Some(kind) = row.first().map(|c| c.to_lowercase()) else {
            return Ok(());
        };

        if kind.contains("device") {
            self.push_device(row)
        } else if kind.contains("poll") {
            self.push_poller(row)
        } else if kind.contains("ref") {
            self.push_reference(row)
        } else {
            Ok(())
        }
    }

    fn push_device(&mut self, row: &[&str]) -> Result<(), RowError> {
        self.device_open = false;
        self.poller = None;

        let [_, name, unit, ..] = row else {
            return Err(invalid("device", "expected device,<name>,<unit id>"));
        };
        if name.is_empty() {
            return Err(invalid("device", "empty device name"));
        }
        let unit = unit
            .parse()
            .map_err(|_| invalid("device", format!("invalid unit id {unit:?}")))?;
        if self.devices.iter().any(|d| d.name == *name) {
            return Err(RowError::DuplicateDevice(name.to_string()));
        }

        debug!(device = name, unit, "Add device");
        self.devices.push(Device::new(*name, unit));
        self.device_open = true;
        Ok(())
    }

    fn push_poller(&mut self, row: &[&str]) -> Result<(), RowError> {
        self.poller = None;
        if !self.device_open {
            return Err(RowError::OrphanPoller);
        }
        let device = self.devices.last_mut().ok_or(RowError::OrphanPoller)?;

        let [_, function, start, quantity, endian, ..] = row else {
            return Err(invalid(
                "poll",
                "expected poll,<object type>,<start>,<quantity>,<endian>",
            ));
        };
        let (Ok(start), Ok(quantity)) = (start.parse::<u16>(), quantity.parse::<u16>()) else {
            return Err(invalid("poll", "invalid start address or size"));
        };
        let function = FunctionCode::from_object_type(function)
            .ok_or_else(|| RowError::UnknownFunctionCode(function.to_string()))?;
        if quantity > function.max_quantity() {
            return Err(RowError::PollerRangeExceeded {
                function,
                quantity,
                max: function.max_quantity(),
            });
        }

        debug!(device = %device.name, %function, start, quantity, "Add poller");
        device
            .pollers
            .push(Poller::new(function, start, quantity, EndianMode::parse(endian)));
        self.poller = Some(device.pollers.len() - 1);
        Ok(())
    }

    fn push_reference(&mut self, row: &[&str]) -> Result<(), RowError> {
        let name = row.get(1).map(|n| n.replace(' ', "_")).unwrap_or_default();
        let (Some(device), Some(poller)) = (self.devices.last_mut(), self.poller) else {
            return Err(RowError::OrphanReference(name));
        };
        if !self.device_open {
            return Err(RowError::OrphanReference(name));
        }

        let [_, _, address, dtype, rw, rest @ ..] = row else {
            return Err(invalid(
                "ref",
                "expected ref,<name>,<address>,<dtype>,<rw>[,<unit>[,<scale>]]",
            ));
        };
        if name.is_empty() {
            return Err(invalid("ref", "empty reference name"));
        }
        let address = address
            .parse()
            .map_err(|_| invalid("ref", format!("invalid address for reference {name}")))?;

        let mut reference =
            Reference::new(&name, address, DataType::parse(dtype), Access::parse(rw));
        reference.unit = rest.first().filter(|u| !u.is_empty()).map(|u| u.to_string());
        reference.scale = rest.get(1).and_then(|s| s.parse().ok());

        let window = &device.pollers[poller];
        let address_taken = reference.access.is_readable()
            && window
                .readable
                .iter()
                .any(|&i| device.references[i].address == reference.address);
        if address_taken || device.reference(&reference.name).is_some() {
            return Err(RowError::ReferenceDuplicate(name));
        }
        if !window.covers(&reference) {
            return Err(RowError::ReferenceOutOfRange(name));
        }

        debug!(device = %device.name, reference = %name, "Add reference");
        device.attach(poller, reference);
        Ok(())
    }
}

/// Parses one sequence of rows into devices.
pub fn parse_rows<I, R, S>(rows: I) -> Vec<Device>
where
    I: IntoIterator<Item = R>,
    R: AsRef<[S]>,
    S: AsRef<str>,
{
    let mut parser = Parser::new();
    parser.push_rows(rows);
    parser.finish()
}

/// Splits CSV text into rows. `#` starts a comment line.
pub fn tokenize(text: &str) -> crate::Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_owned).collect());
    }
    Ok(rows)
}

/// Reads a configuration from an http(s) URL or a local path.
pub async fn fetch(location: &str) -> crate::Result<String> {
    match Url::parse(location) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            debug!(%url, "Fetching configuration");
            let response = reqwest::get(url).await?.error_for_status()?;
            Ok(response.text().await?)
        }
        _ => Ok(std::fs::read_to_string(Path::new(location))?),
    }
}

/// Loads every location in order into one device list.
///
/// Fails with [`Error::ConfigEmpty`](crate::Error::ConfigEmpty) when no device
/// survives parsing.
pub async fn load<S: AsRef<str>>(locations: &[S]) -> crate::Result<Vec<Device>> {
    let mut parser = Parser::new();
    for location in locations {
        let location = location.as_ref();
        info!(location, "Loading config");
        let text = fetch(location).await?;
        parser.push_rows(tokenize(&text)?);
    }

    let devices = parser.finish();
    if devices.is_empty() {
        return Err(crate::Error::ConfigEmpty);
    }
    info!("Added {} device(s)", devices.len());
    Ok(devices)
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn rows(text: &str) -> Vec<Vec<String>> {
    tokenize(text).unwrap()
}

#[cfg(test)]
const METER: &str = "\
device,Meter1,1
poll,holding_register,100,4,BE_BE
ref,Voltage,100,float32,r,V,1.0
ref,Current,102,float32,r,A,0.1
";

#[test]
fn parse_meter_example() {
    let devices = parse_rows(rows(METER));
    assert_eq!(devices.len(), 1);

    let meter = &devices[0];
    assert_eq!(meter.name, "Meter1");
    assert_eq!(meter.unit, 1);
    assert_eq!(meter.pollers.len(), 1);

    let poller = &meter.pollers[0];
    assert_eq!(poller.function, FunctionCode::ReadHoldingRegisters);
    assert_eq!((poller.start_address, poller.quantity), (100, 4));
    assert_eq!(poller.endian, EndianMode::BigBig);
    assert_eq!(poller.readable, vec![0, 1]);

    let current = meter.reference("Current").unwrap();
    assert_eq!(current.address, 102);
    assert_eq!(current.dtype, DataType::Float32);
    assert_eq!(current.unit.as_deref(), Some("A"));
    assert_eq!(current.scale, Some(0.1));
}

#[test]
fn parsing_is_idempotent() {
    assert_eq!(parse_rows(rows(METER)), parse_rows(rows(METER)));
}

#[test]
fn orphan_rows_are_skipped() {
    let mut parser = Parser::new();
    parser.push_rows(rows(
        "poll,coil,0,8,BE_BE\n\
         ref,a,0,bool,r\n\
         device,d,1\n\
         ref,b,0,bool,r\n\
         poll,coil,0,8,BE_BE\n\
         ref,c,0,bool,r\n",
    ));
    assert_eq!(
        parser.rejected(),
        &[
            Rejected {
                line: 1,
                error: RowError::OrphanPoller
            },
            Rejected {
                line: 2,
                error: RowError::OrphanReference("a".into())
            },
            Rejected {
                line: 4,
                error: RowError::OrphanReference("b".into())
            },
        ]
    );
    let devices = parser.finish();
    assert_eq!(devices[0].references.len(), 1);
}

#[test]
fn unknown_function_code_drops_the_poller_and_its_references() {
    let mut parser = Parser::new();
    parser.push_rows(rows(
        "device,d,1\n\
         poll,register,0,8,BE_BE\n\
         ref,a,0,uint16,r\n\
         poll,input_register,0,2,BE_BE\n\
         ref,b,0,uint16,r\n",
    ));
    assert_eq!(
        parser.rejected()[0].error,
        RowError::UnknownFunctionCode("register".into())
    );
    assert_eq!(parser.rejected()[1].error, RowError::OrphanReference("a".into()));
    let devices = parser.finish();
    assert_eq!(devices[0].pollers.len(), 1);
    assert_eq!(devices[0].references.len(), 1);
}

#[test]
fn poller_quantity_limits() {
    let mut parser = Parser::new();
    parser.push_rows(rows(
        "device,d,1\n\
         poll,coil,0,2000,BE_BE\n\
         poll,coil,0,2001,BE_BE\n\
         poll,holding_register,0,123,BE_BE\n\
         poll,input_register,0,124,BE_BE\n",
    ));
    let errors: Vec<_> = parser.rejected().iter().map(|r| r.line).collect();
    assert_eq!(errors, vec![3, 5]);
    assert!(matches!(
        parser.rejected()[1].error,
        RowError::PollerRangeExceeded { quantity: 124, max: 123, .. }
    ));
    assert_eq!(parser.finish()[0].pollers.len(), 2);
}

#[test]
fn duplicate_and_out_of_range_references() {
    let mut parser = Parser::new();
    parser.push_rows(rows(
        "device,d,1
poll,holding_register,10,4,BE_LE
ref,a,10,uint16,r
ref,b,10,int16,r
ref,a,11,int16,r
ref,w,10,uint16,w
ref,c,13,uint32,r
ref,e,9,uint16,r
ref,f,12,uint32,rw
",
    ));
    let errors: Vec<_> = parser.rejected().iter().map(|r| r.error.clone()).collect();
    assert_eq!(
        errors,
        vec![
            RowError::ReferenceDuplicate("b".into()),
            RowError::ReferenceDuplicate("a".into()),
            RowError::ReferenceOutOfRange("c".into()),
            RowError::ReferenceOutOfRange("e".into()),
        ]
    );
    let device = &parser.finish()[0];
    let names: Vec<_> = device.references.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a", "w", "f"]);
    assert_eq!(device.pollers[0].readable, vec![0, 2]);
}

#[test]
fn coil_windows_are_checked_in_packed_units() {
    let mut parser = Parser::new();
    parser.push_rows(rows(
        "device,d,1\npoll,coil,0,10,BE_BE\nref,a,0,bool8,r\nref,b,1,bool8,r\nref,c,2,bool8,r\n",
    ));
    assert_eq!(
        parser.rejected()[0].error,
        RowError::ReferenceOutOfRange("c".into())
    );
}

#[test]
fn duplicate_devices_orphan_their_rows() {
    let mut parser = Parser::new();
    parser.push_rows(rows(
        "device,d,1\npoll,coil,0,8,BE_BE\ndevice,d,2\npoll,coil,0,8,BE_BE\nref,a,0,bool,r\n",
    ));
    let errors: Vec<_> = parser.rejected().iter().map(|r| r.error.clone()).collect();
    assert_eq!(
        errors,
        vec![
            RowError::DuplicateDevice("d".into()),
            RowError::OrphanPoller,
            RowError::OrphanReference("a".into()),
        ]
    );
    let devices = parser.finish();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].unit, 1);
}

#[test]
fn reference_columns() {
    let devices = parse_rows(rows(
        "device,d,1\n\
         poll,holding_register,0,10,LE_LE\n\
         ref,my value,0,uint16,,,\n\
         ref,b,1,uint16,r,kWh,abc\n\
         ref,c,2,uint16,rw,,0.5\n",
    ));
    let device = &devices[0];
    let a = device.reference("my_value").unwrap();
    assert_eq!(a.access, Access::Read);
    assert_eq!((a.unit.clone(), a.scale), (None, None));
    let b = device.reference("b").unwrap();
    assert_eq!((b.unit.as_deref(), b.scale), (Some("kWh"), None));
    let c = device.reference("c").unwrap();
    assert_eq!((c.access, c.unit.clone(), c.scale), (Access::ReadWrite, None, Some(0.5)));
}

#[test]
fn malformed_rows_and_unknown_tokens() {
    let mut parser = Parser::new();
    parser.push_rows(rows(
        "# comment, ignored\ndevice,d\ndevice,d,x\nfoo,bar\ndevice,ok,3\npoll,coil,a,8,BE_BE\n",
    ));
    let lines: Vec<_> = parser.rejected().iter().map(|r| r.line).collect();
    assert_eq!(lines, vec![1, 2, 5]);
    assert_eq!(parser.finish().len(), 1);
}

#[test]
fn multiple_sources_share_one_namespace() {
    let mut parser = Parser::new();
    parser.push_rows(rows("device,a,1\n"));
    parser.push_rows(rows("device,b,2\ndevice,a,3\n"));
    assert_eq!(parser.rejected().len(), 1);
    assert_eq!(parser.finish().len(), 2);
}

#[tokio::test]
async fn load_reads_local_files() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(METER.as_bytes()).unwrap();
    let path = file.path().to_str().unwrap().to_owned();

    let devices = load(&[path]).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].references.len(), 2);
}

#[tokio::test]
async fn load_fails_without_devices() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"poll,coil,0,8,BE_BE\n").unwrap();
    let path = file.path().to_str().unwrap().to_owned();

    assert!(matches!(load(&[path]).await, Err(crate::Error::ConfigEmpty)));
}
