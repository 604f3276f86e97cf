//! The Device → Poller → Reference graph built from configuration rows.

use super::{DataType, EndianMode, FunctionCode, UnitId, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    /// `r`, `w` or `rw` in any case. An empty column means read-only.
    pub fn parse(s: &str) -> Self {
        let s = s.trim().to_lowercase();
        match (s.contains('r'), s.contains('w')) {
            (true, true) => Access::ReadWrite,
            (false, true) => Access::Write,
            _ => Access::Read,
        }
    }

    pub fn is_readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
}

/// One named, typed value inside a poller's address window.
#[derive(Clone, Debug, PartialEq)]
pub struct Reference {
    pub name: String,
    pub address: u16,
    pub dtype: DataType,
    pub access: Access,
    pub unit: Option<String>,
    pub scale: Option<f64>,
    pub value: Option<Value>,
    pub previous_value: Option<Value>,
}

impl Reference {
    pub fn new(name: impl Into<String>, address: u16, dtype: DataType, access: Access) -> Self {
        Self {
            name: name.into(),
            address,
            dtype,
            access,
            unit: None,
            scale: None,
            value: None,
            previous_value: None,
        }
    }

    pub fn width(&self) -> u16 {
        self.dtype.width()
    }

    /// `true` when the reference lies entirely inside `[start, start + size)`.
    pub fn check_sanity(&self, start: u16, size: u16) -> bool {
        let start = u32::from(start);
        let end = start + u32::from(size);
        let first = u32::from(self.address);
        let last = first + u32::from(self.width()) - 1;
        first >= start && last < end
    }

    /// Stores a freshly decoded value, scaled if a scale is configured.
    pub fn update_value(&mut self, raw: Value) {
        let value = match self.scale {
            Some(scale) => raw.scaled(scale),
            None => raw,
        };
        self.previous_value = self.value.replace(value);
    }

    pub fn changed(&self) -> bool {
        self.value != self.previous_value
    }

    /// Payload key: the name, or `name|unit` when a display unit is set.
    pub fn key(&self) -> String {
        match &self.unit {
            Some(unit) => format!("{}|{}", self.name, unit),
            None => self.name.clone(),
        }
    }
}

/// One scheduled read of a contiguous window.
#[derive(Clone, Debug, PartialEq)]
pub struct Poller {
    pub function: FunctionCode,
    pub start_address: u16,
    pub quantity: u16,
    pub endian: EndianMode,
    /// Indices into the owning device's references, ascending by address.
    pub readable: Vec<usize>,
    pub disabled: bool,
    pub consecutive_failures: u32,
}

impl Poller {
    pub fn new(
        function: FunctionCode,
        start_address: u16,
        quantity: u16,
        endian: EndianMode,
    ) -> Self {
        Self {
            function,
            start_address,
            quantity,
            endian,
            readable: Vec::new(),
            disabled: false,
            consecutive_failures: 0,
        }
    }

    /// Window size in units (packed bytes for bit reads, words otherwise).
    pub fn effective_units(&self) -> u16 {
        self.function.effective_units(self.quantity)
    }

    pub fn covers(&self, reference: &Reference) -> bool {
        reference.check_sanity(self.start_address, self.effective_units())
    }
}

/// A Modbus unit and everything polled from it.
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    pub name: String,
    pub unit: UnitId,
    pub pollers: Vec<Poller>,
    /// In declaration order; names are unique.
    pub references: Vec<Reference>,
    pub poll_count: u64,
    pub error_count: u64,
    pub last_poll_success: bool,
}

impl Device {
    pub fn new(name: impl Into<String>, unit: UnitId) -> Self {
        Self {
            name: name.into(),
            unit,
            pollers: Vec::new(),
            references: Vec::new(),
            poll_count: 0,
            error_count: 0,
            last_poll_success: false,
        }
    }

    pub fn reference(&self, name: &str) -> Option<&Reference> {
        self.references.iter().find(|r| r.name == name)
    }

    /// Adds a reference to the device and, when readable, to `poller`'s
    /// readable list in address order. Returns the reference's index.
    pub fn attach(&mut self, poller: usize, reference: Reference) -> usize {
        let index = self.references.len();
        let readable = reference.access.is_readable();
        let address = reference.address;
        self.references.push(reference);

        if readable {
            if let Some(poller) = self.pollers.get_mut(poller) {
                let references = &self.references;
                let at = poller
                    .readable
                    .partition_point(|&i| references[i].address <= address);
                poller.readable.insert(at, index);
            }
        }
        index
    }

    /// Records the outcome of one poll in both the device and poller counters.
    pub fn record_poll(&mut self, poller: usize, success: bool) {
        self.poll_count += 1;
        self.last_poll_success = success;
        if !success {
            self.error_count += 1;
        }
        if let Some(poller) = self.pollers.get_mut(poller) {
            if success {
                poller.consecutive_failures = 0;
            } else {
                poller.consecutive_failures += 1;
            }
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn access_parsing() {
    assert_eq!(Access::parse("r"), Access::Read);
    assert_eq!(Access::parse(""), Access::Read);
    assert_eq!(Access::parse("W"), Access::Write);
    assert_eq!(Access::parse("rw"), Access::ReadWrite);
    assert!(!Access::Write.is_readable());
}

#[test]
fn sanity_check_boundaries() {
    let r = Reference::new("v", 100, DataType::Float32, Access::Read);
    assert!(r.check_sanity(100, 2));
    assert!(!r.check_sanity(100, 1));
    assert!(!r.check_sanity(101, 4));
    assert!(r.check_sanity(99, 3));
    assert!(!r.check_sanity(99, 2));
}

#[test]
fn sanity_check_does_not_overflow_at_the_top_of_the_address_space() {
    let r = Reference::new("v", u16::MAX, DataType::UInt32, Access::Read);
    assert!(!r.check_sanity(u16::MAX, 1));
    assert!(r.check_sanity(u16::MAX - 1, 3));
}

#[test]
fn update_keeps_previous_value_and_scales() {
    let mut r = Reference::new("c", 0, DataType::UInt16, Access::Read);
    r.scale = Some(0.5);
    r.update_value(Value::UInt(4));
    assert_eq!(r.value, Some(Value::Float(2.0)));
    assert_eq!(r.previous_value, None);
    assert!(r.changed());

    r.update_value(Value::UInt(4));
    assert_eq!(r.previous_value, Some(Value::Float(2.0)));
    assert!(!r.changed());
}

#[test]
fn keys_include_units() {
    let mut r = Reference::new("Voltage", 0, DataType::Float32, Access::Read);
    assert_eq!(r.key(), "Voltage");
    r.unit = Some("V".into());
    assert_eq!(r.key(), "Voltage|V");
}

#[test]
fn readable_references_are_sorted_and_write_only_ones_are_not_polled() {
    let mut device = Device::new("d", 1);
    device.pollers.push(Poller::new(
        FunctionCode::ReadHoldingRegisters,
        0,
        10,
        EndianMode::default(),
    ));
    device.attach(0, Reference::new("c", 6, DataType::UInt16, Access::Read));
    device.attach(0, Reference::new("a", 2, DataType::UInt16, Access::ReadWrite));
    device.attach(0, Reference::new("w", 4, DataType::UInt16, Access::Write));
    device.attach(0, Reference::new("b", 4, DataType::UInt16, Access::Read));

    let names: Vec<_> = device.pollers[0]
        .readable
        .iter()
        .map(|&i| device.references[i].name.as_str())
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_eq!(device.references.len(), 4);
    assert!(device.reference("w").is_some());
}

#[test]
fn statistics() {
    let mut device = Device::new("d", 1);
    device.pollers.push(Poller::new(
        FunctionCode::ReadCoils,
        0,
        8,
        EndianMode::default(),
    ));
    device.record_poll(0, false);
    device.record_poll(0, false);
    assert_eq!(device.pollers[0].consecutive_failures, 2);
    assert_eq!((device.poll_count, device.error_count), (2, 2));
    assert!(!device.last_poll_success);

    device.record_poll(0, true);
    assert_eq!(device.pollers[0].consecutive_failures, 0);
    assert_eq!((device.poll_count, device.error_count), (3, 2));
    assert!(device.last_poll_success);
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn sanity_check_matches_the_window_definition(
            start in 0u16..1000,
            size in 1u16..130,
            address in 0u16..1200,
            dtype in prop_oneof![
                Just(DataType::UInt16),
                Just(DataType::Int32),
                Just(DataType::Float64),
                Just(DataType::String { width: 6 }),
            ],
        ) {
            let r = Reference::new("r", address, dtype, Access::Read);
            let end = u32::from(address) + u32::from(r.width()) - 1;
            let expected = address >= start && end < u32::from(start) + u32::from(size);
            prop_assert_eq!(r.check_sanity(start, size), expected);
        }

        #[test]
        fn sanity_check_edges(start in 0u16..1000, size in 1u16..130) {
            let inside_first = Reference::new("r", start, DataType::UInt16, Access::Read);
            let inside_last = Reference::new("r", start + size - 1, DataType::UInt16, Access::Read);
            let past_end = Reference::new("r", start + size, DataType::UInt16, Access::Read);
            let straddling = Reference::new("r", start + size - 1, DataType::UInt32, Access::Read);
            prop_assert!(inside_first.check_sanity(start, size));
            prop_assert!(inside_last.check_sanity(start, size));
            prop_assert!(!past_end.check_sanity(start, size));
            prop_assert!(!straddling.check_sanity(start, size));
            if start > 0 {
                let before = Reference::new("r", start - 1, DataType::UInt16, Access::Read);
                prop_assert!(!before.check_sanity(start, size));
            }
        }
    }
}
