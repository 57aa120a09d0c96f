//! Static protocol tables: equipment/command/mode enums, characteristic
//! converters, and the characteristic catalog.

use std::collections::HashMap;
use std::sync::OnceLock;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::{Error, Result};
use crate::value::{PulseSource, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum SportsEquipment {
    General = 2,
    Treadmill = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Command {
    WriteAndRead = 0x02,
    Calibrate = 0x06,
    SupportedCapabilities = 0x80,
    EquipmentInformation = 0x81,
    EquipmentReference = 0x82,
    EquipmentFirmware = 0x84,
    SupportedCommands = 0x88,
    Enable = 0x90,
    EquipmentSerial = 0x95,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Mode {
    Unknown = 0,
    Idle = 1,
    Active = 2,
    Pause = 3,
    Summary = 4,
    Settings = 7,
    MissingSafetyKey = 8,
}

/// Chunk-index sentinels used by the BLE framing layer.
pub mod chunk_index {
    pub const HEADER: u8 = 0xFE;
    pub const EOF: u8 = 0xFF;
}

/// A pure, immutable (size, decode, encode) triple for one characteristic's
/// wire representation. Modeled as a trait so the catalog can hold
/// `&'static dyn Converter` the way a function-pair table would, while
/// still supporting new converters without
/// touching the enum of existing ones.
pub trait Converter: Send + Sync {
    /// Fixed size in bytes this converter always reads/writes.
    fn size(&self) -> usize;
    fn decode(&self, buf: &[u8]) -> Result<Value>;
    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()>;
}

fn need(buf: &[u8], n: usize) -> Result<()> {
    if buf.len() < n {
        Err(Error::protocol(format!(
            "short buffer: need {n} bytes, have {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

pub struct DoubleConverter;
impl Converter for DoubleConverter {
    fn size(&self) -> usize {
        2
    }
    fn decode(&self, buf: &[u8]) -> Result<Value> {
        need(buf, 2)?;
        let raw = u16::from_le_bytes([buf[0], buf[1]]);
        Ok(Value::Float(raw as f64 / 100.0))
    }
    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        let raw = (value.as_f64()? * 100.0).round() as u16;
        out.extend_from_slice(&raw.to_le_bytes());
        Ok(())
    }
}

pub struct TwoBytesIntConverter;
impl Converter for TwoBytesIntConverter {
    fn size(&self) -> usize {
        2
    }
    fn decode(&self, buf: &[u8]) -> Result<Value> {
        need(buf, 2)?;
        Ok(Value::Integer(u16::from_le_bytes([buf[0], buf[1]]) as i64))
    }
    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        let raw = value.as_i64()? as u16;
        out.extend_from_slice(&raw.to_le_bytes());
        Ok(())
    }
}

pub struct FourBytesIntConverter;
impl Converter for FourBytesIntConverter {
    fn size(&self) -> usize {
        4
    }
    fn decode(&self, buf: &[u8]) -> Result<Value> {
        need(buf, 4)?;
        Ok(Value::Integer(
            u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as i64,
        ))
    }
    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        let raw = value.as_i64()? as u32;
        out.extend_from_slice(&raw.to_le_bytes());
        Ok(())
    }
}

pub struct OneByteIntConverter;
impl Converter for OneByteIntConverter {
    fn size(&self) -> usize {
        1
    }
    fn decode(&self, buf: &[u8]) -> Result<Value> {
        need(buf, 1)?;
        Ok(Value::Integer(buf[0] as i64))
    }
    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        out.push(value.as_i64()? as u8);
        Ok(())
    }
}

pub struct ModeConverter;
impl Converter for ModeConverter {
    fn size(&self) -> usize {
        1
    }
    fn decode(&self, buf: &[u8]) -> Result<Value> {
        need(buf, 1)?;
        let mode = Mode::from_u8(buf[0])
            .ok_or_else(|| Error::protocol(format!("unknown Mode byte {:#x}", buf[0])))?;
        Ok(Value::Mode(mode))
    }
    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        out.push(value.as_mode()? as u8);
        Ok(())
    }
}

pub struct BooleanConverter;
impl Converter for BooleanConverter {
    fn size(&self) -> usize {
        1
    }
    fn decode(&self, buf: &[u8]) -> Result<Value> {
        need(buf, 1)?;
        Ok(Value::Bool(buf[0] != 0))
    }
    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        out.push(if value.as_bool()? { 1 } else { 0 });
        Ok(())
    }
}

/// `100_000_000 / 1024` is the denominator observed in source; the unit is
/// undocumented, but the constant is preserved
/// verbatim so round-trips don't drift.
pub const CALORIES_DENOMINATOR: f64 = 100_000_000.0 / 1024.0;

pub struct CaloriesConverter;
impl Converter for CaloriesConverter {
    fn size(&self) -> usize {
        4
    }
    fn decode(&self, buf: &[u8]) -> Result<Value> {
        need(buf, 4)?;
        let raw = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Ok(Value::Float(raw as f64 / CALORIES_DENOMINATOR))
    }
    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        let raw = (value.as_f64()? * CALORIES_DENOMINATOR).round() as u32;
        out.extend_from_slice(&raw.to_le_bytes());
        Ok(())
    }
}

pub struct PulseConverter;
impl Converter for PulseConverter {
    fn size(&self) -> usize {
        4
    }
    fn decode(&self, buf: &[u8]) -> Result<Value> {
        need(buf, 4)?;
        Ok(Value::Pulse {
            pulse: buf[0],
            average: buf[1],
            count: buf[2],
            source: PulseSource::from_u8(buf[3]),
        })
    }
    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        let (pulse, _average, _count, source) = value.as_pulse()?;
        out.extend_from_slice(&[pulse, 0, 0, source as u8]);
        Ok(())
    }
}

pub static DOUBLE: DoubleConverter = DoubleConverter;
pub static TWO_BYTES_INT: TwoBytesIntConverter = TwoBytesIntConverter;
pub static FOUR_BYTES_INT: FourBytesIntConverter = FourBytesIntConverter;
pub static ONE_BYTE_INT: OneByteIntConverter = OneByteIntConverter;
pub static MODE: ModeConverter = ModeConverter;
pub static BOOLEAN: BooleanConverter = BooleanConverter;
pub static CALORIES: CaloriesConverter = CaloriesConverter;
pub static PULSE: PulseConverter = PulseConverter;

#[derive(Clone, Copy)]
pub struct CharacteristicDefinition {
    pub id: u8,
    pub name: &'static str,
    pub read_only: bool,
    pub converter: Option<&'static (dyn Converter + Sync)>,
}

macro_rules! characteristic {
    ($id:expr, $name:expr, $converter:expr, writable) => {
        CharacteristicDefinition {
            id: $id,
            name: $name,
            read_only: false,
            converter: Some($converter),
        }
    };
    ($id:expr, $name:expr, $converter:expr) => {
        CharacteristicDefinition {
            id: $id,
            name: $name,
            read_only: true,
            converter: Some($converter),
        }
    };
}

/// Canonical catalog subset. A device only ever
/// advertises a subset of this table (`EquipmentInformation::characteristics`);
/// this is the universe those subsets are drawn from.
pub const CATALOG: &[CharacteristicDefinition] = &[
    characteristic!(0, "Kph", &DOUBLE, writable),
    characteristic!(1, "Incline", &DOUBLE, writable),
    characteristic!(4, "CurrentDistance", &FOUR_BYTES_INT),
    characteristic!(6, "Distance", &FOUR_BYTES_INT),
    characteristic!(9, "Volume", &ONE_BYTE_INT, writable),
    characteristic!(10, "Pulse", &PULSE, writable),
    characteristic!(11, "UpTime", &FOUR_BYTES_INT),
    characteristic!(12, "Mode", &MODE, writable),
    characteristic!(13, "Calories", &CALORIES),
    characteristic!(16, "CurrentKph", &DOUBLE),
    characteristic!(17, "CurrentIncline", &DOUBLE),
    characteristic!(20, "CurrentTime", &FOUR_BYTES_INT),
    characteristic!(21, "CurrentCalories", &CALORIES),
    characteristic!(27, "MaxIncline", &DOUBLE),
    characteristic!(28, "MinIncline", &DOUBLE),
    characteristic!(30, "MaxKph", &DOUBLE),
    characteristic!(31, "MinKph", &DOUBLE),
    characteristic!(36, "Metric", &BOOLEAN, writable),
    characteristic!(49, "MaxPulse", &ONE_BYTE_INT),
    characteristic!(52, "AverageIncline", &DOUBLE),
    characteristic!(70, "TotalTime", &FOUR_BYTES_INT),
    characteristic!(103, "PausedTime", &FOUR_BYTES_INT),
];

fn by_id() -> &'static HashMap<u8, &'static CharacteristicDefinition> {
    static MAP: OnceLock<HashMap<u8, &'static CharacteristicDefinition>> = OnceLock::new();
    MAP.get_or_init(|| CATALOG.iter().map(|c| (c.id, c)).collect())
}

fn by_name() -> &'static HashMap<&'static str, &'static CharacteristicDefinition> {
    static MAP: OnceLock<HashMap<&'static str, &'static CharacteristicDefinition>> =
        OnceLock::new();
    MAP.get_or_init(|| CATALOG.iter().map(|c| (c.name, c)).collect())
}

pub fn lookup_by_id(id: u8) -> Option<&'static CharacteristicDefinition> {
    by_id().get(&id).copied()
}

pub fn lookup_by_name(name: &str) -> Option<&'static CharacteristicDefinition> {
    by_name().get(name).copied()
}

/// Resolves a caller-supplied name or numeric-id string to a catalog entry,
/// producing a case-insensitive-hint error for `write`.
pub fn resolve(name: &str) -> Result<&'static CharacteristicDefinition> {
    if let Some(def) = lookup_by_name(name) {
        return Ok(def);
    }
    if let Ok(id) = name.parse::<u8>() {
        if let Some(def) = lookup_by_id(id) {
            return Ok(def);
        }
    }
    let hint = by_name()
        .keys()
        .find(|known| known.eq_ignore_ascii_case(name))
        .map(|known| format!(" (did you mean \"{known}\"?)"))
        .unwrap_or_default();
    Err(Error::invalid_argument(format!(
        "unknown characteristic \"{name}\"{hint}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_round_trips() {
        let v = Value::Float(8.0);
        let mut buf = Vec::new();
        DOUBLE.encode(&v, &mut buf).unwrap();
        assert_eq!(buf, vec![0x20, 0x03]);
        assert_eq!(DOUBLE.decode(&buf).unwrap(), v);
    }

    #[test]
    fn calories_round_trips_without_fp_drift() {
        let v = Value::Float(42.0);
        let mut buf = Vec::new();
        CALORIES.encode(&v, &mut buf).unwrap();
        let back = CALORIES.decode(&buf).unwrap();
        match back {
            Value::Float(f) => assert!((f - 42.0).abs() < 1e-6),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn max_kph_has_id_30() {
        assert_eq!(lookup_by_name("MaxKph").unwrap().id, 30);
    }

    #[test]
    fn unknown_name_suggests_case_insensitive_match() {
        let err = resolve("maxkph").unwrap_err();
        assert!(format!("{err}").contains("MaxKph"));
    }

    #[test]
    fn writable_characteristics_match_spec() {
        for name in ["Kph", "Incline", "Volume", "Pulse", "Mode", "Metric"] {
            assert!(!lookup_by_name(name).unwrap().read_only, "{name}");
        }
        for name in ["CurrentKph", "MaxKph", "Calories"] {
            assert!(lookup_by_name(name).unwrap().read_only, "{name}");
        }
    }
}
