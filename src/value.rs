//! Dynamic-typed characteristic values.
//!
//! The source stores read results in a `name -> value` mapping whose value
//! types depend on which converter produced them. Rather than a
//! heterogeneous hashmap, values here are a small tagged sum with typed
//! accessors.

use crate::catalog::Mode;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Pulse {
        pulse: u8,
        average: u8,
        count: u8,
        source: PulseSource,
    },
    Mode(Mode),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseSource {
    No = 0,
    Hand = 1,
    Unknown = 2,
    Unknown2 = 3,
    Ble = 4,
}

impl PulseSource {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => PulseSource::No,
            1 => PulseSource::Hand,
            4 => PulseSource::Ble,
            3 => PulseSource::Unknown2,
            _ => PulseSource::Unknown,
        }
    }
}

impl Value {
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            Value::Integer(v) => Ok(*v as f64),
            other => Err(Error::protocol(format!("{other:?} is not numeric"))),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Integer(v) => Ok(*v),
            Value::Float(v) => Ok(*v as i64),
            other => Err(Error::protocol(format!("{other:?} is not an integer"))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(Error::protocol(format!("{other:?} is not a bool"))),
        }
    }

    pub fn as_mode(&self) -> Result<Mode> {
        match self {
            Value::Mode(m) => Ok(*m),
            other => Err(Error::protocol(format!("{other:?} is not a Mode"))),
        }
    }

    pub fn as_pulse(&self) -> Result<(u8, u8, u8, PulseSource)> {
        match self {
            Value::Pulse {
                pulse,
                average,
                count,
                source,
            } => Ok((*pulse, *average, *count, *source)),
            other => Err(Error::protocol(format!("{other:?} is not a Pulse value"))),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Pulse { pulse, .. } => write!(f, "{pulse} bpm"),
            Value::Mode(m) => write!(f, "{m:?}"),
            Value::Bytes(b) => write!(f, "{b:02x?}"),
        }
    }
}
