//! iFit BLE protocol: wire codec, characteristic catalog, equipment client,
//! MITM interceptor, and FTMS relay.

#[macro_use]
extern crate log;

pub mod catalog;
pub mod client;
pub mod codec;
pub mod discovery;
pub mod equipment;
pub mod error;
pub mod ftms;
pub mod interceptor;
pub mod persist;
pub mod transport;
pub mod value;

pub use client::EquipmentClient;
pub use error::{Error, Result};
pub use equipment::EquipmentInformation;
pub use ftms::FtmsRelay;
pub use interceptor::{CapturedActivation, Interceptor};
pub use value::Value;
