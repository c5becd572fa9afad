//! BLE Serial Bridge Service (blesrv)
//!
//! Bridges a BLE module driven over a serial AT-command line to an MQTT
//! message bus.
//!
//! - `core::multiplexer` shares one serial line between command/response
//!   traffic, `+COMMAND:` reports and raw peripheral data
//! - `core::controller` drives the module (init sequence, queries)
//! - `core::link` carries JSON documents as fragmented notify packets
//! - `bus` provides envelopes and request/response over publish/subscribe
//! - `service` answers peripheral commands and relays raw data

pub mod bus;
pub mod core;
pub mod error;
pub mod service;

pub use error::{BleSrvError, Result};
