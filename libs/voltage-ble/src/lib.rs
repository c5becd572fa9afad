//! Voltage BLE Protocol Library
//!
//! Pure protocol pieces for driving an AT-command BLE module over a serial
//! line. Nothing in this crate performs I/O.
//!
//! # Architecture
//!
//! - **`command`**: validated AT command builders and fixed commands
//! - **`response`**: line classification (report / terminal / raw) and
//!   response checking with the failure reason preserved
//! - **`packet`**: frame layout, fragmentation and one-shot reassembly
//! - **`reassembly`**: incremental single-buffer reassembly with eviction
//! - **`codec`**: `tokio-util` codec that finds frames in a byte stream
//!
//! Wire frame layout:
//!
//! ```text
//! ┌────────────────┬──────────────┬──────────────┬─────────┬────────┐
//! │ Prefix (ASCII) │ index u16 BE │ total u16 BE │ payload │ "\r\n" │
//! └────────────────┴──────────────┴──────────────┴─────────┴────────┘
//! ```

pub mod codec;
pub mod command;
pub mod error;
pub mod packet;
pub mod reassembly;
pub mod response;

pub use codec::PacketCodec;
pub use command::BleRole;
pub use error::{BleError, Result};
pub use packet::{FrameFormat, Packet, DEFAULT_MTU, HEADER_SIZE};
pub use reassembly::Reassembler;
pub use response::{check_response, classify_line, BleState, LineKind, TerminalStatus};
