//! Byte transports for the serial multiplexer
//!
//! The multiplexer owns any full-duplex async byte stream. In production that
//! is a `tokio_serial::SerialStream`; tests use an in-memory duplex pipe with
//! a scripted peripheral on the far end.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │      SerialMultiplexer       │
//! └──────────────┬───────────────┘
//!                │ AsyncRead + AsyncWrite
//!        ┌───────┴────────┐
//!        ▼                ▼
//! ┌─────────────┐  ┌──────────────┐
//! │ SerialStream│  │ DuplexStream │
//! │ (hardware)  │  │ (mock)       │
//! └─────────────┘  └──────────────┘
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod serial;

use tokio::io::{AsyncRead, AsyncWrite};

pub use serial::open_serial;

/// Any byte stream the multiplexer can own
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
