//! Message bus: envelopes, transports and the RPC client

pub mod client;
pub mod envelope;
pub mod mqtt;
pub mod topic;
pub mod transport;

pub use client::{BusClient, EnvelopeHandler, DEFAULT_REQUEST_TIMEOUT};
pub use envelope::Envelope;
pub use mqtt::MqttBusTransport;
pub use transport::{BusMessage, BusTransport, MemoryBus};
