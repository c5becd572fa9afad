//! Bridge services between the peripheral and the bus

pub mod agent;
pub mod command;
pub mod dataparse;
pub mod driver;

pub use agent::{AgentDownHandler, AgentPayload, AgentService};
pub use command::{CommandService, PeripheralCommand};
pub use driver::BleDriver;
