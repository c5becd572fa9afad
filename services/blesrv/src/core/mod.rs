//! Core bridge components

pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod link;
pub mod logging;
pub mod multiplexer;
pub mod transport;
