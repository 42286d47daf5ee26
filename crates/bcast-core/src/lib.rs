//! Adaptive broadcast delivery engine.
//!
//! Delivers one logical message to a large recipient set through a transport
//! that accepts a single outbound call at a time. The transport and the
//! contact/list store live behind ports (traits) implemented by adapters.

pub mod audience;
pub mod batcher;
pub mod broadcast;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod isolation;
pub mod learning;
pub mod logging;
pub mod ports;
pub mod queue;
pub mod store;
pub mod throttled;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
