//! Smart-meter reading collector.
//!
//! Subscribes to per-field meter topics on an MQTT broker, reassembles the
//! fragments into one record per reporting cycle and writes each record to
//! a time-series store.

pub mod agent;
pub mod aggregator;
pub mod bus;
pub mod config;
pub mod export;
pub mod record;
pub mod registry;
pub mod store;
