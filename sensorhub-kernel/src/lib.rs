//! Sensorhub kernel - live-data fan-out for the dashboard
//!
//! Two producers feed one store:
//! - the broker bridge (MQTT sensor topics)
//! - the probe poller (system commands on an interval)
//!
//! Every accepted sample is pushed to all connected viewers.

pub mod bridge;
pub mod config;
pub mod health;
pub mod http;
pub mod hub;
pub mod ingest;
pub mod models;
pub mod poller;
pub mod store;
