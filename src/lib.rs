#![allow(clippy::result_large_err)]

pub mod aggregate;
pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod line;
pub mod logging;
pub mod metrics;
pub mod poller;
pub mod producer;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod telemetry;

pub mod transport;

pub use app::{MonitorApp, RunReport};
pub use config::MonitorConfig;
pub use error::{Error, Result};
