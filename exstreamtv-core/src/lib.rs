pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod playout;
pub mod provider;
pub mod repository;
pub mod schedule;
pub mod service;
pub mod source;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
