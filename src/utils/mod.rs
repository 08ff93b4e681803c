//! Logging setup and host checks

mod logging;
mod network;

pub use logging::{setup_logging, LogConfig};
pub use network::{internet_accessible, reachable};
