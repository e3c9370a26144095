pub mod network;
pub mod config;
pub mod error;
pub mod utils;

pub use error::{SnifferError, Result};
pub use config::{CaptureConfig, Config};
