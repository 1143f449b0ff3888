pub mod config;
pub mod core;
pub mod digest;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;

pub use config::{Config, FailurePolicy};
pub use error::{Error, Result};
pub use orchestration::{Coordinator, RunReport};
