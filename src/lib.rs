pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod process;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestration::{Collaborators, EngineHandle, RuntimeEngine};
