pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod notify;
pub mod paths;
pub mod pool;
pub mod queue;
pub mod store;
pub mod transition;
pub mod types;
pub mod worker;

pub use engine::Engine;
pub use error::{AppflowError, Result};
