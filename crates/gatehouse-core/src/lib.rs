pub mod config;
pub mod error;
pub mod flow;
pub mod instance;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{GatehouseError, Result};
pub use types::*;
