pub mod config;
pub mod error;
pub mod field;
pub mod model;
pub mod stats;

pub use config::LaNerfModelConfig;
pub use error::{LaNerfErr, Result};
pub use model::LaNerfModel;
