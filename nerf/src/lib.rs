pub mod arch;
pub mod cameras;
pub mod error;
pub mod fields;
pub mod losses;
pub mod models;
pub mod rays;
pub mod renderers;
pub mod samplers;
pub mod scene_box;

pub use error::{NerfErr, Result};
