use std::{error::Error, fmt, io};

use nerf::NerfErr;

/// The uncertainty model's result type.
pub type Result<T> = std::result::Result<T, LaNerfErr>;

/// Failures building or configuring an uncertainty aware model.
#[derive(Debug)]
pub enum LaNerfErr {
    Io(io::Error),
    Json(serde_json::Error),
    InvalidConfig(String),
    Nerf(NerfErr),
}

impl fmt::Display for LaNerfErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaNerfErr::Io(e) => write!(f, "io error: {e}"),
            LaNerfErr::Json(e) => write!(f, "malformed configuration: {e}"),
            LaNerfErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            LaNerfErr::Nerf(e) => write!(f, "{e}"),
        }
    }
}

impl Error for LaNerfErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LaNerfErr::Io(e) => Some(e),
            LaNerfErr::Json(e) => Some(e),
            LaNerfErr::Nerf(e) => Some(e),
            LaNerfErr::InvalidConfig(_) => None,
        }
    }
}

impl From<io::Error> for LaNerfErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for LaNerfErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<NerfErr> for LaNerfErr {
    fn from(value: NerfErr) -> Self {
        Self::Nerf(value)
    }
}
