use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire radiance field module.
pub type Result<T> = std::result::Result<T, NerfErr>;

/// The radiance field module's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum NerfErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    InvalidConfig(String),
    Shape(String),
    EmptyBatch,
    /// An output channel a computation depends on was not rendered.
    MissingOutput(&'static str),
    Numerical(String),
}

impl Display for NerfErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NerfErr::SizeMismatch {
                what,
                got,
                expected,
            } => {
                format!("There's a size mismatch in {what}, got {got} and expected {expected}")
            }
            NerfErr::InvalidConfig(msg) => format!("invalid config: {msg}"),
            NerfErr::Shape(msg) => format!("invalid array shape: {msg}"),
            NerfErr::EmptyBatch => "the batch has no rays".to_string(),
            NerfErr::MissingOutput(name) => format!("the model outputs lack {name}"),
            NerfErr::Numerical(msg) => format!("numerical failure: {msg}"),
        };

        write!(f, "{s}")
    }
}

impl Error for NerfErr {}

impl From<ndarray::ShapeError> for NerfErr {
    fn from(value: ndarray::ShapeError) -> Self {
        Self::Shape(value.to_string())
    }
}
