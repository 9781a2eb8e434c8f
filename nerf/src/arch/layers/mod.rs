mod dense;
mod mlp;

pub use dense::Dense;
pub use mlp::Mlp;
