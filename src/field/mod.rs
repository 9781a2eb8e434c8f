mod hessian;
mod laplace;
mod laplace_field;

pub use hessian::Hessian;
pub use laplace::{LastLayerLaplace, Predictive};
pub use laplace_field::LaNerfactoField;
