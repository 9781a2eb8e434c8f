mod density_field;
mod embedding;
mod encoding;
mod field;
mod nerfacto_field;

pub use density_field::DensityField;
pub use embedding::Embedding;
pub use encoding::{FrequencyEncoding, SceneContraction};
pub use field::{DensityFn, Field, FieldOutputs, analytic_normals, normalize_rows, unflatten};
pub use nerfacto_field::{FieldFeatures, NerfactoField, NerfactoFieldConfig};
