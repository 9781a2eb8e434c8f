mod model;
mod nerfacto;

pub use model::{Batch, LossDict, MetricsDict, Model, ModelOutputs, ProposalTrace};
pub use nerfacto::{NerfactoModel, NerfactoModelConfig};
