mod loss_fn;

pub use loss_fn::{L1, LossFn, Mse, RgbLoss};
