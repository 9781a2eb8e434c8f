use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// A reconstruction loss between a rendered batch and its targets, averaged over every entry.
pub trait LossFn {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32;
}

/// Mean squared error.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mse;

impl LossFn for Mse {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        (&y_pred - &y).mapv(|e| e * e).mean().unwrap_or_default()
    }
}

/// Mean absolute error.
#[derive(Debug, Default, Clone, Copy)]
pub struct L1;

impl LossFn for L1 {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        (&y_pred - &y).mapv(f32::abs).mean().unwrap_or_default()
    }
}

/// The reconstruction loss selector exposed through the model configuration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RgbLoss {
    #[default]
    Mse,
    L1,
}

impl LossFn for RgbLoss {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        match self {
            RgbLoss::Mse => Mse.loss(y_pred, y),
            RgbLoss::L1 => L1.loss(y_pred, y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    #[test]
    fn l1_and_mse_disagree_on_large_errors() {
        let y_pred = array![[0., 0.], [2., 0.]];
        let y = array![[0., 0.], [0., 0.]];

        assert_eq!(L1.loss(y_pred.view(), y.view()), 0.5);
        assert_eq!(Mse.loss(y_pred.view(), y.view()), 1.0);
        assert_eq!(RgbLoss::L1.loss(y_pred.view(), y.view()), 0.5);
    }

    #[test]
    fn empty_batches_cost_nothing() {
        let empty = Array2::<f32>::zeros((0, 3));
        assert_eq!(RgbLoss::Mse.loss(empty.view(), empty.view()), 0.);
    }
}
