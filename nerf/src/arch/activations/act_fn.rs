use serde::{Deserialize, Serialize};

/// Pointwise activation functions used by the field networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActFn {
    Relu,
    Tanh,
    Elu,
    Sigmoid,
    Softplus,
    /// Exponential with the input clamped to keep the gradient finite.
    #[serde(rename = "truncexp")]
    TruncExp,
}
use ActFn::*;

const TRUNC_EXP_MAX: f32 = 15.;

impl ActFn {
    pub fn f(&self, z: f32) -> f32 {
        match self {
            Relu => z.max(0.),
            Tanh => z.tanh(),
            Elu => {
                if z > 0. {
                    z
                } else {
                    z.exp_m1()
                }
            }
            Sigmoid => 1. / (1. + (-z).exp()),
            Softplus => softplus(z),
            TruncExp => z.exp(),
        }
    }

    pub fn df(&self, z: f32) -> f32 {
        match self {
            Relu => {
                if z > 0. {
                    1.
                } else {
                    0.
                }
            }
            Tanh => 1. - z.tanh().powi(2),
            Elu => {
                if z > 0. {
                    1.
                } else {
                    z.exp()
                }
            }
            Sigmoid => {
                let s = Sigmoid.f(z);
                s * (1. - s)
            }
            Softplus => Sigmoid.f(z),
            TruncExp => z.min(TRUNC_EXP_MAX).exp(),
        }
    }
}

fn softplus(z: f32) -> f32 {
    // log(1 + e^z) without overflowing for large z
    if z > 20. { z } else { z.exp().ln_1p() }
}
