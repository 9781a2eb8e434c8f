use std::{fs, path::Path};

use nerf::{
    arch::{activations::ActFn, loss::RgbLoss},
    models::NerfactoModelConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{LaNerfErr, Result};

/// Which library computes the curvature of the field.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaplaceBackend {
    #[default]
    Nnj,
    Backpack,
    /// No Laplace approximation at all, the field renders without uncertainty.
    None,
}

/// How predictions are taken out of the weight posterior.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaplaceMethod {
    /// Monte-Carlo sampling of the posterior weights.
    #[default]
    Laplace,
    /// Closed form variance of the network linearized at the MAP weights.
    LinearizedLaplace,
}

/// The structure kept of the curvature matrix.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HessianShape {
    #[default]
    Diag,
    Kron,
    Full,
}

/// The hidden activations the uncertainty field can be built with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenActFn {
    Relu,
    #[default]
    Tanh,
    Elu,
}

impl From<HiddenActFn> for ActFn {
    fn from(value: HiddenActFn) -> Self {
        match value {
            HiddenActFn::Relu => ActFn::Relu,
            HiddenActFn::Tanh => ActFn::Tanh,
            HiddenActFn::Elu => ActFn::Elu,
        }
    }
}

/// The density output activations the uncertainty field can be built with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutActFn {
    #[default]
    Softplus,
    #[serde(rename = "truncexp")]
    TruncExp,
}

impl From<OutActFn> for ActFn {
    fn from(value: OutActFn) -> Self {
        match value {
            OutActFn::Softplus => ActFn::Softplus,
            OutActFn::TruncExp => ActFn::TruncExp,
        }
    }
}

/// Hyperparameters of the uncertainty aware nerfacto model.
///
/// Every nerfacto option is accepted at the top level next to the Laplace ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaNerfModelConfig {
    #[serde(flatten)]
    pub base: NerfactoModelConfig,
    pub laplace_backend: LaplaceBackend,
    pub laplace_method: LaplaceMethod,
    /// Posterior draws per forward pass of the `laplace` method.
    pub laplace_num_samples: usize,
    pub laplace_hessian_shape: HessianShape,
    pub act_fn: HiddenActFn,
    pub out_act_fn: OutActFn,
    /// Whether the curvature is updated after every backward pass.
    pub online_laplace: bool,
    /// Whether the curvature is an exponential moving average instead of a running sum.
    pub hessian_update_ema: bool,
    pub laplace_prior_precision: f32,
    pub hessian_ema_decay: f32,
}

impl Default for LaNerfModelConfig {
    fn default() -> Self {
        Self {
            base: NerfactoModelConfig {
                rgb_loss: RgbLoss::L1,
                ..Default::default()
            },
            laplace_backend: LaplaceBackend::Nnj,
            laplace_method: LaplaceMethod::Laplace,
            laplace_num_samples: 100,
            laplace_hessian_shape: HessianShape::Diag,
            act_fn: HiddenActFn::Tanh,
            out_act_fn: OutActFn::Softplus,
            online_laplace: false,
            hessian_update_ema: true,
            laplace_prior_precision: 1.,
            hessian_ema_decay: 0.99,
        }
    }
}

impl LaNerfModelConfig {
    /// Reads a configuration out of a json file and validates it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parses a json object of options and validates it. Absent options take the values of
    /// [`LaNerfModelConfig::default`], including the inherited nerfacto ones.
    pub fn from_json(raw: &str) -> Result<Self> {
        let overrides: Map<String, Value> = serde_json::from_str(raw)?;

        let mut options = match serde_json::to_value(Self::default())? {
            Value::Object(defaults) => defaults,
            _ => Map::new(),
        };
        options.extend(overrides);

        let config: Self = serde_json::from_value(Value::Object(options))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values a model cannot be built from.
    pub fn validate(&self) -> Result<()> {
        self.base.validate()?;

        if self.laplace_num_samples == 0 {
            return Err(LaNerfErr::InvalidConfig(
                "laplace_num_samples must be positive".into(),
            ));
        }
        if !(self.laplace_prior_precision > 0.) {
            return Err(LaNerfErr::InvalidConfig(format!(
                "laplace_prior_precision must be positive, got {}",
                self.laplace_prior_precision
            )));
        }
        if !(0. ..1.).contains(&self.hessian_ema_decay) {
            return Err(LaNerfErr::InvalidConfig(format!(
                "hessian_ema_decay must lie in [0, 1), got {}",
                self.hessian_ema_decay
            )));
        }

        Ok(())
    }

    /// Whether the field computes any uncertainty.
    pub fn uses_laplace(&self) -> bool {
        self.laplace_backend != LaplaceBackend::None
    }
}
