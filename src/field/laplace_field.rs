use log::{debug, info};
use ndarray::{Array1, Array2, ArrayD, ArrayView2, Axis, concatenate};
use nerf::{
    Result,
    arch::activations::ActFn,
    fields::{DensityFn, Field, FieldFeatures, FieldOutputs, NerfactoField, unflatten},
    rays::RaySamples,
    scene_box::SceneBox,
};
use rand::{SeedableRng, rngs::StdRng};

use super::{LastLayerLaplace, Predictive};
use crate::config::{LaNerfModelConfig, LaplaceBackend, LaplaceMethod};

/// Appends a column of ones so the bias is part of the layer inputs.
fn augment(features: ArrayView2<f32>) -> Result<Array2<f32>> {
    let ones = Array2::ones((features.nrows(), 1));
    Ok(concatenate(Axis(1), &[features, ones.view()])?)
}

/// A nerfacto field whose color and density heads carry a last-layer Laplace posterior.
///
/// Besides density and color every query yields the posterior mean color, the color spread
/// and the density spread.
#[derive(Debug, Clone)]
pub struct LaNerfactoField {
    field: NerfactoField,
    backend: LaplaceBackend,
    method: LaplaceMethod,
    num_samples: usize,
    online_laplace: bool,
    seed: u64,
    rng: StdRng,
    rgb_laplace: LastLayerLaplace,
    density_laplace: LastLayerLaplace,
    /// Features of the last training query, folded into the curvature after the backward pass.
    pending: Option<FieldFeatures>,
}

impl LaNerfactoField {
    /// Creates a new `LaNerfactoField`.
    ///
    /// # Arguments
    /// * `scene_box` - The box enclosing the scene.
    /// * `config` - The model configuration.
    /// * `num_images` - The amount of training images.
    pub fn new(scene_box: SceneBox, config: &LaNerfModelConfig, num_images: usize) -> Result<Self> {
        let act_fn = config.act_fn.into();
        let field_config = config
            .base
            .field_config(num_images, act_fn, config.out_act_fn.into());
        let field = NerfactoField::new(scene_box, &field_config)?;

        let shape = config.laplace_hessian_shape;
        let ema_decay = config.hessian_update_ema.then_some(config.hessian_ema_decay);
        let rgb_dim = field.mlp_head().output_layer().dim().0 + 1;
        let density_dim = field.mlp_base().output_layer().dim().0 + 1;

        info!(
            backend:? = config.laplace_backend,
            method:? = config.laplace_method,
            hessian:? = shape;
            "built laplace field"
        );

        Ok(Self {
            field,
            backend: config.laplace_backend,
            method: config.laplace_method,
            num_samples: config.laplace_num_samples,
            online_laplace: config.online_laplace,
            seed: config.base.seed,
            rng: StdRng::seed_from_u64(config.base.seed),
            rgb_laplace: LastLayerLaplace::new(
                shape,
                3,
                rgb_dim,
                config.laplace_prior_precision,
                ema_decay,
            ),
            density_laplace: LastLayerLaplace::new(
                shape,
                1,
                density_dim,
                config.laplace_prior_precision,
                ema_decay,
            ),
            pending: None,
        })
    }

    /// The curvature of the color head.
    pub fn hessian(&self) -> ArrayD<f32> {
        self.rgb_laplace.hessian().to_array()
    }

    /// The curvature of the density head.
    pub fn density_hessian(&self) -> ArrayD<f32> {
        self.density_laplace.hessian().to_array()
    }

    /// Folds the curvature of the samples seen by a query into both posteriors.
    pub fn update_hessian(&mut self, features: &FieldFeatures) -> Result<()> {
        if self.backend == LaplaceBackend::None {
            return Ok(());
        }

        let density_act_fn = self.field.density_act_fn();
        let rgb_jac = features.rgb_pre.mapv(|z| ActFn::Sigmoid.df(z).powi(2));
        let density_jac = features
            .density_pre
            .mapv(|z| density_act_fn.df(z).powi(2))
            .insert_axis(Axis(1));

        let rgb_inputs = augment(features.color_features.view())?;
        let density_inputs = augment(features.density_features.view())?;

        self.rgb_laplace.update(rgb_inputs.view(), rgb_jac.view())?;
        self.density_laplace
            .update(density_inputs.view(), density_jac.view())?;

        debug!(points = features.rgb_pre.nrows(); "updated laplace curvature");
        Ok(())
    }

    /// Folds in the curvature of the last training query, if any.
    pub fn after_backward(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(features) => self.update_hessian(&features),
            None => Ok(()),
        }
    }

    /// Folds in the curvature at `ray_samples`.
    pub fn fit(&mut self, ray_samples: &RaySamples) -> Result<()> {
        let features = self.field.forward_features(ray_samples)?;
        self.update_hessian(&features)
    }

    fn predictive(&mut self, features: &FieldFeatures) -> Result<(Predictive, Predictive)> {
        let rgb_inputs = augment(features.color_features.view())?;
        let density_inputs = augment(features.density_features.view())?;
        let density_pre = features.density_pre.view().insert_axis(Axis(1));
        let density_act_fn = self.field.density_act_fn();

        match self.method {
            LaplaceMethod::LinearizedLaplace => Ok((
                self.rgb_laplace.linearized(
                    rgb_inputs.view(),
                    features.rgb_pre.view(),
                    ActFn::Sigmoid,
                )?,
                self.density_laplace
                    .linearized(density_inputs.view(), density_pre, density_act_fn)?,
            )),
            LaplaceMethod::Laplace => {
                let mut eval_rng;
                let rng = if self.field.training() {
                    &mut self.rng
                } else {
                    eval_rng = StdRng::seed_from_u64(self.seed);
                    &mut eval_rng
                };

                let rgb = self.rgb_laplace.sampled(
                    rgb_inputs.view(),
                    features.rgb_pre.view(),
                    ActFn::Sigmoid,
                    self.num_samples,
                    rng,
                )?;
                let density = self.density_laplace.sampled(
                    density_inputs.view(),
                    density_pre,
                    density_act_fn,
                    self.num_samples,
                    rng,
                )?;

                Ok((rgb, density))
            }
        }
    }
}

impl DensityFn for LaNerfactoField {
    fn density(&self, positions: ArrayView2<f32>) -> Result<Array1<f32>> {
        self.field.density(positions)
    }
}

impl Field for LaNerfactoField {
    fn forward(
        &mut self,
        ray_samples: &RaySamples,
        compute_normals: bool,
    ) -> Result<FieldOutputs> {
        let features = self.field.forward_features(ray_samples)?;
        let mut outputs = self
            .field
            .outputs_from_features(ray_samples, &features, compute_normals)?;

        if self.backend != LaplaceBackend::None {
            let (n, s) = (features.num_rays, features.num_samples);
            let (rgb, density) = self.predictive(&features)?;

            outputs.rgb = unflatten(rgb.draw, n, s)?;
            outputs.rgb_mu = Some(unflatten(rgb.mean, n, s)?);
            outputs.rgb_sigma = Some(unflatten(rgb.sigma, n, s)?);
            outputs.density_sigma = Some(unflatten(density.sigma, n, s)?);
        }

        if self.online_laplace && self.field.training() {
            self.pending = Some(features);
        }

        Ok(outputs)
    }

    fn set_training(&mut self, training: bool) {
        self.field.set_training(training);
        if !training {
            self.pending = None;
        }
    }
}
