use log::{debug, info};
use ndarray::{Array2, Axis};
use nerf::{
    NerfErr, Result as NerfResult,
    arch::loss::LossFn,
    fields::FieldOutputs,
    losses::{distortion_loss, interlevel_loss, psnr},
    models::{Batch, LossDict, MetricsDict, Model, ModelOutputs, NerfactoModel, ProposalTrace},
    rays::{RayBundle, RaySamples},
    renderers::UncertaintyRenderer,
    scene_box::SceneBox,
};

use crate::{Result, config::LaNerfModelConfig, field::LaNerfactoField, stats::HessianSummary};

/// Nerfacto with per-ray color and density uncertainty out of a Laplace approximation of the
/// field's output layers.
pub struct LaNerfModel {
    config: LaNerfModelConfig,
    base: NerfactoModel<LaNerfactoField>,
    renderer_uq: UncertaintyRenderer,
}

impl LaNerfModel {
    /// Creates a new `LaNerfModel`.
    ///
    /// # Arguments
    /// * `config` - The model configuration, fixed for the model's lifetime.
    /// * `scene_box` - The box enclosing the scene.
    /// * `num_train_data` - The amount of training images.
    pub fn new(
        config: LaNerfModelConfig,
        scene_box: SceneBox,
        num_train_data: usize,
    ) -> Result<Self> {
        config.validate()?;

        let field = LaNerfactoField::new(scene_box.clone(), &config, num_train_data)?;
        let base = NerfactoModel::with_field(config.base.clone(), scene_box, field)?;

        info!(
            laplace = config.uses_laplace(),
            online = config.online_laplace,
            samples = config.laplace_num_samples;
            "built laplace nerf model"
        );

        Ok(Self {
            config,
            base,
            renderer_uq: UncertaintyRenderer,
        })
    }

    pub fn config(&self) -> &LaNerfModelConfig {
        &self.config
    }

    pub fn field(&self) -> &LaNerfactoField {
        self.base.field()
    }

    /// Folds the curvature at the samples of `ray_bundle` into the field posterior.
    pub fn fit_laplace(&mut self, ray_bundle: &RayBundle) -> NerfResult<()> {
        let (ray_samples, _, _) = self.base.sample(ray_bundle)?;
        self.base.field_mut().fit(&ray_samples)
    }

    fn get_outputs_nerfacto(
        &mut self,
        ray_samples: &RaySamples,
    ) -> NerfResult<(FieldOutputs, ModelOutputs, Array2<f32>)> {
        self.base.render_field(ray_samples)
    }
}

impl Model for LaNerfModel {
    fn get_outputs(&mut self, ray_bundle: &RayBundle) -> NerfResult<ModelOutputs> {
        let (ray_samples, mut weights_list, mut ray_samples_list) = self.base.sample(ray_bundle)?;
        let (field_outputs, mut outputs, weights) = self.get_outputs_nerfacto(&ray_samples)?;

        ray_samples_list.push(ray_samples);

        for (weights, samples) in weights_list.iter().zip(&ray_samples_list) {
            let prop_depth = self.base.renderer_depth().render(weights.view(), samples)?;
            outputs.prop_depths.push(prop_depth);
        }

        let training = self.training();

        if let Some(rgb_mu) = &field_outputs.rgb_mu {
            let rgb_mu = self
                .base
                .renderer_rgb()
                .render(rgb_mu.view(), weights.view(), training)?;
            outputs.rgb_mu = Some(rgb_mu);
        }

        if let Some(rgb_sigma) = &field_outputs.rgb_sigma {
            let betas = rgb_sigma.sum_axis(Axis(2)).insert_axis(Axis(2));
            outputs.rgb_sigma = Some(self.renderer_uq.render(betas.view(), weights.view())?);
        }

        if let Some(density_sigma) = &field_outputs.density_sigma {
            let betas = density_sigma.sum_axis(Axis(2)).insert_axis(Axis(2));
            outputs.density_sigma = Some(self.renderer_uq.render(betas.view(), weights.view())?);
        }

        weights_list.push(weights);
        if training {
            outputs.trace = Some(ProposalTrace {
                weights_list,
                ray_samples_list,
            });
        }

        Ok(outputs)
    }

    fn get_metrics_dict(&self, outputs: &ModelOutputs, batch: &Batch) -> NerfResult<MetricsDict> {
        let image = batch.image_for(outputs.rgb.view())?;
        let mut metrics_dict = MetricsDict::new();

        metrics_dict.insert("psnr".into(), psnr(outputs.rgb.view(), image));

        if self.training() {
            let trace = outputs.trace()?;
            let distortion = distortion_loss(&trace.weights_list, &trace.ray_samples_list)?;
            metrics_dict.insert("distortion".into(), distortion);

            let field = self.base.field();
            if let Some(summary) = HessianSummary::of(&field.hessian()) {
                summary.insert_into(&mut metrics_dict, "hessian");
            }
            if let Some(summary) = HessianSummary::of(&field.density_hessian()) {
                summary.insert_into(&mut metrics_dict, "hessian_density");
            }
        }

        Ok(metrics_dict)
    }

    fn get_loss_dict(
        &self,
        outputs: &ModelOutputs,
        batch: &Batch,
        metrics_dict: Option<&MetricsDict>,
    ) -> NerfResult<LossDict> {
        let image = batch.image_for(outputs.rgb.view())?;
        let base = &self.config.base;
        let mut loss_dict = LossDict::new();

        // the primary color may be a single posterior draw, it is still what gets supervised
        let rgb_loss = base.rgb_loss.loss(outputs.rgb.view(), image);
        loss_dict.insert("rgb_loss".into(), rgb_loss);

        if self.training() {
            let trace = outputs.trace()?;
            let interlevel = interlevel_loss(&trace.weights_list, &trace.ray_samples_list)?;
            loss_dict.insert("interlevel_loss".into(), base.interlevel_loss_mult * interlevel);

            let distortion = metrics_dict.and_then(|m| m.get("distortion")).copied();
            assert!(
                distortion.is_some(),
                "the distortion metric must be computed before the training losses"
            );
            if let Some(distortion) = distortion {
                loss_dict.insert("distortion_loss".into(), base.distortion_loss_mult * distortion);
            }

            if base.predict_normals {
                let orientation = outputs
                    .rendered_orientation_loss
                    .as_ref()
                    .ok_or(NerfErr::MissingOutput("rendered_orientation_loss"))?;
                let pred_normal = outputs
                    .rendered_pred_normal_loss
                    .as_ref()
                    .ok_or(NerfErr::MissingOutput("rendered_pred_normal_loss"))?;

                loss_dict.insert(
                    "orientation_loss".into(),
                    base.orientation_loss_mult * orientation.mean().unwrap_or(0.),
                );
                loss_dict.insert(
                    "pred_normal_loss".into(),
                    base.pred_normal_loss_mult * pred_normal.mean().unwrap_or(0.),
                );
            }
        }

        debug!(losses = loss_dict.len(); "computed laplace nerf losses");
        Ok(loss_dict)
    }

    fn set_training(&mut self, training: bool) {
        self.base.set_training(training);
    }

    fn training(&self) -> bool {
        self.base.training()
    }

    fn before_step(&mut self, step: usize) {
        self.base.before_step(step);
    }

    fn after_backward(&mut self, step: usize) -> NerfResult<()> {
        if self.config.online_laplace {
            self.base.field_mut().after_backward()?;
            debug!(step = step; "online laplace update");
        }

        Ok(())
    }
}
