use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{Batch, LossDict, MetricsDict, Model, ModelOutputs, ProposalTrace};
use crate::{
    NerfErr, Result,
    arch::{
        activations::ActFn,
        loss::{LossFn, RgbLoss},
    },
    fields::{
        DensityField, DensityFn, Field, FieldOutputs, NerfactoField, NerfactoFieldConfig,
        SceneContraction,
    },
    losses::{distortion_loss, interlevel_loss, orientation_loss, pred_normal_loss, psnr},
    rays::{RayBundle, RaySamples},
    renderers::{AccumulationRenderer, BackgroundColor, DepthMethod, DepthRenderer, RgbRenderer},
    samplers::{ProposalNetworkSampler, proposal_weights_anneal},
    scene_box::SceneBox,
};

/// Highest encoding resolution of the first and every later proposal network.
const PROPOSAL_MAX_RES: [usize; 2] = [128, 256];

/// Hyperparameters of the nerfacto model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NerfactoModelConfig {
    pub hidden_dim: usize,
    pub hidden_dim_color: usize,
    pub num_levels: usize,
    pub base_res: usize,
    pub max_res: usize,
    pub appearance_embed_dim: usize,
    pub use_average_appearance_embedding: bool,
    pub num_proposal_iterations: usize,
    pub num_proposal_samples_per_ray: Vec<usize>,
    pub num_nerf_samples_per_ray: usize,
    pub proposal_hidden_dim: usize,
    pub use_same_proposal_network: bool,
    pub use_single_jitter: bool,
    pub near_plane: f32,
    pub far_plane: f32,
    pub background_color: BackgroundColor,
    pub depth_method: DepthMethod,
    pub rgb_loss: RgbLoss,
    pub interlevel_loss_mult: f32,
    pub distortion_loss_mult: f32,
    pub orientation_loss_mult: f32,
    pub pred_normal_loss_mult: f32,
    pub predict_normals: bool,
    pub disable_scene_contraction: bool,
    pub proposal_weights_anneal_max_num_iters: usize,
    pub proposal_weights_anneal_slope: f32,
    pub seed: u64,
}

impl Default for NerfactoModelConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 64,
            hidden_dim_color: 64,
            num_levels: 16,
            base_res: 16,
            max_res: 2048,
            appearance_embed_dim: 32,
            use_average_appearance_embedding: true,
            num_proposal_iterations: 2,
            num_proposal_samples_per_ray: vec![256, 96],
            num_nerf_samples_per_ray: 48,
            proposal_hidden_dim: 16,
            use_same_proposal_network: false,
            use_single_jitter: true,
            near_plane: 0.05,
            far_plane: 1000.,
            background_color: BackgroundColor::LastSample,
            depth_method: DepthMethod::Median,
            rgb_loss: RgbLoss::Mse,
            interlevel_loss_mult: 1.,
            distortion_loss_mult: 0.002,
            orientation_loss_mult: 0.0001,
            pred_normal_loss_mult: 0.001,
            predict_normals: false,
            disable_scene_contraction: false,
            proposal_weights_anneal_max_num_iters: 1000,
            proposal_weights_anneal_slope: 10.,
            seed: 42,
        }
    }
}

impl NerfactoModelConfig {
    /// Checks the values a model cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.num_proposal_iterations == 0 {
            return Err(NerfErr::InvalidConfig(
                "num_proposal_iterations must be positive".into(),
            ));
        }
        if self.num_proposal_samples_per_ray.len() != self.num_proposal_iterations {
            return Err(NerfErr::InvalidConfig(format!(
                "num_proposal_samples_per_ray has {} entries but there are {} proposal iterations",
                self.num_proposal_samples_per_ray.len(),
                self.num_proposal_iterations
            )));
        }
        if self.hidden_dim == 0 || self.hidden_dim_color == 0 || self.proposal_hidden_dim == 0 {
            return Err(NerfErr::InvalidConfig("hidden dims must be positive".into()));
        }
        if !(self.near_plane > 0. && self.far_plane > self.near_plane) {
            return Err(NerfErr::InvalidConfig(format!(
                "near_plane ({}) and far_plane ({}) must satisfy 0 < near < far",
                self.near_plane, self.far_plane
            )));
        }

        Ok(())
    }

    pub fn spatial_distortion(&self) -> Option<SceneContraction> {
        (!self.disable_scene_contraction).then_some(SceneContraction)
    }

    /// The construction parameters of the main field.
    ///
    /// # Arguments
    /// * `num_images` - The amount of training images, one appearance embedding each.
    /// * `act_fn` - The hidden activation.
    /// * `density_act_fn` - The activation of the density output.
    pub fn field_config(
        &self,
        num_images: usize,
        act_fn: ActFn,
        density_act_fn: ActFn,
    ) -> NerfactoFieldConfig {
        NerfactoFieldConfig {
            hidden_dim: self.hidden_dim,
            hidden_dim_color: self.hidden_dim_color,
            num_levels: self.num_levels,
            base_res: self.base_res,
            max_res: self.max_res,
            num_images,
            appearance_embedding_dim: self.appearance_embed_dim,
            use_average_appearance_embedding: self.use_average_appearance_embedding,
            act_fn,
            density_act_fn,
            spatial_distortion: self.spatial_distortion(),
            seed: self.seed,
        }
    }
}

fn proposal_density_fns(networks: &[DensityField], rounds: usize) -> Vec<&dyn DensityFn> {
    (0..rounds)
        .map(|i| &networks[i.min(networks.len() - 1)] as &dyn DensityFn)
        .collect()
}

/// The nerfacto model over any field.
pub struct NerfactoModel<F: Field> {
    config: NerfactoModelConfig,
    field: F,
    proposal_networks: Vec<DensityField>,
    proposal_sampler: ProposalNetworkSampler,
    renderer_rgb: RgbRenderer,
    renderer_depth: DepthRenderer,
    renderer_accumulation: AccumulationRenderer,
    training: bool,
}

impl NerfactoModel<NerfactoField> {
    /// Creates a new `NerfactoModel` with the default nerfacto field.
    ///
    /// # Arguments
    /// * `config` - The model hyperparameters.
    /// * `scene_box` - The box enclosing the scene.
    /// * `num_train_data` - The amount of training images.
    pub fn new(
        config: NerfactoModelConfig,
        scene_box: SceneBox,
        num_train_data: usize,
    ) -> Result<Self> {
        let field_config = config.field_config(num_train_data, ActFn::Relu, ActFn::TruncExp);
        let field = NerfactoField::new(scene_box.clone(), &field_config)?;
        Self::with_field(config, scene_box, field)
    }
}

impl<F: Field> NerfactoModel<F> {
    /// Creates a new `NerfactoModel` rendering `field`.
    pub fn with_field(config: NerfactoModelConfig, scene_box: SceneBox, field: F) -> Result<Self> {
        config.validate()?;

        let num_networks = if config.use_same_proposal_network {
            1
        } else {
            config.num_proposal_iterations
        };

        let proposal_networks = (0..num_networks)
            .map(|i| {
                DensityField::new(
                    scene_box.clone(),
                    config.spatial_distortion(),
                    config.proposal_hidden_dim,
                    PROPOSAL_MAX_RES[i.min(PROPOSAL_MAX_RES.len() - 1)],
                    config.seed + 1 + i as u64,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let proposal_sampler = ProposalNetworkSampler::new(
            config.num_proposal_samples_per_ray.clone(),
            config.num_nerf_samples_per_ray,
            config.use_single_jitter,
            config.seed,
        )?;

        info!(
            proposal_networks = num_networks,
            nerf_samples = config.num_nerf_samples_per_ray;
            "built nerfacto model"
        );

        Ok(Self {
            renderer_rgb: RgbRenderer::new(config.background_color),
            renderer_depth: DepthRenderer::new(config.depth_method),
            renderer_accumulation: AccumulationRenderer,
            config,
            field,
            proposal_networks,
            proposal_sampler,
            training: true,
        })
    }

    pub fn config(&self) -> &NerfactoModelConfig {
        &self.config
    }

    pub fn field(&self) -> &F {
        &self.field
    }

    pub fn field_mut(&mut self) -> &mut F {
        &mut self.field
    }

    pub fn renderer_rgb(&self) -> &RgbRenderer {
        &self.renderer_rgb
    }

    pub fn renderer_depth(&self) -> &DepthRenderer {
        &self.renderer_depth
    }

    /// Runs the proposal sampler over `ray_bundle`.
    ///
    /// # Returns
    /// The final samples together with the weights and samples of every proposal round.
    pub fn sample(
        &mut self,
        ray_bundle: &RayBundle,
    ) -> Result<(RaySamples, Vec<Array2<f32>>, Vec<RaySamples>)> {
        let density_fns =
            proposal_density_fns(&self.proposal_networks, self.config.num_proposal_iterations);
        self.proposal_sampler
            .generate_ray_samples(ray_bundle, &density_fns)
    }

    /// Queries the field at the final samples and renders the per-ray channels every nerfacto
    /// model has.
    ///
    /// # Returns
    /// The raw field outputs, the rendered outputs and the weights of the samples.
    pub fn render_field(
        &mut self,
        ray_samples: &RaySamples,
    ) -> Result<(FieldOutputs, ModelOutputs, Array2<f32>)> {
        let field_outputs = self
            .field
            .forward(ray_samples, self.config.predict_normals)?;
        let weights = ray_samples.get_weights(field_outputs.density.view())?;

        let rgb = self
            .renderer_rgb
            .render(field_outputs.rgb.view(), weights.view(), self.training)?;
        let depth = self.renderer_depth.render(weights.view(), ray_samples)?;
        let accumulation = self.renderer_accumulation.render(weights.view());

        let mut outputs = ModelOutputs::new(rgb, depth, accumulation);

        if self.training && self.config.predict_normals {
            let (Some(normals), Some(pred_normals)) =
                (&field_outputs.normals, &field_outputs.pred_normals)
            else {
                return Err(NerfErr::MissingOutput("the field normals"));
            };

            outputs.rendered_orientation_loss = Some(orientation_loss(
                weights.view(),
                normals.view(),
                ray_samples.directions(),
            )?);
            outputs.rendered_pred_normal_loss = Some(pred_normal_loss(
                weights.view(),
                normals.view(),
                pred_normals.view(),
            )?);
        }

        Ok((field_outputs, outputs, weights))
    }

    /// Sets the proposal weights annealing for a training step.
    pub fn set_anneal(&mut self, step: usize) {
        let anneal = proposal_weights_anneal(
            step,
            self.config.proposal_weights_anneal_max_num_iters,
            self.config.proposal_weights_anneal_slope,
        );
        self.proposal_sampler.set_anneal(anneal);
    }
}

impl<F: Field> Model for NerfactoModel<F> {
    fn get_outputs(&mut self, ray_bundle: &RayBundle) -> Result<ModelOutputs> {
        let (ray_samples, mut weights_list, mut ray_samples_list) = self.sample(ray_bundle)?;
        let (_, mut outputs, weights) = self.render_field(&ray_samples)?;

        ray_samples_list.push(ray_samples);
        weights_list.push(weights);

        for (weights, samples) in weights_list
            .iter()
            .zip(&ray_samples_list)
            .take(self.config.num_proposal_iterations)
        {
            let prop_depth = self.renderer_depth.render(weights.view(), samples)?;
            outputs.prop_depths.push(prop_depth);
        }

        if self.training {
            outputs.trace = Some(ProposalTrace {
                weights_list,
                ray_samples_list,
            });
        }

        Ok(outputs)
    }

    fn get_metrics_dict(&self, outputs: &ModelOutputs, batch: &Batch) -> Result<MetricsDict> {
        let image = batch.image_for(outputs.rgb.view())?;
        let mut metrics_dict = MetricsDict::new();

        metrics_dict.insert("psnr".into(), psnr(outputs.rgb.view(), image));
        if self.training {
            let trace = outputs.trace()?;
            let distortion = distortion_loss(&trace.weights_list, &trace.ray_samples_list)?;
            metrics_dict.insert("distortion".into(), distortion);
        }

        Ok(metrics_dict)
    }

    fn get_loss_dict(
        &self,
        outputs: &ModelOutputs,
        batch: &Batch,
        metrics_dict: Option<&MetricsDict>,
    ) -> Result<LossDict> {
        let image = batch.image_for(outputs.rgb.view())?;
        let mut loss_dict = LossDict::new();

        let rgb_loss = self.config.rgb_loss.loss(outputs.rgb.view(), image);
        loss_dict.insert("rgb_loss".into(), rgb_loss);

        if self.training {
            let trace = outputs.trace()?;
            let interlevel = interlevel_loss(&trace.weights_list, &trace.ray_samples_list)?;
            loss_dict.insert(
                "interlevel_loss".into(),
                self.config.interlevel_loss_mult * interlevel,
            );

            let distortion = metrics_dict.and_then(|m| m.get("distortion"));
            assert!(
                distortion.is_some(),
                "the distortion metric must be computed before the training losses"
            );
            if let Some(distortion) = distortion {
                loss_dict.insert(
                    "distortion_loss".into(),
                    self.config.distortion_loss_mult * distortion,
                );
            }

            if self.config.predict_normals {
                let (Some(orientation), Some(pred_normal)) = (
                    &outputs.rendered_orientation_loss,
                    &outputs.rendered_pred_normal_loss,
                ) else {
                    return Err(NerfErr::MissingOutput("the rendered normal losses"));
                };

                loss_dict.insert(
                    "orientation_loss".into(),
                    self.config.orientation_loss_mult * orientation.mean().unwrap_or(0.),
                );
                loss_dict.insert(
                    "pred_normal_loss".into(),
                    self.config.pred_normal_loss_mult * pred_normal.mean().unwrap_or(0.),
                );
            }
        }

        debug!(losses = loss_dict.len(); "computed nerfacto losses");
        Ok(loss_dict)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.field.set_training(training);
        self.proposal_sampler.set_training(training);
    }

    fn training(&self) -> bool {
        self.training
    }

    fn before_step(&mut self, step: usize) {
        self.set_anneal(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn small_config() -> NerfactoModelConfig {
        NerfactoModelConfig {
            hidden_dim: 8,
            hidden_dim_color: 8,
            num_levels: 2,
            base_res: 1,
            max_res: 4,
            appearance_embed_dim: 2,
            num_proposal_samples_per_ray: vec![8, 6],
            num_nerf_samples_per_ray: 4,
            proposal_hidden_dim: 8,
            near_plane: 0.1,
            far_plane: 10.,
            ..Default::default()
        }
    }

    fn bundle() -> RayBundle {
        RayBundle::new(
            array![[0., 0., 3.], [0., 0., 3.], [0.5, 0., 3.]],
            array![[0., 0., -1.], [0.1, 0., -1.], [0., 0.1, -1.]],
            array![0, 1, 0],
            0.1,
            10.,
        )
        .unwrap()
    }

    fn model(config: NerfactoModelConfig) -> NerfactoModel<NerfactoField> {
        NerfactoModel::new(config, SceneBox::cube(2.), 2).unwrap()
    }

    #[test]
    fn outputs_have_one_row_per_ray() {
        let mut model = model(small_config());
        let outputs = model.get_outputs(&bundle()).unwrap();

        assert_eq!(outputs.rgb.dim(), (3, 3));
        assert_eq!(outputs.depth.dim(), (3, 1));
        assert_eq!(outputs.accumulation.dim(), (3, 1));
        assert_eq!(outputs.prop_depths.len(), 2);
        assert!(outputs.rgb_sigma.is_none());

        let trace = outputs.trace().unwrap();
        assert_eq!(trace.weights_list.len(), 3);
        assert_eq!(trace.ray_samples_list[2].num_samples(), 4);
    }

    #[test]
    fn evaluation_drops_the_trace() {
        let mut model = model(small_config());
        model.set_training(false);

        let outputs = model.get_outputs(&bundle()).unwrap();
        assert!(outputs.trace.is_none());

        let batch = Batch::new(Array2::zeros((3, 3)));
        let losses = model.get_loss_dict(&outputs, &batch, None).unwrap();
        assert_eq!(losses.keys().collect::<Vec<_>>(), vec!["rgb_loss"]);
    }

    #[test]
    fn training_losses_use_the_distortion_metric() {
        let mut model = model(small_config());
        let outputs = model.get_outputs(&bundle()).unwrap();
        let batch = Batch::new(Array2::from_elem((3, 3), 0.5));

        let metrics = model.get_metrics_dict(&outputs, &batch).unwrap();
        let losses = model.get_loss_dict(&outputs, &batch, Some(&metrics)).unwrap();

        assert_eq!(losses["distortion_loss"], 0.002 * metrics["distortion"]);
        assert!(losses.contains_key("interlevel_loss"));
    }

    #[test]
    #[should_panic(expected = "distortion")]
    fn training_losses_require_the_distortion_metric() {
        let mut model = model(small_config());
        let outputs = model.get_outputs(&bundle()).unwrap();
        let batch = Batch::new(Array2::zeros((3, 3)));

        let _ = model.get_loss_dict(&outputs, &batch, Some(&MetricsDict::new()));
    }

    #[test]
    fn normal_losses_follow_predict_normals() {
        let mut model = model(NerfactoModelConfig {
            predict_normals: true,
            ..small_config()
        });
        let outputs = model.get_outputs(&bundle()).unwrap();
        let batch = Batch::new(Array2::zeros((3, 3)));

        let metrics = model.get_metrics_dict(&outputs, &batch).unwrap();
        let losses = model.get_loss_dict(&outputs, &batch, Some(&metrics)).unwrap();
        assert!(losses["orientation_loss"] >= 0.);
        assert!(losses.contains_key("pred_normal_loss"));
    }

    #[test]
    fn mismatched_images_are_rejected() {
        let mut model = model(small_config());
        let outputs = model.get_outputs(&bundle()).unwrap();
        let batch = Batch::new(Array2::zeros((2, 3)));

        assert!(matches!(
            model.get_metrics_dict(&outputs, &batch),
            Err(NerfErr::SizeMismatch { .. })
        ));
    }

    #[test]
    fn config_reads_partial_json() {
        let config: NerfactoModelConfig =
            serde_json::from_str(r#"{"hidden_dim": 32, "rgb_loss": "l1"}"#).unwrap();

        assert_eq!(config.hidden_dim, 32);
        assert_eq!(config.rgb_loss, RgbLoss::L1);
        assert_eq!(config.num_proposal_samples_per_ray, vec![256, 96]);

        let bad = NerfactoModelConfig {
            num_proposal_iterations: 3,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
