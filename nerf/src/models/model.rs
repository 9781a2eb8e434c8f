use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView2};

use crate::{NerfErr, Result, rays::RayBundle, rays::RaySamples};

/// Scalar losses by name.
pub type LossDict = BTreeMap<String, f32>;

/// Scalar metrics by name.
pub type MetricsDict = BTreeMap<String, f32>;

/// The ground truth of a batch of rays.
#[derive(Debug, Clone)]
pub struct Batch {
    /// One target color per ray, `[N, 3]`.
    pub image: Array2<f32>,
}

impl Batch {
    pub fn new(image: Array2<f32>) -> Self {
        Self { image }
    }

    /// Returns the target image after checking it lines up with the rendered colors.
    pub fn image_for(&self, rgb: ArrayView2<f32>) -> Result<ArrayView2<'_, f32>> {
        if self.image.dim() != rgb.dim() {
            return Err(NerfErr::SizeMismatch {
                what: "batch image",
                got: self.image.len(),
                expected: rgb.len(),
            });
        }

        Ok(self.image.view())
    }
}

/// The weights and samples of every sampling round, the final one last.
#[derive(Debug, Clone)]
pub struct ProposalTrace {
    pub weights_list: Vec<Array2<f32>>,
    pub ray_samples_list: Vec<RaySamples>,
}

/// Everything rendered for a batch of `N` rays.
#[derive(Debug, Clone)]
pub struct ModelOutputs {
    /// `[N, 3]`
    pub rgb: Array2<f32>,
    /// `[N, 1]`
    pub depth: Array2<f32>,
    /// `[N, 1]`
    pub accumulation: Array2<f32>,
    /// Color rendered from the posterior mean radiance, `[N, 3]`.
    pub rgb_mu: Option<Array2<f32>>,
    /// `[N, 1]`
    pub rgb_sigma: Option<Array2<f32>>,
    /// `[N, 1]`
    pub density_sigma: Option<Array2<f32>>,
    /// The depth seen by every proposal round, each `[N, 1]`.
    pub prop_depths: Vec<Array2<f32>>,
    /// `[N]`
    pub rendered_orientation_loss: Option<Array1<f32>>,
    /// `[N]`
    pub rendered_pred_normal_loss: Option<Array1<f32>>,
    /// Only kept while training.
    pub trace: Option<ProposalTrace>,
}

impl ModelOutputs {
    pub fn new(rgb: Array2<f32>, depth: Array2<f32>, accumulation: Array2<f32>) -> Self {
        Self {
            rgb,
            depth,
            accumulation,
            rgb_mu: None,
            rgb_sigma: None,
            density_sigma: None,
            prop_depths: Vec::new(),
            rendered_orientation_loss: None,
            rendered_pred_normal_loss: None,
            trace: None,
        }
    }

    pub fn num_rays(&self) -> usize {
        self.rgb.nrows()
    }

    pub fn trace(&self) -> Result<&ProposalTrace> {
        self.trace
            .as_ref()
            .ok_or(NerfErr::MissingOutput("the proposal trace"))
    }
}

/// A radiance field model driven by a trainer.
pub trait Model {
    /// Renders every ray of `ray_bundle`.
    fn get_outputs(&mut self, ray_bundle: &RayBundle) -> Result<ModelOutputs>;

    /// Computes the metrics of a rendered batch.
    ///
    /// # Arguments
    /// * `outputs` - What `get_outputs` rendered.
    /// * `batch` - The ground truth of the rendered rays.
    fn get_metrics_dict(&self, outputs: &ModelOutputs, batch: &Batch) -> Result<MetricsDict>;

    /// Computes the losses of a rendered batch.
    ///
    /// # Arguments
    /// * `outputs` - What `get_outputs` rendered.
    /// * `batch` - The ground truth of the rendered rays.
    /// * `metrics_dict` - The metrics of the same batch. While training it must hold the
    ///   `distortion` metric.
    fn get_loss_dict(
        &self,
        outputs: &ModelOutputs,
        batch: &Batch,
        metrics_dict: Option<&MetricsDict>,
    ) -> Result<LossDict>;

    fn set_training(&mut self, training: bool);

    fn training(&self) -> bool;

    /// Called before every training step.
    fn before_step(&mut self, _step: usize) {}

    /// Called once the gradients of a training step are available.
    fn after_backward(&mut self, _step: usize) -> Result<()> {
        Ok(())
    }
}
