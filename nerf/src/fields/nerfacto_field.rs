use log::info;
use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate, s};
use rand::{SeedableRng, rngs::StdRng};

use super::{
    DensityFn, Embedding, Field, FieldOutputs, FrequencyEncoding, SceneContraction,
    analytic_normals, normalize_rows, unflatten,
};
use crate::{
    NerfErr, Result,
    arch::{activations::ActFn, layers::Mlp},
    rays::RaySamples,
    scene_box::SceneBox,
};

const GEO_FEAT_DIM: usize = 15;
const NUM_LAYERS: usize = 2;
const NUM_LAYERS_COLOR: usize = 3;
const DIR_LEVELS: usize = 4;

/// Construction parameters of a `NerfactoField`.
#[derive(Debug, Clone)]
pub struct NerfactoFieldConfig {
    pub hidden_dim: usize,
    pub hidden_dim_color: usize,
    pub num_levels: usize,
    pub base_res: usize,
    pub max_res: usize,
    pub num_images: usize,
    pub appearance_embedding_dim: usize,
    pub use_average_appearance_embedding: bool,
    /// Activation of every hidden layer.
    pub act_fn: ActFn,
    /// Activation turning the raw density into a non-negative one.
    pub density_act_fn: ActFn,
    pub spatial_distortion: Option<SceneContraction>,
    pub seed: u64,
}

/// The intermediate values of a field query the output heads are computed from.
///
/// Every array is flattened over samples, `[N * S, _]`.
#[derive(Debug, Clone)]
pub struct FieldFeatures {
    pub num_rays: usize,
    pub num_samples: usize,
    /// Input of the density head, `[M, hidden_dim]`.
    pub density_features: Array2<f32>,
    /// Density before its activation, `[M]`.
    pub density_pre: Array1<f32>,
    /// Geometry features shared with the color head, `[M, 15]`.
    pub geo_features: Array2<f32>,
    /// Input of the color output layer, `[M, hidden_dim_color]`.
    pub color_features: Array2<f32>,
    /// Color before its activation, `[M, 3]`.
    pub rgb_pre: Array2<f32>,
}

/// A compact nerfacto style field: a density network over encoded positions followed by a
/// view dependent color network.
#[derive(Debug, Clone)]
pub struct NerfactoField {
    scene_box: SceneBox,
    spatial_distortion: Option<SceneContraction>,
    position_encoding: FrequencyEncoding,
    direction_encoding: FrequencyEncoding,
    mlp_base: Mlp,
    mlp_head: Mlp,
    mlp_pred_normals: Mlp,
    embedding_appearance: Embedding,
    density_act_fn: ActFn,
    use_average_appearance_embedding: bool,
    training: bool,
}

impl NerfactoField {
    pub fn new(scene_box: SceneBox, config: &NerfactoFieldConfig) -> Result<Self> {
        if config.num_images == 0 {
            return Err(NerfErr::InvalidConfig(
                "the field needs at least one training image".into(),
            ));
        }
        if config.num_levels == 0 || config.base_res == 0 || config.max_res < config.base_res {
            return Err(NerfErr::InvalidConfig(format!(
                "invalid encoding resolutions: {} levels from {} to {}",
                config.num_levels, config.base_res, config.max_res
            )));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);

        let position_encoding = FrequencyEncoding::new(
            3,
            config.num_levels,
            config.base_res as f32,
            config.max_res as f32,
            true,
        );
        let direction_encoding = FrequencyEncoding::new(3, DIR_LEVELS, 1., 8., true);

        let mlp_base = Mlp::new(
            position_encoding.out_dim(),
            NUM_LAYERS,
            config.hidden_dim,
            1 + GEO_FEAT_DIM,
            config.act_fn,
            None,
            &mut rng,
        )?;

        let head_in = direction_encoding.out_dim() + GEO_FEAT_DIM + config.appearance_embedding_dim;
        let mlp_head = Mlp::new(
            head_in,
            NUM_LAYERS_COLOR,
            config.hidden_dim_color,
            3,
            config.act_fn,
            Some(ActFn::Sigmoid),
            &mut rng,
        )?;

        let mlp_pred_normals = Mlp::new(
            GEO_FEAT_DIM,
            2,
            config.hidden_dim_color,
            3,
            config.act_fn,
            Some(ActFn::Tanh),
            &mut rng,
        )?;

        let embedding_appearance = Embedding::new(
            config.num_images,
            config.appearance_embedding_dim,
            &mut rng,
        );

        info!(
            params = mlp_base.size() + mlp_head.size() + mlp_pred_normals.size();
            "built nerfacto field"
        );

        Ok(Self {
            scene_box,
            spatial_distortion: config.spatial_distortion,
            position_encoding,
            direction_encoding,
            mlp_base,
            mlp_head,
            mlp_pred_normals,
            embedding_appearance,
            density_act_fn: config.density_act_fn,
            use_average_appearance_embedding: config.use_average_appearance_embedding,
            training: true,
        })
    }

    pub fn mlp_base(&self) -> &Mlp {
        &self.mlp_base
    }

    pub fn mlp_head(&self) -> &Mlp {
        &self.mlp_head
    }

    pub fn density_act_fn(&self) -> ActFn {
        self.density_act_fn
    }

    pub fn training(&self) -> bool {
        self.training
    }

    fn normalize(&self, positions: ArrayView2<f32>) -> Array2<f32> {
        match self.spatial_distortion {
            Some(contraction) => contraction.apply(positions),
            None => self.scene_box.normalize_positions(positions),
        }
    }

    /// Runs the density network at flat positions, `[M, 3]`.
    ///
    /// # Returns
    /// The density head input features and the raw network output, `[M, 1 + 15]`.
    fn base(&self, positions: ArrayView2<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        let x = self.normalize(positions);
        let encoded = self.position_encoding.encode(x.view());
        self.mlp_base.forward_with_features(encoded.view())
    }

    fn appearance(&self, ray_samples: &RaySamples, m: usize) -> Result<Array2<f32>> {
        let dim = self.embedding_appearance.dim();
        let num_samples = ray_samples.num_samples();

        if self.training {
            let per_sample: Vec<usize> = ray_samples
                .camera_indices()
                .iter()
                .flat_map(|&i| std::iter::repeat_n(i, num_samples))
                .collect();
            return self.embedding_appearance.lookup(Array1::from(per_sample).view());
        }

        let row = if self.use_average_appearance_embedding {
            self.embedding_appearance.mean()
        } else {
            Array1::zeros(dim)
        };

        Ok(row
            .insert_axis(Axis(0))
            .broadcast((m, dim))
            .map(|v| v.to_owned())
            .unwrap_or_else(|| Array2::zeros((m, dim))))
    }

    /// Evaluates every network of the field, stopping right before the output activations.
    pub fn forward_features(&self, ray_samples: &RaySamples) -> Result<FieldFeatures> {
        let (num_rays, num_samples) = (ray_samples.num_rays(), ray_samples.num_samples());
        let m = num_rays * num_samples;

        let positions = ray_samples.positions().into_shape_with_order((m, 3))?;
        let (density_features, h) = self.base(positions.view())?;
        let density_pre = h.column(0).to_owned();
        let geo_features = h.slice(s![.., 1..]).to_owned();

        let directions = ray_samples.sample_directions().into_shape_with_order((m, 3))?;
        let directions = directions.mapv(|d| (d + 1.) / 2.);
        let encoded_dirs = self.direction_encoding.encode(directions.view());
        let appearance = self.appearance(ray_samples, m)?;

        let head_in = concatenate(
            Axis(1),
            &[encoded_dirs.view(), geo_features.view(), appearance.view()],
        )?;
        let (color_features, rgb_pre) = self.mlp_head.forward_with_features(head_in.view())?;

        Ok(FieldFeatures {
            num_rays,
            num_samples,
            density_features,
            density_pre,
            geo_features,
            color_features,
            rgb_pre,
        })
    }

    /// Builds the field outputs out of already computed features.
    pub fn outputs_from_features(
        &self,
        ray_samples: &RaySamples,
        features: &FieldFeatures,
        compute_normals: bool,
    ) -> Result<FieldOutputs> {
        let (n, s) = (features.num_rays, features.num_samples);
        let density_act_fn = self.density_act_fn;

        let density = features
            .density_pre
            .mapv(|z| density_act_fn.f(z))
            .into_shape_with_order((n, s))?;
        let rgb = features.rgb_pre.mapv(|z| ActFn::Sigmoid.f(z));

        let mut outputs = FieldOutputs::new(density, unflatten(rgb, n, s)?);

        if compute_normals {
            let positions = ray_samples.positions().into_shape_with_order((n * s, 3))?;
            let normals = analytic_normals(self, positions.view())?;

            let mut pred_normals = self.mlp_pred_normals.forward(features.geo_features.view())?;
            normalize_rows(&mut pred_normals);

            outputs.normals = Some(unflatten(normals, n, s)?);
            outputs.pred_normals = Some(unflatten(pred_normals, n, s)?);
        }

        Ok(outputs)
    }
}

impl DensityFn for NerfactoField {
    fn density(&self, positions: ArrayView2<f32>) -> Result<Array1<f32>> {
        let (_, h) = self.base(positions)?;
        let density_act_fn = self.density_act_fn;
        Ok(h.column(0).mapv(|z| density_act_fn.f(z)))
    }
}

impl Field for NerfactoField {
    fn forward(
        &mut self,
        ray_samples: &RaySamples,
        compute_normals: bool,
    ) -> Result<FieldOutputs> {
        let features = self.forward_features(ray_samples)?;
        self.outputs_from_features(ray_samples, &features, compute_normals)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
