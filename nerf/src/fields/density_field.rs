use ndarray::{Array1, ArrayView2};
use rand::{SeedableRng, rngs::StdRng};

use super::{DensityFn, FrequencyEncoding, SceneContraction};
use crate::{
    Result,
    arch::{activations::ActFn, layers::Mlp},
    scene_box::SceneBox,
};

const NUM_LEVELS: usize = 5;
const BASE_RES: f32 = 16.;

/// A small density only network used to guide the proposal sampler.
#[derive(Debug, Clone)]
pub struct DensityField {
    scene_box: SceneBox,
    spatial_distortion: Option<SceneContraction>,
    encoding: FrequencyEncoding,
    mlp: Mlp,
}

impl DensityField {
    /// Creates a new `DensityField`.
    ///
    /// # Arguments
    /// * `scene_box` - Normalizes positions when no contraction is used.
    /// * `spatial_distortion` - The contraction applied to positions, if any.
    /// * `hidden_dim` - Width of the hidden layer.
    /// * `max_res` - Highest encoding resolution.
    /// * `seed` - Seed for the weight initialization.
    pub fn new(
        scene_box: SceneBox,
        spatial_distortion: Option<SceneContraction>,
        hidden_dim: usize,
        max_res: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let encoding = FrequencyEncoding::new(3, NUM_LEVELS, BASE_RES, max_res as f32, false);
        let mlp = Mlp::new(
            encoding.out_dim(),
            2,
            hidden_dim,
            1,
            ActFn::Relu,
            Some(ActFn::TruncExp),
            &mut rng,
        )?;

        Ok(Self {
            scene_box,
            spatial_distortion,
            encoding,
            mlp,
        })
    }
}

impl DensityFn for DensityField {
    fn density(&self, positions: ArrayView2<f32>) -> Result<Array1<f32>> {
        let x = match self.spatial_distortion {
            Some(contraction) => contraction.apply(positions),
            None => self.scene_box.normalize_positions(positions),
        };

        let encoded = self.encoding.encode(x.view());
        let density = self.mlp.forward(encoded.view())?;
        Ok(density.column(0).to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn density_is_non_negative() {
        let field =
            DensityField::new(SceneBox::cube(1.), Some(SceneContraction), 16, 128, 0).unwrap();
        let positions = Array2::from_shape_fn((10, 3), |(i, j)| (i as f32 - 5.) * (j as f32 + 1.));

        let density = field.density(positions.view()).unwrap();
        assert_eq!(density.len(), 10);
        assert!(density.iter().all(|&d| d >= 0. && d.is_finite()));
    }
}
