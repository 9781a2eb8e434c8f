//! Volume rendering: collapses per-sample quantities into one value per ray using the
//! transmittance weights.

use ndarray::{Array1, Array2, ArrayView2, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::{NerfErr, Result, rays::RaySamples};

fn check_weights(what: &'static str, weights: ArrayView2<f32>, n: usize, s: usize) -> Result<()> {
    if weights.dim() != (n, s) {
        return Err(NerfErr::SizeMismatch {
            what,
            got: weights.len(),
            expected: n * s,
        });
    }

    Ok(())
}

/// Color rays fall back to where they are not fully opaque.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundColor {
    /// The color of the farthest sample of every ray.
    #[default]
    LastSample,
    Black,
    White,
}

/// Renders per-sample colors.
#[derive(Debug, Default, Clone, Copy)]
pub struct RgbRenderer {
    background: BackgroundColor,
}

impl RgbRenderer {
    pub fn new(background: BackgroundColor) -> Self {
        Self { background }
    }

    /// Composites the colors of every ray.
    ///
    /// # Arguments
    /// * `rgb` - The per-sample colors, `[N, S, 3]`.
    /// * `weights` - The per-sample weights, `[N, S]`.
    /// * `training` - Outside training the composited colors are clamped to `[0, 1]`.
    ///
    /// # Returns
    /// One color per ray, `[N, 3]`.
    pub fn render(
        &self,
        rgb: ArrayView3<f32>,
        weights: ArrayView2<f32>,
        training: bool,
    ) -> Result<Array2<f32>> {
        let (n, s, c) = rgb.dim();
        check_weights("rgb renderer weights", weights, n, s)?;
        if s == 0 {
            return Err(NerfErr::EmptyBatch);
        }

        let mut out = Array2::zeros((n, c));

        Zip::from(out.rows_mut())
            .and(rgb.outer_iter())
            .and(weights.rows())
            .par_for_each(|mut out, rgb, w| {
                let mut acc = 0.;
                for (sample, &w) in rgb.outer_iter().zip(w) {
                    out.scaled_add(w, &sample);
                    acc += w;
                }

                let remaining = 1. - acc;
                match self.background {
                    BackgroundColor::LastSample => out.scaled_add(remaining, &rgb.row(s - 1)),
                    BackgroundColor::White => out += remaining,
                    BackgroundColor::Black => {}
                }

                if !training {
                    out.mapv_inplace(|v| v.clamp(0., 1.));
                }
            });

        Ok(out)
    }
}

/// How a depth is read out of the weights of a ray.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthMethod {
    #[default]
    Median,
    Expected,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DepthRenderer {
    method: DepthMethod,
}

impl DepthRenderer {
    pub fn new(method: DepthMethod) -> Self {
        Self { method }
    }

    /// Renders one depth per ray, `[N, 1]`, out of the weights over `ray_samples`.
    pub fn render(
        &self,
        weights: ArrayView2<f32>,
        ray_samples: &RaySamples,
    ) -> Result<Array2<f32>> {
        let (n, s) = (ray_samples.num_rays(), ray_samples.num_samples());
        check_weights("depth renderer weights", weights, n, s)?;

        let steps = ray_samples.midpoints();
        let mut depth = Array1::zeros(n);

        Zip::from(&mut depth)
            .and(weights.rows())
            .and(steps.rows())
            .par_for_each(|d, w, t| {
                *d = match self.method {
                    DepthMethod::Median => {
                        let mut cumulative = 0.;
                        let idx = w
                            .iter()
                            .position(|&w| {
                                cumulative += w;
                                cumulative >= 0.5
                            })
                            .unwrap_or(s - 1);
                        t[idx]
                    }
                    DepthMethod::Expected => {
                        let acc = w.sum();
                        let expected = w.dot(&t) / (acc + 1e-10);
                        let (lo, hi) = t
                            .iter()
                            .fold((f32::MAX, f32::MIN), |(lo, hi), &t| (lo.min(t), hi.max(t)));
                        expected.clamp(lo, hi)
                    }
                };
            });

        Ok(depth.insert_axis(Axis(1)))
    }
}

/// Renders the opacity of every ray.
#[derive(Debug, Default, Clone, Copy)]
pub struct AccumulationRenderer;

impl AccumulationRenderer {
    /// Returns `[N, 1]`.
    pub fn render(&self, weights: ArrayView2<f32>) -> Array2<f32> {
        weights.sum_axis(Axis(1)).insert_axis(Axis(1))
    }
}

/// Integrates a non-negative per-sample uncertainty proxy along every ray.
#[derive(Debug, Default, Clone, Copy)]
pub struct UncertaintyRenderer;

impl UncertaintyRenderer {
    /// Renders `sum w beta` per ray.
    ///
    /// # Arguments
    /// * `betas` - The per-sample uncertainty, `[N, S, 1]`.
    /// * `weights` - The per-sample weights, `[N, S]`.
    ///
    /// # Returns
    /// One uncertainty per ray, `[N, 1]`.
    pub fn render(&self, betas: ArrayView3<f32>, weights: ArrayView2<f32>) -> Result<Array2<f32>> {
        let (n, s, c) = betas.dim();
        check_weights("uncertainty renderer weights", weights, n, s)?;
        if c != 1 {
            return Err(NerfErr::SizeMismatch {
                what: "uncertainty channels",
                got: c,
                expected: 1,
            });
        }

        let betas = betas.index_axis(Axis(2), 0);
        let uncertainty = (&betas * &weights).sum_axis(Axis(1));
        Ok(uncertainty.insert_axis(Axis(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rays::{RayBundle, Spacing};
    use ndarray::{Array3, array};

    fn samples(num_samples: usize) -> RaySamples {
        let bundle = RayBundle::new(
            array![[0., 0., 0.]],
            array![[0., 0., 1.]],
            array![0],
            1.,
            5.,
        )
        .unwrap();
        let edges =
            Array2::from_shape_fn((1, num_samples + 1), |(_, j)| j as f32 / num_samples as f32);
        RaySamples::from_spacing(&bundle, Spacing::Linear, edges).unwrap()
    }

    #[test]
    fn last_sample_background_fills_the_remaining_opacity() {
        let mut rgb = Array3::zeros((1, 2, 3));
        rgb[[0, 1, 2]] = 1.;
        let weights = array![[0.5, 0.]];

        let out = RgbRenderer::default()
            .render(rgb.view(), weights.view(), true)
            .unwrap();
        assert_eq!(out.row(0).to_vec(), vec![0., 0., 0.5]);

        let white = RgbRenderer::new(BackgroundColor::White)
            .render(rgb.view(), weights.view(), true)
            .unwrap();
        assert_eq!(white.row(0).to_vec(), vec![0.5, 0.5, 0.5]);
    }

    #[test]
    fn evaluation_colors_are_clamped() {
        let rgb = Array3::from_elem((1, 1, 3), 2.);
        let out = RgbRenderer::new(BackgroundColor::Black)
            .render(rgb.view(), array![[1.]].view(), false)
            .unwrap();
        assert!(out.iter().all(|&v| v == 1.));
    }

    #[test]
    fn median_depth_picks_the_half_weight_sample() {
        let samples = samples(4);
        let weights = array![[0.1, 0.2, 0.3, 0.1]];

        let depth = DepthRenderer::new(DepthMethod::Median)
            .render(weights.view(), &samples)
            .unwrap();
        assert_eq!(depth[[0, 0]], samples.midpoints()[[0, 2]]);
    }

    #[test]
    fn expected_depth_stays_within_the_samples() {
        let samples = samples(4);
        let depth = DepthRenderer::new(DepthMethod::Expected)
            .render(Array2::zeros((1, 4)).view(), &samples)
            .unwrap();
        assert_eq!(depth[[0, 0]], samples.midpoints()[[0, 0]]);
    }

    #[test]
    fn uncertainty_is_weighted_sum_of_betas() {
        let betas = array![[[1.], [3.]]];
        let out = UncertaintyRenderer
            .render(betas.view(), array![[0.5, 0.25]].view())
            .unwrap();
        assert_eq!(out, array![[1.25]]);
        assert_eq!(AccumulationRenderer.render(array![[0.5, 0.25]].view()), array![[0.75]]);
    }
}
