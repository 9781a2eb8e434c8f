use std::f32::consts::PI;

use ndarray::{Array2, ArrayView2, Axis};

/// Multi-resolution sinusoidal encoding.
///
/// Level `l` encodes every coordinate with `sin(pi r_l x)` and `cos(pi r_l x)`, where the
/// resolutions `r_l` grow geometrically from `base_res` to `max_res`.
#[derive(Debug, Clone)]
pub struct FrequencyEncoding {
    in_dim: usize,
    resolutions: Vec<f32>,
    include_input: bool,
}

impl FrequencyEncoding {
    pub fn new(
        in_dim: usize,
        num_levels: usize,
        base_res: f32,
        max_res: f32,
        include_input: bool,
    ) -> Self {
        let growth = if num_levels > 1 {
            ((max_res.ln() - base_res.ln()) / (num_levels - 1) as f32).exp()
        } else {
            1.
        };

        let resolutions = (0..num_levels)
            .map(|l| base_res * growth.powi(l as i32))
            .collect();

        Self {
            in_dim,
            resolutions,
            include_input,
        }
    }

    pub fn out_dim(&self) -> usize {
        let encoded = self.in_dim * self.resolutions.len() * 2;
        if self.include_input {
            encoded + self.in_dim
        } else {
            encoded
        }
    }

    /// Encodes `x`, `[M, in_dim]`, into `[M, out_dim]`.
    pub fn encode(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut out = Array2::zeros((x.nrows(), self.out_dim()));

        for (row, mut enc) in x.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
            let mut k = 0;
            if self.include_input {
                for &v in row {
                    enc[k] = v;
                    k += 1;
                }
            }

            for &res in &self.resolutions {
                for &v in row {
                    let (sin, cos) = (PI * res * v).sin_cos();
                    enc[k] = sin;
                    enc[k + 1] = cos;
                    k += 2;
                }
            }
        }

        out
    }
}

/// Contracts unbounded space into a ball of radius two using the L-infinity norm.
#[derive(Debug, Clone, Copy, Default)]
pub struct SceneContraction;

impl SceneContraction {
    /// Contracts `positions`, `[M, 3]`, and maps the result into the unit cube.
    pub fn apply(&self, positions: ArrayView2<f32>) -> Array2<f32> {
        let mut out = positions.to_owned();

        for mut p in out.rows_mut() {
            let mag = p.iter().fold(0f32, |m, v| m.max(v.abs()));
            if mag > 1. {
                let scale = (2. - 1. / mag) / mag;
                p *= scale;
            }
            p.mapv_inplace(|v| (v + 2.) / 4.);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn encoding_width_matches_levels() {
        let encoding = FrequencyEncoding::new(3, 4, 1., 8., true);
        assert_eq!(encoding.out_dim(), 3 + 3 * 4 * 2);

        let enc = encoding.encode(array![[0.1, 0.2, 0.3]].view());
        assert_eq!(enc.dim(), (1, 27));
        assert_eq!(enc[[0, 1]], 0.2);
        // first level runs at the base resolution
        assert!((enc[[0, 3]] - (PI * 0.1).sin()).abs() < 1e-6);
    }

    #[test]
    fn contraction_keeps_everything_in_the_unit_cube() {
        let p = array![[0., 0., 0.], [0.5, -1., 0.], [100., 3., -1000.]];
        let c = SceneContraction.apply(p.view());

        assert_eq!(c.row(0).to_vec(), vec![0.5, 0.5, 0.5]);
        assert_eq!(c.row(1).to_vec(), vec![0.625, 0.25, 0.5]);
        assert!(c.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }
}
