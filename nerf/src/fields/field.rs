use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};

use crate::{NerfErr, Result, rays::RaySamples};

/// Step used by the central differences of `analytic_normals`.
const NORMALS_EPS: f32 = 1e-3;

/// Anything that can be queried for density at arbitrary positions.
pub trait DensityFn {
    /// Evaluates the density at `positions`, `[M, 3]`.
    ///
    /// # Returns
    /// One non-negative density per position, `[M]`.
    fn density(&self, positions: ArrayView2<f32>) -> Result<Array1<f32>>;
}

/// Per-sample outputs of a field query.
///
/// Channels other than `density` and `rgb` are only present when the field computes them.
#[derive(Debug, Clone)]
pub struct FieldOutputs {
    /// `[N, S]`
    pub density: Array2<f32>,
    /// `[N, S, 3]`
    pub rgb: Array3<f32>,
    /// Unit normals from the density gradient, `[N, S, 3]`.
    pub normals: Option<Array3<f32>>,
    /// Unit normals predicted by the network, `[N, S, 3]`.
    pub pred_normals: Option<Array3<f32>>,
    /// Mean radiance over the weight posterior, `[N, S, 3]`.
    pub rgb_mu: Option<Array3<f32>>,
    /// Radiance standard deviation, `[N, S, 3]`.
    pub rgb_sigma: Option<Array3<f32>>,
    /// Density standard deviation, `[N, S, 1]`.
    pub density_sigma: Option<Array3<f32>>,
}

impl FieldOutputs {
    pub fn new(density: Array2<f32>, rgb: Array3<f32>) -> Self {
        Self {
            density,
            rgb,
            normals: None,
            pred_normals: None,
            rgb_mu: None,
            rgb_sigma: None,
            density_sigma: None,
        }
    }
}

/// A neural field queried with ray samples.
pub trait Field: DensityFn {
    /// Evaluates the field at every sample.
    ///
    /// # Arguments
    /// * `ray_samples` - The samples to evaluate.
    /// * `compute_normals` - Whether the analytic and predicted normals are requested.
    fn forward(&mut self, ray_samples: &RaySamples, compute_normals: bool)
    -> Result<FieldOutputs>;

    /// Switches between training and evaluation behavior.
    fn set_training(&mut self, training: bool);
}

/// Computes `-normalize(grad density)` at `positions`, `[M, 3]`, by central differences.
pub fn analytic_normals<D>(field: &D, positions: ArrayView2<f32>) -> Result<Array2<f32>>
where
    D: DensityFn + ?Sized,
{
    let mut grad = Array2::zeros(positions.raw_dim());

    for k in 0..3 {
        let mut ahead = positions.to_owned();
        let mut behind = positions.to_owned();
        ahead.column_mut(k).mapv_inplace(|v| v + NORMALS_EPS);
        behind.column_mut(k).mapv_inplace(|v| v - NORMALS_EPS);

        let diff = field.density(ahead.view())? - field.density(behind.view())?;
        grad.column_mut(k).assign(&(diff / (2. * NORMALS_EPS)));
    }

    let mut normals = -grad;
    normalize_rows(&mut normals);
    Ok(normals)
}

/// Scales every row to unit length, leaving zero rows untouched.
pub fn normalize_rows(x: &mut Array2<f32>) {
    for mut row in x.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > f32::EPSILON {
            row /= norm;
        }
    }
}

/// Reshapes a flat per-sample array, `[N * S, C]`, into `[N, S, C]`.
pub fn unflatten(x: Array2<f32>, num_rays: usize, num_samples: usize) -> Result<Array3<f32>> {
    if x.nrows() != num_rays * num_samples {
        return Err(NerfErr::SizeMismatch {
            what: "flattened samples",
            got: x.nrows(),
            expected: num_rays * num_samples,
        });
    }

    let channels = x.ncols();
    Ok(x.into_shape_with_order((num_rays, num_samples, channels))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Density falling off linearly along `+x`.
    struct Slab;

    impl DensityFn for Slab {
        fn density(&self, positions: ArrayView2<f32>) -> Result<Array1<f32>> {
            Ok(positions.column(0).mapv(|x| 10. - x))
        }
    }

    #[test]
    fn normals_point_against_the_density_gradient() {
        let normals = analytic_normals(&Slab, array![[0., 0., 0.], [1., 2., 3.]].view()).unwrap();
        for row in normals.rows() {
            assert!((row[0] - 1.).abs() < 1e-3);
            assert!(row[1].abs() < 1e-3 && row[2].abs() < 1e-3);
        }
    }

    #[test]
    fn unflatten_checks_the_sample_count() {
        let x = Array2::<f32>::zeros((6, 2));
        assert_eq!(unflatten(x.clone(), 2, 3).unwrap().dim(), (2, 3, 2));
        assert!(unflatten(x, 4, 2).is_err());
    }
}
