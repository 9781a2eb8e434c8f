use log::{debug, warn};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView2};
use ndarray_rand::RandomExt;
use nerf::{NerfErr, Result, arch::activations::ActFn};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use super::Hessian;
use crate::config::HessianShape;

/// The predictive distribution of every output at every point, each `[M, O]`.
#[derive(Debug, Clone)]
pub struct Predictive {
    pub mean: Array2<f32>,
    pub sigma: Array2<f32>,
    /// A single posterior draw, the mean for the linearized predictive.
    pub draw: Array2<f32>,
}

impl Predictive {
    fn from_columns(columns: Vec<(Array1<f32>, Array1<f32>, Array1<f32>)>, m: usize) -> Self {
        let o = columns.len();
        let mut predictive = Self {
            mean: Array2::zeros((m, o)),
            sigma: Array2::zeros((m, o)),
            draw: Array2::zeros((m, o)),
        };

        for (k, (mean, sigma, draw)) in columns.into_iter().enumerate() {
            predictive.mean.column_mut(k).assign(&mean);
            predictive.sigma.column_mut(k).assign(&sigma);
            predictive.draw.column_mut(k).assign(&draw);
        }

        predictive
    }
}

/// Gaussian posterior over the weights of an output layer, centered at the trained weights.
///
/// The outputs are independent a posteriori, output `o` has precision `H_o + lambda I`.
#[derive(Debug, Clone)]
pub struct LastLayerLaplace {
    hessian: Hessian,
    prior_precision: f32,
    ema_decay: Option<f32>,
    /// Lower Cholesky factor of every output's precision, dropped on every update.
    factors: Option<Vec<DMatrix<f32>>>,
}

impl LastLayerLaplace {
    /// Creates a new `LastLayerLaplace` with zero curvature.
    ///
    /// # Arguments
    /// * `shape` - The structure of the kept curvature.
    /// * `num_outputs` - The outputs of the layer.
    /// * `dim` - The inputs of the layer, bias included.
    /// * `prior_precision` - The isotropic prior precision `lambda`.
    /// * `ema_decay` - The decay of the curvature moving average, `None` to sum batches.
    pub fn new(
        shape: HessianShape,
        num_outputs: usize,
        dim: usize,
        prior_precision: f32,
        ema_decay: Option<f32>,
    ) -> Self {
        Self {
            hessian: Hessian::zeros(shape, num_outputs, dim),
            prior_precision,
            ema_decay,
            factors: None,
        }
    }

    pub fn hessian(&self) -> &Hessian {
        &self.hessian
    }

    /// Folds the curvature of a batch in.
    ///
    /// # Arguments
    /// * `features` - The layer inputs with a trailing one, `[M, D]`.
    /// * `jac_sq` - The squared derivative of every output activation, `[M, O]`.
    pub fn update(&mut self, features: ArrayView2<f32>, jac_sq: ArrayView2<f32>) -> Result<()> {
        self.check_inputs(features, jac_sq)?;

        let batch = Hessian::from_batch(self.hessian.shape(), features, jac_sq)?;
        self.hessian.update(batch, self.ema_decay)?;
        self.factors = None;

        Ok(())
    }

    fn check_inputs(&self, features: ArrayView2<f32>, per_output: ArrayView2<f32>) -> Result<()> {
        if features.ncols() != self.hessian.dim() {
            return Err(NerfErr::SizeMismatch {
                what: "laplace layer inputs",
                got: features.ncols(),
                expected: self.hessian.dim(),
            });
        }
        if per_output.dim() != (features.nrows(), self.hessian.num_outputs()) {
            return Err(NerfErr::SizeMismatch {
                what: "laplace layer outputs",
                got: per_output.len(),
                expected: features.nrows() * self.hessian.num_outputs(),
            });
        }

        Ok(())
    }

    fn precision_factor(&self, o: usize) -> DMatrix<f32> {
        let d = self.hessian.dim();
        let block = self.hessian.block(o);
        let precision = DMatrix::from_fn(d, d, |i, j| {
            block[[i, j]] + if i == j { self.prior_precision } else { 0. }
        });

        match precision.cholesky() {
            Some(cholesky) => cholesky.l(),
            None => {
                warn!(output = o; "posterior precision is not positive definite, using the prior");
                DMatrix::from_diagonal_element(d, d, self.prior_precision.sqrt())
            }
        }
    }

    fn factors(&mut self) -> &[DMatrix<f32>] {
        if self.factors.is_none() {
            let factors = (0..self.hessian.num_outputs())
                .map(|o| self.precision_factor(o))
                .collect();
            self.factors = Some(factors);
        }

        self.factors.as_deref().unwrap_or_default()
    }

    /// The predictive of the network linearized at the trained weights.
    ///
    /// # Arguments
    /// * `features` - The layer inputs with a trailing one, `[M, D]`.
    /// * `pre` - The pre-activations at the trained weights, `[M, O]`.
    /// * `act_fn` - The output activation.
    pub fn linearized(
        &mut self,
        features: ArrayView2<f32>,
        pre: ArrayView2<f32>,
        act_fn: ActFn,
    ) -> Result<Predictive> {
        self.check_inputs(features, pre)?;

        let m = features.nrows();
        let pt = DMatrix::from_fn(features.ncols(), m, |i, j| features[[j, i]]);
        let factors = self.factors();

        let columns = factors
            .par_iter()
            .enumerate()
            .map(|(o, l)| {
                let v = l
                    .solve_lower_triangular(&pt)
                    .ok_or_else(|| NerfErr::Numerical("singular precision factor".into()))?;

                let z = pre.column(o);
                let mean = z.mapv(|z| act_fn.f(z));
                let sigma = Array1::from_iter(
                    v.column_iter()
                        .zip(z)
                        .map(|(v, &z)| act_fn.df(z).abs() * v.norm_squared().sqrt()),
                );

                Ok((mean.clone(), sigma, mean))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Predictive::from_columns(columns, m))
    }

    /// The Monte-Carlo predictive over `num_samples` posterior draws of the weights, shared by
    /// every point.
    ///
    /// # Arguments
    /// * `features` - The layer inputs with a trailing one, `[M, D]`.
    /// * `pre` - The pre-activations at the trained weights, `[M, O]`.
    /// * `act_fn` - The output activation.
    /// * `num_samples` - The amount of posterior draws.
    /// * `rng` - The source of the draws.
    pub fn sampled<R: Rng + ?Sized>(
        &mut self,
        features: ArrayView2<f32>,
        pre: ArrayView2<f32>,
        act_fn: ActFn,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Predictive> {
        self.check_inputs(features, pre)?;
        if num_samples == 0 {
            return Err(NerfErr::InvalidConfig("cannot draw zero posterior samples".into()));
        }

        let (m, d) = features.dim();
        let noise: Vec<Array2<f32>> = (0..self.hessian.num_outputs())
            .map(|_| Array2::random_using((d, num_samples), StandardNormal, rng))
            .collect();

        let p = DMatrix::from_fn(m, d, |i, j| features[[i, j]]);
        let factors = self.factors();

        let columns = factors
            .par_iter()
            .zip(&noise)
            .enumerate()
            .map(|(o, (l, noise))| {
                let e = DMatrix::from_fn(d, num_samples, |i, j| noise[[i, j]]);
                let delta_w = l
                    .transpose()
                    .solve_upper_triangular(&e)
                    .ok_or_else(|| NerfErr::Numerical("singular precision factor".into()))?;
                let delta_z = &p * delta_w;

                let z = pre.column(o);
                let mut mean = Array1::zeros(m);
                let mut sigma = Array1::zeros(m);
                let mut draw = Array1::zeros(m);

                for (i, &z) in z.iter().enumerate() {
                    let values: Vec<f32> =
                        delta_z.row(i).iter().map(|dz| act_fn.f(z + dz)).collect();
                    let mu = values.iter().sum::<f32>() / num_samples as f32;
                    let var = if num_samples > 1 {
                        values.iter().map(|v| (v - mu).powi(2)).sum::<f32>()
                            / (num_samples - 1) as f32
                    } else {
                        0.
                    };

                    mean[i] = mu;
                    sigma[i] = var.sqrt();
                    draw[i] = values[0];
                }

                Ok((mean, sigma, draw))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(points = m, samples = num_samples; "sampled last layer posterior");
        Ok(Predictive::from_columns(columns, m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};

    fn features() -> Array2<f32> {
        array![[1., 0., 1.], [0., 1., 1.], [3., 3., 1.]]
    }

    #[test]
    fn curvature_shrinks_the_linearized_uncertainty() {
        let mut laplace = LastLayerLaplace::new(HessianShape::Full, 1, 3, 1., None);
        let pre = Array2::zeros((3, 1));

        let before = laplace.linearized(features().view(), pre.view(), ActFn::Sigmoid).unwrap();
        laplace
            .update(features().view(), Array2::from_elem((3, 1), 1.).view())
            .unwrap();
        let after = laplace.linearized(features().view(), pre.view(), ActFn::Sigmoid).unwrap();

        for (b, a) in before.sigma.iter().zip(&after.sigma) {
            assert!(a < b, "{a} is not below {b}");
        }
        assert_eq!(after.mean, Array2::from_elem((3, 1), 0.5));
        assert_eq!(after.draw, after.mean);
    }

    #[test]
    fn prior_only_variance_is_the_feature_norm() {
        let mut laplace = LastLayerLaplace::new(HessianShape::Diag, 2, 3, 4., Some(0.9));
        let pre = Array2::zeros((3, 2));

        // identity activation slope of one for relu at positive inputs
        let predictive = laplace
            .linearized(features().view(), (&pre + 1.).view(), ActFn::Relu)
            .unwrap();

        // |p|^2 / lambda = 2 / 4 for the first point
        assert!((predictive.sigma[[0, 0]] - 0.5f32.sqrt()).abs() < 1e-6);
        assert_eq!(predictive.sigma.column(0), predictive.sigma.column(1));
    }

    #[test]
    fn sampled_predictive_agrees_with_the_linearized_one() {
        let mut laplace = LastLayerLaplace::new(HessianShape::Kron, 1, 3, 1., None);
        laplace
            .update(features().view(), Array2::from_elem((3, 1), 1.).view())
            .unwrap();

        let pre = Array2::from_elem((3, 1), 1.);
        let mut rng = StdRng::seed_from_u64(5);
        let sampled = laplace
            .sampled(features().view(), pre.view(), ActFn::Elu, 4000, &mut rng)
            .unwrap();
        let linearized = laplace.linearized(features().view(), pre.view(), ActFn::Elu).unwrap();

        // elu is the identity at positive pre-activations, small draws stay there
        for (s, l) in sampled.sigma.iter().zip(&linearized.sigma) {
            assert!((s - l).abs() / l < 0.15, "sampled {s} linearized {l}");
        }
        assert!(sampled.sigma.iter().all(|&s| s >= 0.));
    }

    #[test]
    fn sampling_is_reproducible_with_the_same_seed() {
        let mut laplace = LastLayerLaplace::new(HessianShape::Diag, 3, 3, 1., Some(0.99));
        let pre = Array2::zeros((3, 3));

        let mut draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            laplace
                .sampled(features().view(), pre.view(), ActFn::Sigmoid, 8, &mut rng)
                .unwrap()
        };

        let (a, b) = (draw(1), draw(1));
        assert_eq!(a.draw, b.draw);
        assert_eq!(a.sigma, b.sigma);
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let mut laplace = LastLayerLaplace::new(HessianShape::Diag, 1, 4, 1., None);
        let pre = Array2::zeros((3, 1));
        assert!(laplace.linearized(features().view(), pre.view(), ActFn::Tanh).is_err());
        assert!(laplace.update(features().view(), pre.view()).is_err());
    }
}
