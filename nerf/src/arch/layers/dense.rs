use ndarray::{linalg, prelude::*};
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::Uniform;

use crate::{NerfErr, Result, arch::activations::ActFn};

/// A fully connected layer `a = act_fn(x w + b)`.
///
/// The weights are stored as `[in, out]` so a batch of rows can be multiplied directly.
#[derive(Debug, Clone)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,
    w: Array2<f32>,
    b: Array1<f32>,
}

impl Dense {
    /// Creates a new `Dense` layer with Xavier-uniform weights and zero biases.
    ///
    /// # Arguments
    /// * `dim` - The input and output dimension of the layer.
    /// * `act_fn` - The activation applied to the output, if any.
    /// * `rng` - The random number generator used for initialization.
    pub fn new<R: Rng + ?Sized>(dim: (usize, usize), act_fn: Option<ActFn>, rng: &mut R) -> Self {
        let limit = (6. / (dim.0 + dim.1) as f32).sqrt();
        let w = match Uniform::new_inclusive(-limit, limit) {
            Ok(dist) => Array2::random_using(dim, dist, rng),
            Err(_) => Array2::zeros(dim),
        };

        Self {
            dim,
            act_fn,
            w,
            b: Array1::zeros(dim.1),
        }
    }

    /// Creates a `Dense` layer from explicit parameters.
    pub fn from_params(w: Array2<f32>, b: Array1<f32>, act_fn: Option<ActFn>) -> Result<Self> {
        if w.ncols() != b.len() {
            return Err(NerfErr::SizeMismatch {
                what: "dense biases",
                got: b.len(),
                expected: w.ncols(),
            });
        }

        Ok(Self {
            dim: w.dim(),
            act_fn,
            w,
            b,
        })
    }

    /// Returns the size of this layer.
    ///
    /// # Returns
    /// The amount of parameters this layer has.
    pub fn size(&self) -> usize {
        (self.dim.0 + 1) * self.dim.1
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    pub fn act_fn(&self) -> Option<ActFn> {
        self.act_fn
    }

    /// Computes the pre-activation `x w + b`.
    pub fn pre_activation(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.dim.0 {
            return Err(NerfErr::SizeMismatch {
                what: "dense input",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &self.w, 0.0, &mut z);
        z += &self.b;
        Ok(z)
    }

    /// Makes a forward pass through the layer.
    pub fn forward(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let z = self.pre_activation(x)?;

        let Some(act_fn) = self.act_fn else {
            return Ok(z);
        };

        Ok(z.mapv_into(|z| act_fn.f(z)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn forward_applies_weights_bias_and_activation() {
        let w = array![[1., -1.], [2., 0.5]];
        let b = array![0.5, -3.];
        let dense = Dense::from_params(w, b, Some(ActFn::Relu)).unwrap();

        let y = dense.forward(array![[1., 1.]].view()).unwrap();
        assert_eq!(y, array![[3.5, 0.]]);
    }

    #[test]
    fn wrong_input_width_is_a_size_mismatch() {
        let dense = Dense::from_params(Array2::zeros((3, 2)), Array1::zeros(2), None).unwrap();
        let err = dense.forward(Array2::zeros((4, 2)).view()).unwrap_err();
        assert_eq!(
            err,
            NerfErr::SizeMismatch {
                what: "dense input",
                got: 2,
                expected: 3
            }
        );
    }
}
