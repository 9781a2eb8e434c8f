use ndarray::{Array2, ArrayView2};
use rand::Rng;

use super::Dense;
use crate::{NerfErr, Result, arch::activations::ActFn};

/// A stack of `Dense` layers: information flows forward from the first layer to the last.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Dense>,
}

impl Mlp {
    /// Creates a new `Mlp`.
    ///
    /// # Arguments
    /// * `in_dim` - The input width.
    /// * `num_layers` - The total amount of layers, including the output layer.
    /// * `hidden_dim` - The width of every hidden layer.
    /// * `out_dim` - The output width.
    /// * `act_fn` - The activation of the hidden layers.
    /// * `out_act_fn` - The activation of the output layer, if any.
    /// * `rng` - The random number generator used for initialization.
    ///
    /// # Returns
    /// A new `Mlp` instance or an error if `num_layers` is zero.
    pub fn new<R: Rng + ?Sized>(
        in_dim: usize,
        num_layers: usize,
        hidden_dim: usize,
        out_dim: usize,
        act_fn: ActFn,
        out_act_fn: Option<ActFn>,
        rng: &mut R,
    ) -> Result<Self> {
        if num_layers == 0 {
            return Err(NerfErr::InvalidConfig(
                "an mlp needs at least one layer".into(),
            ));
        }

        let mut layers = Vec::with_capacity(num_layers);
        let mut dim_in = in_dim;

        for _ in 0..num_layers - 1 {
            layers.push(Dense::new((dim_in, hidden_dim), Some(act_fn), rng));
            dim_in = hidden_dim;
        }
        layers.push(Dense::new((dim_in, out_dim), out_act_fn, rng));

        Ok(Self { layers })
    }

    /// Creates an `Mlp` out of already built layers.
    pub fn from_layers<I>(layers: I) -> Result<Self>
    where
        I: IntoIterator<Item = Dense>,
    {
        let layers: Vec<_> = layers.into_iter().collect();

        for pair in layers.windows(2) {
            let (prev, next) = (pair[0].dim(), pair[1].dim());
            if prev.1 != next.0 {
                return Err(NerfErr::SizeMismatch {
                    what: "mlp layer input",
                    got: next.0,
                    expected: prev.1,
                });
            }
        }

        if layers.is_empty() {
            return Err(NerfErr::InvalidConfig(
                "an mlp needs at least one layer".into(),
            ));
        }

        Ok(Self { layers })
    }

    pub fn out_dim(&self) -> usize {
        self.output_layer().dim().1
    }

    /// Returns the amount of parameters in the network.
    pub fn size(&self) -> usize {
        self.layers.iter().map(Dense::size).sum()
    }

    /// The last layer of the network.
    pub fn output_layer(&self) -> &Dense {
        // `new` and `from_layers` never build an empty network
        &self.layers[self.layers.len() - 1]
    }

    /// Makes a forward pass through the network.
    pub fn forward(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let (_, z) = self.forward_with_features(x)?;

        let Some(act_fn) = self.output_layer().act_fn() else {
            return Ok(z);
        };

        Ok(z.mapv_into(|z| act_fn.f(z)))
    }

    /// Makes a forward pass stopping right before the output activation.
    ///
    /// # Returns
    /// The input of the output layer (the last hidden features) and the output layer's
    /// pre-activation.
    pub fn forward_with_features(&self, x: ArrayView2<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        let nlayers = self.layers.len();
        let mut h = x.to_owned();

        for layer in &self.layers[..nlayers - 1] {
            h = layer.forward(h.view())?;
        }

        let z = self.output_layer().pre_activation(h.view())?;
        Ok((h, z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn shapes_flow_through_the_stack() {
        let mut rng = StdRng::seed_from_u64(0);
        let mlp = Mlp::new(5, 3, 8, 2, ActFn::Tanh, Some(ActFn::Sigmoid), &mut rng).unwrap();

        let x = Array2::ones((7, 5));
        let (features, z) = mlp.forward_with_features(x.view()).unwrap();
        assert_eq!(features.dim(), (7, 8));
        assert_eq!(z.dim(), (7, 2));

        let y = mlp.forward(x.view()).unwrap();
        assert!(y.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(mlp.size(), 6 * 8 + 9 * 8 + 9 * 2);
    }

    #[test]
    fn single_layer_features_are_the_input() {
        let dense = Dense::from_params(array![[2.], [3.]], array![1.], None).unwrap();
        let mlp = Mlp::from_layers([dense]).unwrap();

        let (features, z) = mlp.forward_with_features(array![[1., 1.]].view()).unwrap();
        assert_eq!(features, array![[1., 1.]]);
        assert_eq!(z, array![[6.]]);
    }

    #[test]
    fn mismatched_layers_are_rejected() {
        let a = Dense::from_params(Array2::zeros((2, 3)), ndarray::Array1::zeros(3), None).unwrap();
        let b = Dense::from_params(Array2::zeros((4, 1)), ndarray::Array1::zeros(1), None).unwrap();
        assert!(Mlp::from_layers([a, b]).is_err());
    }
}
