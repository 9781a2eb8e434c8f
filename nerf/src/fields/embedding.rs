use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{NerfErr, Result};

/// A learned vector per training image.
#[derive(Debug, Clone)]
pub struct Embedding {
    table: Array2<f32>,
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(num_embeddings: usize, dim: usize, rng: &mut R) -> Self {
        Self {
            table: Array2::random_using((num_embeddings, dim), StandardNormal, rng),
        }
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }

    /// Looks up the embedding of every index.
    pub fn lookup(&self, indices: ArrayView1<usize>) -> Result<Array2<f32>> {
        let len = self.table.nrows();

        if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
            return Err(NerfErr::SizeMismatch {
                what: "appearance embedding index",
                got: bad,
                expected: len,
            });
        }

        let indices = indices.to_vec();
        Ok(self.table.select(Axis(0), &indices))
    }

    /// The average embedding, used for novel views.
    pub fn mean(&self) -> Array1<f32> {
        self.table
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.dim()))
    }
}
