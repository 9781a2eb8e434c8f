use ndarray::{Array, Array1, Array2, Array3, ArrayD, ArrayView2, Axis, Dimension, Zip};
use nerf::{NerfErr, Result};

use crate::config::HessianShape;

/// Generalized Gauss-Newton curvature of an output layer with `O` outputs over `D` augmented
/// inputs, the last one being the bias.
#[derive(Debug, Clone, PartialEq)]
pub enum Hessian {
    /// The diagonal of every output block, `[O, D]`.
    Diag(Array2<f32>),
    /// Every output block approximated as `b[o] * a`.
    Kron {
        /// Input factor, `[D, D]`.
        a: Array2<f32>,
        /// Output factor, `[O]`.
        b: Array1<f32>,
        /// Batches summed into `a`, `b` holds their mean.
        updates: usize,
    },
    /// Every output block, `[O, D, D]`.
    Full(Array3<f32>),
}

fn shapes_differ(what: &str) -> NerfErr {
    NerfErr::Shape(format!("cannot fold a {what} curvature into a differently shaped one"))
}

fn blend<D: Dimension>(
    h: &mut Array<f32, D>,
    batch: &Array<f32, D>,
    ema_decay: Option<f32>,
) -> Result<()> {
    if h.shape() != batch.shape() {
        return Err(shapes_differ("batch"));
    }

    Zip::from(h).and(batch).for_each(|h, &hb| {
        *h = match ema_decay {
            Some(d) => d * *h + (1. - d) * hb,
            None => *h + hb,
        }
    });

    Ok(())
}

impl Hessian {
    pub fn zeros(shape: HessianShape, num_outputs: usize, dim: usize) -> Self {
        match shape {
            HessianShape::Diag => Hessian::Diag(Array2::zeros((num_outputs, dim))),
            HessianShape::Kron => Hessian::Kron {
                a: Array2::zeros((dim, dim)),
                b: Array1::zeros(num_outputs),
                updates: 0,
            },
            HessianShape::Full => Hessian::Full(Array3::zeros((num_outputs, dim, dim))),
        }
    }

    /// Computes the curvature of a single batch.
    ///
    /// # Arguments
    /// * `shape` - The structure to keep.
    /// * `features` - The layer inputs with a trailing one, `[M, D]`.
    /// * `jac_sq` - The squared derivative of every output activation, `[M, O]`.
    pub fn from_batch(
        shape: HessianShape,
        features: ArrayView2<f32>,
        jac_sq: ArrayView2<f32>,
    ) -> Result<Self> {
        if features.nrows() != jac_sq.nrows() {
            return Err(NerfErr::SizeMismatch {
                what: "curvature points",
                got: jac_sq.nrows(),
                expected: features.nrows(),
            });
        }

        let (num_outputs, dim) = (jac_sq.ncols(), features.ncols());

        let hessian = match shape {
            HessianShape::Diag => {
                let sq = features.mapv(|p| p * p);
                Hessian::Diag(jac_sq.t().dot(&sq))
            }
            HessianShape::Kron => Hessian::Kron {
                a: features.t().dot(&features),
                b: jac_sq
                    .mean_axis(Axis(0))
                    .unwrap_or_else(|| Array1::zeros(num_outputs)),
                updates: 1,
            },
            HessianShape::Full => {
                let mut blocks = Array3::zeros((num_outputs, dim, dim));
                for (mut block, jac) in blocks.outer_iter_mut().zip(jac_sq.columns()) {
                    let weighted = &features * &jac.insert_axis(Axis(1));
                    block.assign(&weighted.t().dot(&features));
                }
                Hessian::Full(blocks)
            }
        };

        Ok(hessian)
    }

    pub fn shape(&self) -> HessianShape {
        match self {
            Hessian::Diag(_) => HessianShape::Diag,
            Hessian::Kron { .. } => HessianShape::Kron,
            Hessian::Full(_) => HessianShape::Full,
        }
    }

    pub fn num_outputs(&self) -> usize {
        match self {
            Hessian::Diag(h) => h.nrows(),
            Hessian::Kron { b, .. } => b.len(),
            Hessian::Full(h) => h.len_of(Axis(0)),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Hessian::Diag(h) => h.ncols(),
            Hessian::Kron { a, .. } => a.nrows(),
            Hessian::Full(h) => h.len_of(Axis(1)),
        }
    }

    /// Folds the curvature of a batch in.
    ///
    /// # Arguments
    /// * `batch` - A curvature of the same shape.
    /// * `ema_decay` - Blends `d h + (1 - d) batch` when given, sums otherwise. Kronecker
    ///   factors are blended independently.
    pub fn update(&mut self, batch: Hessian, ema_decay: Option<f32>) -> Result<()> {
        match (self, batch) {
            (Hessian::Diag(h), Hessian::Diag(hb)) => blend(h, &hb, ema_decay),
            (Hessian::Full(h), Hessian::Full(hb)) => blend(h, &hb, ema_decay),
            (
                Hessian::Kron { a, b, updates },
                Hessian::Kron {
                    a: ab,
                    b: bb,
                    ..
                },
            ) => {
                if b.len() != bb.len() {
                    return Err(shapes_differ("kronecker"));
                }

                if ema_decay.is_some() {
                    blend(a, &ab, ema_decay)?;
                    blend(b, &bb, ema_decay)?;
                } else {
                    blend(a, &ab, None)?;
                    *updates += 1;
                    let k = *updates as f32;
                    Zip::from(b).and(&bb).for_each(|b, &bb| *b += (bb - *b) / k);
                }

                Ok(())
            }
            (current, batch) => Err(NerfErr::Shape(format!(
                "cannot fold a {:?} curvature into a {:?} one",
                batch.shape(),
                current.shape()
            ))),
        }
    }

    /// The curvature of output `o` as a dense `[D, D]` matrix.
    pub fn block(&self, o: usize) -> Array2<f32> {
        match self {
            Hessian::Diag(h) => Array2::from_diag(&h.row(o)),
            Hessian::Kron { a, b, .. } => a * b[o],
            Hessian::Full(h) => h.index_axis(Axis(0), o).to_owned(),
        }
    }

    /// The curvature as a plain tensor: `[O, D]` for the diagonal and Kronecker shapes (the
    /// latter as the diagonal of every block), `[O, D, D]` for the full one.
    pub fn to_array(&self) -> ArrayD<f32> {
        match self {
            Hessian::Diag(h) => h.clone().into_dyn(),
            Hessian::Kron { a, b, .. } => {
                let diag = a.diag();
                Array2::from_shape_fn((b.len(), diag.len()), |(o, d)| b[o] * diag[d]).into_dyn()
            }
            Hessian::Full(h) => h.clone().into_dyn(),
        }
    }
}
