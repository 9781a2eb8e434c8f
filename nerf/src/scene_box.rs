use ndarray::{Array1, Array2, ArrayView2, array};

use crate::{NerfErr, Result};

/// An axis aligned box enclosing the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneBox {
    aabb: Array2<f32>,
}

impl SceneBox {
    /// Creates a new `SceneBox`.
    ///
    /// # Arguments
    /// * `aabb` - The lower and upper corners, `[2, 3]`.
    pub fn new(aabb: Array2<f32>) -> Result<Self> {
        if aabb.dim() != (2, 3) {
            return Err(NerfErr::SizeMismatch {
                what: "scene box corners",
                got: aabb.len(),
                expected: 6,
            });
        }

        Ok(Self { aabb })
    }

    /// A box spanning `[-scale, scale]` on every axis.
    pub fn cube(scale: f32) -> Self {
        Self {
            aabb: array![[-scale, -scale, -scale], [scale, scale, scale]],
        }
    }

    /// Maps positions, `[M, 3]`, into the unit cube spanned by the box.
    pub fn normalize_positions(&self, positions: ArrayView2<f32>) -> Array2<f32> {
        let lo = self.aabb.row(0);
        let extent: Array1<f32> = &self.aabb.row(1) - &lo;
        (&positions - &lo) / &extent
    }
}
