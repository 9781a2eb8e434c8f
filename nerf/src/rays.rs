use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Zip, s};
use serde::{Deserialize, Serialize};

use crate::{NerfErr, Result};

/// Maps euclidean distances along a ray into the space samples are spread in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Spacing {
    Linear,
    /// Linear up to a distance of one, disparity beyond it.
    #[default]
    LinDisp,
}

impl Spacing {
    pub fn f(&self, t: f32) -> f32 {
        match self {
            Spacing::Linear => t,
            Spacing::LinDisp if t < 1. => t,
            Spacing::LinDisp => 2. - 1. / t,
        }
    }

    pub fn inv(&self, s: f32) -> f32 {
        match self {
            Spacing::Linear => s,
            Spacing::LinDisp if s < 1. => s,
            Spacing::LinDisp => 1. / (2. - s).max(f32::EPSILON),
        }
    }
}

/// A batch of camera rays.
#[derive(Debug, Clone)]
pub struct RayBundle {
    origins: Array2<f32>,
    directions: Array2<f32>,
    nears: Array1<f32>,
    fars: Array1<f32>,
    camera_indices: Array1<usize>,
}

impl RayBundle {
    /// Creates a new `RayBundle` with every ray spanning `[near, far]`.
    ///
    /// # Arguments
    /// * `origins` - The ray origins, `[N, 3]`.
    /// * `directions` - The ray directions, `[N, 3]`. They get normalized.
    /// * `camera_indices` - The index of the camera each ray was shot from.
    /// * `near` - The near plane.
    /// * `far` - The far plane.
    pub fn new(
        origins: Array2<f32>,
        mut directions: Array2<f32>,
        camera_indices: Array1<usize>,
        near: f32,
        far: f32,
    ) -> Result<Self> {
        let n = origins.nrows();

        if origins.ncols() != 3 {
            return Err(NerfErr::SizeMismatch {
                what: "ray origins width",
                got: origins.ncols(),
                expected: 3,
            });
        }
        if directions.dim() != (n, 3) {
            return Err(NerfErr::SizeMismatch {
                what: "ray directions",
                got: directions.nrows(),
                expected: n,
            });
        }
        if camera_indices.len() != n {
            return Err(NerfErr::SizeMismatch {
                what: "camera indices",
                got: camera_indices.len(),
                expected: n,
            });
        }
        if !(near > 0. && far > near) {
            return Err(NerfErr::InvalidConfig(format!(
                "near ({near}) and far ({far}) planes must satisfy 0 < near < far"
            )));
        }

        for mut d in directions.rows_mut() {
            let norm = d.dot(&d).sqrt().max(f32::EPSILON);
            d /= norm;
        }

        Ok(Self {
            origins,
            directions,
            nears: Array1::from_elem(n, near),
            fars: Array1::from_elem(n, far),
            camera_indices,
        })
    }

    pub fn len(&self) -> usize {
        self.origins.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn origins(&self) -> ArrayView2<'_, f32> {
        self.origins.view()
    }

    pub fn directions(&self) -> ArrayView2<'_, f32> {
        self.directions.view()
    }

    pub fn nears(&self) -> ArrayView1<'_, f32> {
        self.nears.view()
    }

    pub fn fars(&self) -> ArrayView1<'_, f32> {
        self.fars.view()
    }

    pub fn camera_indices(&self) -> ArrayView1<'_, usize> {
        self.camera_indices.view()
    }
}

/// Ordered samples along every ray of a bundle.
///
/// Samples are stored as bin edges, `[N, S + 1]`, both in the normalized spacing space and as
/// euclidean distances.
#[derive(Debug, Clone)]
pub struct RaySamples {
    origins: Array2<f32>,
    directions: Array2<f32>,
    camera_indices: Array1<usize>,
    spacing_bins: Array2<f32>,
    bins: Array2<f32>,
}

impl RaySamples {
    /// Builds the samples of `bundle` given their normalized bin edges.
    ///
    /// # Arguments
    /// * `bundle` - The rays being sampled.
    /// * `spacing` - How the normalized edges map into distances.
    /// * `spacing_bins` - Non-decreasing bin edges in `[0, 1]`, `[N, S + 1]`.
    pub fn from_spacing(
        bundle: &RayBundle,
        spacing: Spacing,
        spacing_bins: Array2<f32>,
    ) -> Result<Self> {
        if spacing_bins.nrows() != bundle.len() {
            return Err(NerfErr::SizeMismatch {
                what: "spacing bins rows",
                got: spacing_bins.nrows(),
                expected: bundle.len(),
            });
        }
        if spacing_bins.ncols() < 2 {
            return Err(NerfErr::SizeMismatch {
                what: "spacing bins edges",
                got: spacing_bins.ncols(),
                expected: 2,
            });
        }

        let mut bins = spacing_bins.clone();
        Zip::from(bins.rows_mut())
            .and(bundle.nears())
            .and(bundle.fars())
            .for_each(|mut row, &near, &far| {
                let (s_near, s_far) = (spacing.f(near), spacing.f(far));
                row.mapv_inplace(|s| spacing.inv(s_near + s * (s_far - s_near)));
            });

        Ok(Self {
            origins: bundle.origins.clone(),
            directions: bundle.directions.clone(),
            camera_indices: bundle.camera_indices.clone(),
            spacing_bins,
            bins,
        })
    }

    pub fn num_rays(&self) -> usize {
        self.bins.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.bins.ncols() - 1
    }

    pub fn spacing_bins(&self) -> ArrayView2<'_, f32> {
        self.spacing_bins.view()
    }

    pub fn bins(&self) -> ArrayView2<'_, f32> {
        self.bins.view()
    }

    pub fn starts(&self) -> ArrayView2<'_, f32> {
        self.bins.slice(s![.., ..-1])
    }

    pub fn ends(&self) -> ArrayView2<'_, f32> {
        self.bins.slice(s![.., 1..])
    }

    pub fn deltas(&self) -> Array2<f32> {
        &self.ends() - &self.starts()
    }

    pub fn midpoints(&self) -> Array2<f32> {
        (&self.starts() + &self.ends()) * 0.5
    }

    pub fn directions(&self) -> ArrayView2<'_, f32> {
        self.directions.view()
    }

    pub fn camera_indices(&self) -> ArrayView1<'_, usize> {
        self.camera_indices.view()
    }

    /// Returns the euclidean position of every sample midpoint, `[N, S, 3]`.
    pub fn positions(&self) -> Array3<f32> {
        let mids = self.midpoints();
        let mut positions = Array3::zeros((self.num_rays(), self.num_samples(), 3));

        Zip::from(positions.outer_iter_mut())
            .and(mids.rows())
            .and(self.origins.rows())
            .and(self.directions.rows())
            .for_each(|mut ray, t, o, d| {
                for (mut p, &t) in ray.outer_iter_mut().zip(t) {
                    p.assign(&(&o + &(&d * t)));
                }
            });

        positions
    }

    /// Returns the ray direction of every sample, `[N, S, 3]`.
    pub fn sample_directions(&self) -> Array3<f32> {
        let d = self.directions.view().insert_axis(Axis(1));
        d.broadcast((self.num_rays(), self.num_samples(), 3))
            .map(|d| d.to_owned())
            .unwrap_or_else(|| Array3::zeros((0, 0, 3)))
    }

    /// Computes the transmittance weighted contribution of each sample.
    ///
    /// # Arguments
    /// * `densities` - The density at each sample, `[N, S]`.
    ///
    /// # Returns
    /// The per sample weights, `[N, S]`.
    pub fn get_weights(&self, densities: ArrayView2<f32>) -> Result<Array2<f32>> {
        if densities.dim() != (self.num_rays(), self.num_samples()) {
            return Err(NerfErr::SizeMismatch {
                what: "densities",
                got: densities.len(),
                expected: self.num_rays() * self.num_samples(),
            });
        }

        let deltas = self.deltas();
        let mut weights = Array2::zeros(densities.raw_dim());

        Zip::from(weights.rows_mut())
            .and(densities.rows())
            .and(deltas.rows())
            .par_for_each(|mut w, sigma, delta| {
                let mut optical_depth = 0f32;
                for ((w, &sigma), &delta) in w.iter_mut().zip(sigma).zip(delta) {
                    let dd = sigma * delta;
                    let alpha = 1. - (-dd).exp();
                    let transmittance = (-optical_depth).exp();
                    let weight = alpha * transmittance;
                    *w = if weight.is_finite() { weight } else { 0. };
                    optical_depth += dd;
                }
            });

        Ok(weights)
    }
}
