//! Pinhole cameras that shoot one ray per pixel.

use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::{Array1, Array2};

use crate::{NerfErr, Result, rays::RayBundle};

/// A pinhole camera. The camera looks down its local `-z` axis with `+y` up.
#[derive(Debug, Clone)]
pub struct Camera {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub width: usize,
    pub height: usize,
    /// Camera to world rotation.
    pub rotation: Matrix3<f32>,
    /// Camera center in world coordinates.
    pub center: Point3<f32>,
}

impl Camera {
    /// Creates a camera at `eye` looking at `target`, with a horizontal field of view of `fov_x`
    /// radians.
    pub fn look_at(
        eye: Point3<f32>,
        target: Point3<f32>,
        up: Vector3<f32>,
        fov_x: f32,
        width: usize,
        height: usize,
    ) -> Result<Self> {
        let forward = (target - eye).try_normalize(f32::EPSILON).ok_or_else(|| {
            NerfErr::InvalidConfig("camera eye and target must not coincide".into())
        })?;
        let right = forward.cross(&up).try_normalize(f32::EPSILON).ok_or_else(|| {
            NerfErr::InvalidConfig("camera up vector is parallel to the view direction".into())
        })?;
        let true_up = right.cross(&forward);
        let rotation = Matrix3::from_columns(&[right, true_up, -forward]);

        let fx = width as f32 / (2. * (fov_x / 2.).tan());

        Ok(Self {
            fx,
            fy: fx,
            cx: width as f32 / 2.,
            cy: height as f32 / 2.,
            width,
            height,
            rotation,
            center: eye,
        })
    }

    pub fn num_pixels(&self) -> usize {
        self.width * self.height
    }

    /// Generates one ray through the center of every pixel, row-major.
    ///
    /// # Arguments
    /// * `camera_index` - The index stored in every generated ray.
    /// * `near` - The near plane.
    /// * `far` - The far plane.
    pub fn generate_rays(&self, camera_index: usize, near: f32, far: f32) -> Result<RayBundle> {
        let n = self.num_pixels();
        let mut origins = Array2::zeros((n, 3));
        let mut directions = Array2::zeros((n, 3));

        let rows = origins.rows_mut().into_iter().zip(directions.rows_mut());

        for (i, (mut o, mut d)) in rows.enumerate() {
            let (u, v) = ((i % self.width) as f32 + 0.5, (i / self.width) as f32 + 0.5);
            let local = Vector3::new((u - self.cx) / self.fx, -(v - self.cy) / self.fy, -1.);
            let world = self.rotation * local;

            o.assign(&Array1::from_iter(self.center.coords.iter().copied()));
            d.assign(&Array1::from_iter(world.iter().copied()));
        }

        RayBundle::new(origins, directions, Array1::from_elem(n, camera_index), near, far)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn central_ray_points_at_the_target() {
        let camera = Camera::look_at(
            Point3::new(0., 0., 4.),
            Point3::origin(),
            Vector3::y(),
            0.8,
            3,
            3,
        )
        .unwrap();

        let rays = camera.generate_rays(7, 0.1, 10.).unwrap();
        assert_eq!(rays.len(), 9);
        assert_eq!(rays.camera_indices()[4], 7);

        let d = rays.directions().row(4).to_owned();
        assert!(d[0].abs() < 1e-6 && d[1].abs() < 1e-6);
        assert!((d[2] + 1.).abs() < 1e-6);
    }

    #[test]
    fn degenerate_poses_are_rejected() {
        let eye = Point3::new(0., 0., 1.);
        assert!(Camera::look_at(eye, eye, Vector3::y(), 0.8, 2, 2).is_err());
        assert!(Camera::look_at(eye, Point3::origin(), Vector3::z(), 0.8, 2, 2).is_err());
    }
}
