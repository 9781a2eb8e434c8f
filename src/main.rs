use std::{env, f32::consts::TAU};

use anyhow::Context;
use la_nerf::{LaNerfModel, LaNerfModelConfig};
use log::info;
use nalgebra::{Point3, Vector3};
use ndarray::{Array2, ArrayView2, Zip};
use nerf::{
    cameras::Camera,
    models::{Batch, Model},
    rays::RayBundle,
    scene_box::SceneBox,
};

const DEFAULT_STEPS: usize = 10;
const NUM_CAMERAS: usize = 4;
const IMAGE_SIZE: usize = 8;
const CAMERA_RADIUS: f32 = 3.;
const SPHERE_RADIUS: f32 = 1.;

/// A ring of cameras around the origin, slightly above it.
fn ring_cameras() -> anyhow::Result<Vec<Camera>> {
    (0..NUM_CAMERAS)
        .map(|i| {
            let theta = TAU * i as f32 / NUM_CAMERAS as f32;
            let eye = Point3::new(CAMERA_RADIUS * theta.cos(), 0.5, CAMERA_RADIUS * theta.sin());
            let camera = Camera::look_at(
                eye,
                Point3::origin(),
                Vector3::y(),
                0.9,
                IMAGE_SIZE,
                IMAGE_SIZE,
            )?;
            Ok(camera)
        })
        .collect()
}

/// Colors every ray hitting a sphere at the origin by its surface normal, black elsewhere.
fn sphere_image(origins: ArrayView2<f32>, directions: ArrayView2<f32>) -> Array2<f32> {
    let mut image = Array2::zeros((origins.nrows(), 3));

    Zip::from(image.rows_mut())
        .and(origins.rows())
        .and(directions.rows())
        .for_each(|mut color, o, d| {
            let b = o.dot(&d);
            let c = o.dot(&o) - SPHERE_RADIUS * SPHERE_RADIUS;
            let disc = b * b - c;
            if disc < 0. {
                return;
            }

            let t = -b - disc.sqrt();
            if t > 0. {
                let hit = &o + &(&d * t);
                color.assign(&hit.mapv(|p| (p / SPHERE_RADIUS + 1.) / 2.));
            }
        });

    image
}

fn batch_for(bundle: &RayBundle) -> Batch {
    Batch::new(sphere_image(bundle.origins(), bundle.directions()))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => LaNerfModelConfig::load(&path)
            .with_context(|| format!("failed to load the configuration at {path}"))?,
        None => LaNerfModelConfig::default(),
    };
    let steps = match env::var("LA_NERF_STEPS") {
        Ok(steps) => steps.parse().context("LA_NERF_STEPS must be a number")?,
        Err(_) => DEFAULT_STEPS,
    };

    let (near, far) = (config.base.near_plane, config.base.far_plane);
    let cameras = ring_cameras()?;
    let mut model = LaNerfModel::new(config, SceneBox::cube(SPHERE_RADIUS * 1.5), cameras.len())?;

    info!("training for {steps} steps over {} cameras", cameras.len());

    for step in 0..steps {
        let camera_index = step % cameras.len();
        let bundle = cameras[camera_index].generate_rays(camera_index, near, far)?;
        let batch = batch_for(&bundle);

        model.before_step(step);
        let outputs = model.get_outputs(&bundle)?;
        let metrics_dict = model.get_metrics_dict(&outputs, &batch)?;
        let loss_dict = model.get_loss_dict(&outputs, &batch, Some(&metrics_dict))?;
        model.after_backward(step)?;

        if !model.config().online_laplace {
            model.fit_laplace(&bundle)?;
        }

        info!("step {step} losses {}", serde_json::to_string(&loss_dict)?);
        info!("step {step} metrics {}", serde_json::to_string(&metrics_dict)?);
    }

    model.set_training(false);
    let bundle = cameras[0].generate_rays(0, near, far)?;
    let outputs = model.get_outputs(&bundle)?;
    let metrics_dict = model.get_metrics_dict(&outputs, &batch_for(&bundle))?;

    let mean = |channel: &Option<Array2<f32>>| {
        channel
            .as_ref()
            .and_then(|c| c.mean())
            .map_or_else(|| "n/a".to_string(), |m| format!("{m:.5}"))
    };

    info!(
        "evaluation psnr {:.3}, mean rgb uncertainty {}, mean density uncertainty {}",
        metrics_dict.get("psnr").copied().unwrap_or(f32::NAN),
        mean(&outputs.rgb_sigma),
        mean(&outputs.density_sigma),
    );

    Ok(())
}
