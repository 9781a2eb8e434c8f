//! Regularizers of the proposal sampler and the normal supervision, plus image metrics.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis, Zip, s};

use crate::{
    NerfErr, Result,
    arch::loss::{LossFn, Mse},
    rays::RaySamples,
};

const EPS: f32 = 1e-7;

fn check_rounds(weights_list: &[Array2<f32>], ray_samples_list: &[RaySamples]) -> Result<()> {
    if weights_list.is_empty() {
        return Err(NerfErr::EmptyBatch);
    }
    if weights_list.len() != ray_samples_list.len() {
        return Err(NerfErr::SizeMismatch {
            what: "sampling rounds",
            got: weights_list.len(),
            expected: ray_samples_list.len(),
        });
    }

    for (w, samples) in weights_list.iter().zip(ray_samples_list) {
        if w.dim() != (samples.num_rays(), samples.num_samples()) {
            return Err(NerfErr::SizeMismatch {
                what: "round weights",
                got: w.len(),
                expected: samples.num_rays() * samples.num_samples(),
            });
        }
    }

    Ok(())
}

/// The weight an envelope histogram `(t_env, w_env)` places over every bin of `t`.
fn outer(t: ArrayView1<f32>, t_env: ArrayView1<f32>, w_env: ArrayView1<f32>) -> Vec<f32> {
    let m = w_env.len();
    let mut cw = Vec::with_capacity(m + 1);
    cw.push(0.);
    for &w in w_env {
        cw.push(cw[cw.len() - 1] + w);
    }

    let env_starts = t_env.slice(s![..-1]);
    let env_ends = t_env.slice(s![1..]);

    t.windows(2)
        .into_iter()
        .map(|bin| {
            let (start, end) = (bin[0], bin[1]);
            let lo = env_starts.iter().take_while(|&&s| s <= start).count();
            let lo = lo.saturating_sub(1).min(m - 1);
            let hi = env_ends.iter().take_while(|&&e| e <= end).count().min(m - 1);
            cw[hi + 1] - cw[lo]
        })
        .collect()
}

/// Bounds the weights of every proposal round by the final round.
///
/// # Arguments
/// * `weights_list` - The weights of every round, the final one last, each `[N, S_k]`.
/// * `ray_samples_list` - The samples of every round, the final one last.
pub fn interlevel_loss(
    weights_list: &[Array2<f32>],
    ray_samples_list: &[RaySamples],
) -> Result<f32> {
    check_rounds(weights_list, ray_samples_list)?;

    let last = weights_list.len() - 1;
    let (c, w) = (ray_samples_list[last].spacing_bins(), weights_list[last].view());
    let mut loss = 0.;

    for (samples, weights) in ray_samples_list[..last].iter().zip(&weights_list[..last]) {
        let cp = samples.spacing_bins();
        let mut per_ray = Array1::<f32>::zeros(w.nrows());

        Zip::from(&mut per_ray)
            .and(c.rows())
            .and(w.rows())
            .and(cp.rows())
            .and(weights.rows())
            .par_for_each(|out, c, w, cp, wp| {
                let w_outer = outer(c, cp, wp);
                *out = w
                    .iter()
                    .zip(w_outer)
                    .map(|(&w, w_outer)| (w - w_outer).max(0.).powi(2) / (w + EPS))
                    .sum();
            });

        loss += per_ray.sum() / w.len().max(1) as f32;
    }

    Ok(loss)
}

/// Distortion of a single ray's weight distribution over the bin edges `t`.
fn ray_distortion(t: ArrayView1<f32>, w: ArrayView1<f32>) -> f32 {
    let mids: Vec<f32> = t.windows(2).into_iter().map(|b| (b[0] + b[1]) / 2.).collect();

    let mut inter = 0.;
    for (i, &wi) in w.iter().enumerate() {
        for (j, &wj) in w.iter().enumerate() {
            inter += wi * wj * (mids[i] - mids[j]).abs();
        }
    }

    let intra: f32 = t
        .windows(2)
        .into_iter()
        .zip(w)
        .map(|(b, &w)| w * w * (b[1] - b[0]))
        .sum();

    inter + intra / 3.
}

/// Penalizes weight spread along the final round of samples, averaged over rays.
pub fn distortion_loss(
    weights_list: &[Array2<f32>],
    ray_samples_list: &[RaySamples],
) -> Result<f32> {
    check_rounds(weights_list, ray_samples_list)?;

    let last = weights_list.len() - 1;
    let (c, w) = (ray_samples_list[last].spacing_bins(), weights_list[last].view());
    let mut per_ray = Array1::<f32>::zeros(w.nrows());

    Zip::from(&mut per_ray)
        .and(c.rows())
        .and(w.rows())
        .par_for_each(|out, c, w| *out = ray_distortion(c, w));

    Ok(per_ray.mean().unwrap_or(0.))
}

fn check_normals(
    what: &'static str,
    normals: ArrayView3<f32>,
    weights: ArrayView2<f32>,
) -> Result<()> {
    let (n, s, c) = normals.dim();
    if (n, s) != weights.dim() || c != 3 {
        return Err(NerfErr::SizeMismatch {
            what,
            got: normals.len(),
            expected: weights.len() * 3,
        });
    }

    Ok(())
}

/// Penalizes visible normals facing away from the camera.
///
/// # Arguments
/// * `weights` - `[N, S]`
/// * `normals` - `[N, S, 3]`
/// * `viewdirs` - `[N, 3]`
///
/// # Returns
/// One value per ray, `[N]`.
pub fn orientation_loss(
    weights: ArrayView2<f32>,
    normals: ArrayView3<f32>,
    viewdirs: ArrayView2<f32>,
) -> Result<Array1<f32>> {
    check_normals("orientation loss normals", normals, weights)?;
    if viewdirs.dim() != (weights.nrows(), 3) {
        return Err(NerfErr::SizeMismatch {
            what: "orientation loss view directions",
            got: viewdirs.nrows(),
            expected: weights.nrows(),
        });
    }

    let mut out = Array1::zeros(weights.nrows());
    Zip::from(&mut out)
        .and(weights.rows())
        .and(normals.outer_iter())
        .and(viewdirs.rows())
        .for_each(|out, w, n, v| {
            *out = n
                .outer_iter()
                .zip(w)
                .map(|(n, &w)| w * (-n.dot(&v)).min(0.).powi(2))
                .sum();
        });

    Ok(out)
}

/// Penalizes predicted normals that disagree with the analytic ones, `[N]`.
pub fn pred_normal_loss(
    weights: ArrayView2<f32>,
    normals: ArrayView3<f32>,
    pred_normals: ArrayView3<f32>,
) -> Result<Array1<f32>> {
    check_normals("analytic normals", normals, weights)?;
    check_normals("predicted normals", pred_normals, weights)?;

    let agreement = (&normals * &pred_normals).sum_axis(Axis(2));
    Ok((&weights * &agreement.mapv(|a| 1. - a)).sum_axis(Axis(1)))
}

/// Peak signal to noise ratio for images in `[0, 1]`.
pub fn psnr(rgb: ArrayView2<f32>, image: ArrayView2<f32>) -> f32 {
    -10. * Mse.loss(rgb, image).log10()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rays::{RayBundle, Spacing};
    use ndarray::{Array3, array};

    fn uniform(num_samples: usize) -> RaySamples {
        let bundle =
            RayBundle::new(array![[0., 0., 0.]], array![[1., 0., 0.]], array![0], 1., 2.)
                .unwrap();
        let edges =
            Array2::from_shape_fn((1, num_samples + 1), |(_, j)| j as f32 / num_samples as f32);
        RaySamples::from_spacing(&bundle, Spacing::Linear, edges).unwrap()
    }

    #[test]
    fn interlevel_is_zero_when_the_proposal_covers_the_final_weights() {
        let weights = vec![array![[0.5, 0.5]], array![[0.25, 0.25, 0.25, 0.25]]];
        let samples = vec![uniform(2), uniform(4)];
        assert!(interlevel_loss(&weights, &samples).unwrap().abs() < 1e-6);
    }

    #[test]
    fn interlevel_penalizes_an_empty_proposal() {
        let weights = vec![array![[0., 0.]], array![[0.25, 0.25, 0.25, 0.25]]];
        let samples = vec![uniform(2), uniform(4)];
        assert!(interlevel_loss(&weights, &samples).unwrap() > 0.1);
    }

    #[test]
    fn concentrated_weights_distort_less() {
        let samples = vec![uniform(4)];
        let spread = distortion_loss(&[array![[0.25, 0.25, 0.25, 0.25]]], &samples).unwrap();
        let peaked = distortion_loss(&[array![[0., 1., 0., 0.]]], &samples).unwrap();

        assert!(peaked < spread);
        // a single full bin only keeps the intra term
        assert!((peaked - 0.25 / 3.).abs() < 1e-6);
    }

    #[test]
    fn rounds_must_line_up() {
        let samples = vec![uniform(4)];
        assert!(distortion_loss(&[], &[]).is_err());
        assert!(interlevel_loss(&[array![[1., 0.]]], &samples).is_err());
    }

    #[test]
    fn normals_facing_the_camera_are_free() {
        let weights = array![[1.]];
        let viewdirs = array![[0., 0., 1.]];
        let facing = Array3::from_shape_vec((1, 1, 3), vec![0., 0., -1.]).unwrap();
        let away = Array3::from_shape_vec((1, 1, 3), vec![0., 0., 1.]).unwrap();

        let free = orientation_loss(weights.view(), facing.view(), viewdirs.view()).unwrap();
        let paid = orientation_loss(weights.view(), away.view(), viewdirs.view()).unwrap();
        assert_eq!(free[0], 0.);
        assert_eq!(paid[0], 1.);

        let same = pred_normal_loss(weights.view(), facing.view(), facing.view()).unwrap();
        assert_eq!(same[0], 0.);
    }

    #[test]
    fn psnr_of_a_uniform_error() {
        let rgb = Array2::from_elem((2, 3), 0.1);
        let image = Array2::zeros((2, 3));
        assert!((psnr(rgb.view(), image.view()) - 20.).abs() < 1e-4);
    }
}
