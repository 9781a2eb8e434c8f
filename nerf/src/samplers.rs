//! Ray samplers: uniform stratified sampling, inverse transform sampling of a weight
//! histogram, and the proposal network sampler built on top of both.

use log::debug;
use ndarray::{Array2, ArrayView2, Zip};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    NerfErr, Result,
    fields::DensityFn,
    rays::{RayBundle, RaySamples, Spacing},
};

const HISTOGRAM_PADDING: f32 = 0.01;
const PDF_EPS: f32 = 1e-5;

/// Draws the jitter of every bin edge: one value per ray with `single_jitter`, one per edge
/// otherwise.
fn jitter<R: Rng + ?Sized>(rng: &mut R, rays: usize, edges: usize, single: bool) -> Array2<f32> {
    if single {
        let per_ray: Vec<f32> = (0..rays).map(|_| rng.random()).collect();
        Array2::from_shape_fn((rays, edges), |(i, _)| per_ray[i])
    } else {
        Array2::from_shape_fn((rays, edges), |_| rng.random())
    }
}

/// Spreads samples evenly in spacing space.
#[derive(Debug, Clone, Copy)]
pub struct UniformSampler {
    spacing: Spacing,
    single_jitter: bool,
}

impl UniformSampler {
    pub fn new(spacing: Spacing, single_jitter: bool) -> Self {
        Self {
            spacing,
            single_jitter,
        }
    }

    /// Samples `num_samples` bins per ray. The bins are stratified when an `rng` is given and
    /// evenly spaced otherwise.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        ray_bundle: &RayBundle,
        num_samples: usize,
        rng: Option<&mut R>,
    ) -> Result<RaySamples> {
        if num_samples == 0 {
            return Err(NerfErr::InvalidConfig("cannot take zero samples per ray".into()));
        }

        let (rays, edges) = (ray_bundle.len(), num_samples + 1);
        let mut bins = Array2::from_shape_fn((rays, edges), |(_, j)| j as f32 / num_samples as f32);

        if let Some(rng) = rng {
            let t_rand = jitter(rng, rays, edges, self.single_jitter);
            let half = 0.5 / num_samples as f32;

            Zip::from(&mut bins).and(&t_rand).for_each(|b, &t| {
                let lower = (*b - half).max(0.);
                let upper = (*b + half).min(1.);
                *b = lower + (upper - lower) * t;
            });
        }

        RaySamples::from_spacing(ray_bundle, self.spacing, bins)
    }
}

/// Samples proportionally to a per-bin weight histogram.
#[derive(Debug, Clone, Copy)]
pub struct PdfSampler {
    spacing: Spacing,
    single_jitter: bool,
}

impl PdfSampler {
    pub fn new(spacing: Spacing, single_jitter: bool) -> Self {
        Self {
            spacing,
            single_jitter,
        }
    }

    /// Samples `num_samples` new bins per ray out of the histogram `weights` over the bins of
    /// `ray_samples`. Stratified when an `rng` is given, deterministic otherwise.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        ray_bundle: &RayBundle,
        ray_samples: &RaySamples,
        weights: ArrayView2<f32>,
        num_samples: usize,
        rng: Option<&mut R>,
    ) -> Result<RaySamples> {
        if num_samples == 0 {
            return Err(NerfErr::InvalidConfig("cannot take zero samples per ray".into()));
        }
        if weights.dim() != (ray_samples.num_rays(), ray_samples.num_samples()) {
            return Err(NerfErr::SizeMismatch {
                what: "pdf sampler weights",
                got: weights.len(),
                expected: ray_samples.num_rays() * ray_samples.num_samples(),
            });
        }

        let (rays, num_bins) = (ray_samples.num_rays(), num_samples + 1);
        let step = 1. / num_bins as f32;

        let mut u = Array2::from_shape_fn((rays, num_bins), |(_, j)| j as f32 * step);
        match rng {
            Some(rng) => u += &(jitter(rng, rays, num_bins, self.single_jitter) * step),
            None => u += step / 2.,
        }

        let existing = ray_samples.spacing_bins();
        let mut bins = Array2::zeros((rays, num_bins));

        Zip::from(bins.rows_mut())
            .and(u.rows())
            .and(weights.rows())
            .and(existing.rows())
            .par_for_each(|mut out, u, w, edges| {
                let cdf = padded_cdf(w.iter().copied());
                let last = cdf.len() - 1;

                for (o, &u) in out.iter_mut().zip(u) {
                    let idx = cdf.partition_point(|&c| c <= u);
                    let below = idx.saturating_sub(1).min(last);
                    let above = idx.min(last);

                    let (cdf0, cdf1) = (cdf[below], cdf[above]);
                    let (bin0, bin1) = (edges[below], edges[above]);
                    let t = ((u - cdf0) / (cdf1 - cdf0)).clamp(0., 1.);
                    let t = if t.is_nan() { 0. } else { t };

                    *o = bin0 + t * (bin1 - bin0);
                }
            });

        RaySamples::from_spacing(ray_bundle, self.spacing, bins)
    }
}

/// Builds the cumulative distribution, with a leading zero, of a padded weight histogram.
fn padded_cdf<I>(weights: I) -> Vec<f32>
where
    I: ExactSizeIterator<Item = f32>,
{
    let n = weights.len();
    let mut padded: Vec<f32> = weights.map(|w| w + HISTOGRAM_PADDING).collect();

    let sum: f32 = padded.iter().sum();
    let padding = (PDF_EPS - sum).max(0.);
    padded.iter_mut().for_each(|w| *w += padding / n as f32);
    let sum = sum + padding;

    let mut cdf = Vec::with_capacity(n + 1);
    cdf.push(0.);
    let mut acc = 0.;
    for w in padded {
        acc += w / sum;
        cdf.push(acc.min(1.));
    }

    cdf
}

/// The annealing exponent applied to the proposal weights at a training step.
pub fn proposal_weights_anneal(step: usize, max_num_iters: usize, slope: f32) -> f32 {
    let train_frac = (step as f32 / max_num_iters.max(1) as f32).clamp(0., 1.);
    (slope * train_frac) / ((slope - 1.) * train_frac + 1.)
}

/// Iteratively refines the sample locations with cheap density estimates before the final
/// field evaluation.
#[derive(Debug, Clone)]
pub struct ProposalNetworkSampler {
    num_proposal_samples_per_ray: Vec<usize>,
    num_nerf_samples_per_ray: usize,
    initial_sampler: UniformSampler,
    pdf_sampler: PdfSampler,
    anneal: f32,
    training: bool,
    rng: StdRng,
}

impl ProposalNetworkSampler {
    /// Creates a new `ProposalNetworkSampler`.
    ///
    /// # Arguments
    /// * `num_proposal_samples_per_ray` - Samples taken by each proposal round.
    /// * `num_nerf_samples_per_ray` - Samples handed to the field.
    /// * `single_jitter` - Whether every ray is jittered by a single random offset.
    /// * `seed` - Seed of the stratification jitter.
    pub fn new(
        num_proposal_samples_per_ray: Vec<usize>,
        num_nerf_samples_per_ray: usize,
        single_jitter: bool,
        seed: u64,
    ) -> Result<Self> {
        if num_proposal_samples_per_ray.is_empty() {
            return Err(NerfErr::InvalidConfig(
                "the proposal sampler needs at least one proposal round".into(),
            ));
        }
        if num_nerf_samples_per_ray == 0 || num_proposal_samples_per_ray.contains(&0) {
            return Err(NerfErr::InvalidConfig(
                "every sampling round needs at least one sample per ray".into(),
            ));
        }

        Ok(Self {
            num_proposal_samples_per_ray,
            num_nerf_samples_per_ray,
            initial_sampler: UniformSampler::new(Spacing::LinDisp, single_jitter),
            pdf_sampler: PdfSampler::new(Spacing::LinDisp, single_jitter),
            anneal: 1.,
            training: true,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn num_proposal_iterations(&self) -> usize {
        self.num_proposal_samples_per_ray.len()
    }

    pub fn set_anneal(&mut self, anneal: f32) {
        self.anneal = anneal;
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Runs every proposal round.
    ///
    /// # Arguments
    /// * `ray_bundle` - The rays to sample.
    /// * `density_fns` - One density function per proposal round.
    ///
    /// # Returns
    /// The final samples together with the weights and samples of every proposal round.
    pub fn generate_ray_samples(
        &mut self,
        ray_bundle: &RayBundle,
        density_fns: &[&dyn DensityFn],
    ) -> Result<(RaySamples, Vec<Array2<f32>>, Vec<RaySamples>)> {
        let n = self.num_proposal_iterations();

        if density_fns.len() != n {
            return Err(NerfErr::SizeMismatch {
                what: "proposal density functions",
                got: density_fns.len(),
                expected: n,
            });
        }
        if ray_bundle.is_empty() {
            return Err(NerfErr::EmptyBatch);
        }

        let mut weights_list = Vec::with_capacity(n + 1);
        let mut ray_samples_list = Vec::with_capacity(n + 1);
        let mut previous: Option<(RaySamples, Array2<f32>)> = None;

        for level in 0..=n {
            let num_samples = self
                .num_proposal_samples_per_ray
                .get(level)
                .copied()
                .unwrap_or(self.num_nerf_samples_per_ray);
            let rng = self.training.then_some(&mut self.rng);

            let ray_samples = match &previous {
                None => self.initial_sampler.sample(ray_bundle, num_samples, rng)?,
                Some((samples, weights)) => {
                    let anneal = self.anneal;
                    let annealed = weights.mapv(|w| w.powf(anneal));
                    self.pdf_sampler
                        .sample(ray_bundle, samples, annealed.view(), num_samples, rng)?
                }
            };

            if level == n {
                debug!(rounds = n, samples = num_samples; "proposal sampling done");
                return Ok((ray_samples, weights_list, ray_samples_list));
            }

            let positions = ray_samples
                .positions()
                .into_shape_with_order((ray_samples.num_rays() * num_samples, 3))?;
            let density = density_fns[level]
                .density(positions.view())?
                .into_shape_with_order((ray_samples.num_rays(), num_samples))?;
            let weights = ray_samples.get_weights(density.view())?;

            weights_list.push(weights.clone());
            ray_samples_list.push(ray_samples.clone());
            previous = Some((ray_samples, weights));
        }

        unreachable!("the last level always returns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, array};

    struct Constant(f32);

    impl DensityFn for Constant {
        fn density(&self, positions: ArrayView2<f32>) -> Result<Array1<f32>> {
            Ok(Array1::from_elem(positions.nrows(), self.0))
        }
    }

    fn bundle() -> RayBundle {
        RayBundle::new(
            array![[0., 0., 0.], [0., 1., 0.]],
            array![[1., 0., 0.], [0., 0., 1.]],
            array![0, 0],
            0.05,
            100.,
        )
        .unwrap()
    }

    fn spacing_midpoints(ray_samples: &RaySamples) -> Array2<f32> {
        let bins = ray_samples.spacing_bins();
        (&bins.slice(ndarray::s![.., ..-1]) + &bins.slice(ndarray::s![.., 1..])) * 0.5
    }

    fn is_sorted(bins: ArrayView2<f32>) -> bool {
        bins.rows()
            .into_iter()
            .all(|row| row.iter().zip(row.iter().skip(1)).all(|(a, b)| a <= b))
    }

    #[test]
    fn stratified_uniform_bins_stay_sorted() {
        let sampler = UniformSampler::new(Spacing::LinDisp, false);
        let mut rng = StdRng::seed_from_u64(9);

        let samples = sampler.sample(&bundle(), 16, Some(&mut rng)).unwrap();
        assert!(is_sorted(samples.spacing_bins()));
        assert!(is_sorted(samples.bins()));
        let first = samples.spacing_bins()[[0, 0]];
        assert!((0. ..=0.5 / 16.).contains(&first));
    }

    #[test]
    fn pdf_sampler_concentrates_where_weight_is() {
        let bundle = bundle();
        let coarse = UniformSampler::new(Spacing::Linear, true)
            .sample::<StdRng>(&bundle, 4, None)
            .unwrap();
        let weights = array![[0., 0., 1., 0.], [0., 0., 1., 0.]];

        let fine = PdfSampler::new(Spacing::Linear, true)
            .sample::<StdRng>(&bundle, &coarse, weights.view(), 8, None)
            .unwrap();

        assert_eq!(fine.num_samples(), 8);
        assert!(is_sorted(fine.spacing_bins()));
        let mids = spacing_midpoints(&fine);
        let inside = mids.iter().filter(|&&m| (0.5..=0.75).contains(&m)).count();
        assert!(inside > mids.len() / 2, "only {inside} samples in the heavy bin");
    }

    #[test]
    fn proposal_rounds_are_recorded() {
        let mut sampler = ProposalNetworkSampler::new(vec![12, 6], 5, true, 0).unwrap();
        let (a, b) = (Constant(0.5), Constant(2.));

        let (samples, weights_list, samples_list) =
            sampler.generate_ray_samples(&bundle(), &[&a, &b]).unwrap();

        assert_eq!(samples.num_samples(), 5);
        assert_eq!(weights_list.len(), 2);
        assert_eq!(samples_list[0].num_samples(), 12);
        assert_eq!(weights_list[1].dim(), (2, 6));
    }

    #[test]
    fn evaluation_sampling_is_deterministic() {
        let mut sampler = ProposalNetworkSampler::new(vec![8], 4, true, 0).unwrap();
        sampler.set_training(false);
        let density = Constant(1.);

        let (first, _, _) = sampler.generate_ray_samples(&bundle(), &[&density]).unwrap();
        let (second, _, _) = sampler.generate_ray_samples(&bundle(), &[&density]).unwrap();
        assert_eq!(first.bins(), second.bins());
    }

    #[test]
    fn anneal_ramps_from_zero_to_one() {
        assert_eq!(proposal_weights_anneal(0, 1000, 10.), 0.);
        assert_eq!(proposal_weights_anneal(5000, 1000, 10.), 1.);
        assert!(proposal_weights_anneal(100, 1000, 10.) > 0.1);
    }
}
