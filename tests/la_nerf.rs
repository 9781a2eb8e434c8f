use la_nerf::{
    LaNerfModel, LaNerfModelConfig,
    config::{HessianShape, LaplaceBackend, LaplaceMethod},
    stats::HessianSummary,
};
use ndarray::{Array1, Array2, array};
use nerf::{
    NerfErr,
    arch::loss::{L1, LossFn},
    models::{Batch, MetricsDict, Model},
    rays::RayBundle,
    scene_box::SceneBox,
};

const HESSIAN_KEYS: [&str; 10] = [
    "hessian/max",
    "hessian/min",
    "hessian/mean",
    "hessian/median",
    "hessian/sum",
    "hessian_density/max",
    "hessian_density/min",
    "hessian_density/mean",
    "hessian_density/median",
    "hessian_density/sum",
];

fn small_config() -> LaNerfModelConfig {
    let mut config = LaNerfModelConfig {
        laplace_num_samples: 8,
        ..Default::default()
    };
    config.base.hidden_dim = 8;
    config.base.hidden_dim_color = 8;
    config.base.num_levels = 2;
    config.base.base_res = 1;
    config.base.max_res = 4;
    config.base.appearance_embed_dim = 2;
    config.base.num_proposal_samples_per_ray = vec![8, 6];
    config.base.num_nerf_samples_per_ray = 4;
    config.base.proposal_hidden_dim = 8;
    config.base.near_plane = 0.5;
    config.base.far_plane = 6.;
    config
}

fn model(config: LaNerfModelConfig) -> LaNerfModel {
    LaNerfModel::new(config, SceneBox::cube(2.), 2).unwrap()
}

fn four_rays() -> RayBundle {
    RayBundle::new(
        array![[0., 0., 3.], [0.3, 0., 3.], [0., 0.3, 3.], [-0.3, -0.3, 3.]],
        array![[0., 0., -1.], [0., 0., -1.], [0.1, 0., -1.], [0., 0.1, -1.]],
        Array1::from_elem(4, 1),
        0.5,
        6.,
    )
    .unwrap()
}

fn gray_batch(n: usize) -> Batch {
    Batch::new(Array2::from_elem((n, 3), 0.5))
}

#[test]
fn training_step_yields_finite_non_negative_losses() {
    let mut model = model(small_config());
    let bundle = four_rays();
    let batch = gray_batch(bundle.len());

    model.before_step(0);
    let outputs = model.get_outputs(&bundle).unwrap();
    let metrics = model.get_metrics_dict(&outputs, &batch).unwrap();
    let losses = model.get_loss_dict(&outputs, &batch, Some(&metrics)).unwrap();
    model.after_backward(0).unwrap();

    for key in ["rgb_loss", "interlevel_loss", "distortion_loss"] {
        let loss = losses[key];
        assert!(loss.is_finite() && loss >= 0., "{key} = {loss}");
    }

    assert!(metrics.contains_key("psnr"));
    assert!(metrics.contains_key("distortion"));
    for key in HESSIAN_KEYS {
        assert!(metrics.contains_key(key), "missing {key}");
    }
}

#[test]
fn every_output_is_per_ray() {
    let mut model = model(small_config());
    let bundle = four_rays();
    let outputs = model.get_outputs(&bundle).unwrap();

    assert_eq!(outputs.rgb.dim(), (4, 3));
    assert_eq!(outputs.depth.dim(), (4, 1));
    assert_eq!(outputs.accumulation.dim(), (4, 1));
    assert_eq!(outputs.rgb_mu.as_ref().map(|a| a.dim()), Some((4, 3)));
    assert_eq!(outputs.rgb_sigma.as_ref().map(|a| a.dim()), Some((4, 1)));
    assert_eq!(outputs.density_sigma.as_ref().map(|a| a.dim()), Some((4, 1)));
    assert_eq!(outputs.prop_depths.len(), 2);
    assert!(outputs.prop_depths.iter().all(|d| d.dim() == (4, 1)));
}

#[test]
fn uncertainties_are_non_negative() {
    for method in [LaplaceMethod::Laplace, LaplaceMethod::LinearizedLaplace] {
        let mut model = model(LaNerfModelConfig {
            laplace_method: method,
            ..small_config()
        });
        let outputs = model.get_outputs(&four_rays()).unwrap();

        let rgb_sigma = outputs.rgb_sigma.unwrap();
        let density_sigma = outputs.density_sigma.unwrap();
        assert!(rgb_sigma.iter().all(|&s| s.is_finite() && s >= 0.));
        assert!(density_sigma.iter().all(|&s| s.is_finite() && s >= 0.));
    }
}

#[test]
fn no_backend_skips_uncertainty_but_keeps_zero_curvature_metrics() {
    let mut model = model(LaNerfModelConfig {
        laplace_backend: LaplaceBackend::None,
        ..small_config()
    });
    let bundle = four_rays();
    let batch = gray_batch(bundle.len());

    let outputs = model.get_outputs(&bundle).unwrap();
    assert!(outputs.rgb_mu.is_none());
    assert!(outputs.rgb_sigma.is_none());
    assert!(outputs.density_sigma.is_none());

    let metrics = model.get_metrics_dict(&outputs, &batch).unwrap();
    assert_eq!(metrics.len(), 12);
    for key in HESSIAN_KEYS {
        assert_eq!(metrics[key], 0., "{key}");
    }
}

#[test]
#[should_panic(expected = "distortion")]
fn training_losses_without_metrics_panic() {
    let mut model = model(small_config());
    let bundle = four_rays();
    let outputs = model.get_outputs(&bundle).unwrap();

    let _ = model.get_loss_dict(&outputs, &gray_batch(bundle.len()), None);
}

#[test]
fn evaluation_needs_no_metrics_and_only_reports_the_color_loss() {
    let mut model = model(small_config());
    model.set_training(false);
    let bundle = four_rays();
    let batch = gray_batch(bundle.len());

    let outputs = model.get_outputs(&bundle).unwrap();
    assert!(outputs.trace.is_none());

    let losses = model.get_loss_dict(&outputs, &batch, None).unwrap();
    assert_eq!(losses.keys().collect::<Vec<_>>(), vec!["rgb_loss"]);

    let metrics = model.get_metrics_dict(&outputs, &batch).unwrap();
    assert_eq!(metrics.keys().collect::<Vec<_>>(), vec!["psnr"]);
}

#[test]
fn evaluation_is_idempotent() {
    let mut model = model(small_config());
    let bundle = four_rays();

    model.fit_laplace(&bundle).unwrap();
    model.set_training(false);

    let a = model.get_outputs(&bundle).unwrap();
    let b = model.get_outputs(&bundle).unwrap();

    assert_eq!(a.rgb, b.rgb);
    assert_eq!(a.depth, b.depth);
    assert_eq!(a.rgb_mu, b.rgb_mu);
    assert_eq!(a.rgb_sigma, b.rgb_sigma);
    assert_eq!(a.density_sigma, b.density_sigma);
}

#[test]
fn fitting_the_posterior_moves_the_curvature_metrics() {
    let mut model = model(LaNerfModelConfig {
        laplace_hessian_shape: HessianShape::Kron,
        ..small_config()
    });
    let bundle = four_rays();
    let batch = gray_batch(bundle.len());

    let before = model.get_outputs(&bundle).unwrap();
    let before = model.get_metrics_dict(&before, &batch).unwrap();
    assert_eq!(before["hessian/sum"], 0.);

    model.fit_laplace(&bundle).unwrap();

    let after = model.get_outputs(&bundle).unwrap();
    let after = model.get_metrics_dict(&after, &batch).unwrap();
    assert!(after["hessian/sum"] > 0.);
    assert!(after["hessian_density/sum"] > 0.);
    assert_summary_is_ordered(&after, "hessian");
    assert_summary_is_ordered(&after, "hessian_density");
}

#[test]
fn online_models_update_the_curvature_after_backward() {
    let mut model = model(LaNerfModelConfig {
        online_laplace: true,
        laplace_hessian_shape: HessianShape::Full,
        ..small_config()
    });
    let bundle = four_rays();

    model.get_outputs(&bundle).unwrap();
    assert!(model.field().hessian().iter().all(|&h| h == 0.));

    model.after_backward(0).unwrap();
    assert!(model.field().hessian().iter().any(|&h| h != 0.));
    assert_eq!(model.field().hessian().shape(), &[3, 9, 9]);
}

#[test]
fn color_loss_supervises_the_posterior_draw() {
    let mut model = model(small_config());
    let bundle = four_rays();
    let batch = gray_batch(bundle.len());

    let outputs = model.get_outputs(&bundle).unwrap();
    let metrics = model.get_metrics_dict(&outputs, &batch).unwrap();
    let losses = model.get_loss_dict(&outputs, &batch, Some(&metrics)).unwrap();

    let rgb_mu = outputs.rgb_mu.as_ref().unwrap();
    assert_ne!(&outputs.rgb, rgb_mu);
    assert_eq!(losses["rgb_loss"], L1.loss(outputs.rgb.view(), batch.image.view()));
    assert_ne!(losses["rgb_loss"], L1.loss(rgb_mu.view(), batch.image.view()));
}

#[test]
fn empty_bundles_are_rejected() {
    let mut model = model(small_config());
    let empty = RayBundle::new(
        Array2::zeros((0, 3)),
        Array2::zeros((0, 3)),
        Array1::zeros(0),
        0.5,
        6.,
    )
    .unwrap();

    assert!(matches!(model.get_outputs(&empty), Err(NerfErr::EmptyBatch)));
}

#[test]
fn mismatched_images_are_rejected() {
    let mut model = model(small_config());
    let outputs = model.get_outputs(&four_rays()).unwrap();

    assert!(model.get_metrics_dict(&outputs, &gray_batch(3)).is_err());
}

fn assert_summary_is_ordered(metrics: &MetricsDict, prefix: &str) {
    let summary = HessianSummary {
        max: metrics[&format!("{prefix}/max")],
        min: metrics[&format!("{prefix}/min")],
        mean: metrics[&format!("{prefix}/mean")],
        median: metrics[&format!("{prefix}/median")],
        sum: metrics[&format!("{prefix}/sum")],
    };

    assert!(summary.min <= summary.mean && summary.mean <= summary.max);
    assert!(summary.min <= summary.median && summary.median <= summary.max);
}
