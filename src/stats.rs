use ndarray::{ArrayBase, Data, Dimension};
use nerf::models::MetricsDict;

/// Scalar summary of a curvature tensor, used to watch over its numerical health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HessianSummary {
    pub max: f32,
    pub min: f32,
    pub mean: f32,
    /// The lower median for an even amount of entries.
    pub median: f32,
    pub sum: f32,
}

impl HessianSummary {
    /// Summarizes every entry of `tensor`, `None` when it is empty.
    pub fn of<S, D>(tensor: &ArrayBase<S, D>) -> Option<Self>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        if tensor.is_empty() {
            return None;
        }

        let mut values: Vec<f32> = tensor.iter().copied().collect();
        values.sort_by(f32::total_cmp);

        let sum: f32 = values.iter().sum();
        let n = values.len();

        Some(Self {
            max: values[n - 1],
            min: values[0],
            mean: sum / n as f32,
            median: values[(n - 1) / 2],
            sum,
        })
    }

    /// Inserts the five statistics as `{prefix}/max` and so on.
    pub fn insert_into(&self, metrics_dict: &mut MetricsDict, prefix: &str) {
        let stats = [
            ("max", self.max),
            ("min", self.min),
            ("mean", self.mean),
            ("median", self.median),
            ("sum", self.sum),
        ];

        for (name, value) in stats {
            metrics_dict.insert(format!("{prefix}/{name}"), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, ArrayD, IxDyn, array};

    #[test]
    fn statistics_of_a_small_tensor() {
        let summary = HessianSummary::of(&array![[4., 1.], [3., 2.]]).unwrap();

        assert_eq!(summary.max, 4.);
        assert_eq!(summary.min, 1.);
        assert_eq!(summary.mean, 2.5);
        assert_eq!(summary.median, 2.);
        assert_eq!(summary.sum, 10.);
    }

    #[test]
    fn zero_tensors_summarize_to_zero() {
        let summary = HessianSummary::of(&Array3::<f32>::zeros((3, 4, 4))).unwrap();
        assert_eq!(summary.max, 0.);
        assert_eq!(summary.median, 0.);
        assert_eq!(summary.sum, 0.);
        assert!(HessianSummary::of(&ArrayD::<f32>::zeros(IxDyn(&[0, 3]))).is_none());
    }

    #[test]
    fn keys_carry_the_prefix() {
        let mut metrics = MetricsDict::new();
        HessianSummary::of(&array![1f32])
            .unwrap()
            .insert_into(&mut metrics, "hessian_density");

        assert_eq!(
            metrics.keys().collect::<Vec<_>>(),
            vec![
                "hessian_density/max",
                "hessian_density/mean",
                "hessian_density/median",
                "hessian_density/min",
                "hessian_density/sum"
            ]
        );
    }
}
