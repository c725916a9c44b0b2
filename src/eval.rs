use crate::model::{Cnn, Module};

use ndarray::prelude::*;
use rayon::prelude::*;

/// Named accuracies collected over one experiment run.
///
/// Fields are written once per evaluation call; anything not evaluated in a
/// given configuration stays `None`. The `train_` variants hold train-set
/// accuracies and are only filled when the run asks for them.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AccuracyReport {
    pub clean_train_clean_eval: Option<f32>,
    pub clean_train_adv_eval: Option<f32>,
    pub adv_train_clean_eval: Option<f32>,
    pub adv_train_adv_eval: Option<f32>,
    pub train_clean_train_clean_eval: Option<f32>,
    pub train_clean_train_adv_eval: Option<f32>,
    pub train_adv_train_clean_eval: Option<f32>,
    pub train_adv_train_adv_eval: Option<f32>,
}

impl AccuracyReport {
    pub fn is_empty(&self) -> bool {
        self.clean_train_clean_eval.is_none()
            && self.clean_train_adv_eval.is_none()
            && self.adv_train_clean_eval.is_none()
            && self.adv_train_adv_eval.is_none()
            && self.train_clean_train_clean_eval.is_none()
            && self.train_clean_train_adv_eval.is_none()
            && self.train_adv_train_clean_eval.is_none()
            && self.train_adv_train_adv_eval.is_none()
    }
}

pub(crate) fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).expect("NaN in scores"))
        .map(|(idx, _)| idx)
        .expect("argmax of an empty row")
}

/// Accuracy of the model over a labeled set, evaluated in parallel batches.
///
/// Each batch runs on its own clone of the model (forward passes cache
/// activations, so a shared model cannot be used across threads).
pub fn model_eval(
    model: &Cnn,
    images: &Array4<f32>,
    labels: &Array2<f32>,
    batch_size: usize,
) -> f32 {
    let n = images.shape()[0];
    if n == 0 {
        return 0.0;
    }

    let batches: Vec<(usize, usize)> = (0..n)
        .step_by(batch_size)
        .map(|start| (start, (start + batch_size).min(n)))
        .collect();

    let correct: usize = batches
        .into_par_iter()
        .map(|(start, end)| {
            let mut model = model.clone();
            let x = images.slice(s![start..end, .., .., ..]).to_owned();
            let logits = model
                .forward(x.into_dyn())
                .into_dimensionality::<Ix2>()
                .expect("model output should be 2D logits");

            logits
                .rows()
                .into_iter()
                .zip(labels.slice(s![start..end, ..]).rows())
                .filter(|(predicted, expected)| argmax(predicted.view()) == argmax(expected.view()))
                .count()
        })
        .sum();

    correct as f32 / n as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Dense, Flatten, Layer};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_report_is_empty_until_a_field_is_written() {
        let mut report = AccuracyReport::default();
        assert!(report.is_empty());
        report.clean_train_clean_eval = Some(0.98);
        assert!(!report.is_empty());
    }

    #[test]
    fn argmax_picks_the_largest_score() {
        let row = array![0.1, 0.7, 0.2];
        assert_eq!(argmax(row.view()), 1);
    }

    /// A zero-weight model with a biased head predicts one constant class,
    /// which pins the expected accuracy exactly.
    #[test]
    fn model_eval_counts_argmax_agreements() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut dense = Dense::new(16, 3, &mut rng);
        dense.weights.fill(0.0);
        dense.bias = array![0.0, 1.0, 0.0]; // always predicts class 1
        let model = Cnn {
            layers: vec![Layer::Flatten(Flatten::new()), Layer::Dense(dense)],
        };

        let images = Array4::zeros((4, 1, 4, 4));
        let labels = array![
            [0.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0],
        ];

        let acc = model_eval(&model, &images, &labels, 2);
        assert!((acc - 0.5).abs() < 1e-6);
    }
}
