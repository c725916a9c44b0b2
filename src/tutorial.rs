use crate::attacks::{generate_in_batches, AttackParams, FastGradientMethod};
use crate::dataset::{MnistData, NB_CLASSES};
use crate::error::Result;
use crate::eval::{model_eval, AccuracyReport};
use crate::model::Cnn;
use crate::train::{checkpoint_path, train, CheckpointConfig, TrainParams};

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::{debug, info};

/// Everything one experiment run is parameterized by.
#[derive(Debug, Clone)]
pub struct TutorialParams {
    pub nb_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Model size multiplier.
    pub nb_filters: usize,
    /// Train a model on clean examples and evaluate it against FGSM.
    pub clean_train: bool,
    /// Also fill in the train-set accuracy fields of the report.
    pub testing: bool,
    /// Accepted for interface fidelity; FGSM construction carries no
    /// gradient, so this cannot change the training gradient.
    pub backprop_through_attack: bool,
    /// Repeat the process with adversarial training.
    pub adv_train: bool,
    pub label_smoothing: f32,
    pub attack: AttackParams,
    pub seed: u64,
    /// Where checkpoints are written (and re-loaded from, for the
    /// adversarially trained model).
    pub save_dir: Option<PathBuf>,
}

impl Default for TutorialParams {
    fn default() -> TutorialParams {
        TutorialParams {
            nb_epochs: 10,
            batch_size: 128,
            learning_rate: 0.001,
            nb_filters: 64,
            clean_train: true,
            testing: false,
            backprop_through_attack: false,
            adv_train: false,
            label_smoothing: 0.1,
            attack: AttackParams::default(),
            seed: 1234,
            save_dir: None,
        }
    }
}

fn do_eval(acc: f32, slot: &mut Option<f32>, adversarial: Option<bool>) {
    *slot = Some(acc);
    match adversarial {
        Some(true) => info!("Test accuracy on adversarial examples: {:.4}", acc),
        Some(false) => info!("Test accuracy on legitimate examples: {:.4}", acc),
        None => {}
    }
}

/// Run the MNIST adversarial-examples experiment and collect its accuracies.
///
/// With `clean_train`, a model is trained on clean examples, evaluated on the
/// clean test set and on FGSM adversarial examples. With `adv_train`, the
/// process repeats with a fresh model trained on adversarial examples (or
/// reloaded from `save_dir` if a final checkpoint already exists there).
pub fn mnist_tutorial(params: &TutorialParams, data: &MnistData) -> Result<AccuracyReport> {
    let mut report = AccuracyReport::default();
    let mut rng = StdRng::seed_from_u64(params.seed);

    let train_params = TrainParams {
        nb_epochs: params.nb_epochs,
        batch_size: params.batch_size,
        learning_rate: params.learning_rate,
        label_smoothing: params.label_smoothing,
    };
    let checkpoint = params.save_dir.as_ref().map(|dir| CheckpointConfig {
        save_dir: dir.clone(),
        stride: usize::MAX, // intermediate saves off; final save only
    });

    if params.backprop_through_attack {
        debug!("backprop_through_attack set; no effect for FGSM");
    }

    if params.clean_train {
        let mut model = Cnn::basic(params.nb_filters, NB_CLASSES, &mut rng);

        let mut evaluate = |m: &mut Cnn| {
            let acc = model_eval(m, &data.test_images, &data.test_labels, params.batch_size);
            do_eval(acc, &mut report.clean_train_clean_eval, Some(false));
        };
        train(
            &mut model,
            &data.train_images,
            &data.train_labels,
            &train_params,
            &mut rng,
            None,
            Some(&mut evaluate),
            None,
        )?;

        if params.testing {
            let acc = model_eval(
                &model,
                &data.train_images,
                &data.train_labels,
                params.batch_size,
            );
            do_eval(acc, &mut report.train_clean_train_clean_eval, None);
        }

        // Evaluate the clean-trained model on FGSM adversarial examples.
        let fgsm = FastGradientMethod::new(params.attack);
        let adv_test = generate_in_batches(
            &fgsm,
            &mut model,
            &data.test_images,
            &data.test_labels,
            params.batch_size,
        );
        let acc = model_eval(&model, &adv_test, &data.test_labels, params.batch_size);
        do_eval(acc, &mut report.clean_train_adv_eval, Some(true));

        if params.testing {
            let adv_train_set = generate_in_batches(
                &fgsm,
                &mut model,
                &data.train_images,
                &data.train_labels,
                params.batch_size,
            );
            let acc = model_eval(
                &model,
                &adv_train_set,
                &data.train_labels,
                params.batch_size,
            );
            do_eval(acc, &mut report.train_clean_train_adv_eval, None);
        }
    }

    if params.adv_train {
        info!("Repeating the process, using adversarial training");

        let fgsm = FastGradientMethod::new(params.attack);
        let mut model = Cnn::basic(params.nb_filters, NB_CLASSES, &mut rng);

        let saved = params
            .save_dir
            .as_ref()
            .map(|dir| checkpoint_path(dir, "final"))
            .filter(|path| path.exists());

        match saved {
            Some(path) => {
                info!("Loading adversarially trained model from {}", path.display());
                model = Cnn::from_checkpoint(&path)?;
            }
            None => {
                let mut evaluate = |m: &mut Cnn| {
                    let acc =
                        model_eval(m, &data.test_images, &data.test_labels, params.batch_size);
                    do_eval(acc, &mut report.adv_train_clean_eval, Some(false));

                    let adv = generate_in_batches(
                        &fgsm,
                        m,
                        &data.test_images,
                        &data.test_labels,
                        params.batch_size,
                    );
                    let acc = model_eval(m, &adv, &data.test_labels, params.batch_size);
                    do_eval(acc, &mut report.adv_train_adv_eval, Some(true));
                };
                train(
                    &mut model,
                    &data.train_images,
                    &data.train_labels,
                    &train_params,
                    &mut rng,
                    Some(&fgsm),
                    Some(&mut evaluate),
                    checkpoint.as_ref(),
                )?;
            }
        }

        // Final accuracies of the adversarially trained model.
        let acc = model_eval(&model, &data.test_images, &data.test_labels, params.batch_size);
        do_eval(acc, &mut report.adv_train_clean_eval, Some(false));

        let adv_test = generate_in_batches(
            &fgsm,
            &mut model,
            &data.test_images,
            &data.test_labels,
            params.batch_size,
        );
        let acc = model_eval(&model, &adv_test, &data.test_labels, params.batch_size);
        do_eval(acc, &mut report.adv_train_adv_eval, Some(true));

        if params.testing {
            let acc = model_eval(
                &model,
                &data.train_images,
                &data.train_labels,
                params.batch_size,
            );
            do_eval(acc, &mut report.train_adv_train_clean_eval, None);

            let adv_train_set = generate_in_batches(
                &fgsm,
                &mut model,
                &data.train_images,
                &data.train_labels,
                params.batch_size,
            );
            let acc = model_eval(
                &model,
                &adv_train_set,
                &data.train_labels,
                params.batch_size,
            );
            do_eval(acc, &mut report.train_adv_train_adv_eval, None);
        }
    }

    Ok(report)
}
