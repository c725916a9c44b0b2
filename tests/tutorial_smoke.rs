use advnet::attacks::{generate_in_batches, AttackParams, FastGradientMethod};
use advnet::dataset::MnistData;
use advnet::diagnostics::color_remap_probe;
use advnet::eval::model_eval;
use advnet::model::Cnn;
use advnet::train::{train, TrainParams};
use advnet::tutorial::{mnist_tutorial, TutorialParams};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn small_params() -> TutorialParams {
    TutorialParams {
        nb_epochs: 1,
        batch_size: 16,
        learning_rate: 0.05,
        nb_filters: 2,
        clean_train: true,
        testing: true,
        seed: 1234,
        ..TutorialParams::default()
    }
}

/// With `clean_train` and `testing` set, one run populates all four
/// clean-train accuracy fields, each within [0, 1].
#[test]
fn clean_train_run_fills_the_report() {
    let mut rng = StdRng::seed_from_u64(1234);
    let data = MnistData::synthetic(64, 32, &mut rng);

    let report = mnist_tutorial(&small_params(), &data).expect("tutorial run");

    for (name, field) in [
        ("clean_train_clean_eval", report.clean_train_clean_eval),
        ("clean_train_adv_eval", report.clean_train_adv_eval),
        (
            "train_clean_train_clean_eval",
            report.train_clean_train_clean_eval,
        ),
        (
            "train_clean_train_adv_eval",
            report.train_clean_train_adv_eval,
        ),
    ] {
        let acc = field.unwrap_or_else(|| panic!("{name} not populated"));
        assert!((0.0..=1.0).contains(&acc), "{name} out of range: {acc}");
    }

    // no adversarial training requested, so those fields stay unset
    assert!(report.adv_train_clean_eval.is_none());
    assert!(report.adv_train_adv_eval.is_none());
}

/// Identical parameters and seed give an identical report.
#[test]
fn fixed_seed_runs_are_reproducible() {
    let mut rng = StdRng::seed_from_u64(99);
    let data = MnistData::synthetic(64, 32, &mut rng);

    let a = mnist_tutorial(&small_params(), &data).expect("first run");
    let b = mnist_tutorial(&small_params(), &data).expect("second run");
    assert_eq!(a, b);
}

/// On a batch the model fits well, FGSM examples cannot be easier than the
/// clean ones.
#[test]
fn adversarial_accuracy_does_not_exceed_clean_accuracy_on_a_fitted_set() {
    const MAX_ATTEMPTS: u64 = 3;
    const ROUNDS: usize = 4;

    let params = TrainParams {
        nb_epochs: 20,
        batch_size: 16,
        learning_rate: 0.1,
        label_smoothing: 0.0,
    };

    for attempt in 1..=MAX_ATTEMPTS {
        let mut rng = StdRng::seed_from_u64(500 + attempt);
        let data = MnistData::synthetic(64, 16, &mut rng);
        let mut model = Cnn::basic(2, 10, &mut rng);

        let mut clean_acc = 0.0;
        for _round in 0..ROUNDS {
            train(
                &mut model,
                &data.train_images,
                &data.train_labels,
                &params,
                &mut rng,
                None,
                None,
                None,
            )
            .expect("training");
            clean_acc = model_eval(&model, &data.train_images, &data.train_labels, 16);
            if clean_acc >= 0.95 {
                break;
            }
        }
        if clean_acc < 0.95 {
            println!("attempt {attempt}: model only reached {clean_acc}, retrying");
            continue;
        }

        let fgsm = FastGradientMethod::new(AttackParams::default());
        let adv = generate_in_batches(
            &fgsm,
            &mut model,
            &data.train_images,
            &data.train_labels,
            16,
        );
        let adv_acc = model_eval(&model, &adv, &data.train_labels, 16);

        assert!(
            adv_acc <= clean_acc + 1e-6,
            "adversarial accuracy {adv_acc} above clean accuracy {clean_acc}"
        );
        return;
    }
    panic!("no attempt fitted the training set well enough");
}

/// The diagnostic path performs no evaluations, so its report stays empty.
#[test]
fn probe_runs_and_reports_nothing() {
    let report = color_remap_probe(7);
    assert!(report.is_empty());
}
