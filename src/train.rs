use crate::attacks::Attack;
use crate::error::Result;
use crate::model::{Cnn, Module};
use crate::optim::{softmax_cross_entropy, Optimizer, SgdMomentum};

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct TrainParams {
    pub nb_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub label_smoothing: f32,
}

impl Default for TrainParams {
    fn default() -> TrainParams {
        TrainParams {
            nb_epochs: 10,
            batch_size: 128,
            learning_rate: 0.001,
            label_smoothing: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub save_dir: PathBuf,
    /// Save every this many optimization steps.
    pub stride: usize,
}

pub fn checkpoint_path(save_dir: &Path, tag: &str) -> PathBuf {
    save_dir.join(format!("network-{tag}.json"))
}

/// Train the network with SGD + momentum on minibatches of `images`/`labels`.
///
/// - `attack`: when present, every batch is replaced by its adversarial
///   rendition before the train step (adversarial training).
/// - `evaluate`: run after every epoch, on the current model.
/// - `checkpoint`: when present, the model is saved every `stride` steps and
///   once more at the end as `network-final.json`.
pub fn train(
    model: &mut Cnn,
    images: &Array4<f32>,
    labels: &Array2<f32>,
    params: &TrainParams,
    rng: &mut StdRng,
    attack: Option<&dyn Attack>,
    mut evaluate: Option<&mut dyn FnMut(&mut Cnn)>,
    checkpoint: Option<&CheckpointConfig>,
) -> Result<()> {
    if let Some(cfg) = checkpoint {
        fs::create_dir_all(&cfg.save_dir)?;
    }

    let n = images.shape()[0];
    let mut indices: Vec<usize> = (0..n).collect();
    let mut optimizer = SgdMomentum::new(model, params.learning_rate);

    let steps_per_epoch = n / params.batch_size;
    let pb = ProgressBar::new((params.nb_epochs * steps_per_epoch) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap(),
    );

    let mut optim_step = 1;
    for _epoch in 0..params.nb_epochs {
        indices.shuffle(rng);

        for batch_indices in indices.chunks_exact(params.batch_size) {
            let mut x = images.select(Axis(0), batch_indices);
            let y = labels.select(Axis(0), batch_indices);

            if let Some(att) = attack {
                x = att.generate(model, &x, &y);
            }

            model.zero_grad();
            let logits = model
                .forward(x.into_dyn())
                .into_dimensionality::<Ix2>()
                .expect("model output should be 2D logits");
            let (loss, dlogits) = softmax_cross_entropy(&y, &logits, params.label_smoothing);
            model.backward(dlogits.into_dyn());
            optimizer.step(model);

            if optim_step % 100 == 0 {
                let avg_loss = loss.sum() / loss.len() as f32;
                pb.println(format!("step {} loss: {:.4}", optim_step, avg_loss));
                debug!(step = optim_step, loss = avg_loss, "train step");
            }
            if let Some(cfg) = checkpoint {
                if optim_step % cfg.stride == 0 {
                    model.to_checkpoint(&checkpoint_path(&cfg.save_dir, &optim_step.to_string()))?;
                }
            }

            optim_step += 1;
            pb.inc(1);
        }

        if let Some(eval) = evaluate.as_mut() {
            eval(model);
        }
    }
    pb.finish_and_clear();

    if let Some(cfg) = checkpoint {
        model.to_checkpoint(&checkpoint_path(&cfg.save_dir, "final"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MnistData;
    use crate::eval::model_eval;
    use rand::SeedableRng;

    fn tiny_params() -> TrainParams {
        TrainParams {
            nb_epochs: 1,
            batch_size: 8,
            learning_rate: 0.05,
            label_smoothing: 0.1,
        }
    }

    #[test]
    fn one_epoch_runs_and_calls_the_evaluate_hook() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let data = MnistData::synthetic(16, 8, &mut rng);
        let mut model = Cnn::basic(2, 10, &mut rng);

        let mut evaluated = 0;
        let mut hook = |m: &mut Cnn| {
            let acc = model_eval(m, &data.test_images, &data.test_labels, 8);
            assert!((0.0..=1.0).contains(&acc));
            evaluated += 1;
        };

        train(
            &mut model,
            &data.train_images,
            &data.train_labels,
            &tiny_params(),
            &mut rng,
            None,
            Some(&mut hook),
            None,
        )?;
        assert_eq!(evaluated, 1);
        Ok(())
    }

    #[test]
    fn checkpoints_are_written_under_the_save_dir() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let data = MnistData::synthetic(16, 4, &mut rng);
        let mut model = Cnn::basic(2, 10, &mut rng);

        let save_dir = std::env::temp_dir().join(format!("advnet-train-{}", std::process::id()));
        let cfg = CheckpointConfig {
            save_dir: save_dir.clone(),
            stride: 1,
        };

        train(
            &mut model,
            &data.train_images,
            &data.train_labels,
            &tiny_params(),
            &mut rng,
            None,
            None,
            Some(&cfg),
        )?;

        assert!(checkpoint_path(&save_dir, "1").exists());
        assert!(checkpoint_path(&save_dir, "final").exists());
        fs::remove_dir_all(&save_dir)?;
        Ok(())
    }
}
