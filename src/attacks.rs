use crate::model::{Cnn, Module};
use crate::optim::softmax_cross_entropy;

use ndarray::prelude::*;
use tracing::debug;

/// Perturbation budget shared by the gradient-sign attacks.
#[derive(Debug, Clone, Copy)]
pub struct AttackParams {
    /// Max perturbation per pixel (infinity norm).
    pub eps: f32,
    pub clip_min: f32,
    pub clip_max: f32,
}

impl Default for AttackParams {
    fn default() -> AttackParams {
        AttackParams {
            eps: 0.3,
            clip_min: 0.0,
            clip_max: 1.0,
        }
    }
}

/// An adversarial example generator.
///
/// `generate` runs forward/backward passes on the model to obtain
/// dLoss/dinput; the perturbation itself is built from the detached
/// gradient, so nothing backpropagates through the construction.
pub trait Attack {
    fn generate(&self, model: &mut Cnn, x: &Array4<f32>, y: &Array2<f32>) -> Array4<f32>;
}

/// dLoss/dinput for cross-entropy on the model's logits.
fn loss_input_gradient(model: &mut Cnn, x: &Array4<f32>, y: &Array2<f32>) -> Array4<f32> {
    model.zero_grad();
    let logits = model
        .forward(x.clone().into_dyn())
        .into_dimensionality::<Ix2>()
        .expect("model output should be 2D logits");
    let (_, dlogits) = softmax_cross_entropy(y, &logits, 0.0);
    model
        .backward(dlogits.into_dyn())
        .into_dimensionality::<Ix4>()
        .expect("input gradient should match the 4D input")
}

fn sign(grad: &Array4<f32>) -> Array4<f32> {
    grad.mapv(|g| {
        if g > 0.0 {
            1.0
        } else if g < 0.0 {
            -1.0
        } else {
            0.0
        }
    })
}

/// Project back into the eps-ball around `origin` and into [clip_min, clip_max].
fn project(x_adv: &mut Array4<f32>, origin: &Array4<f32>, params: &AttackParams) {
    ndarray::Zip::from(x_adv).and(origin).for_each(|adv, &orig| {
        *adv = adv
            .max(orig - params.eps)
            .min(orig + params.eps)
            .max(params.clip_min)
            .min(params.clip_max);
    });
}

/// Fast Gradient Sign Method: x_adv = clip(x + eps * sign(dLoss/dx)).
#[derive(Debug, Clone, Default)]
pub struct FastGradientMethod {
    pub params: AttackParams,
}

impl FastGradientMethod {
    pub fn new(params: AttackParams) -> FastGradientMethod {
        FastGradientMethod { params }
    }
}

impl Attack for FastGradientMethod {
    fn generate(&self, model: &mut Cnn, x: &Array4<f32>, y: &Array2<f32>) -> Array4<f32> {
        let grad = loss_input_gradient(model, x, y);
        let mut x_adv = x + &(sign(&grad) * self.params.eps);
        x_adv.mapv_inplace(|v| v.max(self.params.clip_min).min(self.params.clip_max));
        x_adv
    }
}

/// Basic Iterative Method: FGSM applied in small steps, re-projected into
/// the eps-ball after each one.
#[derive(Debug, Clone)]
pub struct BasicIterativeMethod {
    pub params: AttackParams,
    pub eps_iter: f32,
    pub nb_iter: usize,
}

impl Default for BasicIterativeMethod {
    fn default() -> BasicIterativeMethod {
        BasicIterativeMethod {
            params: AttackParams::default(),
            eps_iter: 0.05,
            nb_iter: 10,
        }
    }
}

impl Attack for BasicIterativeMethod {
    fn generate(&self, model: &mut Cnn, x: &Array4<f32>, y: &Array2<f32>) -> Array4<f32> {
        let mut x_adv = x.clone();
        for i in 0..self.nb_iter {
            let grad = loss_input_gradient(model, &x_adv, y);
            x_adv = x_adv + sign(&grad) * self.eps_iter;
            project(&mut x_adv, x, &self.params);
            debug!(iter = i, "bim step");
        }
        x_adv
    }
}

/// Momentum Iterative Method: accumulates an L1-normalized gradient with
/// momentum and steps along its sign.
#[derive(Debug, Clone)]
pub struct MomentumIterativeMethod {
    pub params: AttackParams,
    pub eps_iter: f32,
    pub nb_iter: usize,
    pub decay_factor: f32,
}

impl Default for MomentumIterativeMethod {
    fn default() -> MomentumIterativeMethod {
        MomentumIterativeMethod {
            params: AttackParams::default(),
            eps_iter: 0.05,
            nb_iter: 10,
            decay_factor: 1.0,
        }
    }
}

impl Attack for MomentumIterativeMethod {
    fn generate(&self, model: &mut Cnn, x: &Array4<f32>, y: &Array2<f32>) -> Array4<f32> {
        let mut x_adv = x.clone();
        let mut momentum = Array4::<f32>::zeros(x.dim());

        for i in 0..self.nb_iter {
            let grad = loss_input_gradient(model, &x_adv, y);

            // Normalize each sample's gradient by its L1 norm before
            // accumulating, so every step contributes at the same scale.
            let mut normalized = grad;
            for mut sample in normalized.outer_iter_mut() {
                let l1 = sample.mapv(f32::abs).sum().max(1e-12);
                sample /= l1;
            }

            momentum = momentum * self.decay_factor + normalized;
            x_adv = x_adv + sign(&momentum) * self.eps_iter;
            project(&mut x_adv, x, &self.params);
            debug!(iter = i, "mim step");
        }
        x_adv
    }
}

/// Generate adversarial renditions of a whole set, batch by batch.
pub fn generate_in_batches(
    attack: &dyn Attack,
    model: &mut Cnn,
    images: &Array4<f32>,
    labels: &Array2<f32>,
    batch_size: usize,
) -> Array4<f32> {
    let n = images.shape()[0];
    let mut out = Array4::zeros(images.dim());
    let mut start = 0;
    while start < n {
        let end = (start + batch_size).min(n);
        let x = images.slice(s![start..end, .., .., ..]).to_owned();
        let y = labels.slice(s![start..end, ..]).to_owned();
        let adv = attack.generate(model, &x, &y);
        out.slice_mut(s![start..end, .., .., ..]).assign(&adv);
        start = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Dense, Flatten, Layer};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_model(rng: &mut StdRng) -> Cnn {
        Cnn {
            layers: vec![
                Layer::Flatten(Flatten::new()),
                Layer::Dense(Dense::new(16, 3, rng)),
            ],
        }
    }

    fn tiny_batch(rng: &mut StdRng) -> (Array4<f32>, Array2<f32>) {
        let x = Array4::random_using((4, 1, 4, 4), Uniform::new(0.2, 0.8), rng);
        let mut y = Array2::zeros((4, 3));
        for (i, mut row) in y.rows_mut().into_iter().enumerate() {
            row[i % 3] = 1.0;
        }
        (x, y)
    }

    #[test]
    fn fgsm_moves_each_pixel_by_at_most_eps_and_clips() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = tiny_model(&mut rng);
        let (x, y) = tiny_batch(&mut rng);

        let fgsm = FastGradientMethod::new(AttackParams {
            eps: 0.3,
            clip_min: 0.0,
            clip_max: 1.0,
        });
        let x_adv = fgsm.generate(&mut model, &x, &y);

        for (&a, &o) in x_adv.iter().zip(x.iter()) {
            assert!((a - o).abs() <= 0.3 + 1e-6);
            assert!((0.0..=1.0).contains(&a));
        }
    }

    #[test]
    fn fgsm_does_not_mutate_its_input() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut model = tiny_model(&mut rng);
        let (x, y) = tiny_batch(&mut rng);
        let x_before = x.clone();

        FastGradientMethod::default().generate(&mut model, &x, &y);
        assert_eq!(x, x_before);
    }

    #[test]
    fn iterative_attacks_stay_inside_the_eps_ball() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut model = tiny_model(&mut rng);
        let (x, y) = tiny_batch(&mut rng);

        let params = AttackParams {
            eps: 0.1,
            clip_min: 0.0,
            clip_max: 1.0,
        };
        let bim = BasicIterativeMethod {
            params,
            eps_iter: 0.05,
            nb_iter: 8,
        };
        let mim = MomentumIterativeMethod {
            params,
            eps_iter: 0.05,
            nb_iter: 8,
            decay_factor: 1.0,
        };

        for x_adv in [
            bim.generate(&mut model, &x, &y),
            mim.generate(&mut model, &x, &y),
        ] {
            for (&a, &o) in x_adv.iter().zip(x.iter()) {
                assert!((a - o).abs() <= params.eps + 1e-6);
                assert!((params.clip_min..=params.clip_max).contains(&a));
            }
        }
    }

    #[test]
    fn fgsm_increases_the_loss_it_follows() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut model = tiny_model(&mut rng);
        let (x, y) = tiny_batch(&mut rng);

        let loss_of = |model: &mut Cnn, x: &Array4<f32>| {
            model.zero_grad();
            let logits = model
                .forward(x.clone().into_dyn())
                .into_dimensionality::<Ix2>()
                .unwrap();
            softmax_cross_entropy(&y, &logits, 0.0).0.sum()
        };

        let before = loss_of(&mut model, &x);
        let x_adv = FastGradientMethod::default().generate(&mut model, &x, &y);
        let after = loss_of(&mut model, &x_adv);
        assert!(after >= before, "fgsm should not decrease the loss: {after} < {before}");
    }

    #[test]
    fn batched_generation_matches_the_set_size() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut model = tiny_model(&mut rng);
        let (x, y) = tiny_batch(&mut rng);

        let adv = generate_in_batches(&FastGradientMethod::default(), &mut model, &x, &y, 3);
        assert_eq!(adv.dim(), x.dim());
        // every sample actually got perturbed
        assert!(adv.iter().zip(x.iter()).any(|(&a, &o)| a != o));
    }
}
