use crate::layers::Layer;
use crate::model::Cnn;

use ndarray::prelude::*;

/// Row-wise softmax with the usual max shift for stability.
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let max = logits.fold_axis(Axis(1), f32::NEG_INFINITY, |&a, &b| a.max(b));
    let mut out = logits - &max.insert_axis(Axis(1));
    out.mapv_inplace(|x| x.exp());
    let sum = out.sum_axis(Axis(1));
    out / sum.insert_axis(Axis(1))
}

/// Softmax cross-entropy on logits with label smoothing.
///
/// Returns the per-sample loss and dLoss/dlogits. The gradient is already
/// averaged over the batch; layers below apply the plain chain rule without
/// rescaling.
pub fn softmax_cross_entropy(
    labels: &Array2<f32>,
    logits: &Array2<f32>,
    smoothing: f32,
) -> (Array1<f32>, Array2<f32>) {
    let batch_size = labels.nrows() as f32;
    let nb_classes = labels.ncols() as f32;
    let smoothed = labels * (1.0 - smoothing) + smoothing / nb_classes;

    // log-softmax = logits - max - ln(sum(exp(logits - max)))
    let max = logits.fold_axis(Axis(1), f32::NEG_INFINITY, |&a, &b| a.max(b));
    let shifted = logits - &max.insert_axis(Axis(1));
    let log_norm = shifted.mapv(f32::exp).sum_axis(Axis(1)).mapv(f32::ln);
    let log_probs = shifted - log_norm.insert_axis(Axis(1));

    let loss = -(&smoothed * &log_probs).sum_axis(Axis(1));
    let grad = (softmax(logits) - smoothed) / batch_size;

    (loss, grad)
}

pub trait Optimizer {
    /// Run one optimization step.
    ///
    /// Assumes forward and backward have been done; may mutate internal
    /// optimizer state (momentum).
    fn step(&mut self, cnn: &mut Cnn);
}

pub struct Sgd {
    pub learning_rate: f32,
}

impl Optimizer for Sgd {
    fn step(&mut self, cnn: &mut Cnn) {
        for layer in &mut cnn.layers {
            match layer {
                Layer::Dense(l) => {
                    l.weights -= &(l.w_grad.as_ref().expect("dense weight grad") * self.learning_rate);
                    l.bias -= &(l.b_grad.as_ref().expect("dense bias grad") * self.learning_rate);
                }
                Layer::Conv(l) => {
                    l.kernels -= &(l.k_grad.as_ref().expect("conv kernel grad") * self.learning_rate);
                    l.bias -= &(l.b_grad.as_ref().expect("conv bias grad") * self.learning_rate);
                }
                _ => (), // no weights to update in other layers
            }
        }
    }
}

/// SGD with classical momentum: delta = momentum * delta_prev - lr * grad.
pub struct SgdMomentum {
    pub learning_rate: f32,
    pub momentum: f32,
    // per-layer (weight delta, bias delta), indexed like cnn.layers
    velocity: Vec<Option<(ArrayD<f32>, ArrayD<f32>)>>,
}

impl SgdMomentum {
    pub fn new(cnn: &Cnn, learning_rate: f32) -> SgdMomentum {
        SgdMomentum {
            learning_rate,
            momentum: 0.9,
            velocity: vec![None; cnn.layers.len()],
        }
    }
}

impl Optimizer for SgdMomentum {
    fn step(&mut self, cnn: &mut Cnn) {
        for (layer, velocity) in cnn.layers.iter_mut().zip(self.velocity.iter_mut()) {
            match layer {
                Layer::Dense(l) => {
                    let w_grad = l.w_grad.as_ref().expect("dense weight grad");
                    let b_grad = l.b_grad.as_ref().expect("dense bias grad");

                    let (w_delta, b_delta) = match velocity.take() {
                        None => (
                            (-w_grad * self.learning_rate).into_dyn(),
                            (-b_grad * self.learning_rate).into_dyn(),
                        ),
                        Some((prev_w, prev_b)) => (
                            prev_w * self.momentum - (w_grad * self.learning_rate).into_dyn(),
                            prev_b * self.momentum - (b_grad * self.learning_rate).into_dyn(),
                        ),
                    };

                    l.weights += &w_delta
                        .view()
                        .into_dimensionality::<Ix2>()
                        .expect("dense weight delta is 2D");
                    l.bias += &b_delta
                        .view()
                        .into_dimensionality::<Ix1>()
                        .expect("dense bias delta is 1D");

                    *velocity = Some((w_delta, b_delta));
                }
                Layer::Conv(l) => {
                    let k_grad = l.k_grad.as_ref().expect("conv kernel grad");
                    let b_grad = l.b_grad.as_ref().expect("conv bias grad");

                    let (k_delta, b_delta) = match velocity.take() {
                        None => (
                            (-k_grad * self.learning_rate).into_dyn(),
                            (-b_grad * self.learning_rate).into_dyn(),
                        ),
                        Some((prev_k, prev_b)) => (
                            prev_k * self.momentum - (k_grad * self.learning_rate).into_dyn(),
                            prev_b * self.momentum - (b_grad * self.learning_rate).into_dyn(),
                        ),
                    };

                    l.kernels += &k_delta
                        .view()
                        .into_dimensionality::<Ix2>()
                        .expect("conv kernel delta is 2D");
                    l.bias += &b_delta
                        .view()
                        .into_dimensionality::<Ix1>()
                        .expect("conv bias delta is 1D");

                    *velocity = Some((k_delta, b_delta));
                }
                _ => (), // no weights to update in other layers
            }
        }
    }
}
