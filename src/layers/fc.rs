use crate::model::Module;
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Fully-connected layer: z = x.W + b.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Dense {
    input_size: usize,
    output_size: usize,
    /// (input_size, output_size)
    pub weights: Array2<f32>,
    /// (output_size)
    pub bias: Array1<f32>,
    // previous layer activation from the last forward: (batch, input_size)
    #[serde(skip)]
    last_input: Option<Array2<f32>>,
    #[serde(skip)]
    pub w_grad: Option<Array2<f32>>,
    #[serde(skip)]
    pub b_grad: Option<Array1<f32>>,
}

impl Dense {
    pub fn new(input_size: usize, output_size: usize, rng: &mut StdRng) -> Dense {
        let scale = (2.0 / input_size as f32).sqrt();
        let weights =
            Array2::random_using((input_size, output_size), Uniform::new(-1.0, 1.0), rng) * scale;

        Dense {
            input_size,
            output_size,
            weights,
            bias: Array1::zeros(output_size),
            last_input: None,
            w_grad: None,
            b_grad: None,
        }
    }
}

impl Module for Dense {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix2>()
            .expect("dense input should be 2D");
        self.last_input = Some(input.clone());

        // (batch, input_size) x (input_size, output_size) = (batch, output_size)
        let out = input.dot(&self.weights) + &self.bias;
        out.into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let dz = dz
            .into_dimensionality::<Ix2>()
            .expect("dense backward input should be 2D");
        let last_input = self
            .last_input
            .take()
            .expect("run forward before backward");

        // (input_size, batch)^T x (batch, output_size) = (input_size, output_size)
        self.w_grad = Some(last_input.t().dot(&dz));
        self.b_grad = Some(dz.sum_axis(Axis(0)));

        // Propagated to the previous layer: (batch, output_size) x (output_size, input_size)
        dz.dot(&self.weights.t()).into_dyn()
    }

    fn zero_grad(&mut self) {
        self.last_input = None;
        self.w_grad = None;
        self.b_grad = None;
    }
}
