pub use crate::layers::activations::Relu;
pub use crate::layers::conv::{Conv2d, Flatten, MaxPool2d};
pub use crate::layers::fc::Dense;
pub use crate::model::Module;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

pub mod activations;
pub mod conv;
pub mod fc;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Layer {
    Conv(Conv2d),
    Pool(MaxPool2d),
    Flatten(Flatten),
    Dense(Dense),
    Relu(Relu),
}

impl Module for Layer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::Conv(l) => l.forward(input),
            Layer::Pool(l) => l.forward(input),
            Layer::Flatten(l) => l.forward(input),
            Layer::Dense(l) => l.forward(input),
            Layer::Relu(l) => l.forward(input),
        }
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::Conv(l) => l.backward(dz),
            Layer::Pool(l) => l.backward(dz),
            Layer::Flatten(l) => l.backward(dz),
            Layer::Dense(l) => l.backward(dz),
            Layer::Relu(l) => l.backward(dz),
        }
    }

    fn zero_grad(&mut self) {
        match self {
            Layer::Conv(l) => l.zero_grad(),
            Layer::Pool(l) => l.zero_grad(),
            Layer::Flatten(l) => l.zero_grad(),
            Layer::Dense(l) => l.zero_grad(),
            Layer::Relu(l) => l.zero_grad(),
        }
    }
}
