use crate::error::Result;
use crate::layers::{Conv2d, Dense, Flatten, Layer, MaxPool2d, Relu};

use ndarray::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

pub trait Module {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32>;
    /// Backward pass.
    ///
    /// Receives dLoss/dz where z is this layer's output, combines it with the
    /// layer's local gradients via the chain rule, fills in the gradients for
    /// the layer's own weights, and returns dLoss/dx for the previous layer.
    ///
    /// For the network as a whole, the returned value is dLoss/dinput,
    /// the quantity the gradient-sign attacks are built from.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32>;
    fn zero_grad(&mut self);
}

/// A feed-forward network producing logits. The softmax lives in the loss.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Cnn {
    pub layers: Vec<Layer>,
}

impl Module for Cnn {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = input;
        for layer in &mut self.layers {
            x = layer.forward(x);
        }
        x
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = dz;
        for layer in self.layers.iter_mut().rev() {
            x = layer.backward(x);
        }
        x
    }

    fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }
}

impl Cnn {
    /// The basic MNIST CNN, width scaled by `nb_filters`:
    /// two conv/relu/pool blocks and a dense head to `nb_classes` logits.
    ///
    /// (1, 28, 28) -> conv5 -> (f, 24, 24) -> pool2 -> (f, 12, 12)
    ///             -> conv3 -> (2f, 10, 10) -> pool2 -> (2f, 5, 5)
    ///             -> dense -> (nb_classes)
    pub fn basic(nb_filters: usize, nb_classes: usize, rng: &mut StdRng) -> Cnn {
        Cnn {
            layers: vec![
                Layer::Conv(Conv2d::new(1, nb_filters, 5, rng)),
                Layer::Relu(Relu::new()),
                Layer::Pool(MaxPool2d::new(2)),
                Layer::Conv(Conv2d::new(nb_filters, 2 * nb_filters, 3, rng)),
                Layer::Relu(Relu::new()),
                Layer::Pool(MaxPool2d::new(2)),
                Layer::Flatten(Flatten::new()),
                Layer::Dense(Dense::new(2 * nb_filters * 5 * 5, nb_classes, rng)),
            ],
        }
    }

    /// Save the network weights to a JSON checkpoint file.
    pub fn to_checkpoint(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Load a network from a JSON checkpoint file.
    pub fn from_checkpoint(path: &Path) -> Result<Cnn> {
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        let cnn: Cnn = serde_json::from_str(&contents)?;
        Ok(cnn)
    }
}
