use crate::model::Module;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Relu {
    #[serde(skip)]
    last_input: Option<ArrayD<f32>>,
}

impl Relu {
    pub fn new() -> Relu {
        Relu { last_input: None }
    }
}

impl Module for Relu {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        self.last_input = Some(input.clone());
        input.mapv(|x| x.max(0.0))
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        self.last_input
            .as_ref()
            .expect("run forward before backward")
            .mapv(|x| if x > 0.0 { 1.0 } else { 0.0 })
            * dz
    }

    fn zero_grad(&mut self) {
        self.last_input = None;
    }
}
