use crate::model::Module;
use ndarray::prelude::*;
use ndarray::Zip;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::f32;

/// 2D convolution, no padding, stride 1, computed with the im2col method:
/// every kernel application site in the input volume becomes one row of a
/// patches matrix, so the whole convolution reduces to a single GEMM per
/// batch item.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    /// im2col weight layout: (out_channels, in_channels * k^2)
    pub kernels: Array2<f32>,
    /// One bias per output channel.
    pub bias: Array1<f32>,
    // cached patches matrix from the last forward: (batch, locations, in_channels * k^2)
    #[serde(skip)]
    patches: Option<Array3<f32>>,
    #[serde(skip)]
    pub k_grad: Option<Array2<f32>>,
    #[serde(skip)]
    pub b_grad: Option<Array1<f32>>,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        rng: &mut StdRng,
    ) -> Conv2d {
        // He-style uniform init, fan-in = in_channels * k^2
        let scale = (6.0 / (in_channels * kernel_size * kernel_size) as f32).sqrt();
        let kernels = Array2::random_using(
            (out_channels, in_channels * kernel_size * kernel_size),
            Uniform::new(-1.0, 1.0),
            rng,
        ) * scale;

        Conv2d {
            in_channels,
            out_channels,
            kernel_size,
            kernels,
            bias: Array1::zeros(out_channels),
            patches: None,
            k_grad: None,
            b_grad: None,
        }
    }
}

impl Module for Conv2d {
    /// Input: (batch, in_channels, h, w).
    /// Output: (batch, out_channels, h-k+1, w-k+1).
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("conv input should be 4D");
        let (batch_size, in_channels, in_height, in_width) = input.dim();
        assert_eq!(in_channels, self.in_channels);

        let k = self.kernel_size;
        let out_height = in_height - k + 1;
        let out_width = in_width - k + 1;
        let nb_locations = out_height * out_width;

        let mut out = Array4::zeros((batch_size, self.out_channels, out_height, out_width));
        let mut patches = Array3::<f32>::zeros((batch_size, nb_locations, in_channels * k * k));

        for (batch_idx, feature_maps) in input.outer_iter().enumerate() {
            // One row per location, each row a flattened (in_channels, k, k) patch.
            let mut patches_mat = patches.slice_mut(s![batch_idx, .., ..]);
            for (mut row, patch) in patches_mat
                .rows_mut()
                .into_iter()
                .zip(feature_maps.windows((in_channels, k, k)))
            {
                for (dst, &src) in row.iter_mut().zip(patch.iter()) {
                    *dst = src;
                }
            }

            // (out_channels, locations) = (out_channels, in_channels*k^2) x (in_channels*k^2, locations)
            let mut flat_out = self.kernels.dot(&patches_mat.t());
            flat_out += &self.bias.view().insert_axis(Axis(1));

            let feature_map_out = flat_out
                .into_shape((self.out_channels, out_height, out_width))
                .expect("conv output locations match the output feature map shape");
            out.index_axis_mut(Axis(0), batch_idx).assign(&feature_map_out);
        }

        self.patches = Some(patches);
        out.into_dyn()
    }

    /// dz: (batch, out_channels, out_h, out_w).
    ///
    /// With im2col the forward is out = kernels x patches^T, so:
    /// - dL/dkernels = dz x patches, accumulated over the batch
    /// - dL/dbias    = dz summed over locations and batch
    /// - dL/dpatches = kernels^T x dz, scattered back (with accumulation,
    ///   since patches overlap) into the input volume to give dL/dinput.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("conv backward input should be 4D");
        let (batch_size, out_channels, out_height, out_width) = dz.dim();
        let k = self.kernel_size;
        let nb_locations = out_height * out_width;

        let dz = dz
            .to_shape((batch_size, out_channels, nb_locations))
            .expect("conv dz reshapes to (batch, out_channels, locations)");

        let patches = self
            .patches
            .as_ref()
            .expect("run forward before backward");

        let mut k_grad = Array2::<f32>::zeros((out_channels, self.in_channels * k * k));
        for batch_idx in 0..batch_size {
            k_grad += &dz
                .slice(s![batch_idx, .., ..])
                .dot(&patches.slice(s![batch_idx, .., ..]));
        }
        self.k_grad = Some(k_grad);

        self.b_grad = Some(
            dz.fold_axis(Axis(2), 0.0, |&a, &b| a + b)
                .fold_axis(Axis(0), 0.0, |&a, &b| a + b),
        );

        // dL/dpatches, one GEMM per batch item
        let mut dpatches =
            Array3::<f32>::zeros((batch_size, self.in_channels * k * k, nb_locations));
        for batch_idx in 0..batch_size {
            let sample_grad = self.kernels.t().dot(&dz.slice(s![batch_idx, .., ..]));
            dpatches
                .slice_mut(s![batch_idx, .., ..])
                .assign(&sample_grad);
        }

        // Scatter patch gradients back into the input volume
        let in_height = out_height + k - 1;
        let in_width = out_width + k - 1;
        let mut dinput = Array4::zeros((batch_size, self.in_channels, in_height, in_width));

        let dpatches = dpatches.permuted_axes([0, 2, 1]);
        let grad_patches = dpatches
            .to_shape((batch_size, nb_locations, self.in_channels, k, k))
            .expect("patch gradients reshape to (batch, locations, in_channels, k, k)");
        for batch_idx in 0..batch_size {
            for (loc, patch_grad) in grad_patches
                .slice(s![batch_idx, .., .., .., ..])
                .outer_iter()
                .enumerate()
            {
                let top_y = loc / out_width;
                let top_x = loc % out_width;
                let mut slot =
                    dinput.slice_mut(s![batch_idx, .., top_y..top_y + k, top_x..top_x + k]);
                slot += &patch_grad;
            }
        }

        dinput.into_dyn()
    }

    fn zero_grad(&mut self) {
        self.patches = None;
        self.k_grad = None;
        self.b_grad = None;
    }
}

/// Max pooling with a square window; window size must divide the input size.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MaxPool2d {
    pool_size: usize,
    // 1.0 where the input held the window max: (batch, channels, h/k, k, w/k, k)
    #[serde(skip)]
    max_mask: Option<Array6<f32>>,
}

impl MaxPool2d {
    pub fn new(pool_size: usize) -> MaxPool2d {
        MaxPool2d {
            pool_size,
            max_mask: None,
        }
    }
}

impl Module for MaxPool2d {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("pool input should be 4D");
        let (batch_size, channels, height, width) = input.dim();
        let k = self.pool_size;
        assert!(height % k == 0 && width % k == 0);

        // Split h and w into (h/k, k) and (w/k, k), then reduce the two
        // window axes.
        let input_6d = input
            .to_shape((batch_size, channels, height / k, k, width / k, k))
            .expect("pool input splits into window axes");

        let pooled: Array4<f32> = input_6d
            .fold_axis(Axis(3), f32::NEG_INFINITY, |&a, &b| a.max(b))
            .fold_axis(Axis(4), f32::NEG_INFINITY, |&a, &b| a.max(b));

        let pooled_6d = pooled
            .to_shape((batch_size, channels, height / k, 1, width / k, 1))
            .expect("pooled output broadcasts against the window axes");

        let mut mask = Array6::zeros((batch_size, channels, height / k, k, width / k, k));
        Zip::from(&mut mask)
            .and(&input_6d)
            .and_broadcast(&pooled_6d)
            .for_each(|m, &v, &max| {
                // Ties mark more than one cell and duplicate the gradient.
                if v == max {
                    *m = 1.0;
                }
            });
        self.max_mask = Some(mask);

        pooled.into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("pool backward input should be 4D");
        let (batch_size, channels, out_height, out_width) = dz.dim();
        let k = self.pool_size;

        let dz_6d = dz
            .to_shape((batch_size, channels, out_height, 1, out_width, 1))
            .expect("pool dz broadcasts against the window axes");

        let mask = self
            .max_mask
            .as_ref()
            .expect("run forward before backward");

        let mut dinput = Array6::zeros((batch_size, channels, out_height, k, out_width, k));
        Zip::from(&mut dinput)
            .and(mask)
            .and_broadcast(&dz_6d)
            .for_each(|d, &m, &g| {
                if m == 1.0 {
                    *d = g;
                }
            });

        dinput
            .into_shape((batch_size, channels, out_height * k, out_width * k))
            .expect("pool dinput merges back into 4D")
            .into_dyn()
    }

    fn zero_grad(&mut self) {
        self.max_mask = None;
    }
}

/// Collapse feature maps to (batch, features) ahead of the dense head.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Flatten {
    #[serde(skip)]
    input_shape: Option<Vec<usize>>,
}

impl Flatten {
    pub fn new() -> Flatten {
        Flatten { input_shape: None }
    }
}

impl Module for Flatten {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        self.input_shape = Some(input.shape().to_vec());
        let batch_size = input.shape()[0];
        let features = input.len() / batch_size;
        input
            .into_shape(IxDyn(&[batch_size, features]))
            .expect("flatten input is contiguous")
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let shape = self
            .input_shape
            .as_ref()
            .expect("run forward before backward");
        dz.into_shape(IxDyn(shape))
            .expect("flatten gradient reshapes back to the input shape")
    }

    fn zero_grad(&mut self) {
        self.input_shape = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn conv_output_shape_is_valid_convolution() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut conv = Conv2d::new(1, 3, 5, &mut rng);
        let input = Array4::<f32>::zeros((2, 1, 28, 28)).into_dyn();
        let out = conv.forward(input);
        assert_eq!(out.shape(), &[2, 3, 24, 24]);
    }

    #[test]
    fn conv_backward_returns_input_shaped_gradient_and_fills_weight_grads() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut conv = Conv2d::new(2, 4, 3, &mut rng);
        let input = Array4::random_using((2, 2, 8, 8), Uniform::new(-1.0, 1.0), &mut rng);
        let out = conv.forward(input.into_dyn());
        let dinput = conv.backward(ArrayD::ones(out.shape()));
        assert_eq!(dinput.shape(), &[2, 2, 8, 8]);
        assert_eq!(conv.k_grad.as_ref().unwrap().dim(), (4, 2 * 3 * 3));
        assert_eq!(conv.b_grad.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn pool_picks_window_max_and_routes_gradient_to_it() {
        let mut pool = MaxPool2d::new(2);
        let mut input = Array4::<f32>::zeros((1, 1, 2, 2));
        input[(0, 0, 1, 0)] = 5.0;
        let out = pool.forward(input.into_dyn());
        assert_eq!(out.shape(), &[1, 1, 1, 1]);
        assert_eq!(out[[0, 0, 0, 0]], 5.0);

        let dinput = pool.backward(ArrayD::ones(vec![1, 1, 1, 1]));
        assert_eq!(dinput[[0, 0, 1, 0]], 1.0);
        assert_eq!(dinput[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn flatten_round_trips_shapes() {
        let mut flatten = Flatten::new();
        let out = flatten.forward(ArrayD::zeros(vec![3, 2, 4, 4]));
        assert_eq!(out.shape(), &[3, 32]);
        let back = flatten.backward(ArrayD::zeros(vec![3, 32]));
        assert_eq!(back.shape(), &[3, 2, 4, 4]);
    }
}
