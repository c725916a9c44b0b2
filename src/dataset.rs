use crate::error::{Error, Result};

use mnist::MnistBuilder;
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::Rng;
use std::path::Path;

pub const IMG_SIDE: usize = 28;
pub const IMG_PIXELS: usize = IMG_SIDE * IMG_SIDE;
pub const NB_CLASSES: usize = 10;

const TRAIN_SET_LEN: usize = 60_000;
const TEST_SET_LEN: usize = 10_000;

/// Index ranges selecting which slice of the decoded MNIST sets to keep.
#[derive(Debug, Clone, Copy)]
pub struct IndexRanges {
    pub train_start: usize,
    pub train_end: usize,
    pub test_start: usize,
    pub test_end: usize,
}

impl Default for IndexRanges {
    fn default() -> IndexRanges {
        IndexRanges {
            train_start: 0,
            train_end: TRAIN_SET_LEN,
            test_start: 0,
            test_end: TEST_SET_LEN,
        }
    }
}

/// MNIST held fully in memory as float tensors.
///
/// Images are NCHW `(n, 1, 28, 28)` with pixels scaled to [0, 1].
/// Labels are one-hot `(n, 10)`.
pub struct MnistData {
    pub train_images: Array4<f32>,
    pub train_labels: Array2<f32>,
    pub test_images: Array4<f32>,
    pub test_labels: Array2<f32>,
}

impl MnistData {
    /// Deterministic random dataset with the real shapes, for tests.
    pub fn synthetic(n_train: usize, n_test: usize, rng: &mut StdRng) -> MnistData {
        let distr = Uniform::new(0.0, 1.0);
        let train_images =
            Array4::random_using((n_train, 1, IMG_SIDE, IMG_SIDE), distr, rng);
        let test_images = Array4::random_using((n_test, 1, IMG_SIDE, IMG_SIDE), distr, rng);

        let random_one_hot = |n: usize, rng: &mut StdRng| {
            let mut labels = Array2::zeros((n, NB_CLASSES));
            for mut row in labels.rows_mut() {
                row[rng.gen_range(0..NB_CLASSES)] = 1.0;
            }
            labels
        };
        let train_labels = random_one_hot(n_train, rng);
        let test_labels = random_one_hot(n_test, rng);

        MnistData {
            train_images,
            train_labels,
            test_images,
            test_labels,
        }
    }
}

/// Load the MNIST ubyte files under `data_dir` and keep the index ranges
/// selected by `ranges`.
pub fn load_mnist(data_dir: &Path, ranges: &IndexRanges) -> Result<MnistData> {
    // The decoder panics on missing files, so check up front.
    for name in [
        "train-images-idx3-ubyte",
        "train-labels-idx1-ubyte",
        "t10k-images-idx3-ubyte",
        "t10k-labels-idx1-ubyte",
    ] {
        if !data_dir.join(name).exists() {
            return Err(Error::Data(format!(
                "missing MNIST file {} under {}",
                name,
                data_dir.display()
            )));
        }
    }

    check_range("train", ranges.train_start, ranges.train_end, TRAIN_SET_LEN)?;
    check_range("test", ranges.test_start, ranges.test_end, TEST_SET_LEN)?;

    let mut base_path = data_dir.to_string_lossy().into_owned();
    if !base_path.ends_with('/') {
        base_path.push('/');
    }
    let raw = MnistBuilder::new()
        .base_path(&base_path)
        .training_set_length(TRAIN_SET_LEN as u32)
        .test_set_length(TEST_SET_LEN as u32)
        .finalize();

    Ok(MnistData {
        train_images: to_images(&raw.trn_img, ranges.train_start, ranges.train_end)?,
        train_labels: to_one_hot(&raw.trn_lbl, ranges.train_start, ranges.train_end),
        test_images: to_images(&raw.tst_img, ranges.test_start, ranges.test_end)?,
        test_labels: to_one_hot(&raw.tst_lbl, ranges.test_start, ranges.test_end),
    })
}

fn check_range(set: &str, start: usize, end: usize, len: usize) -> Result<()> {
    if start > end || end > len {
        return Err(Error::Data(format!(
            "invalid {set} range {start}..{end} for a set of {len} examples"
        )));
    }
    Ok(())
}

fn to_images(raw: &[u8], start: usize, end: usize) -> Result<Array4<f32>> {
    let pixels: Vec<f32> = raw[start * IMG_PIXELS..end * IMG_PIXELS]
        .iter()
        .map(|&p| p as f32 / 255.0)
        .collect();
    Ok(Array4::from_shape_vec(
        (end - start, 1, IMG_SIDE, IMG_SIDE),
        pixels,
    )?)
}

fn to_one_hot(raw: &[u8], start: usize, end: usize) -> Array2<f32> {
    let mut labels = Array2::zeros((end - start, NB_CLASSES));
    for (i, &digit) in raw[start..end].iter().enumerate() {
        labels[(i, digit as usize)] = 1.0;
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn one_hot_rows_sum_to_one() {
        let labels = to_one_hot(&[3, 0, 9, 9], 0, 4);
        assert_eq!(labels.dim(), (4, NB_CLASSES));
        for row in labels.rows() {
            assert_eq!(row.sum(), 1.0);
        }
        assert_eq!(labels[(0, 3)], 1.0);
        assert_eq!(labels[(2, 9)], 1.0);
    }

    #[test]
    fn range_validation_rejects_inverted_and_oversized() {
        assert!(check_range("train", 10, 5, 100).is_err());
        assert!(check_range("test", 0, 101, 100).is_err());
        assert!(check_range("train", 0, 100, 100).is_ok());
    }

    #[test]
    fn synthetic_is_deterministic_for_a_fixed_seed() {
        let a = MnistData::synthetic(8, 4, &mut StdRng::seed_from_u64(42));
        let b = MnistData::synthetic(8, 4, &mut StdRng::seed_from_u64(42));
        assert_eq!(a.train_images, b.train_images);
        assert_eq!(a.train_labels, b.train_labels);
        assert_eq!(a.test_images.dim(), (4, 1, IMG_SIDE, IMG_SIDE));
    }

    #[test]
    fn missing_data_dir_is_a_clean_error() {
        let err = load_mnist(Path::new("/nonexistent"), &IndexRanges::default());
        assert!(matches!(err, Err(Error::Data(_))));
    }
}
