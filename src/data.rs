//! Batch sources for training and evaluation
//!
//! The search loop only sees the [`BatchSource`] trait, so the CIFAR-10
//! binary loader and the synthetic generator used in tests are fully
//! interchangeable. Images are stored as raw `[0, 1]` floats; augmentation
//! runs on the raw values and channel normalization is applied last, which
//! keeps the crop padding at true black.

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::path::Path;

use crate::error::{EnasError, Result};

/// CIFAR-10 channel means in `[0, 1]` scale
pub const CIFAR_MEAN: [f32; 3] = [125.3 / 255.0, 123.0 / 255.0, 113.9 / 255.0];
/// CIFAR-10 channel standard deviations in `[0, 1]` scale
pub const CIFAR_STD: [f32; 3] = [63.0 / 255.0, 62.1 / 255.0, 66.7 / 255.0];

const IMAGE_DIM: usize = 32;
const IMAGE_LEN: usize = 3 * IMAGE_DIM * IMAGE_DIM;
const RECORD_LEN: usize = 1 + IMAGE_LEN;
const CROP_PAD: usize = 4;

/// One mini-batch: `images` is `[b, 3, 32, 32]` f32, `labels` is `[b]` u32
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Anything that can hand out mini-batches to the training loop
pub trait BatchSource {
    /// Next batch, wrapping around (with a reshuffle where applicable) when
    /// the epoch is exhausted
    fn next_batch(&mut self) -> Result<Batch>;
    /// Number of full batches per epoch
    fn num_batches(&self) -> usize;
    /// Restart the epoch from the beginning
    fn reset(&mut self);
}

/// In-memory CIFAR-10 split backed by the original binary distribution
/// (`data_batch_1.bin` .. `data_batch_5.bin`, `test_batch.bin`)
#[derive(Debug)]
pub struct CifarDataset {
    /// Raw pixel values in `[0, 1]`, `IMAGE_LEN` floats per sample, CHW
    images: Vec<f32>,
    labels: Vec<u32>,
    indices: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    augment: bool,
    shuffle: bool,
    rng: Xoshiro256PlusPlus,
    device: Device,
}

impl CifarDataset {
    /// First 45k samples of the training files, with augmentation
    pub fn train(dir: &Path, batch_size: usize, device: &Device, seed: u64) -> Result<Self> {
        let (images, labels) = load_train_files(dir)?;
        Self::from_raw(images, labels, 0..45_000, batch_size, true, true, device, seed)
    }

    /// Last 5k samples of the training files, held out for the controller
    /// reward. Augmented and shuffled like the training split.
    pub fn valid(dir: &Path, batch_size: usize, device: &Device, seed: u64) -> Result<Self> {
        let (images, labels) = load_train_files(dir)?;
        Self::from_raw(images, labels, 45_000..50_000, batch_size, true, true, device, seed)
    }

    /// The 10k test samples, unaugmented and in file order
    pub fn test(dir: &Path, batch_size: usize, device: &Device) -> Result<Self> {
        let mut images = Vec::new();
        let mut labels = Vec::new();
        read_records(&dir.join("test_batch.bin"), &mut images, &mut labels)?;
        let n = labels.len();
        Self::from_raw(images, labels, 0..n, batch_size, false, false, device, 0)
    }

    #[allow(clippy::too_many_arguments)]
    fn from_raw(
        images: Vec<f32>,
        labels: Vec<u32>,
        range: std::ops::Range<usize>,
        batch_size: usize,
        augment: bool,
        shuffle: bool,
        device: &Device,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(EnasError::Config("batch_size must be positive".into()));
        }
        if range.end > labels.len() {
            return Err(EnasError::Data(format!(
                "split needs {} samples but the files hold {}",
                range.end,
                labels.len()
            )));
        }
        let indices: Vec<usize> = range.collect();
        if indices.len() < batch_size {
            return Err(EnasError::Data(format!(
                "split of {} samples cannot fill a batch of {batch_size}",
                indices.len()
            )));
        }
        let mut source = Self {
            images,
            labels,
            indices,
            cursor: 0,
            batch_size,
            augment,
            shuffle,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            device: device.clone(),
        };
        source.reset();
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Random crop with 4-pixel zero padding, then horizontal flip with
    /// probability one half, on a single raw CHW sample
    fn augment_sample(&mut self, sample: &mut [f32]) {
        let dy = self.rng.gen_range(0..=2 * CROP_PAD);
        let dx = self.rng.gen_range(0..=2 * CROP_PAD);
        let flip = self.rng.gen_bool(0.5);
        let mut out = [0.0f32; IMAGE_LEN];
        for c in 0..3 {
            for y in 0..IMAGE_DIM {
                let src_y = (y + dy) as isize - CROP_PAD as isize;
                if !(0..IMAGE_DIM as isize).contains(&src_y) {
                    continue;
                }
                for x in 0..IMAGE_DIM {
                    let src_x = (x + dx) as isize - CROP_PAD as isize;
                    if !(0..IMAGE_DIM as isize).contains(&src_x) {
                        continue;
                    }
                    let dst_x = if flip { IMAGE_DIM - 1 - x } else { x };
                    out[(c * IMAGE_DIM + y) * IMAGE_DIM + dst_x] =
                        sample[(c * IMAGE_DIM + src_y as usize) * IMAGE_DIM + src_x as usize];
                }
            }
        }
        sample.copy_from_slice(&out);
    }
}

impl BatchSource for CifarDataset {
    fn next_batch(&mut self) -> Result<Batch> {
        if self.cursor + self.batch_size > self.indices.len() {
            self.reset();
        }
        let picked = self.indices[self.cursor..self.cursor + self.batch_size].to_vec();
        self.cursor += self.batch_size;

        let mut pixels = Vec::with_capacity(self.batch_size * IMAGE_LEN);
        let mut labels = Vec::with_capacity(self.batch_size);
        for idx in picked {
            let mut sample: Vec<f32> = self.images[idx * IMAGE_LEN..(idx + 1) * IMAGE_LEN].to_vec();
            if self.augment {
                self.augment_sample(&mut sample);
            }
            for (c, channel) in sample.chunks_exact(IMAGE_DIM * IMAGE_DIM).enumerate() {
                pixels.extend(channel.iter().map(|&v| (v - CIFAR_MEAN[c]) / CIFAR_STD[c]));
            }
            labels.push(self.labels[idx]);
        }

        Ok(Batch {
            images: Tensor::from_vec(
                pixels,
                (self.batch_size, 3, IMAGE_DIM, IMAGE_DIM),
                &self.device,
            )?,
            labels: Tensor::from_vec(labels, self.batch_size, &self.device)?,
        })
    }

    fn num_batches(&self) -> usize {
        self.indices.len() / self.batch_size
    }

    fn reset(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            // Fisher-Yates over the split's index list
            for i in (1..self.indices.len()).rev() {
                let j = self.rng.gen_range(0..=i);
                self.indices.swap(i, j);
            }
        }
    }
}

fn load_train_files(dir: &Path) -> Result<(Vec<f32>, Vec<u32>)> {
    let mut images = Vec::new();
    let mut labels = Vec::new();
    for i in 1..=5 {
        read_records(&dir.join(format!("data_batch_{i}.bin")), &mut images, &mut labels)?;
    }
    Ok((images, labels))
}

fn read_records(path: &Path, images: &mut Vec<f32>, labels: &mut Vec<u32>) -> Result<()> {
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() || bytes.len() % RECORD_LEN != 0 {
        return Err(EnasError::Data(format!(
            "{} is not a CIFAR-10 binary file: {} bytes is not a multiple of {RECORD_LEN}",
            path.display(),
            bytes.len()
        )));
    }
    for record in bytes.chunks_exact(RECORD_LEN) {
        let label = record[0];
        if label > 9 {
            return Err(EnasError::Data(format!(
                "{}: label {label} out of range",
                path.display()
            )));
        }
        labels.push(label as u32);
        images.extend(record[1..].iter().map(|&b| b as f32 / 255.0));
    }
    Ok(())
}

/// Seeded random batches for tests and smoke runs
pub struct SyntheticDataset {
    batch_size: usize,
    num_batches: usize,
    num_classes: usize,
    seed: u64,
    rng: Xoshiro256PlusPlus,
    device: Device,
}

impl SyntheticDataset {
    pub fn new(
        batch_size: usize,
        num_batches: usize,
        num_classes: usize,
        device: &Device,
        seed: u64,
    ) -> Self {
        Self {
            batch_size,
            num_batches,
            num_classes,
            seed,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            device: device.clone(),
        }
    }
}

impl BatchSource for SyntheticDataset {
    fn next_batch(&mut self) -> Result<Batch> {
        let mut pixels = Vec::with_capacity(self.batch_size * IMAGE_LEN);
        for _ in 0..self.batch_size * IMAGE_LEN {
            pixels.push(self.rng.gen::<f32>() * 2.0 - 1.0);
        }
        let labels: Vec<u32> = (0..self.batch_size)
            .map(|_| self.rng.gen_range(0..self.num_classes as u32))
            .collect();
        Ok(Batch {
            images: Tensor::from_vec(
                pixels,
                (self.batch_size, 3, IMAGE_DIM, IMAGE_DIM),
                &self.device,
            )?,
            labels: Tensor::from_vec(labels, self.batch_size, &self.device)?,
        })
    }

    fn num_batches(&self) -> usize {
        self.num_batches
    }

    fn reset(&mut self) {
        self.rng = Xoshiro256PlusPlus::seed_from_u64(self.seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_cifar_file(path: &Path, records: usize, label: u8, value: u8) {
        let mut bytes = Vec::with_capacity(records * RECORD_LEN);
        for _ in 0..records {
            bytes.push(label);
            bytes.extend(std::iter::repeat(value).take(IMAGE_LEN));
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_synthetic_batch_shapes() {
        let mut source = SyntheticDataset::new(4, 3, 10, &Device::Cpu, 7);
        let batch = source.next_batch().unwrap();
        assert_eq!(batch.images.dims(), &[4, 3, 32, 32]);
        assert_eq!(batch.labels.dims(), &[4]);
        assert_eq!(source.num_batches(), 3);
    }

    #[test]
    fn test_synthetic_reset_is_deterministic() {
        let mut source = SyntheticDataset::new(2, 1, 10, &Device::Cpu, 9);
        let first = source.next_batch().unwrap().labels.to_vec1::<u32>().unwrap();
        source.reset();
        let again = source.next_batch().unwrap().labels.to_vec1::<u32>().unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_record_parsing_and_normalization() {
        let dir = std::env::temp_dir().join("enas_cifar_parse_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test_batch.bin");
        fake_cifar_file(&path, 4, 3, 128);

        let mut source = CifarDataset::test(&dir, 2, &Device::Cpu).unwrap();
        assert_eq!(source.len(), 4);
        assert_eq!(source.num_batches(), 2);

        let batch = source.next_batch().unwrap();
        assert_eq!(batch.labels.to_vec1::<u32>().unwrap(), vec![3, 3]);
        let pixel = batch
            .images
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        let expected = (128.0 / 255.0 - CIFAR_MEAN[0]) / CIFAR_STD[0];
        assert!((pixel - expected).abs() < 1e-6);
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = std::env::temp_dir().join("enas_cifar_truncated_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test_batch.bin");
        std::fs::write(&path, vec![0u8; RECORD_LEN - 1]).unwrap();
        let err = CifarDataset::test(&dir, 1, &Device::Cpu).unwrap_err();
        assert!(matches!(err, EnasError::Data(_)));
    }

    #[test]
    fn test_out_of_range_label_is_rejected() {
        let dir = std::env::temp_dir().join("enas_cifar_label_test");
        std::fs::create_dir_all(&dir).unwrap();
        fake_cifar_file(&dir.join("test_batch.bin"), 1, 11, 0);
        assert!(CifarDataset::test(&dir, 1, &Device::Cpu).is_err());
    }

    #[test]
    fn test_augmentation_keeps_shape_and_range() {
        let n = 16;
        let images = vec![0.5f32; n * IMAGE_LEN];
        let labels = vec![1u32; n];
        let mut source =
            CifarDataset::from_raw(images, labels, 0..n, 8, true, true, &Device::Cpu, 3).unwrap();
        let batch = source.next_batch().unwrap();
        assert_eq!(batch.images.dims(), &[8, 3, 32, 32]);
        let v = batch.images.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(v.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_wraps_around_after_epoch() {
        let dir = std::env::temp_dir().join("enas_cifar_wrap_test");
        std::fs::create_dir_all(&dir).unwrap();
        fake_cifar_file(&dir.join("test_batch.bin"), 3, 0, 10);
        let mut source = CifarDataset::test(&dir, 2, &Device::Cpu).unwrap();
        for _ in 0..4 {
            let batch = source.next_batch().unwrap();
            assert_eq!(batch.len(), 2);
        }
    }
}
