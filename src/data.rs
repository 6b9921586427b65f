use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::Config;

// ---------------------------------------------------------------------------
// Dataset registry
// ---------------------------------------------------------------------------

/// Image shape (channels, height, width) for a dataset id.
pub fn dataset_shape(name: &str) -> Result<(usize, usize, usize)> {
    match name {
        "blobs" => Ok((3, 32, 32)),
        "blobs-tiny" => Ok((1, 8, 8)),
        _ => bail!("unknown dataset '{}' (expected 'blobs' or 'blobs-tiny')", name),
    }
}

// ---------------------------------------------------------------------------
// Splits
// ---------------------------------------------------------------------------

struct Split {
    images: Vec<Vec<f32>>,
    labels: Vec<u32>,
}

impl Split {
    fn len(&self) -> usize {
        self.images.len()
    }
}

/// A batch of augmented views of the same underlying examples. Labels ride
/// along but training ignores them; only the probes consume labels.
pub struct ViewBatch {
    pub views: Vec<Tensor>,
}

// ---------------------------------------------------------------------------
// Synthetic multi-view dataset
// ---------------------------------------------------------------------------

/// Class-prototype images plus per-sample noise. Stands in for a real image
/// dataset behind the same train/clf/test interface the loop consumes.
pub struct ViewDataset {
    pub shape: (usize, usize, usize),
    bs: usize,
    num_views: usize,
    train: Split,
    clf: Split,
    test: Split,
    rng: StdRng,
}

pub fn get_ds(cfg: &Config) -> Result<ViewDataset> {
    let shape = dataset_shape(&cfg.dataset)?;
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    let prototypes: Vec<Vec<f32>> = (0..cfg.classes)
        .map(|_| make_prototype(shape, &mut rng))
        .collect();

    let mut make_split = |n: usize| -> Split {
        let mut images = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let class = i % cfg.classes;
            let proto = &prototypes[class];
            let img: Vec<f32> = proto.iter().map(|&p| p + 0.3 * randn(&mut rng)).collect();
            images.push(img);
            labels.push(class as u32);
        }
        Split { images, labels }
    };

    let train = make_split(cfg.train_samples);
    let clf = make_split(cfg.clf_samples);
    let test = make_split(cfg.test_samples);

    Ok(ViewDataset {
        shape,
        bs: cfg.bs,
        num_views: cfg.num_views,
        train,
        clf,
        test,
        rng,
    })
}

impl ViewDataset {
    pub fn iters_per_epoch(&self) -> usize {
        (self.train.len() / self.bs).max(1)
    }

    /// One epoch worth of shuffled multi-view training batches. Each call
    /// reshuffles and re-augments, so views are produced fresh per step.
    pub fn train_batches(&mut self, device: &Device) -> Result<Vec<ViewBatch>> {
        let n = self.train.len();
        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut self.rng);

        let bs = self.bs.min(n);
        let mut batches = Vec::with_capacity(n / bs);
        for chunk in indices.chunks(bs) {
            if chunk.len() < bs && !batches.is_empty() {
                break; // drop last partial batch
            }
            let mut views = Vec::with_capacity(self.num_views);
            for _ in 0..self.num_views {
                let mut data = Vec::with_capacity(chunk.len() * flat_len(self.shape));
                for &idx in chunk {
                    data.extend(augment(&self.train.images[idx], self.shape, &mut self.rng));
                }
                let (c, h, w) = self.shape;
                views.push(Tensor::from_vec(data, (chunk.len(), c, h, w), device)?);
            }
            batches.push(ViewBatch { views });
        }
        Ok(batches)
    }

    pub fn clf_batches(&self, device: &Device) -> Result<Vec<(Tensor, Tensor)>> {
        plain_batches(&self.clf, self.shape, self.bs, device)
    }

    pub fn test_batches(&self, device: &Device) -> Result<Vec<(Tensor, Tensor)>> {
        plain_batches(&self.test, self.shape, self.bs, device)
    }
}

/// Unaugmented (images, labels) batches for the probes.
fn plain_batches(
    split: &Split,
    shape: (usize, usize, usize),
    bs: usize,
    device: &Device,
) -> Result<Vec<(Tensor, Tensor)>> {
    let (c, h, w) = shape;
    let bs = bs.min(split.len());
    let mut out = Vec::new();
    for start in (0..split.len()).step_by(bs) {
        let end = (start + bs).min(split.len());
        let mut data = Vec::with_capacity((end - start) * flat_len(shape));
        for img in &split.images[start..end] {
            data.extend_from_slice(img);
        }
        let images = Tensor::from_vec(data, (end - start, c, h, w), device)?;
        let labels = Tensor::from_vec(split.labels[start..end].to_vec(), end - start, device)?;
        out.push((images, labels));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Prototype generation and augmentation
// ---------------------------------------------------------------------------

fn flat_len((c, h, w): (usize, usize, usize)) -> usize {
    c * h * w
}

/// Standard normal via Box-Muller.
fn randn(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(1e-7f32..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

/// A smooth random image: white noise passed twice through a 3x3 box blur
/// so that classes differ in coarse structure rather than per-pixel noise.
fn make_prototype(shape: (usize, usize, usize), rng: &mut StdRng) -> Vec<f32> {
    let (c, h, w) = shape;
    let mut img: Vec<f32> = (0..flat_len(shape)).map(|_| randn(rng)).collect();
    for _ in 0..2 {
        img = box_blur(&img, c, h, w);
    }
    // Rescale to unit variance so augmentation noise keeps its meaning.
    let mean = img.iter().sum::<f32>() / img.len() as f32;
    let var = img.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / img.len() as f32;
    let scale = 1.0 / var.sqrt().max(1e-6);
    img.iter().map(|v| (v - mean) * scale).collect()
}

fn box_blur(img: &[f32], c: usize, h: usize, w: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; img.len()];
    for ch in 0..c {
        for y in 0..h {
            for x in 0..w {
                let mut sum = 0.0;
                let mut count = 0.0;
                for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        let ny = y as i32 + dy;
                        let nx = x as i32 + dx;
                        if ny >= 0 && ny < h as i32 && nx >= 0 && nx < w as i32 {
                            sum += img[ch * h * w + ny as usize * w + nx as usize];
                            count += 1.0;
                        }
                    }
                }
                out[ch * h * w + y * w + x] = sum / count;
            }
        }
    }
    out
}

/// One augmented view: random horizontal flip, random shift with zero pad,
/// additive pixel jitter.
fn augment(img: &[f32], shape: (usize, usize, usize), rng: &mut StdRng) -> Vec<f32> {
    let (c, h, w) = shape;
    let flip = rng.gen::<f32>() < 0.5;
    let max_shift = (h / 8).clamp(1, 3) as i32;
    let dy = rng.gen_range(-max_shift..=max_shift);
    let dx = rng.gen_range(-max_shift..=max_shift);

    let mut out = vec![0.0f32; img.len()];
    for ch in 0..c {
        for y in 0..h {
            for x in 0..w {
                let sy = y as i32 - dy;
                let sx = x as i32 - dx;
                if sy < 0 || sy >= h as i32 || sx < 0 || sx >= w as i32 {
                    continue;
                }
                let sx = if flip { w - 1 - sx as usize } else { sx as usize };
                out[ch * h * w + y * w + x] = img[ch * h * w + sy as usize * w + sx];
            }
        }
    }
    for v in &mut out {
        *v += 0.1 * randn(rng);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_dataset_shapes() {
        assert_eq!(dataset_shape("blobs").unwrap(), (3, 32, 32));
        assert_eq!(dataset_shape("blobs-tiny").unwrap(), (1, 8, 8));
        assert!(dataset_shape("cifar100").is_err());
    }

    #[test]
    fn test_train_batches_have_n_views() -> Result<()> {
        let mut cfg = Config::test();
        cfg.num_views = 3;
        let mut ds = get_ds(&cfg)?;
        let device = Device::Cpu;
        let batches = ds.train_batches(&device)?;
        assert_eq!(batches.len(), ds.iters_per_epoch());
        for batch in &batches {
            assert_eq!(batch.views.len(), 3);
            let dims = batch.views[0].dims();
            assert_eq!(dims, &[cfg.bs, 1, 8, 8]);
        }
        Ok(())
    }

    #[test]
    fn test_views_of_same_batch_differ() -> Result<()> {
        let cfg = Config::test();
        let mut ds = get_ds(&cfg)?;
        let device = Device::Cpu;
        let batches = ds.train_batches(&device)?;
        let a = batches[0].views[0].flatten_all()?.to_vec1::<f32>()?;
        let b = batches[0].views[1].flatten_all()?.to_vec1::<f32>()?;
        let diff: f32 = a.iter().zip(&b).map(|(x, y)| (x - y).abs()).sum();
        assert!(diff > 1e-3, "augmented views should not be identical");
        Ok(())
    }

    #[test]
    fn test_probe_splits_carry_labels() -> Result<()> {
        let cfg = Config::test();
        let ds = get_ds(&cfg)?;
        let device = Device::Cpu;
        let clf = ds.clf_batches(&device)?;
        let total: usize = clf.iter().map(|(x, _)| x.dims()[0]).sum();
        assert_eq!(total, cfg.clf_samples);
        for (_, labels) in &clf {
            for l in labels.to_vec1::<u32>()? {
                assert!((l as usize) < cfg.classes);
            }
        }
        Ok(())
    }

    #[test]
    fn test_seeded_generation_is_reproducible() -> Result<()> {
        let cfg = Config::test();
        let ds1 = get_ds(&cfg)?;
        let ds2 = get_ds(&cfg)?;
        assert_eq!(ds1.train.images[0], ds2.train.images[0]);
        assert_eq!(ds1.test.labels, ds2.test.labels);
        Ok(())
    }
}
