use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::loss::cross_entropy;
use candle_nn::{linear, Module, Optimizer, VarBuilder, VarMap, SGD};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::byol::l2_normalize;
use crate::model::Backbone;

/// Learning rate for the linear/SGD probe.
const PROBE_LR: f64 = 0.05;

// ---------------------------------------------------------------------------
// Feature extraction
// ---------------------------------------------------------------------------

/// Embed every batch through the frozen backbone. Outputs are detached, so
/// probe training can never backpropagate into the encoder.
pub fn embed_features(
    backbone: &Backbone,
    batches: &[(Tensor, Tensor)],
) -> Result<(Tensor, Tensor)> {
    ensure!(!batches.is_empty(), "no batches to embed");
    let mut feats = Vec::with_capacity(batches.len());
    let mut labels = Vec::with_capacity(batches.len());
    for (x, y) in batches {
        feats.push(backbone.forward(x)?.detach());
        labels.push(y.clone());
    }
    Ok((Tensor::cat(&feats, 0)?, Tensor::cat(&labels, 0)?))
}

// ---------------------------------------------------------------------------
// k-NN probe
// ---------------------------------------------------------------------------

/// Cosine-similarity k-NN over frozen features. Majority vote among the k
/// most similar labeled examples; returns accuracy in [0, 1].
pub fn eval_knn(
    backbone: &Backbone,
    out_size: usize,
    clf: &[(Tensor, Tensor)],
    test: &[(Tensor, Tensor)],
    k: usize,
) -> Result<f32> {
    let (train_f, train_y) = embed_features(backbone, clf)?;
    ensure!(
        train_f.dim(1)? == out_size,
        "backbone produced dim {} features, expected {}",
        train_f.dim(1)?,
        out_size
    );
    let (test_f, test_y) = embed_features(backbone, test)?;

    let train_n = l2_normalize(&train_f)?;
    let test_n = l2_normalize(&test_f)?;
    let sims = test_n.matmul(&train_n.t()?)?.to_vec2::<f32>()?;
    let train_y = train_y.to_vec1::<u32>()?;
    let test_y = test_y.to_vec1::<u32>()?;

    let k = k.min(train_y.len());
    let mut correct = 0usize;
    for (row, &label) in sims.iter().zip(test_y.iter()) {
        let mut idx: Vec<usize> = (0..row.len()).collect();
        idx.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(Ordering::Equal));

        let mut votes: HashMap<u32, usize> = HashMap::new();
        for &i in idx.iter().take(k) {
            *votes.entry(train_y[i]).or_insert(0) += 1;
        }
        let pred = votes
            .into_iter()
            .max_by_key(|&(_, count)| count)
            .map(|(class, _)| class);
        if pred == Some(label) {
            correct += 1;
        }
    }
    Ok(correct as f32 / test_y.len() as f32)
}

// ---------------------------------------------------------------------------
// Linear/SGD probe
// ---------------------------------------------------------------------------

/// Train a single linear layer with SGD + cross-entropy on frozen features
/// for `steps` full-batch iterations; returns test accuracy in [0, 1].
pub fn eval_sgd(
    backbone: &Backbone,
    out_size: usize,
    clf: &[(Tensor, Tensor)],
    test: &[(Tensor, Tensor)],
    steps: usize,
    device: &Device,
) -> Result<f32> {
    let (train_f, train_y) = embed_features(backbone, clf)?;
    ensure!(
        train_f.dim(1)? == out_size,
        "backbone produced dim {} features, expected {}",
        train_f.dim(1)?,
        out_size
    );
    let (test_f, test_y) = embed_features(backbone, test)?;

    let labels = train_y.to_vec1::<u32>()?;
    let classes = labels.iter().copied().max().unwrap_or(0) as usize + 1;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let probe = linear(out_size, classes, vb.pp("probe"))?;
    let mut sgd = SGD::new(varmap.all_vars(), PROBE_LR)?;

    for _ in 0..steps {
        let logits = probe.forward(&train_f)?;
        let loss = cross_entropy(&logits, &train_y)?;
        sgd.backward_step(&loss)?;
    }

    let preds = probe
        .forward(&test_f)?
        .argmax(D::Minus1)?
        .to_vec1::<u32>()?;
    let test_y = test_y.to_vec1::<u32>()?;
    let correct = preds
        .iter()
        .zip(test_y.iter())
        .filter(|(p, y)| p == y)
        .count();
    Ok(correct as f32 / test_y.len() as f32)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
