use anyhow::{anyhow, ensure, Result};
use candle_core::{Tensor, D};
use candle_nn::VarMap;
use std::f64::consts::PI;

// ---------------------------------------------------------------------------
// Momentum update (online -> target EMA)
// ---------------------------------------------------------------------------

/// Blend online parameters into target parameters in place:
/// `target := target * tau + online * (1 - tau)`, matched by variable name.
///
/// Call once with tau = 0 before training starts; that forces the target
/// stack to equal the online stack exactly. Operands are detached so the
/// update never enters the differentiable graph, and the target vars are
/// never handed to the optimizer. Online-only variables (the predictor)
/// have no target counterpart and are skipped because iteration runs over
/// the target map. A target name missing from the online map is a
/// precondition violation and aborts.
pub fn momentum_update(online: &VarMap, target: &VarMap, tau: f64) -> Result<()> {
    let online_data = online.data().lock().unwrap();
    let target_data = target.data().lock().unwrap();
    for (name, t) in target_data.iter() {
        let s = online_data
            .get(name)
            .ok_or_else(|| anyhow!("target var '{}' has no online counterpart", name))?;
        let blended = ((t.as_tensor().detach() * tau)?
            + (s.as_tensor().detach() * (1.0 - tau))?)?;
        t.set(&blended)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Momentum coefficient schedule
// ---------------------------------------------------------------------------

/// `tau = 1 - (1 - base_tau) * (cos(pi * epoch / total_epochs) + 1) / 2`.
///
/// Deliberately epoch-granular: tau modulates a per-iteration update but is
/// constant within an epoch, rising monotonically from base_tau toward 1 as
/// training progresses. This epoch-level coupling is a reproducible design
/// choice of the algorithm, not an oversight.
pub fn tau_for_epoch(base_tau: f64, epoch: usize, total_epochs: usize) -> f64 {
    1.0 - (1.0 - base_tau) * ((PI * epoch as f64 / total_epochs as f64).cos() + 1.0) / 2.0
}

// ---------------------------------------------------------------------------
// Pairwise symmetric loss
// ---------------------------------------------------------------------------

/// L2-normalize along the embedding dimension, with an epsilon floor on the
/// norm so zero vectors stay finite.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sqrt()?
        .clamp(1e-12, f64::INFINITY)?;
    x.broadcast_div(&norm).map_err(Into::into)
}

/// Directional regression loss between one online prediction and one target
/// projection: `2 - 2 * mean_over_batch(cos(x, y))`. Range [0, 4]; 0 for
/// aligned unit vectors, 2 for orthogonal ones.
pub fn pair_loss(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let x = l2_normalize(x)?;
    let y = l2_normalize(y)?;
    let cos = (x * y)?.sum(D::Minus1)?.mean_all()?;
    cos.affine(-2.0, 2.0).map_err(Into::into)
}

/// Symmetric multi-view aggregate: for every unordered pair of distinct
/// views {i, j}, add `pair_loss(z_i, zt_j) + pair_loss(z_j, zt_i)`, then
/// divide by the pair count N*(N-1)/2. No view is privileged as input or
/// target, and the scale is invariant to N.
pub fn multiview_loss(z: &[Tensor], zt: &[Tensor]) -> Result<Tensor> {
    ensure!(
        z.len() == zt.len(),
        "got {} online predictions but {} target projections",
        z.len(),
        zt.len()
    );
    ensure!(z.len() >= 2, "need >= 2 views, got {}", z.len());

    let n = z.len();
    let mut total: Option<Tensor> = None;
    for i in 0..n {
        for j in (i + 1)..n {
            let pair = (pair_loss(&z[i], &zt[j])? + pair_loss(&z[j], &zt[i])?)?;
            total = Some(match total {
                Some(t) => (t + pair)?,
                None => pair,
            });
        }
    }
    let pairs = (n * (n - 1) / 2) as f64;
    let total = total.ok_or_else(|| anyhow!("no view pairs"))?;
    (total / pairs).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
