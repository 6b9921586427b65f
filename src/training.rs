use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use std::f64::consts::PI;

use crate::byol::{momentum_update, multiview_loss, tau_for_epoch};
use crate::config::{Config, LrStrategy};
use crate::data::{dataset_shape, get_ds};
use crate::eval::{eval_knn, eval_sgd};
use crate::metrics::MetricsLogger;
use crate::model::{get_backbone, get_head, get_predictor};

// ---------------------------------------------------------------------------
// Linear LR warmup
// ---------------------------------------------------------------------------

/// One-way WARMUP -> STEADY ramp. The step counter crosses epoch boundaries
/// and never resets; once `total_steps` iterations have passed, `next_lr`
/// returns None forever and the steady-state schedule takes over.
pub struct LrWarmup {
    base_lr: f64,
    total_steps: usize,
    steps_done: usize,
}

impl LrWarmup {
    pub fn new(base_lr: f64, total_steps: usize) -> Self {
        Self {
            base_lr,
            total_steps,
            steps_done: 0,
        }
    }

    /// A warmup that is already elapsed (lr_warmup off).
    pub fn disabled(base_lr: f64) -> Self {
        Self::new(base_lr, 0)
    }

    pub fn is_done(&self) -> bool {
        self.steps_done >= self.total_steps
    }

    /// LR for the current iteration, or None once warmup has elapsed.
    pub fn next_lr(&mut self) -> Option<f64> {
        if self.is_done() {
            return None;
        }
        let lr = self.base_lr * (self.steps_done + 1) as f64 / self.total_steps as f64;
        self.steps_done += 1;
        Some(lr)
    }
}

// ---------------------------------------------------------------------------
// Cosine annealing with warm restarts
// ---------------------------------------------------------------------------

/// Stateless in progress: `lr_at` maps fractional-epoch progress
/// `epoch + iter/iters_per_epoch` to an LR, restarting at cycle boundaries.
/// Cycle lengths are T0, T0*Tmult, T0*Tmult^2, ...
pub struct CosineRestarts {
    base_lr: f64,
    t0: f64,
    t_mult: f64,
    eta_min: f64,
}

impl CosineRestarts {
    pub fn new(base_lr: f64, t0: f64, t_mult: f64, eta_min: f64) -> Self {
        Self {
            base_lr,
            t0,
            t_mult,
            eta_min,
        }
    }

    pub fn lr_at(&self, progress: f64) -> f64 {
        let (t_cur, t_i) = if (self.t_mult - 1.0).abs() < f64::EPSILON {
            (progress % self.t0, self.t0)
        } else {
            let n = ((progress / self.t0 * (self.t_mult - 1.0) + 1.0).ln() / self.t_mult.ln())
                .floor();
            let consumed = self.t0 * (self.t_mult.powf(n) - 1.0) / (self.t_mult - 1.0);
            (progress - consumed, self.t0 * self.t_mult.powf(n))
        };
        self.eta_min + (self.base_lr - self.eta_min) * (1.0 + (PI * t_cur / t_i).cos()) / 2.0
    }
}

// ---------------------------------------------------------------------------
// Multi-step decay
// ---------------------------------------------------------------------------

/// Advanced once per epoch, after that epoch's iterations.
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    epochs_done: usize,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, milestones: Vec<usize>, gamma: f64) -> Self {
        Self {
            base_lr,
            milestones,
            gamma,
            epochs_done: 0,
        }
    }

    pub fn advance(&mut self) -> f64 {
        self.epochs_done += 1;
        let passed = self
            .milestones
            .iter()
            .filter(|&&m| m <= self.epochs_done)
            .count();
        self.base_lr * self.gamma.powi(passed as i32)
    }
}

pub enum LrSchedule {
    Cos(CosineRestarts),
    Step(MultiStepLr),
}

pub fn build_schedule(cfg: &Config) -> LrSchedule {
    match &cfg.lr_step {
        LrStrategy::Cos { t0, t_mult, eta_min } => {
            LrSchedule::Cos(CosineRestarts::new(cfg.lr, *t0, *t_mult, *eta_min))
        }
        LrStrategy::Step { drop, drop_gamma } => {
            LrSchedule::Step(MultiStepLr::new(cfg.lr, drop.clone(), *drop_gamma))
        }
    }
}

// ---------------------------------------------------------------------------
// Loop-owned counters
// ---------------------------------------------------------------------------

/// Process-wide epoch/step counters, owned by the loop and passed into
/// schedule computations. Nothing self-advances; probes and schedulers only
/// ever read or are fed these values. Reset only by process restart.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrainState {
    pub epoch: usize,
    pub step: usize,
}

// ---------------------------------------------------------------------------
// Training loop
// ---------------------------------------------------------------------------

pub struct TrainReport {
    /// Mean loss per epoch.
    pub epoch_losses: Vec<f32>,
    /// Linear/SGD probe accuracy from the last eval epoch, if any ran.
    pub acc: Option<f32>,
    /// k-NN probe accuracy from the last eval epoch, if any ran.
    pub acc_knn: Option<f32>,
    pub steps: usize,
}

/// Run the full BYOL training loop. Any failure inside a step or a probe is
/// fatal and propagates; there is no retry, loss-skipping or checkpointing.
pub fn run_training(cfg: &Config, device: &Device) -> Result<TrainReport> {
    cfg.validate()?;
    let mut metrics = MetricsLogger::new("byol", cfg)?;

    let shape = dataset_shape(&cfg.dataset)?;
    let mut ds = get_ds(cfg)?;

    // Online stack: backbone + projection head + predictor, one VarMap.
    let online_varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&online_varmap, DType::F32, device);
    let (backbone, out_size) = get_backbone(&cfg.arch, shape, vb.pp("backbone"))?;
    let head = get_head(out_size, cfg, vb.pp("head"))?;
    let pred = get_predictor(cfg, vb.pp("pred"))?;

    // Target stack: structurally mirrored backbone + head over its own
    // VarMap (same name prefixes), value-synchronized by momentum only.
    let target_varmap = VarMap::new();
    let vb_t = VarBuilder::from_varmap(&target_varmap, DType::F32, device);
    let (backbone_t, _) = get_backbone(&cfg.arch, shape, vb_t.pp("backbone"))?;
    let head_t = get_head(out_size, cfg, vb_t.pp("head"))?;

    // Only the online vars reach the optimizer; target vars are updated
    // exclusively by momentum_update.
    let mut optimizer = AdamW::new(
        online_varmap.all_vars(),
        ParamsAdamW {
            lr: cfg.lr,
            beta1: cfg.adam_b0,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: cfg.adam_l2,
        },
    )?;

    let mut schedule = build_schedule(cfg);
    let mut warmup = if cfg.lr_warmup {
        LrWarmup::new(cfg.lr, cfg.warmup_steps)
    } else {
        LrWarmup::disabled(cfg.lr)
    };

    // Establish target == online before the first step.
    momentum_update(&online_varmap, &target_varmap, 0.0)?;

    let n_params: usize = online_varmap
        .all_vars()
        .iter()
        .map(|v| v.as_tensor().elem_count())
        .sum();
    eprintln!(
        "[train] dataset={} arch={} views={} params={} epochs={} lr={:.2e} ({})",
        cfg.dataset,
        cfg.arch,
        cfg.num_views,
        n_params,
        cfg.epoch,
        cfg.lr,
        cfg.lr_step.name()
    );

    let mut state = TrainState::default();
    let mut report = TrainReport {
        epoch_losses: Vec::with_capacity(cfg.epoch),
        acc: None,
        acc_knn: None,
        steps: 0,
    };

    for ep in 0..cfg.epoch {
        state.epoch = ep;
        let batches = ds.train_batches(device)?;
        let iters = batches.len();
        let mut loss_ep = Vec::with_capacity(iters);
        let mut tau = cfg.byol_tau;

        for (n_iter, batch) in batches.iter().enumerate() {
            if let Some(lr) = warmup.next_lr() {
                optimizer.set_learning_rate(lr);
            }

            // Online predictions with gradients; target projections detached
            // so no backward traversal ever reaches the target stack. Each
            // backward_step computes a fresh gradient store, so there is no
            // cross-step accumulation to zero.
            let mut z = Vec::with_capacity(batch.views.len());
            let mut zt = Vec::with_capacity(batch.views.len());
            for x in &batch.views {
                z.push(pred.forward(&head.forward(&backbone.forward(x)?)?)?);
                zt.push(head_t.forward(&backbone_t.forward(x)?)?.detach());
            }

            let loss = multiview_loss(&z, &zt)?;
            optimizer.backward_step(&loss)?;
            loss_ep.push(loss.to_scalar::<f32>()?);

            tau = tau_for_epoch(cfg.byol_tau, state.epoch, cfg.epoch);
            momentum_update(&online_varmap, &target_varmap, tau)?;

            // Cosine advancement is gated on warmup being fully elapsed,
            // even when both fall inside the same epoch.
            if let LrSchedule::Cos(cos) = &schedule {
                if warmup.is_done() {
                    let progress = ep as f64 + n_iter as f64 / iters as f64;
                    optimizer.set_learning_rate(cos.lr_at(progress));
                }
            }
            state.step += 1;
        }

        if let LrSchedule::Step(step_lr) = &mut schedule {
            optimizer.set_learning_rate(step_lr.advance());
        }

        let mean_loss = loss_ep.iter().sum::<f32>() / loss_ep.len().max(1) as f32;
        report.epoch_losses.push(mean_loss);
        eprintln!(
            "[train] ep {}/{} loss={:.4} lr={:.2e} tau={:.4}",
            ep + 1,
            cfg.epoch,
            mean_loss,
            optimizer.learning_rate(),
            tau
        );
        metrics.log(ep, &[("loss", mean_loss as f64)]);

        if (ep + 1) % cfg.eval_every == 0 {
            let clf = ds.clf_batches(device)?;
            let test = ds.test_batches(device)?;
            let acc_knn = eval_knn(&backbone, out_size, &clf, &test, cfg.knn)?;
            let acc = eval_sgd(&backbone, out_size, &clf, &test, cfg.sgd_steps, device)?;
            // The probes take the online backbone read-only; our backbones
            // carry no train/eval-mode state, so there is no mode to restore
            // before training resumes.
            eprintln!("[eval] ep {} acc={:.4} acc_knn={:.4}", ep + 1, acc, acc_knn);
            metrics.log(ep, &[("acc", acc as f64), ("acc_knn", acc_knn as f64)]);
            report.acc = Some(acc);
            report.acc_knn = Some(acc_knn);
        }
    }

    report.steps = state.step;
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
