use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::data::dataset_shape;

// ---------------------------------------------------------------------------
// Learning-rate strategy
// ---------------------------------------------------------------------------

/// Steady-state LR strategy, fixed for the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LrStrategy {
    /// Cosine annealing with warm restarts, advanced every iteration with
    /// fractional-epoch progress.
    Cos { t0: f64, t_mult: f64, eta_min: f64 },
    /// Multi-step decay, advanced once per epoch.
    Step { drop: Vec<usize>, drop_gamma: f64 },
}

impl LrStrategy {
    /// Parse a strategy selector string into its default-parameterized form.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cos" => Ok(Self::Cos {
                t0: 10.0,
                t_mult: 2.0,
                eta_min: 0.0,
            }),
            "step" => Ok(Self::Step {
                drop: vec![30, 60],
                drop_gamma: 0.1,
            }),
            _ => bail!("unknown lr strategy '{}' (expected 'cos' or 'step')", s),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cos { .. } => "cos",
            Self::Step { .. } => "step",
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dataset: String,
    pub arch: String,
    /// Batch size.
    pub bs: usize,
    /// Embedding size produced by the projection head and predictor.
    pub emb: usize,
    /// Hidden width of the projection/prediction MLPs.
    pub head_size: usize,
    /// Total training epochs.
    pub epoch: usize,
    /// Base learning rate.
    pub lr: f64,
    /// Adam beta1 (beta2 is fixed at 0.999).
    pub adam_b0: f64,
    /// Adam weight decay.
    pub adam_l2: f64,
    pub lr_step: LrStrategy,
    /// Linear LR warmup toggle. When on, the first `warmup_steps` iterations
    /// ramp the LR from base_lr/warmup_steps up to base_lr.
    pub lr_warmup: bool,
    pub warmup_steps: usize,
    /// Base momentum coefficient for the target-network EMA.
    pub byol_tau: f64,
    /// Number of augmented views per example (>= 2).
    pub num_views: usize,
    /// Run the evaluation probes every this many epochs.
    pub eval_every: usize,
    /// k for the k-NN probe.
    pub knn: usize,
    /// Optimization steps for the linear/SGD probe.
    pub sgd_steps: usize,
    // Synthetic dataset knobs.
    pub classes: usize,
    pub train_samples: usize,
    pub clf_samples: usize,
    pub test_samples: usize,
    pub seed: u64,
    /// Optional JSONL metrics file.
    pub metrics: Option<String>,
}

impl Config {
    /// Tiny CPU-friendly tier for tests.
    pub fn test() -> Self {
        Self {
            dataset: "blobs-tiny".into(),
            arch: "mlp".into(),
            bs: 16,
            emb: 8,
            head_size: 16,
            epoch: 2,
            lr: 1e-2,
            adam_b0: 0.9,
            adam_l2: 1e-6,
            lr_step: LrStrategy::Cos {
                t0: 1.0,
                t_mult: 2.0,
                eta_min: 1e-4,
            },
            lr_warmup: true,
            warmup_steps: 4,
            byol_tau: 0.99,
            num_views: 2,
            eval_every: 1,
            knn: 3,
            sgd_steps: 50,
            classes: 4,
            train_samples: 64,
            clf_samples: 32,
            test_samples: 32,
            seed: 42,
            metrics: None,
        }
    }

    /// Full-scale tier, hyperparameters from the reference run.
    pub fn default_cfg() -> Self {
        Self {
            dataset: "blobs".into(),
            arch: "conv".into(),
            bs: 256,
            emb: 64,
            head_size: 512,
            epoch: 100,
            lr: 1e-3,
            adam_b0: 0.9,
            adam_l2: 1e-6,
            lr_step: LrStrategy::Cos {
                t0: 10.0,
                t_mult: 2.0,
                eta_min: 0.0,
            },
            lr_warmup: true,
            warmup_steps: 500,
            byol_tau: 0.99,
            num_views: 2,
            eval_every: 20,
            knn: 5,
            sgd_steps: 500,
            classes: 10,
            train_samples: 4096,
            clf_samples: 1024,
            test_samples: 1024,
            seed: 42,
            metrics: None,
        }
    }

    /// Startup-time validation. Every rejection here is fatal: there is no
    /// recovery path for a malformed configuration.
    pub fn validate(&self) -> Result<()> {
        dataset_shape(&self.dataset)?;
        if self.arch != "mlp" && self.arch != "conv" {
            bail!("unknown arch '{}' (expected 'mlp' or 'conv')", self.arch);
        }
        if self.num_views < 2 {
            bail!("num_views={} but the pairwise loss needs >= 2 views", self.num_views);
        }
        if self.lr_warmup && self.warmup_steps == 0 {
            bail!("lr_warmup is on but warmup_steps is 0");
        }
        if self.epoch == 0 {
            bail!("epoch must be >= 1");
        }
        if self.bs == 0 {
            bail!("bs must be >= 1");
        }
        if !(0.0..1.0).contains(&self.byol_tau) {
            bail!("byol_tau={} outside [0, 1)", self.byol_tau);
        }
        if self.eval_every == 0 {
            bail!("eval_every must be >= 1");
        }
        if self.knn == 0 {
            bail!("knn must be >= 1");
        }
        if self.classes < 2 {
            bail!("classes must be >= 2 for the probes to be meaningful");
        }
        match &self.lr_step {
            LrStrategy::Cos { t0, t_mult, .. } => {
                if *t0 <= 0.0 {
                    bail!("cos strategy needs t0 > 0");
                }
                if *t_mult < 1.0 {
                    bail!("cos strategy needs t_mult >= 1");
                }
            }
            LrStrategy::Step { drop_gamma, .. } => {
                if *drop_gamma <= 0.0 {
                    bail!("step strategy needs drop_gamma > 0");
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_validate() {
        Config::test().validate().unwrap();
        Config::default_cfg().validate().unwrap();
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        assert!(LrStrategy::parse("linear").is_err());
        assert!(LrStrategy::parse("cos").is_ok());
        assert!(LrStrategy::parse("step").is_ok());
    }

    #[test]
    fn test_single_view_rejected() {
        let mut cfg = Config::test();
        cfg.num_views = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_warmup_window_rejected() {
        let mut cfg = Config::test();
        cfg.lr_warmup = true;
        cfg.warmup_steps = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_dataset_rejected() {
        let mut cfg = Config::test();
        cfg.dataset = "imagenet".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tau_out_of_range_rejected() {
        let mut cfg = Config::test();
        cfg.byol_tau = 1.0;
        assert!(cfg.validate().is_err());
    }
}
