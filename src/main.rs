// byol unified binary
//
// Commands:
//   byol train    [--config test|default] [flags]   Run the training loop
//   byol schedule [--config test|default] [flags]   Preview LR/tau schedules
//
// Config tiers: test (tiny, CPU, fast) and default (full-scale run).
// GPU: auto-detected when compiled with --features cuda and tier is not "test".

use byol::byol::tau_for_epoch;
use byol::config::{Config, LrStrategy};
use byol::training::{build_schedule, run_training, LrSchedule, LrWarmup};

use anyhow::{anyhow, bail, Result};
use candle_core::Device;

// ---------------------------------------------------------------------------
// Config tier selection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum ConfigTier {
    Test,
    Default,
}

impl ConfigTier {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "test" => Some(Self::Test),
            "default" => Some(Self::Default),
            _ => None,
        }
    }

    fn config(&self) -> Config {
        match self {
            Self::Test => Config::test(),
            Self::Default => Config::default_cfg(),
        }
    }
}

/// Select device: CUDA if available and not test tier, else CPU.
fn select_device(tier: ConfigTier) -> Device {
    if tier == ConfigTier::Test {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    eprintln!("[byol] Using CUDA device 0");
                    return dev;
                }
                Err(e) => {
                    eprintln!("[byol] CUDA init failed, falling back to CPU: {}", e);
                }
            }
        } else {
            eprintln!("[byol] CUDA not available, using CPU");
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        eprintln!("[byol] Built without CUDA feature, using CPU (rebuild with --features cuda for GPU)");
    }

    Device::Cpu
}

/// Parse --config TIER from args, returns (tier, remaining_args).
fn parse_config_tier(args: &[String]) -> (ConfigTier, Vec<String>) {
    let mut tier = ConfigTier::Test;
    let mut rest = Vec::new();
    let mut skip_next = false;

    for (i, arg) in args.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "--config" {
            if let Some(next) = args.get(i + 1) {
                if let Some(t) = ConfigTier::from_str(next) {
                    tier = t;
                } else {
                    eprintln!("[byol] Unknown config tier '{}', using test", next);
                }
                skip_next = true;
            }
        } else {
            rest.push(arg.clone());
        }
    }

    (tier, rest)
}

// ---------------------------------------------------------------------------
// Flag overrides
// ---------------------------------------------------------------------------

fn next_value(args: &[String], i: &mut usize) -> Result<String> {
    let flag = args[*i].clone();
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| anyhow!("flag {} needs a value", flag))
}

fn apply_overrides(cfg: &mut Config, args: &[String]) -> Result<()> {
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--epochs" => cfg.epoch = next_value(args, &mut i)?.parse()?,
            "--dataset" => cfg.dataset = next_value(args, &mut i)?,
            "--arch" => cfg.arch = next_value(args, &mut i)?,
            "--bs" => cfg.bs = next_value(args, &mut i)?.parse()?,
            "--lr" => cfg.lr = next_value(args, &mut i)?.parse()?,
            "--lr-step" => cfg.lr_step = LrStrategy::parse(&next_value(args, &mut i)?)?,
            "--tau" => cfg.byol_tau = next_value(args, &mut i)?.parse()?,
            "--views" => cfg.num_views = next_value(args, &mut i)?.parse()?,
            "--eval-every" => cfg.eval_every = next_value(args, &mut i)?.parse()?,
            "--seed" => cfg.seed = next_value(args, &mut i)?.parse()?,
            "--metrics" => cfg.metrics = Some(next_value(args, &mut i)?),
            "--no-warmup" => cfg.lr_warmup = false,
            flag => bail!("unknown flag '{}'", flag),
        }
        i += 1;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let command = args[1].as_str();
    let (tier, remaining) = parse_config_tier(&args[2..]);

    let result = match command {
        "train" => cmd_train(tier, &remaining),
        "schedule" => cmd_schedule(tier, &remaining),
        _ => {
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("[byol] Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: byol <command> [--config test|default] [flags]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  train     Run the self-supervised training loop");
    eprintln!("  schedule  Print the LR/tau schedule without training");
    eprintln!();
    eprintln!("Flags:");
    eprintln!("  --epochs N --dataset S --arch S --bs N --lr F --lr-step cos|step");
    eprintln!("  --tau F --views N --eval-every N --seed N --metrics FILE --no-warmup");
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_train(tier: ConfigTier, args: &[String]) -> Result<()> {
    let mut cfg = tier.config();
    apply_overrides(&mut cfg, args)?;
    let device = select_device(tier);

    let report = run_training(&cfg, &device)?;

    let final_loss = report.epoch_losses.last().copied().unwrap_or(f32::NAN);
    eprintln!("[byol] done: {} steps, final loss {:.4}", report.steps, final_loss);
    if let (Some(acc), Some(acc_knn)) = (report.acc, report.acc_knn) {
        println!("acc={:.4} acc_knn={:.4}", acc, acc_knn);
    }
    Ok(())
}

/// Dry-run the warmup/schedule/tau machinery with the exact per-iteration
/// ordering of the training loop, printing one line per epoch.
fn cmd_schedule(tier: ConfigTier, args: &[String]) -> Result<()> {
    let mut cfg = tier.config();
    apply_overrides(&mut cfg, args)?;
    cfg.validate()?;

    let iters = (cfg.train_samples / cfg.bs).max(1);
    let mut schedule = build_schedule(&cfg);
    let mut warmup = if cfg.lr_warmup {
        LrWarmup::new(cfg.lr, cfg.warmup_steps)
    } else {
        LrWarmup::disabled(cfg.lr)
    };

    println!("ep\tlr\ttau");
    let mut lr = cfg.lr;
    for ep in 0..cfg.epoch {
        let mut epoch_start_lr = None;
        for n_iter in 0..iters {
            if let Some(w) = warmup.next_lr() {
                lr = w;
            }
            if let LrSchedule::Cos(cos) = &schedule {
                if warmup.is_done() {
                    lr = cos.lr_at(ep as f64 + n_iter as f64 / iters as f64);
                }
            }
            if epoch_start_lr.is_none() {
                epoch_start_lr = Some(lr);
            }
        }
        if let LrSchedule::Step(step_lr) = &mut schedule {
            lr = step_lr.advance();
        }
        let tau = tau_for_epoch(cfg.byol_tau, ep, cfg.epoch);
        println!("{}\t{:.4e}\t{:.6}", ep, epoch_start_lr.unwrap_or(lr), tau);
    }
    Ok(())
}
