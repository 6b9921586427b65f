// End-to-end tests: full training runs on the test tier (tiny models, CPU)
// to verify the loop, schedules, momentum sync and probes work together.

use byol::byol::momentum_update;
use byol::config::{Config, LrStrategy};
use byol::data::dataset_shape;
use byol::model::{get_backbone, get_head, get_predictor};
use byol::training::run_training;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

fn var_values(varmap: &VarMap, name: &str) -> Vec<f32> {
    let data = varmap.data().lock().unwrap();
    data[name]
        .as_tensor()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

fn var_names(varmap: &VarMap) -> Vec<String> {
    let mut names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
    names.sort();
    names
}

// ---------------------------------------------------------------------------
// Full training runs
// ---------------------------------------------------------------------------

#[test]
fn test_training_run_cosine_strategy() {
    let cfg = Config::test();
    let device = Device::Cpu;
    let report = run_training(&cfg, &device).unwrap();

    assert_eq!(report.epoch_losses.len(), cfg.epoch);
    for &loss in &report.epoch_losses {
        assert!(loss.is_finite(), "loss must stay finite: {loss}");
        assert!(
            (0.0..=4.0).contains(&loss),
            "mean pair loss must sit in [0, 4]: {loss}"
        );
    }
    // eval_every = 1 on the test tier, so both probes ran.
    let acc = report.acc.expect("sgd probe should have run");
    let acc_knn = report.acc_knn.expect("knn probe should have run");
    assert!((0.0..=1.0).contains(&acc), "acc out of range: {acc}");
    assert!((0.0..=1.0).contains(&acc_knn), "acc_knn out of range: {acc_knn}");

    // 64 train samples / bs 16 = 4 iterations per epoch.
    assert_eq!(report.steps, cfg.epoch * 4);
}

#[test]
fn test_training_run_step_strategy_three_views() {
    let mut cfg = Config::test();
    cfg.lr_step = LrStrategy::Step {
        drop: vec![1],
        drop_gamma: 0.1,
    };
    cfg.lr_warmup = false;
    cfg.num_views = 3;
    let device = Device::Cpu;
    let report = run_training(&cfg, &device).unwrap();

    assert_eq!(report.epoch_losses.len(), cfg.epoch);
    for &loss in &report.epoch_losses {
        assert!(loss.is_finite());
    }
}

#[test]
fn test_training_rejects_bad_config() {
    let mut cfg = Config::test();
    cfg.num_views = 1;
    assert!(run_training(&cfg, &Device::Cpu).is_err());
}

// ---------------------------------------------------------------------------
// Momentum sync over real stacks
// ---------------------------------------------------------------------------

#[test]
fn test_initial_sync_makes_stacks_equal() {
    let cfg = Config::test();
    let device = Device::Cpu;
    let shape = dataset_shape(&cfg.dataset).unwrap();

    let online = VarMap::new();
    let vb = VarBuilder::from_varmap(&online, DType::F32, &device);
    let (_, out_size) = get_backbone(&cfg.arch, shape, vb.pp("backbone")).unwrap();
    let _head = get_head(out_size, &cfg, vb.pp("head")).unwrap();
    let _pred = get_predictor(&cfg, vb.pp("pred")).unwrap();

    let target = VarMap::new();
    let vb_t = VarBuilder::from_varmap(&target, DType::F32, &device);
    let _ = get_backbone(&cfg.arch, shape, vb_t.pp("backbone")).unwrap();
    let _head_t = get_head(out_size, &cfg, vb_t.pp("head")).unwrap();

    // Independently initialized stacks start out different.
    let probe_name = "backbone.fc1.weight";
    assert_ne!(var_values(&online, probe_name), var_values(&target, probe_name));

    momentum_update(&online, &target, 0.0).unwrap();

    // tau = 0 forces exact element-for-element equality on every shared var.
    for name in var_names(&target) {
        assert_eq!(
            var_values(&online, &name),
            var_values(&target, &name),
            "var {name} not synced"
        );
    }
    // The predictor stays online-only.
    assert!(var_names(&target).iter().all(|n| !n.starts_with("pred.")));
    assert!(var_names(&online).iter().any(|n| n.starts_with("pred.")));
}
