use anyhow::{bail, Result};
use candle_core::Tensor;
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, Module, VarBuilder};

use crate::config::Config;

/// Feature width every backbone maps into.
const FEATURE_DIM: usize = 128;

// ---------------------------------------------------------------------------
// Gradient-safe BatchNorm (candle_nn::BatchNorm has no reliable backward pass)
// Normalizes over the batch dimension with basic tensor ops only.
// Training-time statistics only; the heads never run in inference mode.
// ---------------------------------------------------------------------------

pub struct GradBatchNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl GradBatchNorm {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            eps: 1e-5,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // x: (batch, dim)
        let mean = x.mean_keepdim(0)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(0)?;
        let denom = (var + self.eps)?.sqrt()?;
        let normed = centered.broadcast_div(&denom)?;
        normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Backbones
// ---------------------------------------------------------------------------

pub struct MlpBackbone {
    fc1: Linear,
    fc2: Linear,
}

impl MlpBackbone {
    fn new(input_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(input_dim, 256, vb.pp("fc1"))?,
            fc2: linear(256, FEATURE_DIM, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.flatten_from(1)?;
        let x = self.fc1.forward(&x)?.relu()?;
        self.fc2.forward(&x).map_err(Into::into)
    }
}

pub struct ConvBackbone {
    c1: Conv2d,
    c2: Conv2d,
    fc: Linear,
}

impl ConvBackbone {
    fn new(shape: (usize, usize, usize), vb: VarBuilder) -> Result<Self> {
        let (c, h, w) = shape;
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        // Two 3x3 conv + maxpool stages quarter the spatial dims.
        let flat = 64 * (h / 4) * (w / 4);
        Ok(Self {
            c1: conv2d(c, 32, 3, cfg, vb.pp("c1"))?,
            c2: conv2d(32, 64, 3, cfg, vb.pp("c2"))?,
            fc: linear(flat, FEATURE_DIM, vb.pp("fc"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.c1.forward(x)?.relu()?.max_pool2d(2)?;
        let x = self.c2.forward(&x)?.relu()?.max_pool2d(2)?;
        let x = x.flatten_from(1)?;
        self.fc.forward(&x).map_err(Into::into)
    }
}

pub enum Backbone {
    Mlp(MlpBackbone),
    Conv(ConvBackbone),
}

impl Backbone {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Mlp(m) => m.forward(x),
            Self::Conv(c) => c.forward(x),
        }
    }
}

/// Backbone factory. Called once for the online stack and once for the
/// target stack so the two are structurally identical but independently
/// owned — never shared references.
pub fn get_backbone(
    arch: &str,
    shape: (usize, usize, usize),
    vb: VarBuilder,
) -> Result<(Backbone, usize)> {
    let (c, h, w) = shape;
    match arch {
        "mlp" => Ok((Backbone::Mlp(MlpBackbone::new(c * h * w, vb)?), FEATURE_DIM)),
        "conv" => Ok((Backbone::Conv(ConvBackbone::new(shape, vb)?), FEATURE_DIM)),
        _ => bail!("unknown arch '{}' (expected 'mlp' or 'conv')", arch),
    }
}

// ---------------------------------------------------------------------------
// Projection / prediction heads
// ---------------------------------------------------------------------------

/// Linear -> BatchNorm -> ReLU -> Linear. Serves as both the projection
/// head (out_size -> emb) and the online predictor (emb -> emb).
pub struct MlpHead {
    fc1: Linear,
    bn: GradBatchNorm,
    fc2: Linear,
}

impl MlpHead {
    pub fn new(in_dim: usize, hidden: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(in_dim, hidden, vb.pp("fc1"))?,
            bn: GradBatchNorm::new(hidden, vb.pp("bn"))?,
            fc2: linear(hidden, out_dim, vb.pp("fc2"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(x)?;
        let x = self.bn.forward(&x)?.relu()?;
        self.fc2.forward(&x).map_err(Into::into)
    }
}

pub fn get_head(out_size: usize, cfg: &Config, vb: VarBuilder) -> Result<MlpHead> {
    MlpHead::new(out_size, cfg.head_size, cfg.emb, vb)
}

pub fn get_predictor(cfg: &Config, vb: VarBuilder) -> Result<MlpHead> {
    MlpHead::new(cfg.emb, cfg.head_size, cfg.emb, vb)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_mlp_backbone_shape() -> Result<()> {
        let varmap = VarMap::new();
        let (backbone, out_size) = get_backbone("mlp", (1, 8, 8), vb(&varmap))?;
        let x = Tensor::randn(0.0f32, 1.0, (4, 1, 8, 8), &Device::Cpu)?;
        let y = backbone.forward(&x)?;
        assert_eq!(y.dims(), &[4, out_size]);
        Ok(())
    }

    #[test]
    fn test_conv_backbone_shape() -> Result<()> {
        let varmap = VarMap::new();
        let (backbone, out_size) = get_backbone("conv", (3, 32, 32), vb(&varmap))?;
        let x = Tensor::randn(0.0f32, 1.0, (2, 3, 32, 32), &Device::Cpu)?;
        let y = backbone.forward(&x)?;
        assert_eq!(y.dims(), &[2, out_size]);
        Ok(())
    }

    #[test]
    fn test_unknown_arch_rejected() {
        let varmap = VarMap::new();
        assert!(get_backbone("resnet50", (3, 32, 32), vb(&varmap)).is_err());
    }

    #[test]
    fn test_head_shape() -> Result<()> {
        let cfg = Config::test();
        let varmap = VarMap::new();
        let head = get_head(FEATURE_DIM, &cfg, vb(&varmap))?;
        let x = Tensor::randn(0.0f32, 1.0, (4, FEATURE_DIM), &Device::Cpu)?;
        let y = head.forward(&x)?;
        assert_eq!(y.dims(), &[4, cfg.emb]);
        Ok(())
    }

    #[test]
    fn test_batch_norm_standardizes() -> Result<()> {
        let varmap = VarMap::new();
        let bn = GradBatchNorm::new(4, vb(&varmap))?;
        let x = Tensor::randn(3.0f32, 2.0, (32, 4), &Device::Cpu)?;
        let y = bn.forward(&x)?;
        let mean = y.mean(0)?.to_vec1::<f32>()?;
        for m in mean {
            assert!(m.abs() < 1e-4, "per-feature mean should be ~0, got {m}");
        }
        Ok(())
    }

    #[test]
    fn test_stacks_with_same_prefix_share_names() -> Result<()> {
        // Online and target stacks built from the same factories must line
        // up name-for-name so the momentum update can match them.
        let cfg = Config::test();
        let online = VarMap::new();
        let target = VarMap::new();
        let vb_o = vb(&online);
        let vb_t = vb(&target);
        let _ = get_backbone(&cfg.arch, (1, 8, 8), vb_o.pp("backbone"))?;
        let _ = get_head(FEATURE_DIM, &cfg, vb_o.pp("head"))?;
        let _ = get_predictor(&cfg, vb_o.pp("pred"))?;
        let _ = get_backbone(&cfg.arch, (1, 8, 8), vb_t.pp("backbone"))?;
        let _ = get_head(FEATURE_DIM, &cfg, vb_t.pp("head"))?;

        let online_names: std::collections::HashSet<String> =
            online.data().lock().unwrap().keys().cloned().collect();
        let target_names = target.data().lock().unwrap();
        for name in target_names.keys() {
            assert!(online_names.contains(name), "missing online var for {name}");
        }
        Ok(())
    }
}
