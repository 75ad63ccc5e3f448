use candle_core::Tensor;
use candle_nn::{
    Conv1d,
    Module,
    VarBuilder,
};
use tracing::debug;

use crate::{
    api::model::{
        attentions::{
            RelativePositionTransformer,
            SequenceEncoder,
            TransformerConfig,
        },
        utils::{
            conv1d,
            conv1d_config,
        },
        wavenet::{
            ConditionalFeatureTransform,
            WaveNet,
        },
    },
    error::MyError,
};

/// 仿射耦合层，x0不变，x1按照由x0计算得到的(m, logs)做仿射变换
///
/// ```text
/// x0 -> conv1x1 -> [+ transformer(h)] -> WaveNet(g) -> conv1x1 (zero init) -> (m, logs)
/// x1' = m + x1 * exp(logs)
/// ```
pub struct ResidualCouplingLayer {
    half_channels:   usize,
    mean_only:       bool,
    log_scale_clamp: Option<f64>,
    pre:             Conv1d,
    pre_transformer: Option<Box<dyn SequenceEncoder>>,
    enc:             Box<dyn ConditionalFeatureTransform>,
    post:            Conv1d,
}

impl ResidualCouplingLayer {
    /// Plain coupling layer with a WaveNet feature path.
    pub fn new(
        channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        dilation_rate: usize,
        n_layers: usize,
        gin_channels: usize,
        mean_only: bool,
        vb: VarBuilder,
    ) -> Result<Self, MyError> {
        check_even(channels)?;
        let enc = WaveNet::new(hidden_channels, kernel_size, dilation_rate, n_layers, gin_channels, 0.0, vb.pp("enc"))?;
        Self::with_modules(channels, hidden_channels, mean_only, None, Box::new(enc), vb)
    }

    /// Coupling layer whose hidden features are refined by a relative-position transformer
    /// before the WaveNet: `h = h + transformer(h * mask, mask)`.
    pub fn new_with_transformer(
        channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        dilation_rate: usize,
        n_layers: usize,
        gin_channels: usize,
        mean_only: bool,
        vb: VarBuilder,
    ) -> Result<Self, MyError> {
        check_even(channels)?;
        let transformer = RelativePositionTransformer::new(
            &TransformerConfig {
                in_channels: hidden_channels,
                out_channels: hidden_channels,
                hidden_channels,
                hidden_channels_ffn: 768,
                num_heads: 2,
                num_layers: n_layers,
                kernel_size,
                dropout_p: 0.1,
                rel_attn_window_size: None,
                cond_channels: 0,
                cond_layer_idx: None,
            },
            vb.pp("pre_transformer"),
        )?;
        let enc = WaveNet::new(hidden_channels, kernel_size, dilation_rate, n_layers, gin_channels, 0.0, vb.pp("enc"))?;
        Self::with_modules(channels, hidden_channels, mean_only, Some(Box::new(transformer)), Box::new(enc), vb)
    }

    /// Builds `pre`/`post` from `vb` around caller-supplied feature modules.
    ///
    /// `post` is zero-initialised, so a freshly built layer is the identity.
    pub fn with_modules(
        channels: usize,
        hidden_channels: usize,
        mean_only: bool,
        pre_transformer: Option<Box<dyn SequenceEncoder>>,
        enc: Box<dyn ConditionalFeatureTransform>,
        vb: VarBuilder,
    ) -> Result<Self, MyError> {
        check_even(channels)?;
        let half_channels = channels / 2;
        let cfg = conv1d_config(0, 1);
        let post_channels = if mean_only { half_channels } else { 2 * half_channels };
        Ok(ResidualCouplingLayer {
            half_channels,
            mean_only,
            log_scale_clamp: None,
            pre: conv1d(half_channels, hidden_channels, 1, cfg, false, vb.pp("pre"))?, // flow.flows.xxx.pre
            pre_transformer,
            enc,
            post: conv1d(hidden_channels, post_channels, 1, cfg, true, vb.pp("post"))?, // flow.flows.xxx.post
        })
    }

    /// Clamp log-scales to `[-clamp, clamp]` in both directions.
    pub fn with_log_scale_clamp(mut self, clamp: Option<f64>) -> Self {
        self.log_scale_clamp = clamp;
        self
    }

    pub fn channels(&self) -> usize {
        self.half_channels * 2
    }

    pub fn mean_only(&self) -> bool {
        self.mean_only
    }

    pub fn has_transformer(&self) -> bool {
        self.pre_transformer.is_some()
    }

    /// Mean and log-scale of the affine map, computed from the untouched half `x0`.
    pub fn stats(&self, x0: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<(Tensor, Tensor), MyError> {
        let mut h = self.pre.forward(x0)?.broadcast_mul(x_mask)?;
        if let Some(transformer) = &self.pre_transformer {
            let refined = transformer.forward(&h.broadcast_mul(x_mask)?, x_mask, None)?;
            h = h.add(&refined)?;
        }
        let h = self.enc.forward(&h, x_mask, g)?;
        let stats = self.post.forward(&h)?.broadcast_mul(x_mask)?;

        let (m, logs) = if self.mean_only {
            let logs = stats.zeros_like()?;
            (stats, logs)
        } else {
            (
                stats.narrow(1, 0, self.half_channels)?,
                stats.narrow(1, self.half_channels, self.half_channels)?,
            )
        };
        let logs = match self.log_scale_clamp {
            Some(c) => logs.clamp(-c, c)?,
            None => logs,
        };
        Ok((m, logs))
    }

    /// `x`: `[B, C, T]`, `x_mask`: `[B, 1, T]`, `g`: `[B, gin, 1]`.
    ///
    /// Forward returns `(y, Some(logdet))` with `logdet`: `[B]`; reverse returns `(x, None)`.
    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>, reverse: bool) -> Result<(Tensor, Option<Tensor>), MyError> {
        let channels = x.dim(1)?;
        if channels != 2 * self.half_channels {
            return Err(MyError::invalid(format!("coupling layer expects {} channels, got {}", 2 * self.half_channels, channels)))
        }
        // 第1维channels拆成前后两半
        let x0 = x.narrow(1, 0, self.half_channels)?;
        let x1 = x.narrow(1, self.half_channels, self.half_channels)?;

        let (m, logs) = self.stats(&x0, x_mask, g)?;

        if !reverse {
            let x1 = m.add(&x1.mul(&logs.exp()?)?.broadcast_mul(x_mask)?)?;
            let x = Tensor::cat(&[&x0, &x1], 1)?;
            let logdet = logs.sum((1, 2))?; // [B]
            Ok((x, Some(logdet)))
        } else {
            let x1 = x1.sub(&m)?.mul(&logs.neg()?.exp()?)?.broadcast_mul(x_mask)?;
            let x = Tensor::cat(&[&x0, &x1], 1)?;
            Ok((x, None))
        }
    }
}

fn check_even(channels: usize) -> Result<(), MyError> {
    if channels == 0 || channels % 2 != 0 {
        return Err(MyError::invalid(format!("coupling channels must be a positive even number, got {}", channels)))
    }
    Ok(())
}

/// 沿通道维翻转，自身即为逆变换
pub struct Flip;

impl Flip {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor, MyError> {
        // flip基于index_select，要求输入连续；耦合层cat的结果在B > 1时不连续
        Ok(x.contiguous()?.flip(&[1])?)
    }
}

/// VITS2 flow: `n_flows` mean-only coupling layers, optionally followed by one
/// transformer-augmented layer, with a channel flip after every layer.
pub struct ResidualCouplingBlock {
    flows: Vec<ResidualCouplingLayer>,
    flip:  Flip,
}

impl ResidualCouplingBlock {
    pub fn new(
        channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        dilation_rate: usize,
        n_layers: usize,
        n_flows: usize,
        gin_channels: usize,
        use_transformer_flow_layer: bool,
        vb: VarBuilder,
    ) -> Result<Self, MyError> {
        check_even(channels)?;
        let vb_flows = vb.pp("flows");
        let mut flows = Vec::with_capacity(n_flows + use_transformer_flow_layer as usize);
        for i in 0..n_flows {
            flows.push(ResidualCouplingLayer::new(
                channels,
                hidden_channels,
                kernel_size,
                dilation_rate,
                n_layers,
                gin_channels,
                true, // mean_only
                vb_flows.pp(i.to_string()), // flow.flows.0, flow.flows.1, ...
            )?);
        }
        // 仅在末尾追加一个带transformer的耦合层
        if use_transformer_flow_layer {
            flows.push(ResidualCouplingLayer::new_with_transformer(
                channels,
                hidden_channels,
                kernel_size,
                dilation_rate,
                n_layers,
                gin_channels,
                true, // mean_only
                vb_flows.pp(n_flows.to_string()),
            )?);
        }
        debug!(n_flows, use_transformer_flow_layer, channels, "built residual coupling block");
        Ok(Self::from_layers(flows))
    }

    pub fn from_layers(flows: Vec<ResidualCouplingLayer>) -> Self {
        ResidualCouplingBlock {
            flows,
            flip: Flip,
        }
    }

    /// Applies the same log-scale clamp to every layer.
    pub fn with_log_scale_clamp(self, clamp: Option<f64>) -> Self {
        Self::from_layers(self.flows.into_iter().map(|f| f.with_log_scale_clamp(clamp)).collect())
    }

    pub fn layers(&self) -> &[ResidualCouplingLayer] {
        &self.flows
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Forward: layer then flip, in order. Reverse: flip then inverse layer, last to first.
    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>, reverse: bool) -> Result<Tensor, MyError> {
        if !reverse {
            Ok(self.forward_with_logdet(x, x_mask, g)?.0)
        } else {
            let mut x = x.clone();
            for flow in self.flows.iter().rev() {
                x = self.flip.forward(&x)?;
                x = flow.forward(&x, x_mask, g, true)?.0;
            }
            Ok(x)
        }
    }

    /// Forward pass that also returns the total log-determinant `[B]` (flips contribute 0).
    pub fn forward_with_logdet(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<(Tensor, Tensor), MyError> {
        let mut x = x.clone();
        let mut logdet = Tensor::zeros(x.dim(0)?, x.dtype(), x.device())?;
        for flow in &self.flows {
            let (y, layer_logdet) = flow.forward(&x, x_mask, g, false)?;
            if let Some(l) = layer_logdet {
                logdet = logdet.add(&l)?;
            }
            x = self.flip.forward(&y)?;
        }
        Ok((x, logdet))
    }
}
