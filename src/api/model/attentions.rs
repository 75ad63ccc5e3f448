//! Relative-position transformer encoder used by the text encoder and by the
//! transformer-augmented coupling layer.
//!
//! Layout follows VITS: channel-major `[B, C, T]` tensors, 1x1 convolutions for the
//! attention projections, a convolutional feed-forward block, and a layer norm over
//! the channel axis after every residual connection.

use candle_core::{
    D,
    Device,
    DType,
    Tensor,
};
use candle_nn::{
    Conv1d,
    Dropout,
    init::{
        self,
        Init,
    },
    LayerNorm,
    Module,
    ops::softmax_last_dim,
    VarBuilder,
};
use tracing::debug;

use crate::{
    api::model::utils::{
        conv1d,
        conv1d_config,
    },
    error::MyError,
};

/// Masked sequence-to-sequence encoder with optional global conditioning.
///
/// `g` (`[B, cond_channels, 1]`) is injected at one configured layer; passing `g` to an
/// unconditioned encoder, or omitting it from a conditioned one, is an `InvalidArgument`.
pub trait SequenceEncoder: Send + Sync {
    fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor, MyError>;
}

/// 编码器超参数
#[derive(Debug, Clone)]
pub struct TransformerConfig {
    pub in_channels:          usize,
    pub out_channels:         usize,
    pub hidden_channels:      usize,
    pub hidden_channels_ffn:  usize,
    pub num_heads:            usize,
    pub num_layers:           usize,
    pub kernel_size:          usize,
    pub dropout_p:            f32,
    pub rel_attn_window_size: Option<usize>, // None表示不使用相对位置编码
    pub cond_channels:        usize,         // 0表示无条件
    pub cond_layer_idx:       Option<usize>, // 默认第2层
}

const MASK_FILL: f64 = -1e4;

/// 通道维的LayerNorm，参数名为`gamma`、`beta`
struct ChannelLayerNorm {
    inner: LayerNorm,
}

impl ChannelLayerNorm {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self, MyError> {
        let gamma = vb.get_with_hints(channels, "gamma", Init::Const(1.0))?;
        let beta = vb.get_with_hints(channels, "beta", init::ZERO)?;
        Ok(ChannelLayerNorm {
            inner: LayerNorm::new(gamma, beta, 1e-5),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor, MyError> {
        // [B, C, T] -> [B, T, C] -> norm -> [B, C, T]
        let x = self.inner.forward(&x.transpose(1, 2)?.contiguous()?)?;
        Ok(x.transpose(1, 2)?.contiguous()?)
    }
}

struct MultiHeadAttention {
    conv_q:      Conv1d,
    conv_k:      Conv1d,
    conv_v:      Conv1d,
    conv_o:      Conv1d,
    emb_rel_k:   Option<Tensor>, // [2w+1, k_channels]
    emb_rel_v:   Option<Tensor>, // [2w+1, k_channels]
    window_size: usize,
    n_heads:     usize,
    k_channels:  usize,
    drop:        Dropout,
}

impl MultiHeadAttention {
    fn new(
        channels: usize,
        out_channels: usize,
        n_heads: usize,
        p_dropout: f32,
        window_size: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self, MyError> {
        let k_channels = channels / n_heads;
        let cfg = conv1d_config(0, 1);
        let (emb_rel_k, emb_rel_v) = match window_size {
            Some(w) => {
                // heads共享相对位置向量，checkpoint中的形状为[1, 2w+1, k_channels]
                let rel_init = Init::Randn{mean: 0.0, stdev: (k_channels as f64).powf(-0.5)};
                let k = vb.get_with_hints((1, 2 * w + 1, k_channels), "emb_rel_k", rel_init)?.squeeze(0)?;
                let v = vb.get_with_hints((1, 2 * w + 1, k_channels), "emb_rel_v", rel_init)?.squeeze(0)?;
                (Some(k), Some(v))
            },
            None => (None, None),
        };
        Ok(MultiHeadAttention {
            conv_q: conv1d(channels, channels, 1, cfg, false, vb.pp("conv_q"))?,
            conv_k: conv1d(channels, channels, 1, cfg, false, vb.pp("conv_k"))?,
            conv_v: conv1d(channels, channels, 1, cfg, false, vb.pp("conv_v"))?,
            conv_o: conv1d(channels, out_channels, 1, cfg, false, vb.pp("conv_o"))?,
            emb_rel_k,
            emb_rel_v,
            window_size: window_size.unwrap_or(0),
            n_heads,
            k_channels,
            drop: Dropout::new(p_dropout),
        })
    }

    /// `band[i, r, j] = 1` iff `j - i + w == r`, i.e. key `j` sits at relative offset
    /// `r - w` from query `i` inside the attention window.
    fn relative_band(&self, t: usize, device: &Device) -> Result<Tensor, MyError> {
        let w = self.window_size;
        let r = 2 * w + 1;
        let mut band = vec![0f32; t * r * t];
        for i in 0..t {
            let lo = i.saturating_sub(w);
            let hi = (i + w).min(t - 1);
            for j in lo..=hi {
                let rel = j + w - i;
                band[(i * r + rel) * t + j] = 1.0;
            }
        }
        Ok(Tensor::from_vec(band, (t, r, t), device)?)
    }

    /// `x`: `[B, C, T]`, `attn_mask`: `[B, 1, T, T]` with 1 for visible (query, key) pairs.
    fn forward(&self, x: &Tensor, attn_mask: &Tensor) -> Result<Tensor, MyError> {
        let (b, c, t) = x.dims3()?;
        let heads = |h: Tensor| -> Result<Tensor, MyError> {
            // [B, C, T] -> [B, H, T, Dk]
            Ok(h.reshape((b, self.n_heads, self.k_channels, t))?.transpose(2, 3)?.contiguous()?)
        };
        let q = heads(self.conv_q.forward(x)?)?;
        let k = heads(self.conv_k.forward(x)?)?;
        let v = heads(self.conv_v.forward(x)?)?;

        let q = q.affine(1.0 / (self.k_channels as f64).sqrt(), 0.0)?;
        let mut scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?; // [B, H, T, T]

        let band = match (&self.emb_rel_k, t > 0) {
            (Some(_), true) => Some(self.relative_band(t, x.device())?),
            _ => None,
        };
        if let (Some(emb_rel_k), Some(band)) = (&self.emb_rel_k, &band) {
            // 每个query与窗口内相对位置向量的点积: [B, H, T, 2w+1]
            let rel = emb_rel_k.dim(0)?;
            let rel_logits = q
                .reshape((b * self.n_heads * t, self.k_channels))?
                .matmul(&emb_rel_k.t()?.contiguous()?)?
                .reshape((b, self.n_heads, t, rel))?;
            // 散布到绝对位置: [B, H, T, T]
            scores = scores.add(&per_query_matmul(&rel_logits, band)?)?;
        }

        let visible = attn_mask.gt(0.5)?.broadcast_as(scores.dims())?.contiguous()?;
        let fill = Tensor::full(MASK_FILL as f32, scores.dims(), scores.device())?.to_dtype(scores.dtype())?;
        let scores = visible.where_cond(&scores, &fill)?;

        let p_attn = softmax_last_dim(&scores)?;
        let p_attn = self.drop.forward(&p_attn, false)?; // 仅推理
        let mut output = p_attn.matmul(&v)?; // [B, H, T, Dk]

        if let (Some(emb_rel_v), Some(band)) = (&self.emb_rel_v, &band) {
            // 注意力权重按相对位置汇总: [B, H, T, 2w+1]
            let band_t = band.transpose(1, 2)?.contiguous()?;
            let rel_weights = per_query_matmul(&p_attn, &band_t)?;
            let rel = emb_rel_v.dim(0)?;
            let rel_values = rel_weights
                .reshape((b * self.n_heads * t, rel))?
                .matmul(emb_rel_v)?
                .reshape((b, self.n_heads, t, self.k_channels))?;
            output = output.add(&rel_values)?;
        }

        // [B, H, T, Dk] -> [B, C, T]
        let output = output.transpose(2, 3)?.reshape((b, c, t))?;
        Ok(self.conv_o.forward(&output)?)
    }
}

/// `out[b, h, i, :] = x[b, h, i, :] @ band[i]` for `x`: `[B, H, T, P]`, `band`: `[T, P, Q]`.
fn per_query_matmul(x: &Tensor, band: &Tensor) -> Result<Tensor, MyError> {
    let (b, h, t, p) = x.dims4()?;
    let q = band.dim(2)?;
    let x = x.permute((2, 0, 1, 3))?.reshape((t, b * h, p))?; // [T, B*H, P]
    let out = x.matmul(band)?; // [T, B*H, Q]
    Ok(out.reshape((t, b, h, q))?.permute((1, 2, 0, 3))?.contiguous()?)
}

struct FeedForward {
    conv_1:  Conv1d,
    conv_2:  Conv1d,
    pad_l:   usize,
    pad_r:   usize,
    drop:    Dropout,
}

impl FeedForward {
    fn new(
        in_channels: usize,
        out_channels: usize,
        filter_channels: usize,
        kernel_size: usize,
        p_dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self, MyError> {
        let cfg = conv1d_config(0, 1);
        Ok(FeedForward {
            conv_1: conv1d(in_channels, filter_channels, kernel_size, cfg, false, vb.pp("conv_1"))?,
            conv_2: conv1d(filter_channels, out_channels, kernel_size, cfg, false, vb.pp("conv_2"))?,
            pad_l: (kernel_size - 1) / 2,
            pad_r: kernel_size / 2,
            drop: Dropout::new(p_dropout),
        })
    }

    fn same_padding(&self, x: &Tensor) -> Result<Tensor, MyError> {
        Ok(x.pad_with_zeros(D::Minus1, self.pad_l, self.pad_r)?)
    }

    fn forward(&self, x: &Tensor, x_mask: &Tensor) -> Result<Tensor, MyError> {
        let x = self.conv_1.forward(&self.same_padding(&x.broadcast_mul(x_mask)?)?)?;
        let x = self.drop.forward(&x.relu()?, false)?;
        let x = self.conv_2.forward(&self.same_padding(&x.broadcast_mul(x_mask)?)?)?;
        Ok(x.broadcast_mul(x_mask)?)
    }
}

/// VITS相对位置Transformer编码器，可在`cond_layer_idx`层注入全局条件
pub struct RelativePositionTransformer {
    pre:            Option<Conv1d>, // in_channels != hidden_channels时的1x1投影
    attn_layers:    Vec<MultiHeadAttention>,
    norm_layers_1:  Vec<ChannelLayerNorm>,
    ffn_layers:     Vec<FeedForward>,
    norm_layers_2:  Vec<ChannelLayerNorm>,
    proj:           Option<Conv1d>, // hidden_channels != out_channels时的1x1投影
    cond_layer:     Option<Conv1d>,
    cond_layer_idx: usize,
}

impl RelativePositionTransformer {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self, MyError> {
        let TransformerConfig {
            in_channels,
            out_channels,
            hidden_channels,
            hidden_channels_ffn,
            num_heads,
            num_layers,
            kernel_size,
            dropout_p,
            rel_attn_window_size,
            cond_channels,
            cond_layer_idx,
        } = config.clone();

        if num_heads == 0 || hidden_channels % num_heads != 0 {
            return Err(MyError::invalid(format!("hidden_channels ({}) must be divisible by num_heads ({})", hidden_channels, num_heads)))
        }
        if kernel_size == 0 {
            return Err(MyError::invalid("feed-forward kernel_size must be positive"))
        }
        let cond_layer_idx = cond_layer_idx.unwrap_or(2);
        if cond_channels > 0 && cond_layer_idx >= num_layers {
            return Err(MyError::invalid(format!("cond_layer_idx ({}) must be less than num_layers ({})", cond_layer_idx, num_layers)))
        }

        let cfg = conv1d_config(0, 1);
        let pre = if in_channels != hidden_channels {
            Some(conv1d(in_channels, hidden_channels, 1, cfg, false, vb.pp("pre"))?)
        } else {
            None
        };
        let proj = if out_channels != hidden_channels {
            Some(conv1d(hidden_channels, out_channels, 1, cfg, false, vb.pp("proj"))?)
        } else {
            None
        };
        let cond_layer = if cond_channels > 0 {
            Some(conv1d(cond_channels, hidden_channels, 1, cfg, false, vb.pp("cond_layer"))?)
        } else {
            None
        };

        let mut attn_layers = Vec::with_capacity(num_layers);
        let mut norm_layers_1 = Vec::with_capacity(num_layers);
        let mut ffn_layers = Vec::with_capacity(num_layers);
        let mut norm_layers_2 = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            attn_layers.push(MultiHeadAttention::new(
                hidden_channels,
                hidden_channels,
                num_heads,
                dropout_p,
                rel_attn_window_size,
                vb.pp("attn_layers").pp(i.to_string()),
            )?);
            norm_layers_1.push(ChannelLayerNorm::new(hidden_channels, vb.pp("norm_layers_1").pp(i.to_string()))?);
            ffn_layers.push(FeedForward::new(
                hidden_channels,
                hidden_channels,
                hidden_channels_ffn,
                kernel_size,
                dropout_p,
                vb.pp("ffn_layers").pp(i.to_string()),
            )?);
            norm_layers_2.push(ChannelLayerNorm::new(hidden_channels, vb.pp("norm_layers_2").pp(i.to_string()))?);
        }
        debug!(num_layers, hidden_channels, cond_channels, ?rel_attn_window_size, "built relative position transformer");

        Ok(RelativePositionTransformer {
            pre,
            attn_layers,
            norm_layers_1,
            ffn_layers,
            norm_layers_2,
            proj,
            cond_layer,
            cond_layer_idx,
        })
    }
}

impl SequenceEncoder for RelativePositionTransformer {
    fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor, MyError> {
        let g = match (g, &self.cond_layer) {
            (Some(g), Some(cond_layer)) => Some(cond_layer.forward(g)?), // [B, hidden, 1]
            (None, None) => None,
            (Some(_), None) => return Err(MyError::invalid("conditioning vector given to an unconditioned encoder")),
            (None, Some(_)) => return Err(MyError::invalid("encoder is conditioned but no conditioning vector was given")),
        };

        // [B, 1, 1, T] * [B, 1, T, 1] -> [B, 1, T, T]
        let attn_mask = x_mask.unsqueeze(2)?.broadcast_mul(&x_mask.unsqueeze(D::Minus1)?)?;

        let mut x = x.broadcast_mul(x_mask)?;
        if let Some(pre) = &self.pre {
            x = pre.forward(&x)?.broadcast_mul(x_mask)?;
        }
        for i in 0..self.attn_layers.len() {
            if i == self.cond_layer_idx {
                if let Some(g) = &g {
                    x = x.broadcast_add(g)?.broadcast_mul(x_mask)?;
                }
            }
            let y = self.attn_layers[i].forward(&x, &attn_mask)?;
            x = self.norm_layers_1[i].forward(&x.add(&y)?)?;

            let y = self.ffn_layers[i].forward(&x, x_mask)?;
            x = self.norm_layers_2[i].forward(&x.add(&y)?)?;
        }
        let mut x = x.broadcast_mul(x_mask)?;
        if let Some(proj) = &self.proj {
            x = proj.forward(&x)?.broadcast_mul(x_mask)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use candle_nn::VarMap;

    use super::*;
    use crate::api::model::utils::{
        max_abs_diff,
        sequence_mask,
    };

    fn config(cond_channels: usize) -> TransformerConfig {
        TransformerConfig {
            in_channels: 6,
            out_channels: 10,
            hidden_channels: 8,
            hidden_channels_ffn: 16,
            num_heads: 2,
            num_layers: 3,
            kernel_size: 3,
            dropout_p: 0.1,
            rel_attn_window_size: Some(2),
            cond_channels,
            cond_layer_idx: Some(1),
        }
    }

    #[test]
    fn shapes_and_padding() -> Result<(), MyError> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let enc = RelativePositionTransformer::new(&config(0), vb)?;

        let mask = sequence_mask(&[7, 4], Some(7), &device)?;
        let x = Tensor::randn(0f32, 1., (2, 6, 7), &device)?;
        let y = enc.forward(&x, &mask, None)?;
        assert_eq!(y.dims(), &[2, 10, 7]);

        // 修改padding位置的输入不影响有效位置的输出
        let noise = Tensor::randn(0f32, 5., (2, 6, 7), &device)?;
        let inverted = mask.affine(-1.0, 1.0)?;
        let x2 = x.add(&noise.broadcast_mul(&inverted)?)?;
        let y2 = enc.forward(&x2, &mask, None)?;
        assert!(max_abs_diff(&y, &y2)? < 1e-5);
        Ok(())
    }

    #[test]
    fn conditioning_presence_is_checked() -> Result<(), MyError> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let enc = RelativePositionTransformer::new(&config(4), vb)?;
        let mask = sequence_mask(&[5], Some(5), &device)?;
        let x = Tensor::randn(0f32, 1., (1, 6, 5), &device)?;
        let g = Tensor::randn(0f32, 1., (1, 4, 1), &device)?;

        assert!(matches!(enc.forward(&x, &mask, None), Err(MyError::InvalidArgument{..})));
        let with_g = enc.forward(&x, &mask, Some(&g))?;
        let other_g = enc.forward(&x, &mask, Some(&g.affine(-1.0, 0.5)?))?;
        assert!(max_abs_diff(&with_g, &other_g)? > 0.0);
        Ok(())
    }

    #[test]
    fn cond_layer_idx_must_be_in_range() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut cfg = config(4);
        cfg.cond_layer_idx = Some(3);
        assert!(matches!(RelativePositionTransformer::new(&cfg, vb), Err(MyError::InvalidArgument{..})));
    }

    #[test]
    fn band_covers_window_only() -> Result<(), MyError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = MultiHeadAttention::new(4, 4, 2, 0.0, Some(1), vb)?;
        let band = attn.relative_band(4, &Device::Cpu)?;
        // 每个query最多看到2w+1个key
        let per_query = band.sum((1, 2))?.to_vec1::<f32>()?;
        assert_eq!(per_query, vec![2., 3., 3., 2.]);
        Ok(())
    }
}
