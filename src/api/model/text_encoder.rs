use candle_core::Tensor;
use candle_nn::{
    Conv1d,
    Embedding,
    init::Init,
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
            sequence_mask,
        },
    },
    error::MyError,
};

/// 文本编码器，输出先验分布参数（均值、log-scale）
///
/// ```text
/// ids -> emb * sqrt(hidden) -> [cat lang_emb] -> transformer(g = speaker_emb) -> conv1x1 -> split -> (m_p, logs_p)
/// ```
pub struct TextEncoder {
    emb:              Embedding,
    encoder:          Box<dyn SequenceEncoder>,
    proj:             Conv1d,
    hidden_channels:  usize,
    out_channels:     usize,
    language_emb_dim: usize, // 0表示不拼接语言向量
    speaker_emb_dim:  usize, // 0表示不使用说话人条件
}

impl TextEncoder {
    /// `speaker_emb_dim = Some(d)` turns on speaker conditioning at layer
    /// `speaker_emb_layer_idx` (default 2); it is then required on every call.
    pub fn new(
        n_vocab: usize,
        out_channels: usize,
        hidden_channels: usize,
        hidden_channels_ffn: usize,
        num_heads: usize,
        num_layers: usize,
        kernel_size: usize,
        dropout_p: f32,
        language_emb_dim: Option<usize>,
        speaker_emb_dim: Option<usize>,
        speaker_emb_layer_idx: Option<usize>,
        rel_attn_window_size: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self, MyError> {
        let language_emb_dim = match language_emb_dim {
            Some(0) => return Err(MyError::invalid("language_emb_dim must be greater than 0 when given")),
            Some(d) => d,
            None => 0,
        };
        let (speaker_emb_dim, cond_layer_idx) = match speaker_emb_dim {
            Some(0) => return Err(MyError::invalid("speaker_emb_dim must be greater than 0 when speaker conditioning is enabled")),
            Some(d) => {
                let idx = speaker_emb_layer_idx.unwrap_or(2);
                if idx >= num_layers {
                    return Err(MyError::invalid(format!("speaker_emb_layer_idx ({}) must be less than num_layers ({})", idx, num_layers)))
                }
                (d, Some(idx))
            },
            None => (0, None),
        };

        // embedding初始化为N(0, hidden^-0.5)
        let emb_init = Init::Randn{mean: 0.0, stdev: (hidden_channels as f64).powf(-0.5)};
        let emb = Embedding::new(
            vb.pp("emb").get_with_hints((n_vocab, hidden_channels), "weight", emb_init)?,
            hidden_channels,
        );

        // 拼接语言向量后encoder的通道数变大
        let encoder_channels = hidden_channels + language_emb_dim;
        let encoder = RelativePositionTransformer::new(
            &TransformerConfig {
                in_channels: encoder_channels,
                out_channels: encoder_channels,
                hidden_channels: encoder_channels,
                hidden_channels_ffn,
                num_heads,
                num_layers,
                kernel_size,
                dropout_p,
                rel_attn_window_size,
                cond_channels: speaker_emb_dim,
                cond_layer_idx,
            },
            vb.pp("encoder"),
        )?;
        let proj = conv1d(encoder_channels, out_channels * 2, 1, conv1d_config(0, 1), false, vb.pp("proj"))?;
        debug!(n_vocab, hidden_channels, language_emb_dim, speaker_emb_dim, "built text encoder");

        Ok(TextEncoder {
            emb,
            encoder: Box::new(encoder),
            proj,
            hidden_channels,
            out_channels,
            language_emb_dim,
            speaker_emb_dim,
        })
    }

    pub fn speaker_conditioning(&self) -> bool {
        self.speaker_emb_dim > 0
    }

    /// `x`: token ids `[B, T]`, `lang_emb`: `[B, language_emb_dim, 1]`,
    /// `speaker_emb`: `[B, speaker_emb_dim, 1]`.
    ///
    /// Returns `(x, m_p, logs_p, x_mask)` with `x`: `[B, hidden + lang, T]`,
    /// `m_p`/`logs_p`: `[B, out_channels, T]`, `x_mask`: `[B, 1, T]`.
    pub fn forward(
        &self,
        x: &Tensor,
        x_lengths: &[usize],
        lang_emb: Option<&Tensor>,
        speaker_emb: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor, Tensor, Tensor), MyError> {
        let (batch, time) = x.dims2()?;
        if batch != x_lengths.len() {
            return Err(MyError::invalid(format!("token batch ({}) and lengths ({}) differ", batch, x_lengths.len())))
        }
        match (speaker_emb, self.speaker_conditioning()) {
            (None, true) => return Err(MyError::invalid("speaker_emb is None but speaker conditioning is enabled")),
            (Some(_), false) => return Err(MyError::invalid("speaker_emb is given but speaker conditioning is disabled")),
            (Some(g), true) => check_conditioning(g, batch, self.speaker_emb_dim, "speaker_emb")?,
            (None, false) => {},
        }
        match (lang_emb, self.language_emb_dim) {
            (None, 0) => {},
            (None, _) => return Err(MyError::invalid("lang_emb is None but language_emb_dim is configured")),
            (Some(_), 0) => return Err(MyError::invalid("lang_emb is given but language_emb_dim is 0")),
            (Some(l), d) => check_conditioning(l, batch, d, "lang_emb")?,
        }

        let x_mask = sequence_mask(x_lengths, Some(time), x.device())?; // [B, 1, T]

        let mut h = self.emb.forward(x)?.affine((self.hidden_channels as f64).sqrt(), 0.0)?; // [B, T, H]
        if let Some(l) = lang_emb {
            // [B, L, 1] -> [B, T, L]，沿通道拼接到每个字符的embedding上
            let l = l.transpose(1, 2)?.broadcast_as((batch, time, self.language_emb_dim))?;
            h = Tensor::cat(&[&h, &l.contiguous()?], 2)?;
        }
        let h = h.transpose(1, 2)?.contiguous()?; // [B, H, T]

        let h = self.encoder.forward(&h.broadcast_mul(&x_mask)?, &x_mask, speaker_emb)?;
        let stats = self.proj.forward(&h)?.broadcast_mul(&x_mask)?;

        let m = stats.narrow(1, 0, self.out_channels)?;
        let logs = stats.narrow(1, self.out_channels, self.out_channels)?;
        Ok((h, m, logs, x_mask))
    }
}

/// 条件向量形状检查，要求为`[B, dim, 1]`
pub(crate) fn check_conditioning(g: &Tensor, batch: usize, dim: usize, name: &str) -> Result<(), MyError> {
    match g.dims() {
        [b, d, 1] if *b == batch && *d == dim => Ok(()),
        dims => Err(MyError::invalid(format!("{} must have shape [{}, {}, 1], got {:?}", name, batch, dim, dims))),
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, DType};
    use candle_nn::VarMap;

    use super::*;

    fn build(speaker: Option<usize>, language: Option<usize>, vb: VarBuilder) -> Result<TextEncoder, MyError> {
        TextEncoder::new(20, 4, 8, 16, 2, 3, 3, 0.1, language, speaker, Some(1), Some(2), vb)
    }

    #[test]
    fn prior_shapes_and_padding() -> Result<(), MyError> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let enc = build(None, Some(2), VarBuilder::from_varmap(&varmap, DType::F32, &device))?;

        let ids = Tensor::new(&[[1u32, 2, 3, 0, 0], [4, 5, 6, 7, 8]], &device)?;
        let lang = Tensor::randn(0f32, 1., (2, 2, 1), &device)?;
        let (h, m, logs, mask) = enc.forward(&ids, &[3, 5], Some(&lang), None)?;
        assert_eq!(h.dims(), &[2, 10, 5]);
        assert_eq!(m.dims(), &[2, 4, 5]);
        assert_eq!(logs.dims(), &[2, 4, 5]);
        assert_eq!(mask.dims(), &[2, 1, 5]);

        let pad = Tensor::cat(&[&m, &logs], 1)?.narrow(0, 0, 1)?.narrow(2, 3, 2)?;
        assert_eq!(pad.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn language_presence_is_checked() -> Result<(), MyError> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let enc = build(None, Some(2), VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
        let ids = Tensor::new(&[[1u32, 2]], &device)?;
        assert!(matches!(enc.forward(&ids, &[2], None, None), Err(MyError::InvalidArgument{..})));

        let wrong = Tensor::zeros((1, 3, 1), DType::F32, &device)?;
        assert!(matches!(enc.forward(&ids, &[2], Some(&wrong), None), Err(MyError::InvalidArgument{..})));
        Ok(())
    }

    #[test]
    fn batch_mismatch_rejected() -> Result<(), MyError> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let enc = build(None, None, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
        let ids = Tensor::new(&[[1u32, 2], [3, 4]], &device)?;
        assert!(matches!(enc.forward(&ids, &[2], None, None), Err(MyError::InvalidArgument{..})));
        Ok(())
    }

    #[test]
    fn construction_validates_speaker_settings() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        assert!(matches!(build(Some(0), None, vb.clone()), Err(MyError::InvalidArgument{..})));
        let too_deep = TextEncoder::new(20, 4, 8, 16, 2, 3, 3, 0.1, None, Some(6), Some(3), Some(2), vb);
        assert!(matches!(too_deep, Err(MyError::InvalidArgument{..})));
    }
}
