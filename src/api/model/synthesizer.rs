use candle_core::{
    DType,
    Tensor,
};
use candle_nn::{
    Embedding,
    Module,
    VarBuilder,
};
use tracing::{
    debug,
    info,
};

use crate::{
    api::model::{
        posterior_encoder::PosteriorEncoder,
        residual_coupling_block::ResidualCouplingBlock,
        text_encoder::{
            check_conditioning,
            TextEncoder,
        },
        utils::{
            generate_path,
            sequence_mask,
        },
    },
    api::noise::NoiseSource,
    config::HParams,
    error::MyError,
};

/// 训练时flow前向得到的全部隐变量
pub struct TrainLatents {
    pub z:      Tensor, // 后验采样 [B, inter, T_y]
    pub z_p:    Tensor, // flow(z) [B, inter, T_y]
    pub m_p:    Tensor, // 先验均值 [B, inter, T_x]
    pub logs_p: Tensor, // 先验log-scale [B, inter, T_x]
    pub m_q:    Tensor, // 后验均值 [B, inter, T_y]
    pub logs_q: Tensor, // 后验log-scale [B, inter, T_y]
    pub x_mask: Tensor, // [B, 1, T_x]
    pub y_mask: Tensor, // [B, 1, T_y]
    pub logdet: Tensor, // flow总log-determinant [B]
}

/// 推理输出，`z`交给声码器解码
pub struct InferOutput {
    pub z:      Tensor, // [B, inter, T_y]
    pub y_mask: Tensor, // [B, 1, T_y]
    pub m_p:    Tensor, // 按时长展开后的先验均值 [B, inter, T_y]
    pub logs_p: Tensor, // [B, inter, T_y]
}

/// VITS2 acoustic core: text prior, audio posterior and the coupling flow between them.
pub struct Vits2 {
    enc_p:        TextEncoder,
    enc_q:        PosteriorEncoder,
    flow:         ResidualCouplingBlock,
    emb_g:        Option<Embedding>, // n_speakers > 1时的说话人向量表
    emb_l:        Option<Embedding>, // n_languages > 1时的语言向量表
    n_speakers:   usize,
    n_languages:  usize,
    gin_channels: usize,
    text_cond:    bool,              // 文本编码器是否使用说话人条件
}

impl Vits2 {
    pub fn new(hps: &HParams, vb: VarBuilder) -> Result<Self, MyError> {
        hps.validate()?;
        let m = &hps.model;
        let n_speakers = hps.data.n_speakers;
        let n_languages = hps.data.n_languages;

        let emb_g = if n_speakers > 1 && m.gin_channels > 0 {
            Some(candle_nn::embedding(n_speakers, m.gin_channels, vb.pp("emb_g"))?)
        } else {
            None
        };
        let emb_l = if n_languages > 1 {
            Some(candle_nn::embedding(n_languages, m.language_emb_dim, vb.pp("emb_l"))?)
        } else {
            None
        };

        let enc_p = TextEncoder::new(
            m.n_vocab,
            m.inter_channels, // out_channels
            m.hidden_channels,
            m.filter_channels, // hidden_channels_ffn
            m.n_heads,
            m.n_layers,
            m.kernel_size,
            m.p_dropout,
            emb_l.as_ref().map(|_| m.language_emb_dim),
            if m.use_speaker_emb_as_text_cond { Some(m.gin_channels) } else { None },
            Some(m.speaker_emb_layer_idx),
            m.rel_attn_window_size,
            vb.pp("enc_p"),
        )?;
        let enc_q = PosteriorEncoder::new(
            hps.spec_channels(), // 1024 / 2 + 1 = 513
            m.inter_channels,
            m.hidden_channels,
            m.posterior_kernel_size, // 5
            m.posterior_dilation_rate, // 1
            m.posterior_n_layers, // 16
            m.gin_channels,
            vb.pp("enc_q"),
        )?;
        let flow = ResidualCouplingBlock::new(
            m.inter_channels,
            m.hidden_channels,
            m.flow_kernel_size, // 5
            m.flow_dilation_rate, // 1
            m.flow_n_layers, // 4
            m.n_flows, // 4
            m.gin_channels,
            m.use_transformer_flows,
            vb.pp("flow"),
        )?
        .with_log_scale_clamp(m.log_scale_clamp);

        info!(
            version = hps.version.as_deref().unwrap_or("unknown"),
            n_speakers,
            n_languages,
            n_flows = flow.len(),
            "loaded vits2 acoustic core"
        );
        Ok(Vits2 {
            enc_p,
            enc_q,
            flow,
            emb_g,
            emb_l,
            n_speakers,
            n_languages,
            gin_channels: m.gin_channels,
            text_cond: m.use_speaker_emb_as_text_cond,
        })
    }

    pub fn text_encoder(&self) -> &TextEncoder {
        &self.enc_p
    }

    pub fn posterior_encoder(&self) -> &PosteriorEncoder {
        &self.enc_q
    }

    pub fn flow(&self) -> &ResidualCouplingBlock {
        &self.flow
    }

    /// 说话人id -> `[B, gin, 1]`
    pub fn speaker_embedding(&self, sid: &[u32]) -> Result<Tensor, MyError> {
        let emb_g = self.emb_g.as_ref().ok_or_else(|| MyError::invalid("model has no speaker embedding table"))?;
        lookup(emb_g, sid, self.n_speakers, "speaker")
    }

    /// 语言id -> `[B, language_emb_dim, 1]`
    pub fn language_embedding(&self, lid: &[u32]) -> Result<Tensor, MyError> {
        let emb_l = self.emb_l.as_ref().ok_or_else(|| MyError::invalid("model has no language embedding table"))?;
        lookup(emb_l, lid, self.n_languages, "language")
    }

    fn check_speaker(&self, g: Option<&Tensor>, batch: usize) -> Result<(), MyError> {
        if let Some(g) = g {
            check_conditioning(g, batch, self.gin_channels, "g")?;
        }
        Ok(())
    }

    /// 文本编码器只在`use_speaker_emb_as_text_cond`时接收说话人向量
    fn text_condition<'a>(&self, g: Option<&'a Tensor>) -> Option<&'a Tensor> {
        if self.text_cond { g } else { None }
    }

    /// Training-side latent pass: prior from text, posterior from the linear spectrogram,
    /// and the posterior sample pushed through the flow.
    ///
    /// `ids`: `[B, T_x]`, `spec`: `[B, spec_channels, T_y]`, `g`: `[B, gin, 1]`,
    /// `lang`: `[B, language_emb_dim, 1]`.
    pub fn forward_latents(
        &self,
        ids: &Tensor,
        id_lengths: &[usize],
        spec: &Tensor,
        spec_lengths: &[usize],
        g: Option<&Tensor>,
        lang: Option<&Tensor>,
        noise: &mut dyn NoiseSource,
    ) -> Result<TrainLatents, MyError> {
        let batch = ids.dim(0)?;
        if spec.dim(0)? != batch {
            return Err(MyError::invalid(format!("token batch ({}) and spectrogram batch ({}) differ", batch, spec.dim(0)?)))
        }
        self.check_speaker(g, batch)?;

        let (_, m_p, logs_p, x_mask) = self.enc_p.forward(ids, id_lengths, lang, self.text_condition(g))?;
        let (z, m_q, logs_q, y_mask) = self.enc_q.forward(spec, spec_lengths, g, noise)?;
        let (z_p, logdet) = self.flow.forward_with_logdet(&z, &y_mask, g)?;
        debug!(z = ?z.dims(), m_p = ?m_p.dims(), "computed training latents");

        Ok(TrainLatents { z, z_p, m_p, logs_p, m_q, logs_q, x_mask, y_mask, logdet })
    }

    /// Samples a latent from the prior expanded by integer durations and maps it back
    /// through the inverse flow.
    ///
    /// `durations`: `[B, T_x]` frames per token, rounded up; `None` gives one frame per token.
    /// Every item gets at least one frame.
    pub fn infer(
        &self,
        ids: &Tensor,
        id_lengths: &[usize],
        durations: Option<&Tensor>,
        g: Option<&Tensor>,
        lang: Option<&Tensor>,
        noise_scale: f64,
        noise: &mut dyn NoiseSource,
    ) -> Result<InferOutput, MyError> {
        let (batch, t_x) = ids.dims2()?;
        self.check_speaker(g, batch)?;
        let (_, m_p, logs_p, x_mask) = self.enc_p.forward(ids, id_lengths, lang, self.text_condition(g))?;

        // w: [B, T_x]，padding位置时长为0
        let w = match durations {
            Some(d) => {
                if d.dims() != [batch, t_x] {
                    return Err(MyError::invalid(format!("durations must have shape [{}, {}], got {:?}", batch, t_x, d.dims())))
                }
                d.to_dtype(DType::F32)?.ceil()?.relu()?
            },
            None => Tensor::ones((batch, t_x), DType::F32, ids.device())?,
        };
        let w = w.mul(&x_mask.squeeze(1)?)?;

        let y_lengths: Vec<usize> = w
            .sum(1)?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|l| (l as usize).max(1))
            .collect();
        let t_y = y_lengths.iter().copied().max().unwrap_or(1);
        let y_mask = sequence_mask(&y_lengths, Some(t_y), ids.device())?; // [B, 1, T_y]

        // [B, T_y, 1] * [B, 1, T_x] -> [B, T_y, T_x]
        let attn_mask = y_mask.transpose(1, 2)?.broadcast_mul(&x_mask)?;
        let attn = generate_path(&w, &attn_mask)?.transpose(1, 2)?.contiguous()?; // [B, T_x, T_y]

        // [B, C, T_x] x [B, T_x, T_y] -> [B, C, T_y]
        let m_p = m_p.contiguous()?.matmul(&attn)?;
        let logs_p = logs_p.contiguous()?.matmul(&attn)?;

        let eps = noise.standard_normal(&m_p)?;
        let z_p = m_p.add(&eps.mul(&logs_p.exp()?)?.affine(noise_scale, 0.0)?)?;
        let z = self.flow.forward(&z_p, &y_mask, g, true)?.broadcast_mul(&y_mask)?;
        debug!(?y_lengths, t_y, "sampled latent from prior");

        Ok(InferOutput { z, y_mask, m_p, logs_p })
    }

    /// Re-voices a spectrogram in latent space: posterior under `g_src`, flow forward with
    /// `g_src`, flow reverse with `g_tgt`. Returns `(z, z_p, z_hat, y_mask)`.
    pub fn voice_conversion(
        &self,
        spec: &Tensor,
        spec_lengths: &[usize],
        g_src: &Tensor,
        g_tgt: &Tensor,
        tau: f64,
        noise: &mut dyn NoiseSource,
    ) -> Result<(Tensor, Tensor, Tensor, Tensor), MyError> {
        let batch = spec.dim(0)?;
        if self.gin_channels == 0 {
            return Err(MyError::invalid("voice conversion needs a speaker-conditioned model (gin_channels > 0)"))
        }
        check_conditioning(g_src, batch, self.gin_channels, "g_src")?;
        check_conditioning(g_tgt, batch, self.gin_channels, "g_tgt")?;

        let (z, _m_q, _logs_q, y_mask) = self.enc_q.forward_with_tau(spec, spec_lengths, Some(g_src), tau, noise)?;
        let z_p = self.flow.forward(&z, &y_mask, Some(g_src), false)?;
        let z_hat = self.flow.forward(&z_p, &y_mask, Some(g_tgt), true)?.broadcast_mul(&y_mask)?;
        Ok((z, z_p, z_hat, y_mask))
    }
}

fn lookup(table: &Embedding, ids: &[u32], size: usize, name: &str) -> Result<Tensor, MyError> {
    if let Some(id) = ids.iter().find(|id| **id as usize >= size) {
        return Err(MyError::invalid(format!("{} id {} out of range (table size {})", name, id, size)))
    }
    let ids = Tensor::new(ids, table.embeddings().device())?;
    Ok(table.forward(&ids)?.unsqueeze(2)?) // [B, dim] -> [B, dim, 1]
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use candle_nn::VarMap;

    use super::*;
    use crate::api::noise::SeededNoise;

    const CONFIG: &str = r#"{
        "data": {"sampling_rate": 16000, "filter_length": 14, "hop_length": 4, "n_speakers": 3, "n_languages": 2},
        "model": {
            "n_vocab": 12, "inter_channels": 4, "hidden_channels": 8, "filter_channels": 16,
            "n_heads": 2, "n_layers": 3, "kernel_size": 3, "p_dropout": 0.1,
            "gin_channels": 6, "language_emb_dim": 2, "use_speaker_emb_as_text_cond": true,
            "speaker_emb_layer_idx": 1, "posterior_n_layers": 2, "n_flows": 2, "flow_n_layers": 2,
            "use_transformer_flows": true
        }
    }"#;

    fn model(varmap: &VarMap) -> Result<Vits2, MyError> {
        let hps = HParams::from_json_str(CONFIG)?;
        Vits2::new(&hps, VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu))
    }

    #[test]
    fn infer_expands_durations() -> Result<(), MyError> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vits = model(&varmap)?;

        let ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 0]], &device)?;
        let durations = Tensor::new(&[[1.2f32, 2.0, 1.0], [3.0, 0.5, 9.0]], &device)?;
        let g = vits.speaker_embedding(&[0, 2])?;
        let lang = vits.language_embedding(&[1, 0])?;
        let out = vits.infer(&ids, &[3, 2], Some(&durations), Some(&g), Some(&lang), 0.667, &mut SeededNoise::new(7))?;

        // ceil: [2, 2, 1] -> 5, [3, 1, (masked)] -> 4
        assert_eq!(out.z.dims(), &[2, 4, 5]);
        assert_eq!(out.y_mask.squeeze(1)?.to_vec2::<f32>()?, vec![
            vec![1., 1., 1., 1., 1.],
            vec![1., 1., 1., 1., 0.],
        ]);
        let pad = out.z.narrow(0, 1, 1)?.narrow(2, 4, 1)?;
        assert_eq!(pad.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn submodules_follow_config() -> Result<(), MyError> {
        let varmap = VarMap::new();
        let vits = model(&varmap)?;
        assert!(vits.text_encoder().speaker_conditioning());
        assert_eq!(vits.flow().len(), 3); // 2 plain + 1 transformer
        assert!(vits.flow().layers().last().map(|l| l.has_transformer()).unwrap_or(false));

        let spec = Tensor::randn(0f32, 1., (1, 8, 6), &Device::Cpu)?;
        let g = vits.speaker_embedding(&[2])?;
        let (z, m, _, mask) = vits.posterior_encoder().forward_with_tau(&spec, &[6], Some(&g), 0.0, &mut SeededNoise::new(0))?;
        assert_eq!(z.dims(), &[1, 4, 6]);
        assert_eq!(mask.dims(), &[1, 1, 6]);
        assert!(crate::api::model::utils::max_abs_diff(&z, &m)? < 1e-6);
        Ok(())
    }

    #[test]
    fn out_of_range_speaker_rejected() -> Result<(), MyError> {
        let varmap = VarMap::new();
        let vits = model(&varmap)?;
        assert!(matches!(vits.speaker_embedding(&[3]), Err(MyError::InvalidArgument{..})));
        assert_eq!(vits.speaker_embedding(&[1, 2])?.dims(), &[2, 6, 1]);
        Ok(())
    }

    #[test]
    fn training_latents_shapes() -> Result<(), MyError> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vits = model(&varmap)?;

        let ids = Tensor::new(&[[1u32, 2, 3, 4]], &device)?;
        let spec = Tensor::randn(0f32, 1., (1, 8, 10), &device)?;
        let g = vits.speaker_embedding(&[1])?;
        let lang = vits.language_embedding(&[0])?;
        let out = vits.forward_latents(&ids, &[4], &spec, &[10], Some(&g), Some(&lang), &mut SeededNoise::new(3))?;
        assert_eq!(out.z.dims(), &[1, 4, 10]);
        assert_eq!(out.z_p.dims(), &[1, 4, 10]);
        assert_eq!(out.m_p.dims(), &[1, 4, 4]);
        assert_eq!(out.logdet.to_vec1::<f32>()?, vec![0.0]); // mean-only flows
        Ok(())
    }
}
