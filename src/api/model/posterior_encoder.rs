use candle_core::Tensor;
use candle_nn::{
    Conv1d,
    Module,
    VarBuilder,
};

use crate::{
    api::model::{
        utils::{
            conv1d,
            conv1d_config,
            sequence_mask,
        },
        wavenet::{
            ConditionalFeatureTransform,
            WaveNet,
        },
    },
    api::noise::NoiseSource,
    error::MyError,
};

/// 后验编码器，提取目标音频的后验分布参数（均值、log-scale）并重参数化采样
///
/// ```text
/// x -> conv1x1() -> WaveNet() (non-causal) -> conv1x1() -> split() -> [m, s] -> sample(m, s) -> z
/// ```
pub struct PosteriorEncoder {
    in_channels:  usize,
    out_channels: usize,
    pre:          Conv1d,
    enc:          Box<dyn ConditionalFeatureTransform>,
    proj:         Conv1d,
}

impl PosteriorEncoder {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        dilation_rate: usize,
        n_layers: usize,
        gin_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self, MyError> {
        let enc = WaveNet::new(
            hidden_channels,
            kernel_size,
            dilation_rate,
            n_layers,
            gin_channels,
            0.0, // p_dropout
            vb.pp("enc"),
        )?;
        Ok(PosteriorEncoder {
            in_channels,
            out_channels,
            pre: conv1d(in_channels, hidden_channels, 1, conv1d_config(0, 1), false, vb.pp("pre"))?, // enc_q.pre
            enc: Box::new(enc),
            proj: conv1d(hidden_channels, out_channels * 2, 1, conv1d_config(0, 1), false, vb.pp("proj"))?, // enc_q.proj
        })
    }

    /// `x`: `[B, in_channels, T]`, `g`: `[B, gin, 1]`.
    ///
    /// Returns `(z, m_q, logs_q, x_mask)`; all three latents are exactly zero at padding.
    /// Draws one batch of noise from `noise`.
    pub fn forward(
        &self,
        x: &Tensor,
        x_lengths: &[usize],
        g: Option<&Tensor>,
        noise: &mut dyn NoiseSource,
    ) -> Result<(Tensor, Tensor, Tensor, Tensor), MyError> {
        self.forward_with_tau(x, x_lengths, g, 1.0, noise)
    }

    /// Same as [`forward`](Self::forward) with the sampling noise scaled by `tau`.
    pub fn forward_with_tau(
        &self,
        x: &Tensor,
        x_lengths: &[usize],
        g: Option<&Tensor>,
        tau: f64,
        noise: &mut dyn NoiseSource,
    ) -> Result<(Tensor, Tensor, Tensor, Tensor), MyError> {
        let (batch, channels, time) = x.dims3()?;
        if batch != x_lengths.len() {
            return Err(MyError::invalid(format!("feature batch ({}) and lengths ({}) differ", batch, x_lengths.len())))
        }
        if channels != self.in_channels {
            return Err(MyError::invalid(format!("expected {} feature channels, got {}", self.in_channels, channels)))
        }
        let x_mask = sequence_mask(x_lengths, Some(time), x.device())?; // [B, 1, T]

        let h = self.pre.forward(x)?.broadcast_mul(&x_mask)?; // [B, hidden, T]
        let h = self.enc.forward(&h, &x_mask, g)?;
        let stats = self.proj.forward(&h)?.broadcast_mul(&x_mask)?; // [B, 2 * out, T]

        let m = stats.narrow(1, 0, self.out_channels)?;
        let logs = stats.narrow(1, self.out_channels, self.out_channels)?;

        // z = (m + randn_like(m) * tau * exp(logs)) * x_mask
        let eps = noise.standard_normal(&m)?;
        let z = m
            .add(&eps.affine(tau, 0.0)?.mul(&logs.exp()?)?)?
            .broadcast_mul(&x_mask)?;

        Ok((z, m, logs, x_mask))
    }
}
