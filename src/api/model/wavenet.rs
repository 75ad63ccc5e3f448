use candle_core::Tensor;
use candle_nn::{
    Dropout,
    VarBuilder,
};

use crate::{
    api::model::utils::{
        ConvWeightNorm,
        fused_add_tanh_sigmoid_multiply,
        get_padding,
    },
    error::MyError,
};

/// Masked sequence-to-sequence transform with optional global conditioning.
///
/// `x`: `[B, C, T]`, `x_mask`: `[B, 1, T]`, `g`: `[B, gin, 1]`. Implementations must return
/// zeros at padding positions and be deterministic for fixed weights.
///
/// `g` is optional even for a conditioned transform: `None` runs it unconditioned (the
/// posterior encoder and flow of a single-speaker model call it that way). Passing `g` to a
/// transform built without conditioning is an `InvalidArgument`.
pub trait ConditionalFeatureTransform: Send + Sync {
    fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor, MyError>;
}

/// WaveNet风格的非因果膨胀卷积残差网络（VITS中的`WN`）
pub struct WaveNet {
    hidden_channels: usize,
    n_layers:        usize,
    in_layers:       Vec<ConvWeightNorm>,
    res_skip_layers: Vec<ConvWeightNorm>,
    drop:            Dropout,
    cond_layer:      Option<ConvWeightNorm>,
}

impl WaveNet {
    pub fn new(
        hidden_channels: usize,
        kernel_size: usize,
        dilation_rate: usize,
        n_layers: usize,
        gin_channels: usize,
        p_dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self, MyError> {
        if kernel_size % 2 == 0 {
            return Err(MyError::invalid(format!("WaveNet kernel_size must be odd, got {}", kernel_size)))
        }
        if n_layers == 0 {
            return Err(MyError::invalid("WaveNet needs at least one layer"))
        }

        let vb_in_layers = vb.pp("in_layers");
        let vb_res_skip_layers = vb.pp("res_skip_layers");
        let mut in_layers = Vec::with_capacity(n_layers);
        let mut res_skip_layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            let dilation = dilation_rate.pow(i as u32);
            let padding = get_padding(kernel_size, dilation);
            in_layers.push(ConvWeightNorm::new_conv1d(
                hidden_channels, // in_channels
                2 * hidden_channels, // out_channels
                kernel_size,
                padding,
                dilation,
                vb_in_layers.pp(i.to_string()), // enc.in_layers.xxx
            )?);
            res_skip_layers.push(ConvWeightNorm::new_conv1d(
                hidden_channels, // in_channels
                if i < n_layers - 1 { // last one is not necessary
                    2 * hidden_channels
                } else {
                    hidden_channels
                }, // out_channels
                1, // kernel_size
                0, // padding
                1, // dilation
                vb_res_skip_layers.pp(i.to_string()), // enc.res_skip_layers.xxx
            )?);
        }

        let cond_layer = if gin_channels != 0 {
            Some(ConvWeightNorm::new_conv1d(
                gin_channels, // in_channels
                2 * hidden_channels * n_layers, // out_channels
                1, // kernel_size
                0, // padding
                1, // dilation
                vb.pp("cond_layer"),
            )?)
        } else {
            None
        };

        Ok(WaveNet {
            hidden_channels,
            n_layers,
            in_layers,
            res_skip_layers,
            drop: Dropout::new(p_dropout),
            cond_layer,
        })
    }
}

impl ConditionalFeatureTransform for WaveNet {
    fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor, MyError> {
        let g_processed = match (g, &self.cond_layer) {
            (Some(g), Some(cond_layer)) => Some(cond_layer.forward(g)?), // [B, 2 * hidden * n_layers, 1]
            (Some(_), None) => return Err(MyError::invalid("conditioning vector given to a WaveNet built with gin_channels = 0")),
            (None, _) => None,
        };

        let mut x = x.clone();
        let mut output = x.zeros_like()?;
        for i in 0..self.n_layers {
            let x_in = self.in_layers[i].forward(&x)?;
            // g_l = g[:, cond_offset : cond_offset + 2 * hidden_channels, :]
            let g_l = match &g_processed {
                Some(g) => Some(g.narrow(1, i * 2 * self.hidden_channels, 2 * self.hidden_channels)?),
                None => None,
            };

            let acts = fused_add_tanh_sigmoid_multiply(&x_in, g_l.as_ref(), self.hidden_channels)?;
            let acts = self.drop.forward(&acts, false)?; // 仅推理

            let res_skip_acts = self.res_skip_layers[i].forward(&acts)?;
            if i < self.n_layers - 1 {
                let res_acts = res_skip_acts.narrow(1, 0, self.hidden_channels)?;
                x = x.add(&res_acts)?.broadcast_mul(x_mask)?;
                let skip_acts = res_skip_acts.narrow(1, self.hidden_channels, self.hidden_channels)?;
                output = output.add(&skip_acts)?;
            } else {
                output = output.add(&res_skip_acts)?;
            }
        }
        Ok(output.broadcast_mul(x_mask)?)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, DType};
    use candle_nn::VarMap;

    use super::*;
    use crate::api::model::utils::sequence_mask;

    #[test]
    fn output_is_zero_at_padding() -> Result<(), MyError> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let wn = WaveNet::new(8, 5, 2, 3, 6, 0.0, vb)?;

        let mask = sequence_mask(&[4, 9], Some(9), &device)?;
        let x = Tensor::randn(0f32, 1., (2, 8, 9), &device)?.broadcast_mul(&mask)?;
        let g = Tensor::randn(0f32, 1., (2, 6, 1), &device)?;
        let y = wn.forward(&x, &mask, Some(&g))?;
        assert_eq!(y.dims(), &[2, 8, 9]);

        let tail = y.narrow(0, 0, 1)?.narrow(2, 4, 5)?;
        assert_eq!(tail.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn conditioning_without_cond_layer_fails() -> Result<(), MyError> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let wn = WaveNet::new(4, 3, 1, 2, 0, 0.0, vb)?;

        let mask = sequence_mask(&[3], Some(3), &device)?;
        let x = Tensor::zeros((1, 4, 3), DType::F32, &device)?;
        let g = Tensor::zeros((1, 2, 1), DType::F32, &device)?;
        assert!(matches!(wn.forward(&x, &mask, Some(&g)), Err(MyError::InvalidArgument{..})));
        Ok(())
    }

    #[test]
    fn conditioned_net_runs_without_g() -> Result<(), MyError> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let wn = WaveNet::new(4, 3, 1, 2, 5, 0.0, vb)?;

        let mask = sequence_mask(&[3, 2], Some(3), &device)?;
        let x = Tensor::randn(0f32, 1., (2, 4, 3), &device)?.broadcast_mul(&mask)?;
        let y = wn.forward(&x, &mask, None)?;
        assert_eq!(y.dims(), &[2, 4, 3]);
        let tail = y.narrow(0, 1, 1)?.narrow(2, 2, 1)?;
        assert_eq!(tail.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);

        let g = Tensor::randn(0f32, 1., (2, 5, 1), &device)?;
        let conditioned = wn.forward(&x, &mask, Some(&g))?;
        let diff = y.sub(&conditioned)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 1e-6, "g should change the output of a conditioned net");
        Ok(())
    }

    #[test]
    fn even_kernel_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(WaveNet::new(4, 4, 1, 2, 0, 0.0, vb), Err(MyError::InvalidArgument{..})));
    }
}
