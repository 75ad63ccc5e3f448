use candle_core::{
    D,
    Device,
    DType,
    Shape,
    Tensor,
};
use candle_nn::{
    init::{
        self,
        Init,
    },
    Conv1d,
    Conv1dConfig,
    Module,
    ops::sigmoid,
    VarBuilder,
};

use crate::error::MyError;

pub fn get_padding(kernel_size: usize, dilation: usize) -> usize {
    // With dilation: effective_kernel_size = (kernel_size - 1) * dilation + 1
    // padding = (effective_kernel_size - 1) / 2
    (kernel_size - 1) * dilation / 2
}

/// stride为1的Conv1dConfig
pub fn conv1d_config(padding: usize, dilation: usize) -> Conv1dConfig {
    Conv1dConfig{
        padding,
        stride: 1,
        dilation,
        groups: 1,
        cudnn_fwd_algo: None,
    }
}

/// 普通Conv1d（带bias），`zero_init`为true时weight和bias都初始化为0
/// 从checkpoint加载时忽略初始化方式，直接读取`weight`和`bias`
pub fn conv1d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv1dConfig,
    zero_init: bool,
    vb: VarBuilder,
) -> Result<Conv1d, MyError> {
    let (weight_init, bias_init) = if zero_init {
        (init::ZERO, init::ZERO)
    } else {
        // 与PyTorch的Conv1d默认初始化保持一致
        let bound = 1.0 / ((in_channels * kernel_size) as f64).sqrt();
        (init::DEFAULT_KAIMING_NORMAL, Init::Uniform{lo: -bound, up: bound})
    };
    let weight = vb.get_with_hints((out_channels, in_channels, kernel_size), "weight", weight_init)?;
    let bias = vb.get_with_hints(out_channels, "bias", bias_init)?;
    Ok(Conv1d::new(weight, Some(bias), config))
}

/// 实现PyTorch的torch.nn.utils.weight_norm（仅Conv1d）
pub struct ConvWeightNorm {
    weight_v: Tensor, // Direction
    weight_g: Tensor, // Magnitude
    bias:     Tensor,
    config:   Conv1dConfig,
}

impl ConvWeightNorm {
    /// Creates a new `ConvWeightNorm` layer for 1D convolution.
    pub fn new_conv1d(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        padding: usize,
        dilation: usize,
        vb: VarBuilder,
    ) -> Result<Self, MyError> {
        Ok(Self {
            weight_v: vb.get_with_hints((out_channels, in_channels, kernel_size), "weight_v", init::DEFAULT_KAIMING_NORMAL)?,
            weight_g: vb.get_with_hints((out_channels, 1, 1), "weight_g", Init::Const(1.0))?,
            bias: vb.get_with_hints(out_channels, "bias", init::ZERO)?,
            config: conv1d_config(padding, dilation),
        })
    }

    /// Computes the effective weight tensor from `weight_g` and `weight_v`.
    /// w = g * (v / ||v||), norm taken per output filter.
    /// https://arxiv.org/pdf/1602.07868
    fn compute_weight(&self) -> Result<Tensor, MyError> {
        let out_channels = self.weight_v.dim(0)?;
        let rank = self.weight_v.rank();

        // 在除第0维之外的所有维度上求平方和再开方，得到[out_channels]
        let sum_dims: Vec<usize> = (1..rank).collect();
        let norm_v = self.weight_v.sqr()?.sum(sum_dims)?.sqrt()?;

        let mut norm_shape = vec![out_channels];
        norm_shape.extend(std::iter::repeat(1).take(rank - 1));
        let norm_shape = Shape::from(norm_shape);

        // Epsilon for numerical stability, preventing division by zero
        let norm_v = norm_v.reshape(norm_shape.clone())?.affine(1.0, 1e-12)?;
        let normalized_v = self.weight_v.broadcast_div(&norm_v)?;
        let g = self.weight_g.reshape(norm_shape)?;
        Ok(g.broadcast_mul(&normalized_v)?)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor, MyError> {
        let conv = Conv1d::new(self.compute_weight()?, Some(self.bias.clone()), self.config);
        Ok(conv.forward(xs)?)
    }
}

/// 融合操作：加法 + tanh + sigmoid + 逐元素乘法
///
/// `input_a`为`[B, 2 * n_channels, T]`，`input_b`为可选的条件项（可沿时间维广播），
/// 前半通道过tanh，后半通道过sigmoid，两者相乘得到`[B, n_channels, T]`。
pub fn fused_add_tanh_sigmoid_multiply(input_a: &Tensor, input_b: Option<&Tensor>, n_channels: usize) -> Result<Tensor, MyError> {
    let in_act = match input_b {
        Some(b) => input_a.broadcast_add(b)?,
        None => input_a.clone(),
    };

    let channels = in_act.dim(D::Minus2)?;
    if n_channels > channels {
        return Err(MyError::invalid(format!(
            "split point {} exceeds channel dimension {}",
            n_channels, channels
        )));
    }

    let t_act = in_act.narrow(D::Minus2, 0, n_channels)?.tanh()?;
    let s_act = sigmoid(&in_act.narrow(D::Minus2, n_channels, channels - n_channels)?)?;
    Ok(t_act.mul(&s_act)?)
}

/// Creates a sequence mask.
///
/// Returns a `[batch, 1, max_length]` F32 tensor holding 1 where `t < lengths[b]` and 0
/// elsewhere. `max_length` defaults to the longest length. A length larger than
/// `max_length` is an `InvalidArgument`.
pub fn sequence_mask(lengths: &[usize], max_length: Option<usize>, device: &Device) -> Result<Tensor, MyError> {
    let max_length = match max_length {
        Some(m) => m,
        None => lengths.iter().copied().max().unwrap_or(0),
    };
    if let Some((b, l)) = lengths.iter().enumerate().find(|(_, l)| **l > max_length) {
        return Err(MyError::invalid(format!(
            "length {} of batch item {} exceeds the time extent {}",
            l, b, max_length
        )));
    }
    let lengths = Tensor::from_vec(
        lengths.iter().map(|l| *l as u32).collect::<Vec<u32>>(),
        (lengths.len(), 1),
        device,
    )?; // [B, 1]
    let x = Tensor::arange(0u32, max_length as u32, device)?.unsqueeze(0)?; // [1, T]

    // 比较运算返回U8（0或1），转为F32后在第1维增加通道维
    Ok(x.broadcast_lt(&lengths)?.to_dtype(DType::F32)?.unsqueeze(1)?) // [B, 1, T]
}

/// Hard monotonic alignment from integer durations.
///
/// `durations`: `[B, T_x]`, `mask`: `[B, T_y, T_x]`. Returns `[B, T_y, T_x]` with
/// `path[b, y, x] = 1` iff `cum[x - 1] <= y < cum[x]`.
pub fn generate_path(durations: &Tensor, mask: &Tensor) -> Result<Tensor, MyError> {
    let (b, t_x) = durations.dims2()?;
    let (_, t_y, _) = mask.dims3()?;
    let device = durations.device();
    if t_x == 0 || t_y == 0 {
        return Ok(Tensor::zeros((b, t_y, t_x), DType::F32, device)?);
    }
    let cum = durations.to_dtype(DType::F32)?.cumsum(1)?.unsqueeze(1)?; // [B, 1, T_x]
    let frames = Tensor::arange(0u32, t_y as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((1, t_y, 1))?;
    let below = frames.broadcast_lt(&cum)?.to_dtype(DType::F32)?; // [B, T_y, T_x]
    // 右移一位得到 y < cum[x - 1]
    let shifted = Tensor::cat(&[
        Tensor::zeros((b, t_y, 1), DType::F32, device)?,
        below.narrow(2, 0, t_x - 1)?,
    ], 2)?;
    Ok(below.sub(&shifted)?.mul(&mask.to_dtype(DType::F32)?)?)
}

/// Largest absolute elementwise difference, used by the tests.
#[cfg(test)]
pub(crate) fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32, MyError> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

/// Overwrites every variable of `varmap` with N(0, stdev) noise so that zero-initialised
/// projections stop being the identity.
#[cfg(test)]
pub(crate) fn randomize_vars(varmap: &candle_nn::VarMap, stdev: f32) -> Result<(), MyError> {
    for var in varmap.all_vars() {
        let values = Tensor::randn(0f32, stdev, var.dims(), var.device())?;
        var.set(&values)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_mask_marks_valid_positions() -> Result<(), MyError> {
        let mask = sequence_mask(&[3, 5, 0], Some(5), &Device::Cpu)?;
        assert_eq!(mask.dims(), &[3, 1, 5]);
        assert_eq!(
            mask.squeeze(1)?.to_vec2::<f32>()?,
            vec![
                vec![1.0, 1.0, 1.0, 0.0, 0.0],
                vec![1.0, 1.0, 1.0, 1.0, 1.0],
                vec![0.0, 0.0, 0.0, 0.0, 0.0],
            ]
        );
        Ok(())
    }

    #[test]
    fn sequence_mask_defaults_to_longest() -> Result<(), MyError> {
        let mask = sequence_mask(&[2, 4], None, &Device::Cpu)?;
        assert_eq!(mask.dims(), &[2, 1, 4]);
        Ok(())
    }

    #[test]
    fn sequence_mask_rejects_overlong_lengths() {
        let err = sequence_mask(&[3, 6], Some(5), &Device::Cpu);
        assert!(matches!(err, Err(MyError::InvalidArgument{..})));
    }

    #[test]
    fn path_follows_durations() -> Result<(), MyError> {
        let device = Device::Cpu;
        let durations = Tensor::new(&[[2f32, 1., 3.]], &device)?;
        let mask = Tensor::ones((1, 6, 3), DType::F32, &device)?;
        let path = generate_path(&durations, &mask)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(path, vec![
            vec![1., 0., 0.],
            vec![1., 0., 0.],
            vec![0., 1., 0.],
            vec![0., 0., 1.],
            vec![0., 0., 1.],
            vec![0., 0., 1.],
        ]);
        Ok(())
    }

    #[test]
    fn weight_norm_recovers_magnitude() -> Result<(), MyError> {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = ConvWeightNorm::new_conv1d(4, 6, 3, 1, 1, vb)?;
        // weight_g为1时每个输出滤波器的L2范数都为1
        let w = conv.compute_weight()?;
        let norms = w.sqr()?.sum((1, 2))?.sqrt()?.to_vec1::<f32>()?;
        for n in norms {
            assert!((n - 1.0).abs() < 1e-4);
        }
        Ok(())
    }
}
