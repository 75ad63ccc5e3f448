use candle_core::Tensor;
use rand::{
    Rng,
    SeedableRng,
};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::MyError;

/// Source of standard-normal noise for reparameterized sampling.
///
/// The posterior encoder and prior sampling draw exactly one tensor per call, so a seeded
/// source makes a whole forward pass reproducible.
pub trait NoiseSource {
    /// N(0, 1) noise with the shape, dtype and device of `like`.
    fn standard_normal(&mut self, like: &Tensor) -> Result<Tensor, MyError>;
}

/// 使用设备自带的随机数生成器（CPU无法设置种子）
pub struct DeviceNoise;

impl NoiseSource for DeviceNoise {
    fn standard_normal(&mut self, like: &Tensor) -> Result<Tensor, MyError> {
        Ok(like.randn_like(0.0_f64, 1.0_f64)?)
    }
}

/// 固定种子的噪声，在host端生成后拷贝到目标设备
pub struct SeededNoise {
    rng: ChaCha8Rng,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        SeededNoise {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl NoiseSource for SeededNoise {
    fn standard_normal(&mut self, like: &Tensor) -> Result<Tensor, MyError> {
        let values: Vec<f32> = (0..like.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(values, like.dims(), like.device())?.to_dtype(like.dtype())?)
    }
}
