#![allow(dead_code)]

use candle_core::{Device, DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use vits2_core::error::MyError;

pub fn fresh_vars() -> (VarMap, Device) {
    (VarMap::new(), Device::Cpu)
}

pub fn builder<'a>(varmap: &VarMap, device: &Device) -> VarBuilder<'a> {
    VarBuilder::from_varmap(varmap, DType::F32, device)
}

/// Replace every weight with N(0, stdev) noise; zero-initialised projections included.
pub fn randomize(varmap: &VarMap, stdev: f32) -> Result<(), MyError> {
    for var in varmap.all_vars() {
        var.set(&Tensor::randn(0f32, stdev, var.dims(), var.device())?)?;
    }
    Ok(())
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32, MyError> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

/// `x` with every padded frame (t >= lengths[b]) replaced by large random values.
pub fn perturb_padding(x: &Tensor, mask: &Tensor) -> Result<Tensor, MyError> {
    let junk = x.randn_like(0.0, 100.0)?;
    let inverse = mask.affine(-1.0, 1.0)?;
    Ok(x.broadcast_mul(mask)?.add(&junk.broadcast_mul(&inverse)?)?)
}

/// Keep only the valid frames of item `b`.
pub fn valid(x: &Tensor, b: usize, len: usize) -> Result<Tensor, MyError> {
    Ok(x.narrow(0, b, 1)?.narrow(2, 0, len)?)
}
