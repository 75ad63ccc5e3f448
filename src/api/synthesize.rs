use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::time::SystemTime;

use candle_core::{
    Device,
    DType,
    Tensor,
    utils::cuda_is_available,
};
use candle_nn::VarBuilder;
use memmap2::MmapOptions;
use safetensors::SafeTensors;
use tracing::info;

use crate::{
    api::model::synthesizer::Vits2,
    api::noise::{
        DeviceNoise,
        NoiseSource,
        SeededNoise,
    },
    config::HParams,
    error::MyError,
    parse_paras::{
        ParsedParas,
        SpeakerSource,
    },
};

/// 文本token -> 先验采样 -> flow逆变换，得到隐变量z并保存为safetensors（`z`、`y_mask`）
pub fn synthesize_latent(paras: &ParsedParas) -> Result<(), MyError> {
    let t1 = SystemTime::now();
    let device = if cuda_is_available() {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };

    // 加载参数文件
    let hps = HParams::new(&paras.config)?;
    let vb = load_checkpoint(&paras.ckpt, &device)?;
    let vits = Vits2::new(&hps, vb)?;

    // 不同长度的token序列在末尾补0
    let lengths: Vec<usize> = paras.tokens.iter().map(|t| t.len()).collect();
    let ids = pad_batch(&paras.tokens, 0u32, &device)?; // [B, T_x]
    let durations = match &paras.durations {
        Some(d) => Some(pad_batch(d, 0f32, &device)?),
        None => None,
    };
    let batch = lengths.len();

    let g = match &paras.speaker {
        Some(SpeakerSource::Id(sid)) => Some(vits.speaker_embedding(&vec![*sid; batch])?),
        Some(SpeakerSource::File(file)) => Some(expand_batch(load_conditioning_from_file(file, &device)?, batch)?),
        None => None,
    };
    let lang = match paras.language {
        Some(lid) => Some(vits.language_embedding(&vec![lid; batch])?),
        None => None,
    };

    let mut noise: Box<dyn NoiseSource> = match paras.seed {
        Some(seed) => Box::new(SeededNoise::new(seed)),
        None => Box::new(DeviceNoise),
    };
    let out = vits.infer(
        &ids,
        &lengths,
        durations.as_ref(),
        g.as_ref(),
        lang.as_ref(),
        paras.noise_scale,
        noise.as_mut(),
    )?;

    let mut tensors: HashMap<&str, Tensor> = HashMap::new();
    tensors.insert("z", out.z.to_device(&Device::Cpu)?);
    tensors.insert("y_mask", out.y_mask.to_device(&Device::Cpu)?);
    candle_core::safetensors::save(&tensors, &paras.outfile)?;

    let t2 = SystemTime::now();
    info!(
        batch,
        frames = out.z.dim(2)?,
        outfile = %paras.outfile.display(),
        "saved latent (elapsed time: {})",
        elapsed_time(t1, t2)
    );
    Ok(())
}

/// `.safetensors`使用mmap加载，其余按PyTorch的`.pth`加载
fn load_checkpoint<'a>(ckpt: &Path, device: &Device) -> Result<VarBuilder<'a>, MyError> {
    let is_safetensors = ckpt.extension().map(|e| e == "safetensors").unwrap_or(false);
    if is_safetensors {
        // 文件在mmap期间不能被修改
        Ok(unsafe { VarBuilder::from_mmaped_safetensors(&[ckpt], DType::F32, device)? })
    } else {
        Ok(VarBuilder::from_pth(ckpt, DType::F32, device)?)
    }
}

/// 按最长序列在末尾补`pad`，得到`[B, T]`
fn pad_batch<T: candle_core::WithDType>(items: &[Vec<T>], pad: T, device: &Device) -> Result<Tensor, MyError> {
    let max_len = items.iter().map(|i| i.len()).max().unwrap_or(0);
    let mut flat: Vec<T> = Vec::with_capacity(items.len() * max_len);
    for item in items {
        flat.extend_from_slice(item);
        flat.extend(std::iter::repeat(pad).take(max_len - item.len()));
    }
    Ok(Tensor::from_vec(flat, (items.len(), max_len), device)?)
}

/// `[1, gin, 1]`的说话人向量复制到整个batch
fn expand_batch(g: Tensor, batch: usize) -> Result<Tensor, MyError> {
    match g.dims() {
        [1, d, 1] if batch > 1 => Ok(g.broadcast_as((batch, *d, 1))?.contiguous()?),
        _ => Ok(g),
    }
}

/// 读取保存的说话人向量（safetensors中名为`g`的F32张量）
pub fn load_conditioning_from_file(file: &Path, device: &Device) -> Result<Tensor, MyError> {
    let g_file = File::open(file).map_err(|e| MyError::OpenFileError{file: file.display().to_string(), error: e})?;
    let buffer = unsafe { MmapOptions::new().map(&g_file)? };
    let safe_tensors = SafeTensors::deserialize(&buffer)?;
    let tensor_view = safe_tensors.tensor("g")?;
    if tensor_view.dtype() != safetensors::Dtype::F32 {
        return Err(MyError::invalid(format!("{}: tensor g must be F32, got {:?}", file.display(), tensor_view.dtype())))
    }
    Ok(Tensor::from_raw_buffer(tensor_view.data(), DType::F32, tensor_view.shape(), device)?)
}

/// 计算耗时
pub fn elapsed_time(start: SystemTime, end: SystemTime) -> String {
    let nano = end.duration_since(start).unwrap_or_default().as_nanos();
    if nano > 1_000_000_000 {
        format!("{:.2}s", (nano / 1_000_000_000) as f32 + (nano % 1_000_000_000) as f32 / 1e9)
    } else if nano > 1_000_000 {
        format!("{:.2}ms", (nano / 1_000_000) as f32 + (nano % 1_000_000) as f32 / 1e6)
    } else if nano > 1_000 {
        format!("{:.2}us", (nano / 1_000) as f32 + (nano % 1_000) as f32 / 1e3)
    } else {
        format!("{:.2}ns", nano as f32)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn ragged_batch_is_padded() -> Result<(), MyError> {
        let ids = pad_batch(&[vec![1u32, 2, 3], vec![4]], 0, &Device::Cpu)?;
        assert_eq!(ids.to_vec2::<u32>()?, vec![vec![1, 2, 3], vec![4, 0, 0]]);
        Ok(())
    }

    #[test]
    fn single_speaker_vector_is_broadcast() -> Result<(), MyError> {
        let g = Tensor::ones((1, 4, 1), DType::F32, &Device::Cpu)?;
        assert_eq!(expand_batch(g, 3)?.dims(), &[3, 4, 1]);
        Ok(())
    }

    #[test]
    fn conditioning_file_round_trip() -> Result<(), MyError> {
        let dir = std::env::temp_dir().join(format!("vits2_core_g_{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let file = dir.join("speaker.safetensors");
        let g = Tensor::new(&[[[0.5f32], [-1.0], [2.0]]], &Device::Cpu)?;
        g.save_safetensors("g", &file)?;

        let loaded = load_conditioning_from_file(&file, &Device::Cpu)?;
        assert_eq!(loaded.dims(), &[1, 3, 1]);
        assert_eq!(loaded.flatten_all()?.to_vec1::<f32>()?, vec![0.5, -1.0, 2.0]);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn elapsed_time_units() {
        let start = SystemTime::UNIX_EPOCH;
        assert_eq!(elapsed_time(start, start + Duration::from_millis(1500)), "1.50s");
        assert_eq!(elapsed_time(start, start + Duration::from_micros(2500)), "2.50ms");
    }
}
