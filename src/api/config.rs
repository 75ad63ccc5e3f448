use std::fs::read_to_string;
use std::path::Path;

use serde::Deserialize;
use serde_json::from_str;

use crate::error::MyError;

/// data参数
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    pub sampling_rate: usize, // 22050
    pub filter_length: usize, // 1024, 线性谱通道数为 filter_length / 2 + 1
    pub hop_length:    usize, // 256
    #[serde(default)]
    pub n_speakers:    usize, // 0
    #[serde(default)]
    pub n_languages:   usize, // 0
}

/// model参数
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub n_vocab:                  usize,           // 词表大小
    pub inter_channels:           usize,           // 192, 隐变量通道数
    pub hidden_channels:          usize,           // 192
    pub filter_channels:          usize,           // 768
    pub n_heads:                  usize,           // 2
    pub n_layers:                 usize,           // 6
    pub kernel_size:              usize,           // 3
    pub p_dropout:                f32,             // 0.1
    #[serde(default)]
    pub gin_channels:             usize,           // 256, 0表示不使用说话人条件
    #[serde(default)]
    pub language_emb_dim:         usize,           // 0表示不拼接语言向量
    #[serde(default)]
    pub use_speaker_emb_as_text_cond: bool,        // 文本编码器是否在某一层注入说话人向量
    #[serde(default = "default_speaker_emb_layer_idx")]
    pub speaker_emb_layer_idx:    usize,           // 2
    #[serde(default = "default_rel_attn_window_size")]
    pub rel_attn_window_size:     Option<usize>,   // 4
    #[serde(default = "default_posterior_kernel_size")]
    pub posterior_kernel_size:    usize,           // 5
    #[serde(default = "default_dilation_rate")]
    pub posterior_dilation_rate:  usize,           // 1
    #[serde(default = "default_posterior_n_layers")]
    pub posterior_n_layers:       usize,           // 16
    #[serde(default = "default_n_flows")]
    pub n_flows:                  usize,           // 4
    #[serde(default = "default_flow_kernel_size")]
    pub flow_kernel_size:         usize,           // 5
    #[serde(default = "default_dilation_rate")]
    pub flow_dilation_rate:       usize,           // 1
    #[serde(default = "default_flow_n_layers")]
    pub flow_n_layers:            usize,           // 4
    #[serde(default)]
    pub use_transformer_flows:    bool,            // 在flow末尾追加一个带transformer的耦合层
    #[serde(default)]
    pub log_scale_clamp:          Option<f64>,     // None表示不截断log-scale
}

fn default_speaker_emb_layer_idx() -> usize { 2 }
fn default_rel_attn_window_size() -> Option<usize> { Some(4) }
fn default_posterior_kernel_size() -> usize { 5 }
fn default_dilation_rate() -> usize { 1 }
fn default_posterior_n_layers() -> usize { 16 }
fn default_n_flows() -> usize { 4 }
fn default_flow_kernel_size() -> usize { 5 }
fn default_flow_n_layers() -> usize { 4 }

/// 存储config.json
#[derive(Debug, Clone, Deserialize)]
pub struct HParams {
    #[serde(rename = "_version_", default)] // 将`version`映射到json的`_version_`
    pub version: Option<String>,
    pub data:    DataConfig,
    pub model:   ModelConfig,
}

impl HParams {
    /// 读取config.json创建对象
    pub fn new(file: &Path) -> Result<Self, MyError> {
        match read_to_string(file) {
            Ok(cfg) => Self::from_json_str(&cfg),
            Err(e) => Err(MyError::ReadToStringError{file: file.display().to_string(), error: e}),
        }
    }

    pub fn from_json_str(cfg: &str) -> Result<Self, MyError> {
        let hps = from_str::<HParams>(cfg).map_err(|e| MyError::StringToJsonError{error: e})?;
        hps.validate()?;
        Ok(hps)
    }

    /// 线性谱通道数
    pub fn spec_channels(&self) -> usize {
        self.data.filter_length / 2 + 1
    }

    /// Rejects hyper-parameter combinations the model cannot be built with.
    pub fn validate(&self) -> Result<(), MyError> {
        let m = &self.model;
        if m.inter_channels == 0 || m.inter_channels % 2 != 0 {
            return Err(MyError::invalid(format!("inter_channels must be a positive even number, got {}", m.inter_channels)))
        }
        if m.n_heads == 0 || m.hidden_channels % m.n_heads != 0 {
            return Err(MyError::invalid(format!("hidden_channels ({}) must be divisible by n_heads ({})", m.hidden_channels, m.n_heads)))
        }
        if m.use_speaker_emb_as_text_cond {
            if m.gin_channels == 0 {
                return Err(MyError::invalid("use_speaker_emb_as_text_cond requires gin_channels > 0"))
            }
            if m.speaker_emb_layer_idx >= m.n_layers {
                return Err(MyError::invalid(format!("speaker_emb_layer_idx ({}) must be less than n_layers ({})", m.speaker_emb_layer_idx, m.n_layers)))
            }
        }
        if self.data.n_languages > 1 && m.language_emb_dim == 0 {
            return Err(MyError::invalid("n_languages > 1 requires language_emb_dim > 0"))
        }
        if let Some(c) = m.log_scale_clamp {
            if !(c > 0.0) {
                return Err(MyError::invalid(format!("log_scale_clamp must be positive, got {}", c)))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "_version_": "v2",
        "data": {"sampling_rate": 22050, "filter_length": 1024, "hop_length": 256, "n_speakers": 4},
        "model": {
            "n_vocab": 100, "inter_channels": 192, "hidden_channels": 192, "filter_channels": 768,
            "n_heads": 2, "n_layers": 6, "kernel_size": 3, "p_dropout": 0.1, "gin_channels": 256
        }
    }"#;

    #[test]
    fn defaults_fill_vits2_fields() -> Result<(), MyError> {
        let hps = HParams::from_json_str(CONFIG)?;
        assert_eq!(hps.version.as_deref(), Some("v2"));
        assert_eq!(hps.spec_channels(), 513);
        assert_eq!(hps.model.n_flows, 4);
        assert_eq!(hps.model.posterior_n_layers, 16);
        assert_eq!(hps.model.rel_attn_window_size, Some(4));
        assert!(!hps.model.use_transformer_flows);
        assert!(hps.model.log_scale_clamp.is_none());
        Ok(())
    }

    #[test]
    fn odd_latent_channels_rejected() {
        let cfg = CONFIG.replace("\"inter_channels\": 192", "\"inter_channels\": 191");
        assert!(matches!(HParams::from_json_str(&cfg), Err(MyError::InvalidArgument{..})));
    }

    #[test]
    fn text_cond_layer_must_exist() {
        let cfg = CONFIG.replace("\"gin_channels\": 256", "\"gin_channels\": 256, \"use_speaker_emb_as_text_cond\": true, \"speaker_emb_layer_idx\": 6");
        assert!(matches!(HParams::from_json_str(&cfg), Err(MyError::InvalidArgument{..})));
    }
}
