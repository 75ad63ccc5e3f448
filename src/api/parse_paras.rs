use std::env::set_var;
use std::fs::create_dir_all;
use std::path::{
    Path,
    PathBuf,
};

use argh::FromArgs;
use candle_core::utils::cuda_is_available;
use tracing::warn;

use crate::error::MyError;

#[derive(FromArgs)]
#[argh(help_triggers("-h", "--help"))] // https://github.com/google/argh/pull/106
/// vits2 acoustic core: text token ids -> latent z
struct Paras {
    /// token ids, comma separated, batch items colon separated, e.g. 3,15,7:4,9
    #[argh(option, short = 't')]
    tokens: String,

    /// frames per token, same layout as -t, default: 1 frame per token
    #[argh(option, short = 'd')]
    durations: Option<String>,

    /// speaker id used for every batch item
    #[argh(option, short = 's')]
    speaker: Option<u32>,

    /// speaker embedding file (.safetensors with a [1, gin, 1] or [B, gin, 1] tensor named "g"), conflicts with -s
    #[argh(option, short = 'g')]
    speaker_file: Option<String>,

    /// language id used for every batch item
    #[argh(option, short = 'l')]
    language: Option<u32>,

    /// prior noise scale, default: 0.667
    #[argh(option, short = 'n')]
    noise_scale: Option<f64>,

    /// random seed, default: device random generator
    #[argh(option, short = 'r')]
    seed: Option<u64>,

    /// model path containing config.json and model.safetensors (or checkpoint.pth), default: ./checkpoints/vits2
    #[argh(option, short = 'm')]
    model: Option<String>,

    /// cpu threads, 0 means all threads, default: 4
    #[argh(option, short = 'T')]
    thread: Option<usize>,

    /// output file, default: ./latent.safetensors
    #[argh(option, short = 'o')]
    outfile: Option<String>,
}

/// 说话人条件来源
pub enum SpeakerSource {
    Id(u32),       // 查说话人向量表emb_g
    File(PathBuf), // 直接读取保存的说话人向量
}

/// 存储解析后的命令行参数
pub struct ParsedParas {
    pub tokens:      Vec<Vec<u32>>,         // 每个batch item的token id
    pub durations:   Option<Vec<Vec<f32>>>, // 每个token的帧数，与tokens一一对应
    pub speaker:     Option<SpeakerSource>,
    pub language:    Option<u32>,
    pub noise_scale: f64,
    pub seed:        Option<u64>,
    pub config:      PathBuf,               // 模型config.json
    pub ckpt:        PathBuf,               // 模型参数，model.safetensors或checkpoint.pth
    pub outfile:     PathBuf,               // 保存z和y_mask的safetensors文件
}

/// 解析参数
pub fn parse_para() -> Result<ParsedParas, MyError> {
    let para: Paras = argh::from_env();

    let tokens = parse_batch::<u32>(&para.tokens, "-t")?;
    if tokens.iter().any(|t| t.is_empty()) {
        return Err(MyError::ParaError{para: "-t every batch item needs at least one token id".to_string()})
    }
    let durations = match para.durations {
        Some(d) => {
            let durations = parse_batch::<f32>(&d, "-d")?;
            let same_layout = durations.len() == tokens.len()
                && durations.iter().zip(tokens.iter()).all(|(d, t)| d.len() == t.len());
            if !same_layout {
                return Err(MyError::ParaError{para: "-d must have the same layout as -t".to_string()})
            }
            if durations.iter().flatten().any(|d| !(*d >= 0.0)) {
                return Err(MyError::ParaError{para: "-d durations must be non-negative numbers".to_string()})
            }
            Some(durations)
        },
        None => None,
    };

    let speaker = match (para.speaker, para.speaker_file) {
        (Some(_), Some(_)) => return Err(MyError::ParaError{para: "-s and -g cannot be used together".to_string()}),
        (Some(s), None) => Some(SpeakerSource::Id(s)),
        (None, Some(f)) => {
            let tmp_file = PathBuf::from(&f);
            if !(tmp_file.exists() && tmp_file.is_file()) {
                return Err(MyError::FileNotExistError{file: f})
            }
            Some(SpeakerSource::File(tmp_file))
        },
        (None, None) => None,
    };

    let noise_scale = para.noise_scale.unwrap_or(0.667);
    if !(noise_scale >= 0.0) {
        return Err(MyError::ParaError{para: format!("-n must be non-negative, got {}", noise_scale)})
    }

    // 检查输出文件，所在路径不存在则创建
    let outfile = PathBuf::from(para.outfile.unwrap_or("./latent.safetensors".to_string()));
    if !outfile.to_string_lossy().to_lowercase().ends_with(".safetensors") {
        return Err(MyError::ParaError{para: "-o only support .safetensors output".to_string()})
    }
    if let Some(dir) = outfile.parent() {
        check_outpath(dir)?;
    }

    // 获取模型文件
    let (config, ckpt) = check_vits2_model(para.model)?;

    // 设置线程数，默认4，0表示使用当前可用的所有线程
    match para.thread { // 不设置环境变量时，Rayon使用的线程池默认为系统的逻辑核心数
        Some(t) => if t > 0 {
            if cuda_is_available() { // 使用cuda时-T无效
                warn!("-T is invalid when using cuda");
            } else {
                set_var("RAYON_NUM_THREADS", t.to_string());
            }
        },
        None => if !cuda_is_available() {
            set_var("RAYON_NUM_THREADS", "4"); // 默认4线程
        },
    }

    Ok(ParsedParas{
        tokens,
        durations,
        speaker,
        language: para.language,
        noise_scale,
        seed: para.seed,
        config,
        ckpt,
        outfile,
    })
}

/// `1,2,3:4,5` -> `[[1, 2, 3], [4, 5]]`
fn parse_batch<T: std::str::FromStr>(value: &str, flag: &str) -> Result<Vec<Vec<T>>, MyError> {
    value
        .split(':')
        .map(|item| {
            item.split(',')
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(|v| v.parse::<T>().map_err(|_| MyError::ParaError{para: format!("{} invalid value: {}", flag, v)}))
                .collect::<Result<Vec<T>, MyError>>()
        })
        .collect()
}

/// 检查输出路径，不存在则创建
fn check_outpath(path: &Path) -> Result<(), MyError> {
    if path.as_os_str().is_empty() || (path.exists() && path.is_dir()) {
        return Ok(())
    }
    if let Err(err) = create_dir_all(path) {
        return Err(MyError::CreateDirAllError{dir_name: path.display().to_string(), error: err})
    }
    Ok(())
}

/// 检查指定的模型路径下所需文件是否存在，返回config.json和模型参数文件的PathBuf
/// 优先使用model.safetensors，不存在时使用checkpoint.pth
fn check_vits2_model(path: Option<String>) -> Result<(PathBuf, PathBuf), MyError> {
    let p_str = path.unwrap_or("./checkpoints/vits2/".to_string());
    let tmp_path = PathBuf::from(&p_str);
    if !(tmp_path.exists() && tmp_path.is_dir()) {
        return Err(MyError::DirNotExistError{dir: p_str})
    }
    // 检查config.json
    let tmp_config = tmp_path.join("config.json");
    if !(tmp_config.exists() && tmp_config.is_file()) {
        return Err(MyError::FileNotExistError{file: tmp_config.display().to_string()})
    }
    // 检查model.safetensors或checkpoint.pth
    let safetensors = tmp_path.join("model.safetensors");
    if safetensors.is_file() {
        return Ok((tmp_config, safetensors))
    }
    let pth = tmp_path.join("checkpoint.pth");
    if pth.is_file() {
        return Ok((tmp_config, pth))
    }
    Err(MyError::FileNotExistError{file: format!("{} or {}", safetensors.display(), pth.display())})
}
