use std::io;

use candle_core::error::Error as candle_error;
use safetensors::tensor::SafeTensorError as safe_tensor_error;
use serde_json::Error as json_error;
use thiserror::Error;

/// 自定义的错误类型，方便传递错误
/// 参考：https://github.com/dtolnay/thiserror
#[derive(Debug, Error)]
pub enum MyError {
    // 打开文件错误
    #[error("Error - fs::File::open {file}: {error}")]
    OpenFileError{file: String, error: io::Error},

    // 创建路径错误
    #[error("Error - fs::create_dir_all {dir_name}: {error}")]
    CreateDirAllError{dir_name: String, error: io::Error},

    // 读取文件到字符串错误
    #[error("Error - read_to_string {file}: {error}")]
    ReadToStringError{file: String, error: io::Error},

    // 路径不存在
    #[error("Error - {dir} does not exist")]
    DirNotExistError{dir: String},

    // 文件不存在
    #[error("Error - {file} does not exist")]
    FileNotExistError{file: String},

    // 字符串转json错误
    #[error("Error - string to json: {error}")]
    StringToJsonError{error: json_error},

    // 构建或调用时违反约定，例如奇数通道、条件向量缺失、长度超出时间维度
    #[error("Error - invalid argument: {info}")]
    InvalidArgument{info: String},

    // candle错误
    #[error("Error - candle: {0}")]
    CandleError(#[from] candle_error),

    // SafeTensor错误
    #[error("Error - SafeTensor error: {0}")]
    SafeTensorError(#[from] safe_tensor_error),

    // 参数使用错误
    #[error("Error - {para}")]
    ParaError{para: String},

    // 常规io::Error
    #[error("I/O error occurred: {0}")]
    IoError(#[from] io::Error),
}

impl MyError {
    /// Shorthand for contract violations raised by the model code.
    pub fn invalid(info: impl Into<String>) -> Self {
        MyError::InvalidArgument{info: info.into()}
    }
}
