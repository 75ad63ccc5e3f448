use tracing_subscriber::EnvFilter;

use vits2_core::{
    error::MyError,
    parse_paras::parse_para,
    synthesize::synthesize_latent,
};

fn main() {
    // RUST_LOG未设置时默认输出info级别
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run() {
        eprintln!("{}", e); // 这里不要用`{:?}`，会打印结构体而不是打印指定的错误信息
        std::process::exit(1);
    }
}

fn run() -> Result<(), MyError> {
    // 解析参数
    let paras = parse_para()?;

    // 文本 -> 隐变量z
    synthesize_latent(&paras)
}
