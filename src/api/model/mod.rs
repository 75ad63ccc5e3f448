// +---------------------------------------------------------------------------------------+
// | synthesizer --> text_encoder            | 文本编码器，相对位置Transformer，输出先验分布参数（均值、log-scale） |
// |                 posterior_encoder       | 后验编码器，WaveNet结构，从线性谱提取后验分布参数并重参数化采样       |
// |                 residual_coupling_block | 流模型，多个mean-only仿射耦合层 + 可选的末尾transformer耦合层       |
// | attentions / wavenet                    | 上面三者共用的序列编码器（SequenceEncoder、ConditionalFeatureTransform） |
// +---------------------------------------------------------------------------------------+

pub mod utils;

pub mod attentions;
pub mod wavenet;

pub mod posterior_encoder;
pub mod residual_coupling_block;
pub mod text_encoder;

pub mod synthesizer;
