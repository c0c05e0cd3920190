use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_PATH: &str = "outputs/finetuned_shakespeare";

/// 从 Rocket 的 figment 中读取（Rocket.toml + ROCKET_* 环境变量）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 本地模型目录；不存在时按 Hugging Face hub repo id 处理
    pub model_path: PathBuf,
    /// true: 启动时加载模型，失败则拒绝启动
    pub preload_model: bool,
    pub max_concurrent_generations: usize,
    pub generation: GenerationParams,
    pub cors: CorsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            preload_model: true,
            max_concurrent_generations: 4,
            generation: GenerationParams::default(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// prompt + 生成部分的 token 总数上限
    pub max_length: usize,
    pub num_return_sequences: usize,
    pub do_sample: bool,
    pub temperature: f64,
    /// 只在概率最高的 k 个 token 里采样；None 表示不截断
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub seed: u64,
    /// 去掉标点前多余的空格（" ." -> "."）
    pub clean_up_tokenization_spaces: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 50,
            num_return_sequences: 1,
            do_sample: true,
            temperature: 1.0,
            top_k: Some(50),
            top_p: None,
            seed: 42,
            clean_up_tokenization_spaces: true,
        }
    }
}

impl GenerationParams {
    /// LogitsProcessor 的温度参数；None 表示 greedy
    pub fn sampling_temperature(&self) -> Option<f64> {
        if !self.do_sample || self.temperature <= 0.0 {
            None
        } else {
            Some(self.temperature)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// `"*"` 表示允许任意来源
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: u32,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allow_credentials: true,
            max_age: 600,
        }
    }
}

impl CorsConfig {
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}
