use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use rocket::tokio;

// Candle 相关
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use tokenizers::decoders::byte_level::ByteLevel;
use tokenizers::decoders::DecoderWrapper;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::PreTokenizerWrapper;
use tokenizers::{AddedToken, Tokenizer};

use crate::artifacts::{ModelArtifacts, TokenizerFiles};
use crate::config::GenerationParams;
use crate::error::{GenerationError, LoadError};
use crate::gpt2::{Gpt2Config, Gpt2Model};

const END_OF_TEXT: &str = "<|endoftext|>";

/// 统一的推理引擎抽象（即 ModelHandle 背后的 model runtime）
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn model_name(&self) -> &str;

    /// 模型能处理的最大 token 数（position embedding 的长度）
    fn context_window(&self) -> Option<usize> {
        None
    }

    /// 返回 `params.num_return_sequences` 个候选，每个都是 prompt + 续写
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Vec<String>, GenerationError>;
}

/// 从模型位置构造引擎；测试里可以换成 stub
pub type EngineLoader =
    Arc<dyn Fn(&Path) -> Result<Arc<dyn InferenceEngine>, LoadError> + Send + Sync>;

pub fn candle_loader() -> EngineLoader {
    Arc::new(
        |location: &Path| -> Result<Arc<dyn InferenceEngine>, LoadError> {
            let engine: Arc<dyn InferenceEngine> = CandleEngine::load(location)?;
            Ok(engine)
        },
    )
}

pub struct CandleEngine {
    runtime: Arc<Gpt2Runtime>,
}

struct Gpt2Runtime {
    model_name: String,
    device: Device,
    model: Gpt2Model,
    tokenizer: Tokenizer,
}

impl CandleEngine {
    pub fn load(location: &Path) -> Result<Arc<Self>, LoadError> {
        let artifacts = ModelArtifacts::resolve(location)?;
        let device = Device::cuda_if_available(0)?;
        let start = Instant::now();

        let config_file = std::fs::File::open(&artifacts.config)?;
        let config: Gpt2Config =
            serde_json::from_reader(config_file).map_err(|source| LoadError::Config {
                path: artifacts.config.clone(),
                source,
            })?;

        let weights_size = std::fs::metadata(&artifacts.weights)?.len() as usize;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&artifacts.weights], DType::F32, &device)?
        };
        let model = Gpt2Model::load(&config, vb)?;

        let tokenizer = load_tokenizer(&artifacts.tokenizer)
            .map_err(|e| LoadError::Tokenizer(format!("{e:#}")))?;

        let model_name = location.to_string_lossy().into_owned();
        tracing::info!(
            model = %model_name,
            layers = config.n_layer,
            weights = %format_size(weights_size),
            device = ?device,
            "loaded gpt2 model in {:.2}s",
            start.elapsed().as_secs_f32()
        );

        Ok(Arc::new(Self {
            runtime: Arc::new(Gpt2Runtime {
                model_name,
                device,
                model,
                tokenizer,
            }),
        }))
    }
}

fn load_tokenizer(files: &TokenizerFiles) -> anyhow::Result<Tokenizer> {
    match files {
        TokenizerFiles::Json(path) => {
            Tokenizer::from_file(path).map_err(|e| anyhow!("Error loading tokenizer: {e}"))
        }
        TokenizerFiles::VocabMerges { vocab, merges } => {
            let bpe = BPE::from_file(&vocab.to_string_lossy(), &merges.to_string_lossy())
                .build()
                .map_err(|e| anyhow!("Error building BPE from vocab/merges: {e}"))?;

            let mut tokenizer = Tokenizer::new(bpe);
            tokenizer.with_pre_tokenizer(PreTokenizerWrapper::ByteLevel(
                ByteLevel::default().add_prefix_space(false),
            ));
            tokenizer.with_decoder(DecoderWrapper::ByteLevel(ByteLevel::default()));
            tokenizer.add_special_tokens(&[AddedToken::from(END_OF_TEXT, true)]);
            Ok(tokenizer)
        }
    }
}

impl Gpt2Runtime {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Error encoding prompt: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, GenerationError> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| GenerationError::Decode(e.to_string()))
    }

    fn decode_text(
        &self,
        tokens: &[u32],
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let text = self.decode(tokens)?;
        if params.clean_up_tokenization_spaces {
            Ok(clean_up_tokenization(&text))
        } else {
            Ok(text)
        }
    }

    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Vec<String>, GenerationError> {
        let mut prompt_tokens = self
            .encode(prompt)
            .map_err(|e| GenerationError::Tokenize(format!("{e:#}")))?;
        // 空 prompt 用 BOS 起头
        if prompt_tokens.is_empty() {
            prompt_tokens.push(self.model.config().bos_token_id);
        }

        let window = self.model.config().n_positions;
        if prompt_tokens.len() > window {
            return Err(GenerationError::PromptTooLong {
                tokens: prompt_tokens.len(),
                window,
            });
        }

        let prefix = self.decode_text(&prompt_tokens, params)?;
        (0..params.num_return_sequences)
            .map(|i| {
                let seed = params.seed.wrapping_add(i as u64);
                let tokens = self.sample_sequence(&prompt_tokens, params, seed)?;
                let full = self.decode_text(&tokens, params)?;
                let continuation = match full.strip_prefix(prefix.as_str()) {
                    Some(rest) => rest.to_string(),
                    None => self.decode_text(&tokens[prompt_tokens.len()..], params)?,
                };
                Ok::<_, GenerationError>(format!("{prompt}{continuation}"))
            })
            .collect()
    }

    /// 第一步跑完整 prompt，之后每步只喂最后一个 token（KV cache）
    fn sample_sequence(
        &self,
        prompt_tokens: &[u32],
        params: &GenerationParams,
        seed: u64,
    ) -> Result<Vec<u32>, GenerationError> {
        let eos_token = self.model.config().eos_token_id;
        // 总长度不能超过 position embedding
        let limit = params.max_length.min(self.model.config().n_positions);
        let to_sample = limit.saturating_sub(prompt_tokens.len());
        let temperature = params.sampling_temperature();
        let top_k = params.top_k.filter(|_| temperature.is_some());
        let mut logits_processor = LogitsProcessor::new(seed, temperature, params.top_p);
        let mut cache = self.model.new_cache();
        let mut tokens = prompt_tokens.to_vec();

        for step in 0..to_sample {
            let context = if step == 0 {
                &tokens[..]
            } else {
                &tokens[tokens.len() - 1..]
            };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let mut logits = self.model.forward(&input, &mut cache)?.squeeze(0)?;
            if let Some(k) = top_k {
                logits = top_k_filter(&logits, k)?;
            }
            let next_token = logits_processor.sample(&logits)?;
            if next_token == eos_token {
                break;
            }
            tokens.push(next_token);
        }

        Ok(tokens)
    }
}

/// 概率最高的 k 个之外的 logits 置为 -inf
fn top_k_filter(logits: &Tensor, k: usize) -> candle_core::Result<Tensor> {
    let mut values: Vec<f32> = logits.to_dtype(DType::F32)?.to_vec1()?;
    if k == 0 || k >= values.len() {
        return Ok(logits.clone());
    }
    let mut sorted = values.clone();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for v in values.iter_mut() {
        if *v < threshold {
            *v = f32::NEG_INFINITY;
        }
    }
    Tensor::new(values.as_slice(), logits.device())
}

/// 和 transformers 的 clean_up_tokenization 一致
fn clean_up_tokenization(text: &str) -> String {
    text.replace(" .", ".")
        .replace(" ?", "?")
        .replace(" !", "!")
        .replace(" ,", ",")
        .replace(" ' ", "'")
        .replace(" n't", "n't")
        .replace(" 'm", "'m")
        .replace(" 's", "'s")
        .replace(" 've", "'ve")
        .replace(" 're", "'re")
}

#[async_trait]
impl InferenceEngine for CandleEngine {
    fn model_name(&self) -> &str {
        &self.runtime.model_name
    }

    fn context_window(&self) -> Option<usize> {
        Some(self.runtime.model.config().n_positions)
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Vec<String>, GenerationError> {
        // forward 是 CPU 密集的，放到 blocking 线程池
        let runtime = Arc::clone(&self.runtime);
        let prompt = prompt.to_string();
        let params = params.clone();
        tokio::task::spawn_blocking(move || runtime.generate(&prompt, &params))
            .await
            .map_err(|e| GenerationError::Worker(e.to_string()))?
    }
}

// 小工具：人类可读的字节数
pub fn format_size(size: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let size_f = size as f64;
    if size_f > GB {
        format!("{:.2} GiB", size_f / GB)
    } else if size_f > MB {
        format!("{:.2} MiB", size_f / MB)
    } else if size_f > KB {
        format!("{:.2} KiB", size_f / KB)
    } else {
        format!("{size} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    const WORDS: [&str; 6] = ["a", "<eot>", "[UNK]", "b", "c", "d"];

    /// 全零权重 + 按空格切词的小 tokenizer，greedy 时结果可预测
    fn tiny_runtime() -> Gpt2Runtime {
        let config = Gpt2Config {
            vocab_size: WORDS.len(),
            n_positions: 8,
            n_embd: 8,
            n_layer: 1,
            n_head: 2,
            layer_norm_epsilon: 1e-5,
            bos_token_id: 1,
            eos_token_id: 1,
        };
        let device = Device::Cpu;
        let model = Gpt2Model::load(&config, VarBuilder::zeros(DType::F32, &device)).unwrap();

        let vocab: HashMap<String, u32> = WORDS
            .iter()
            .enumerate()
            .map(|(id, word)| (word.to_string(), id as u32))
            .collect();
        let word_level = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(word_level);
        tokenizer.with_pre_tokenizer(PreTokenizerWrapper::Whitespace(Whitespace::default()));
        tokenizer.add_special_tokens(&[AddedToken::from("<eot>", true)]);

        Gpt2Runtime {
            model_name: "tiny".to_string(),
            device,
            model,
            tokenizer,
        }
    }

    fn greedy(max_length: usize) -> GenerationParams {
        GenerationParams {
            max_length,
            do_sample: false,
            ..GenerationParams::default()
        }
    }

    #[test]
    fn response_is_prompt_followed_by_continuation() {
        let runtime = tiny_runtime();
        let out = runtime.generate("a b", &greedy(5)).unwrap();

        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with("a b"), "got {:?}", out[0]);
        assert_eq!(out[0].split_whitespace().count(), 5);
    }

    #[test]
    fn empty_prompt_starts_from_bos() {
        let runtime = tiny_runtime();
        let out = runtime.generate("", &greedy(4)).unwrap();

        assert!(!out[0].is_empty());
        assert!(!out[0].contains("<eot>"));
        assert_eq!(out[0].split_whitespace().count(), 3);
    }

    #[test]
    fn prompt_at_or_past_max_length_is_returned_as_is() {
        let runtime = tiny_runtime();
        for max_length in [3, 4] {
            let out = runtime.generate("a b c d", &greedy(max_length)).unwrap();
            assert_eq!(out, vec!["a b c d".to_string()]);
        }
    }

    #[test]
    fn prompt_longer_than_window_is_rejected() {
        let runtime = tiny_runtime();
        let err = runtime
            .generate("a b c d a b c d a", &greedy(5))
            .unwrap_err();
        assert!(matches!(
            err,
            GenerationError::PromptTooLong { tokens: 9, window: 8 }
        ));
    }

    #[test]
    fn max_length_past_window_stops_at_window() {
        let runtime = tiny_runtime();
        let out = runtime.generate("a", &greedy(50)).unwrap();
        assert_eq!(out[0].split_whitespace().count(), 8);
    }

    #[test]
    fn each_return_sequence_gets_a_candidate() {
        let runtime = tiny_runtime();
        let params = GenerationParams {
            num_return_sequences: 3,
            max_length: 4,
            ..GenerationParams::default()
        };
        let out = runtime.generate("b c", &params).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|text| text.starts_with("b c")));
    }

    #[test]
    fn top_k_keeps_only_the_largest_logits() {
        let logits = Tensor::new(&[0.5f32, 3.0, -1.0, 2.0, 1.0], &Device::Cpu).unwrap();
        let kept: Vec<f32> = top_k_filter(&logits, 2).unwrap().to_vec1().unwrap();
        assert_eq!(kept[1], 3.0);
        assert_eq!(kept[3], 2.0);
        assert!(kept
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 1 && *i != 3)
            .all(|(_, v)| *v == f32::NEG_INFINITY));

        let all: Vec<f32> = top_k_filter(&logits, 50).unwrap().to_vec1().unwrap();
        assert_eq!(all, vec![0.5, 3.0, -1.0, 2.0, 1.0]);
    }

    #[test]
    fn clean_up_joins_punctuation_and_contractions() {
        assert_eq!(
            clean_up_tokenization("Thou art , I think , mad . Is 't so ? I do n't know"),
            "Thou art, I think, mad. Is 't so? I don't know"
        );
        assert_eq!(clean_up_tokenization("no change"), "no change");
    }

    #[test]
    fn format_size_picks_unit() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KiB");
        assert_eq!(format_size(500 * 1024 * 1024), "500.00 MiB");
    }

    #[test]
    fn loading_a_missing_directory_fails() {
        let loader = candle_loader();
        let err = loader(Path::new("./outputs/missing-shakespeare")).err().unwrap();
        assert!(matches!(err, LoadError::MissingArtifact(_)));
    }
}
