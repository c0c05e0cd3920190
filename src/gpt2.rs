//! GPT-2 decoder（Hugging Face `GPT2LMHeadModel` 权重布局）
//!
//! 只实现推理需要的 forward：token/position embedding、N 个 pre-LN block、
//! 最后的 LayerNorm 和与 `wte` 共享权重的 lm head。

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_special_token")]
    pub bos_token_id: u32,
    #[serde(default = "default_special_token")]
    pub eos_token_id: u32,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_special_token() -> u32 {
    50256
}

/// 每层一份 (k, v)，形状 (batch, n_head, seq, head_dim)
#[derive(Debug, Clone)]
pub struct Cache {
    kvs: Vec<Option<(Tensor, Tensor)>>,
}

impl Cache {
    pub fn new(n_layer: usize) -> Self {
        Self {
            kvs: vec![None; n_layer],
        }
    }

    /// 已经缓存的 token 数
    pub fn seq_len(&self) -> usize {
        self.kvs
            .first()
            .and_then(|kv| kv.as_ref())
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }
}

/// HF 的 Conv1D：权重按 (in, out) 存储，和 nn.Linear 相反
#[derive(Debug, Clone)]
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn new(in_size: usize, out_size: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((in_size, out_size), "weight")?;
        let bias = vb.get(out_size, "bias")?;
        Ok(Self { weight, bias })
    }
}

impl Module for Conv1D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)
    }
}

#[derive(Debug, Clone)]
struct Attention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn new(cfg: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let c_attn = Conv1D::new(cfg.n_embd, 3 * cfg.n_embd, vb.pp("c_attn"))?;
        let c_proj = Conv1D::new(cfg.n_embd, cfg.n_embd, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: cfg.n_head,
            head_dim: cfg.n_embd / cfg.n_head,
        })
    }

    fn split_heads(&self, xs: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        xs.reshape((b, t, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor, kv: &mut Option<(Tensor, Tensor)>) -> Result<Tensor> {
        let (b, t, c) = xs.dims3()?;
        let qkv = self.c_attn.forward(xs)?;
        let q = self.split_heads(&qkv.narrow(D::Minus1, 0, c)?, b, t)?;
        let k = self.split_heads(&qkv.narrow(D::Minus1, c, c)?, b, t)?;
        let v = self.split_heads(&qkv.narrow(D::Minus1, 2 * c, c)?, b, t)?;

        // cat 的结果不连续，matmul 要求连续的 rhs
        let (k, v) = match kv.take() {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[&prev_k, &k], 2)?.contiguous()?,
                Tensor::cat(&[&prev_v, &v], 2)?.contiguous()?,
            ),
            None => (k, v),
        };
        *kv = Some((k.clone(), v.clone()));

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let att = (q.matmul(&k.t()?)? * scale)?;
        let att = if t > 1 {
            let past = k.dim(2)? - t;
            masked_fill(&att, &causal_mask(t, past, xs.device())?)?
        } else {
            att
        };
        let att = candle_nn::ops::softmax_last_dim(&att)?;

        let ys = att
            .matmul(&v.contiguous()?)?
            .transpose(1, 2)?
            .reshape((b, t, c))?;
        self.c_proj.forward(&ys)
    }
}

/// 1 表示要屏蔽：query i 只能看到 past + i 及之前的位置
fn causal_mask(t: usize, past: usize, device: &Device) -> Result<Tensor> {
    let total = past + t;
    let mask: Vec<u8> = (0..t)
        .flat_map(|i| (0..total).map(move |j| u8::from(j > past + i)))
        .collect();
    Tensor::from_slice(&mask, (t, total), device)
}

fn masked_fill(att: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let shape = att.shape();
    let neg_inf = Tensor::new(f32::NEG_INFINITY, att.device())?
        .to_dtype(att.dtype())?
        .broadcast_as(shape)?;
    mask.broadcast_as(shape)?.where_cond(&neg_inf, att)
}

#[derive(Debug, Clone)]
struct Mlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
}

impl Mlp {
    fn new(cfg: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let inner = 4 * cfg.n_embd;
        Ok(Self {
            c_fc: Conv1D::new(cfg.n_embd, inner, vb.pp("c_fc"))?,
            c_proj: Conv1D::new(inner, cfg.n_embd, vb.pp("c_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // gelu_new 即 tanh 近似
        self.c_proj.forward(&self.c_fc.forward(xs)?.gelu()?)
    }
}

#[derive(Debug, Clone)]
struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: candle_nn::layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            ln_2: candle_nn::layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, xs: &Tensor, kv: &mut Option<(Tensor, Tensor)>) -> Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.ln_1.forward(xs)?, kv)?)?;
        &xs + self.mlp.forward(&self.ln_2.forward(&xs)?)?
    }
}

#[derive(Debug, Clone)]
pub struct Gpt2Model {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: Gpt2Config,
}

impl Gpt2Model {
    pub fn load(cfg: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        // save_pretrained 会带 `transformer.` 前缀，hub 上的原始 gpt2 没有
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte_weight = vb.get((cfg.vocab_size, cfg.n_embd), "wte.weight")?;
        let wte = Embedding::new(wte_weight.clone(), cfg.n_embd);
        let wpe = candle_nn::embedding(cfg.n_positions, cfg.n_embd, vb.pp("wpe"))?;
        let blocks = (0..cfg.n_layer)
            .map(|i| Block::new(cfg, vb.pp("h").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = candle_nn::layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_f"))?;
        // lm_head 与 wte 共享权重
        let lm_head = Linear::new(wte_weight, None);

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }

    pub fn new_cache(&self) -> Cache {
        Cache::new(self.blocks.len())
    }

    /// input: (batch, seq) 的 u32 token id；返回最后一个位置的 logits (batch, vocab)
    pub fn forward(&self, input: &Tensor, cache: &mut Cache) -> Result<Tensor> {
        let (_b, t) = input.dims2()?;
        let past = cache.seq_len();
        let positions = Tensor::arange(past as u32, (past + t) as u32, input.device())?;

        let mut xs = self
            .wte
            .forward(input)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;
        for (block, kv) in self.blocks.iter().zip(cache.kvs.iter_mut()) {
            xs = block.forward(&xs, kv)?;
        }

        let xs = self.ln_f.forward(&xs)?;
        let last = xs.i((.., t - 1, ..))?.contiguous()?;
        self.lm_head.forward(&last)?.to_dtype(DType::F32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> Gpt2Config {
        Gpt2Config {
            vocab_size: 16,
            n_positions: 8,
            n_embd: 8,
            n_layer: 2,
            n_head: 2,
            layer_norm_epsilon: 1e-5,
            bos_token_id: 15,
            eos_token_id: 15,
        }
    }

    #[test]
    fn config_fills_defaults_from_hf_json() {
        let cfg: Gpt2Config = serde_json::from_str(
            r#"{"vocab_size": 50257, "n_positions": 1024, "n_embd": 768,
                "n_layer": 12, "n_head": 12, "activation_function": "gelu_new"}"#,
        )
        .unwrap();
        assert_eq!(cfg.eos_token_id, 50256);
        assert_eq!(cfg.layer_norm_epsilon, 1e-5);
    }

    #[test]
    fn forward_returns_last_position_logits_and_fills_cache() -> Result<()> {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = Gpt2Model::load(&cfg, vb)?;

        let mut cache = model.new_cache();
        let prompt = Tensor::new(&[1u32, 2, 3], &device)?.unsqueeze(0)?;
        let logits = model.forward(&prompt, &mut cache)?;
        assert_eq!(logits.dims(), &[1, cfg.vocab_size]);
        assert_eq!(cache.seq_len(), 3);

        let next = Tensor::new(&[4u32], &device)?.unsqueeze(0)?;
        let logits = model.forward(&next, &mut cache)?;
        assert_eq!(logits.dims(), &[1, cfg.vocab_size]);
        assert_eq!(cache.seq_len(), 4);
        Ok(())
    }

    #[test]
    fn cached_decode_steps_work_for_any_prompt_length() -> Result<()> {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let model = Gpt2Model::load(&cfg, VarBuilder::zeros(DType::F32, &device))?;

        for prompt_len in [1usize, 2, 3, 6] {
            let mut cache = model.new_cache();
            let prompt: Vec<u32> = (0..prompt_len as u32).collect();
            let input = Tensor::new(prompt.as_slice(), &device)?.unsqueeze(0)?;
            model.forward(&input, &mut cache)?;

            for step in 0..2 {
                let next = Tensor::new(&[7u32], &device)?.unsqueeze(0)?;
                let logits = model.forward(&next, &mut cache)?;
                assert_eq!(logits.dims(), &[1, cfg.vocab_size]);
                assert_eq!(cache.seq_len(), prompt_len + step + 1);
            }
        }
        Ok(())
    }

    #[test]
    fn causal_mask_accounts_for_cached_positions() -> Result<()> {
        let mask = causal_mask(2, 1, &Device::Cpu)?.to_vec2::<u8>()?;
        assert_eq!(mask, vec![vec![0, 0, 1], vec![0, 0, 0]]);
        Ok(())
    }
}
