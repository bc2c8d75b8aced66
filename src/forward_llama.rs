//! LLaMA forward pass with per-layer residual capture
//!
//! Runs the decoder layer by layer so that the residual stream can be read
//! out after each attention block and after each full layer. Covers
//! bias-free LLaMA-layout checkpoints (LLaMA 1/2/3, Vicuna, Mistral-style
//! GQA). Of the `rope_scaling` variants only `llama3` is supported; any
//! other variant is rejected at load time.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use std::ops::Range;
use tracing::{debug, info};

use crate::cache::{ActivationCache, CapturePoint};
use crate::masks::causal_mask;
use crate::model::ModelFiles;

/// Model configuration (subset of HuggingFace config.json)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
}

/// `rope_scaling` block of config.json
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RopeScaling {
    #[serde(alias = "type")]
    pub rope_type: String,
    #[serde(default = "default_scaling_factor")]
    pub factor: f64,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f64,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f64,
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
}

fn default_scaling_factor() -> f64 {
    8.0
}

fn default_low_freq_factor() -> f64 {
    1.0
}

fn default_high_freq_factor() -> f64 {
    4.0
}

fn default_original_max_position_embeddings() -> usize {
    8192
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl LlamaConfig {
    /// Key/value heads, falling back to full multi-head attention
    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// RoPE inverse frequencies, one per pair of head dimensions
    pub fn inv_frequencies(&self) -> Result<Vec<f64>> {
        let dim = self.head_dim();
        let base: Vec<f64> = (0..dim)
            .step_by(2)
            .map(|i| 1.0 / self.rope_theta.powf(i as f64 / dim as f64))
            .collect();

        match &self.rope_scaling {
            None => Ok(base),
            Some(scaling) if scaling.rope_type == "default" => Ok(base),
            Some(scaling) if scaling.rope_type == "llama3" => {
                Ok(base.into_iter().map(|f| scaling.llama3_frequency(f)).collect())
            }
            Some(scaling) => {
                anyhow::bail!("Unsupported rope_scaling type '{}'", scaling.rope_type)
            }
        }
    }
}

impl RopeScaling {
    /// Long wavelengths are slowed by `factor`, short ones kept, the band between interpolated
    fn llama3_frequency(&self, freq: f64) -> f64 {
        let original = self.original_max_position_embeddings as f64;
        let low_freq_wavelen = original / self.low_freq_factor;
        let high_freq_wavelen = original / self.high_freq_factor;
        let wavelen = 2.0 * std::f64::consts::PI / freq;

        if wavelen < high_freq_wavelen {
            freq
        } else if wavelen > low_freq_wavelen {
            freq / self.factor
        } else {
            let smooth = (original / wavelen - self.low_freq_factor)
                / (self.high_freq_factor - self.low_freq_factor);
            (1.0 - smooth) * freq / self.factor + smooth * freq
        }
    }
}

/// Rotary position embedding tables
#[derive(Debug)]
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &LlamaConfig, device: &Device, dtype: DType) -> Result<Self> {
        let inv_freq: Vec<f32> = config
            .inv_frequencies()?
            .into_iter()
            .map(|f| f as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?;

        let positions: Vec<f32> = (0..config.max_position_embeddings)
            .map(|p| p as f32)
            .collect();
        let positions = Tensor::new(positions, device)?;

        // [max_pos, dim/2]
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;

        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let max_len = self.cos.dim(0)?;
        anyhow::ensure!(
            seq_len <= max_len,
            "Sequence of {seq_len} tokens exceeds max_position_embeddings ({max_len})"
        );
        let cos = self.cos.i(..seq_len)?;
        let sin = self.sin.i(..seq_len)?;

        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// Grouped-query self-attention without biases
#[derive(Debug)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let kv_dim = config.kv_heads() * head_dim;

        Ok(Self {
            q_proj: linear_no_bias(config.hidden_size, config.hidden_size, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(config.hidden_size, kv_dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(config.hidden_size, kv_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(config.hidden_size, config.hidden_size, vb.pp("o_proj"))?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.kv_heads(),
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let scores = scores.broadcast_add(&causal_mask(seq_len, x.device(), x.dtype())?)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;

        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, n_kv, seq_len, head_dim) = x.dims4()?;
    Ok(x
        .unsqueeze(2)?
        .expand((b, n_kv, n_rep, seq_len, head_dim))?
        .reshape((b, n_kv * n_rep, seq_len, head_dim))?)
}

/// SwiGLU feed-forward block
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(h, i, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(h, i, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(i, h, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

#[derive(Debug)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    /// Returns `(residual after attention, residual after MLP)`
    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<(Tensor, Tensor)> {
        let attn = self
            .self_attn
            .forward(&self.input_layernorm.forward(x)?, rotary)?;
        let post_attention = (x + attn)?;

        let mlp = self
            .mlp
            .forward(&self.post_attention_layernorm.forward(&post_attention)?)?;
        let output = (&post_attention + mlp)?;

        Ok((post_attention, output))
    }
}

/// Safetensors index for sharded checkpoints
#[derive(Debug, serde::Deserialize)]
pub(crate) struct SafetensorsIndex {
    pub weight_map: std::collections::HashMap<String, String>,
}

/// LLaMA decoder with residual capture
#[derive(Debug)]
pub struct TfqaLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    hidden_size: usize,
    vocab_size: usize,
}

impl TfqaLlama {
    /// Load weights from resolved model files
    pub fn load(files: &ModelFiles, device: &Device, dtype: DType) -> Result<Self> {
        let config_str =
            std::fs::read_to_string(&files.config).context("Failed to read config.json")?;
        let config: LlamaConfig =
            serde_json::from_str(&config_str).context("Failed to parse config.json")?;

        info!(
            "Model config: {} layers, {} hidden, {} heads ({} kv), {} vocab",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.kv_heads(),
            config.vocab_size
        );

        info!("Loading weights from {} file(s)...", files.weights.len());
        // SAFETY: weight files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? };
        Self::from_var_builder(&config, vb, device, dtype)
    }

    /// Build the model from a var builder rooted at the checkpoint top level
    pub fn from_var_builder(
        config: &LlamaConfig,
        vb: VarBuilder,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let rotary = RotaryEmbedding::new(config, device, dtype)?;
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(vb_model.pp(format!("layers.{i}")), config)?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            info!("Tying lm_head to embed_tokens");
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            hidden_size: config.hidden_size,
            vocab_size: config.vocab_size,
        })
    }

    /// Forward pass that keeps one residual state per layer.
    ///
    /// `input_ids` has shape `(1, seq_len)`. Captured states and the returned
    /// final (normed) output are cut to the positions in `window`; the output
    /// has shape `(window.len(), d_model)`.
    pub fn forward_with_capture(
        &self,
        input_ids: &Tensor,
        capture: CapturePoint,
        window: Range<usize>,
    ) -> Result<(Tensor, ActivationCache)> {
        let seq_len = input_ids.dim(1)?;
        anyhow::ensure!(
            window.start < window.end && window.end <= seq_len,
            "Capture window {window:?} invalid for {seq_len} tokens"
        );

        let mut cache = ActivationCache::with_capacity(self.layers.len());
        let mut hidden = self.embed_tokens.forward(input_ids)?;

        for (i, layer) in self.layers.iter().enumerate() {
            let (post_attention, output) = layer.forward(&hidden, &self.rotary)?;
            match capture {
                CapturePoint::None => {}
                CapturePoint::LayerOutput => {
                    cache.push(output.i((0, window.clone()))?);
                }
                CapturePoint::PostAttention => {
                    cache.push(post_attention.i((0, window.clone()))?);
                }
            }
            hidden = output;

            if (i + 1) % 10 == 0 {
                debug!("Processed layer {}/{}", i + 1, self.layers.len());
            }
        }

        let output = self.norm.forward(&hidden.i((0, window))?)?;
        Ok((output, cache))
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn d_model(&self) -> usize {
        self.hidden_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Read an intermediate state out through the final norm and lm_head
    pub fn logit_lens(&self, state: &Tensor) -> Result<Tensor> {
        let normed = self.norm.forward(state)?;
        self.project_to_vocab(&normed)
    }

    /// Project an already-normed state to vocabulary logits
    pub fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(self.lm_head.forward(hidden)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> LlamaConfig {
        serde_json::from_str(
            r#"{
                "hidden_size": 8,
                "intermediate_size": 16,
                "num_attention_heads": 2,
                "num_key_value_heads": 1,
                "num_hidden_layers": 3,
                "vocab_size": 11,
                "max_position_embeddings": 32
            }"#,
        )
        .unwrap()
    }

    fn tiny_model() -> TfqaLlama {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        TfqaLlama::from_var_builder(&tiny_config(), vb, &device, DType::F32).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = tiny_config();
        assert_eq!(config.kv_heads(), 1);
        assert_eq!(config.head_dim(), 4);
        assert_eq!(config.rope_theta, 10_000.0);
        assert!(!config.tie_word_embeddings);
        assert!(config.rope_scaling.is_none());
    }

    fn config_with_scaling(scaling: &str) -> LlamaConfig {
        serde_json::from_str(&format!(
            r#"{{
                "hidden_size": 256,
                "intermediate_size": 16,
                "num_attention_heads": 2,
                "num_hidden_layers": 1,
                "vocab_size": 11,
                "rope_theta": 500000.0,
                "rope_scaling": {scaling}
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_llama3_rope_scaling() {
        let scaled = config_with_scaling(
            r#"{"rope_type": "llama3", "factor": 8.0, "low_freq_factor": 1.0,
                "high_freq_factor": 4.0, "original_max_position_embeddings": 8192}"#,
        );
        let mut plain = scaled.clone();
        plain.rope_scaling = None;

        let scaled_freqs = scaled.inv_frequencies().unwrap();
        let plain_freqs = plain.inv_frequencies().unwrap();
        assert_eq!(scaled_freqs.len(), 64);

        // highest frequency is short-wavelength and untouched
        assert_eq!(scaled_freqs[0], plain_freqs[0]);
        // lowest frequency has a wavelength far past 8192 and is divided by the factor
        let last = plain_freqs.len() - 1;
        assert!((scaled_freqs[last] - plain_freqs[last] / 8.0).abs() < 1e-15);
        // every frequency lies between the two extremes
        for (s, p) in scaled_freqs.iter().zip(&plain_freqs) {
            assert!(*s <= *p && *s >= p / 8.0 - 1e-15);
        }
    }

    #[test]
    fn test_rope_scaling_type_alias_and_default() {
        let config = config_with_scaling(r#"{"type": "default"}"#);
        assert_eq!(config.rope_scaling.as_ref().unwrap().rope_type, "default");
        let mut plain = config.clone();
        plain.rope_scaling = None;
        assert_eq!(config.inv_frequencies().unwrap(), plain.inv_frequencies().unwrap());
    }

    #[test]
    fn test_unsupported_rope_scaling_rejected() {
        let config = config_with_scaling(r#"{"type": "linear", "factor": 2.0}"#);
        let err = config.inv_frequencies().unwrap_err();
        assert!(err.to_string().contains("linear"));

        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let err = TfqaLlama::from_var_builder(&config, vb, &device, DType::F32).unwrap_err();
        assert!(err.to_string().contains("linear"));
    }

    #[test]
    fn test_capture_shapes() {
        let model = tiny_model();
        let ids = Tensor::new(&[[1u32, 4, 2, 7, 3]], &Device::Cpu).unwrap();

        let (out, cache) = model
            .forward_with_capture(&ids, CapturePoint::LayerOutput, 2..4)
            .unwrap();
        assert_eq!(out.dims(), &[2, 8]);
        assert_eq!(cache.n_layers(), 3);
        assert_eq!(cache.get_layer(0).unwrap().dims(), &[2, 8]);
        assert_eq!(model.logit_lens(cache.get_layer(1).unwrap()).unwrap().dims(), &[2, 11]);

        let (_, cache) = model
            .forward_with_capture(&ids, CapturePoint::None, 0..5)
            .unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_last_layer_output_matches_final_logits() {
        let model = tiny_model();
        let ids = Tensor::new(&[[5u32, 1, 9, 2]], &Device::Cpu).unwrap();

        let (out, cache) = model
            .forward_with_capture(&ids, CapturePoint::LayerOutput, 1..4)
            .unwrap();
        let final_logits: Vec<Vec<f32>> = model.project_to_vocab(&out).unwrap().to_vec2().unwrap();
        let lens_logits: Vec<Vec<f32>> = model
            .logit_lens(cache.get_layer(2).unwrap())
            .unwrap()
            .to_vec2()
            .unwrap();

        for (a, b) in final_logits.iter().flatten().zip(lens_logits.iter().flatten()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_bad_window() {
        let model = tiny_model();
        let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        assert!(model
            .forward_with_capture(&ids, CapturePoint::None, 2..5)
            .is_err());
        assert!(model
            .forward_with_capture(&ids, CapturePoint::None, 1..1)
            .is_err());
    }
}
