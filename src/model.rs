//! TfqaModel: candidate answer scoring under a language model
//!
//! Wraps a LLaMA-family checkpoint and its tokenizer and exposes
//! `lm_score`, the log-likelihood of an answer continuation read out at the
//! final layer or at every layer.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::cache::CapturePoint;
use crate::forward_llama::{SafetensorsIndex, TfqaLlama};
use crate::logit_lens::{continuation_log_prob, layer_key};

/// Where the per-answer scores are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreMode {
    /// Final layer only
    #[default]
    Baseline,
    /// Residual stream after every decoder layer, through the lm_head
    LayerWise,
    /// Residual stream after every attention block, through the lm_head
    Attention,
}

impl ScoreMode {
    fn capture_point(self) -> CapturePoint {
        match self {
            ScoreMode::Baseline => CapturePoint::None,
            ScoreMode::LayerWise => CapturePoint::LayerOutput,
            ScoreMode::Attention => CapturePoint::PostAttention,
        }
    }

    /// Result keys for each score slot, in slot order
    pub fn result_keys(self, n_layers: usize) -> Vec<String> {
        match self {
            ScoreMode::Baseline => vec!["Final_layer".to_string()],
            ScoreMode::LayerWise => (0..n_layers).map(|i| layer_key(i, "lm_head")).collect(),
            ScoreMode::Attention => (0..n_layers).map(|i| layer_key(i, "attention")).collect(),
        }
    }

    /// Short name used in output file names
    pub fn file_suffix(self) -> &'static str {
        match self {
            ScoreMode::Baseline => "baseline",
            ScoreMode::LayerWise => "layer_wise",
            ScoreMode::Attention => "layer_wise_atten",
        }
    }
}

/// Anything that can score an answer continuation given a prompt
pub trait AnswerScorer {
    /// Number of decoder layers
    fn n_layers(&self) -> usize;

    /// Log-likelihood of `answer` following `prompt`, one value per score slot
    fn lm_score(&self, prompt: &str, answer: &str, mode: ScoreMode) -> Result<Vec<f64>>;

    /// Number of score slots `lm_score` returns for a mode
    fn n_scores(&self, mode: ScoreMode) -> usize {
        match mode {
            ScoreMode::Baseline => 1,
            ScoreMode::LayerWise | ScoreMode::Attention => self.n_layers(),
        }
    }
}

/// Local paths of the files needed to load a checkpoint
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Resolve from a local directory if `model_id` is one, else from the HuggingFace Hub
    pub fn resolve(model_id: &str) -> Result<Self> {
        let dir = Path::new(model_id);
        if dir.is_dir() {
            info!("Loading model files from {}", dir.display());
            return Self::from_dir(dir);
        }
        Self::from_hub(model_id)
    }

    fn from_dir(dir: &Path) -> Result<Self> {
        let config = dir.join("config.json");
        let tokenizer = dir.join("tokenizer.json");
        anyhow::ensure!(config.exists(), "Missing {}", config.display());
        anyhow::ensure!(tokenizer.exists(), "Missing {}", tokenizer.display());

        let index_path = dir.join("model.safetensors.index.json");
        let weights = if index_path.exists() {
            shard_names(&index_path)?
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            vec![dir.join("model.safetensors")]
        };
        for path in &weights {
            anyhow::ensure!(path.exists(), "Missing {}", path.display());
        }

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }

    fn from_hub(model_id: &str) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let tokenizer = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;

        let weights = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            let names = shard_names(&index_path)?;
            info!("Downloading {} shard files...", names.len());
            let mut paths = Vec::with_capacity(names.len());
            for name in &names {
                let path = repo
                    .get(name)
                    .with_context(|| format!("Failed to download {name}"))?;
                paths.push(path);
            }
            paths
        } else {
            vec![repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?]
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

/// Unique shard file names listed in a safetensors index
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let index_str = std::fs::read_to_string(index_path).context("Failed to read index")?;
    let index: SafetensorsIndex = serde_json::from_str(&index_str)?;
    let mut names: Vec<String> = index.weight_map.into_values().collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Model plus tokenizer, ready to score answers
pub struct TfqaModel {
    model: TfqaLlama,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
}

impl TfqaModel {
    /// Load a model (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, false)
    }

    /// Load with an explicit CPU override
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: bool) -> Result<Self> {
        let (device, dtype) = if force_cpu {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    (dev, DType::BF16)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };

        info!("Loading model: {}", model_id);
        info!("Device: {:?}, dtype: {:?}", device, dtype);

        let files = ModelFiles::resolve(model_id)?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        let model = TfqaLlama::load(&files, &device, dtype)?;

        info!(
            "Model loaded: {} layers, {} hidden, {} vocab",
            model.n_layers(),
            model.d_model(),
            model.vocab_size()
        );

        Ok(Self {
            model,
            tokenizer,
            device,
            model_id: model_id.to_string(),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl AnswerScorer for TfqaModel {
    fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    fn lm_score(&self, prompt: &str, answer: &str, mode: ScoreMode) -> Result<Vec<f64>> {
        let input_ids = self.encode(&format!("{prompt}{answer}"))?;
        let prefix_len = self.encode(prompt)?.len();

        let targets = answer_targets(&input_ids, prefix_len)?;
        debug!(
            "Scoring {} answer tokens after {} prompt tokens",
            targets.len(),
            prefix_len
        );

        // Row t of the window predicts input_ids[prefix_len + t]
        let window = prefix_len - 1..input_ids.len() - 1;
        let input = Tensor::new(&input_ids[..], &self.device)?.unsqueeze(0)?;
        let (output, cache) =
            self.model
                .forward_with_capture(&input, mode.capture_point(), window)?;

        match mode {
            ScoreMode::Baseline => {
                let logits = self.model.project_to_vocab(&output)?;
                Ok(vec![continuation_log_prob(&logits, targets)?])
            }
            ScoreMode::LayerWise | ScoreMode::Attention => cache
                .states()
                .iter()
                .map(|state| {
                    let logits = self.model.logit_lens(state)?;
                    continuation_log_prob(&logits, targets)
                })
                .collect(),
        }
    }
}

/// Answer token ids: everything past the prompt's token count
fn answer_targets(input_ids: &[u32], prefix_len: usize) -> Result<&[u32]> {
    anyhow::ensure!(prefix_len > 0, "Prompt produced no tokens");
    anyhow::ensure!(
        input_ids.len() > prefix_len,
        "Answer produced no tokens past the prompt ({} <= {})",
        input_ids.len(),
        prefix_len
    );
    Ok(&input_ids[prefix_len..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_keys() {
        assert_eq!(ScoreMode::Baseline.result_keys(32), vec!["Final_layer"]);
        assert_eq!(
            ScoreMode::LayerWise.result_keys(2),
            vec!["Layer_1_lm_head", "Layer_2_lm_head"]
        );
        assert_eq!(
            ScoreMode::Attention.result_keys(2),
            vec!["Layer_1_attention", "Layer_2_attention"]
        );
    }

    #[test]
    fn test_answer_targets() {
        let ids = [1, 10, 11, 12, 13];
        assert_eq!(answer_targets(&ids, 3).unwrap(), &[12, 13]);
        assert!(answer_targets(&ids, 5).is_err());
        assert!(answer_targets(&ids, 0).is_err());
    }

    #[test]
    fn test_missing_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn test_local_sharded_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["config.json", "tokenizer.json", "a.safetensors", "b.safetensors"] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        std::fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"weight_map": {"x": "b.safetensors", "y": "a.safetensors", "z": "b.safetensors"}}"#,
        )
        .unwrap();

        let files = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap();
        let names: Vec<_> = files
            .weights
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.safetensors", "b.safetensors"]);
    }
}
