//! Logit lens scoring of answer continuations
//!
//! Intermediate residual states are read out through the final norm and
//! unembedding; the resulting logits are turned into the log-likelihood of
//! the answer tokens that follow the prompt.

use anyhow::Result;
use candle_core::{DType, Tensor, D};

/// Sum of answer-token log-probabilities.
///
/// `logits` has shape `(n, vocab)` where row `t` is the prediction for
/// `target_ids[t]`, i.e. the logits at the position just before that token.
pub fn continuation_log_prob(logits: &Tensor, target_ids: &[u32]) -> Result<f64> {
    let (rows, _vocab) = logits.dims2()?;
    anyhow::ensure!(
        rows == target_ids.len(),
        "Got {rows} logit rows for {} answer tokens",
        target_ids.len()
    );
    anyhow::ensure!(!target_ids.is_empty(), "Answer has no tokens");

    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let targets = Tensor::new(target_ids, logits.device())?.unsqueeze(1)?;
    let picked = log_probs.gather(&targets, 1)?.squeeze(1)?;

    let total = picked.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?;
    Ok(total)
}

/// Result key for one score slot, e.g. `Layer_3_lm_head`
pub fn layer_key(layer: usize, suffix: &str) -> String {
    format!("Layer_{}_{suffix}", layer + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_continuation_log_prob() {
        let device = Device::Cpu;
        // Uniform over 4 tokens, then a peaked row
        let logits = Tensor::new(&[[0.0f32, 0.0, 0.0, 0.0], [10.0, 0.0, 0.0, 0.0]], &device).unwrap();

        let score = continuation_log_prob(&logits, &[2, 0]).unwrap();

        let peaked = 10.0 - (10.0f64.exp() + 3.0).ln();
        let expected = (0.25f64).ln() + peaked;
        assert!((score - expected).abs() < 1e-5);
    }

    #[test]
    fn test_row_count_must_match() {
        let logits = Tensor::zeros((3, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(continuation_log_prob(&logits, &[0, 1]).is_err());
    }

    #[test]
    fn test_layer_key_is_one_based() {
        assert_eq!(layer_key(0, "lm_head"), "Layer_1_lm_head");
        assert_eq!(layer_key(31, "attention"), "Layer_32_attention");
    }
}
