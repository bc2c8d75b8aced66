//! Causal attention masks
//!
//! Every candidate answer shares the same few-shot preamble, so prompt
//! lengths repeat heavily across a run. Masks are cached by
//! `(seq_len, device kind, dtype)` and handed out as shallow clones.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type MaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

static CAUSAL_MASKS: MaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

fn device_kind(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Additive causal mask of shape `[1, 1, seq_len, seq_len]`.
///
/// Entry `(i, j)` is `0.0` when `j <= i` and `-inf` otherwise.
pub fn causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = (seq_len, device_kind(device), dtype);

    if let Some(mask) = CAUSAL_MASKS.lock().unwrap().get(&key) {
        return Ok(mask.clone());
    }

    let values: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask = Tensor::from_vec(values, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    CAUSAL_MASKS.lock().unwrap().insert(key, mask.clone());
    Ok(mask)
}

/// Drop all cached masks
#[cfg(test)]
pub(crate) fn clear_mask_cache() {
    CAUSAL_MASKS.lock().unwrap().clear();
}

/// Number of cached masks
#[cfg(test)]
pub(crate) fn mask_cache_size() -> usize {
    CAUSAL_MASKS.lock().unwrap().len()
}
