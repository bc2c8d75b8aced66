//! Per-layer residual stream capture

use candle_core::Tensor;

/// Which residual stream state to keep from each decoder layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePoint {
    /// Nothing; only the final output is needed
    None,
    /// After the full decoder layer (attention + MLP)
    LayerOutput,
    /// After the attention block, before the MLP
    PostAttention,
}

/// Residual stream states captured during a forward pass.
///
/// Each tensor is already cut to the scored window of the input and has
/// shape `(len, d_model)`.
#[derive(Debug)]
pub struct ActivationCache {
    states: Vec<Tensor>,
}

impl ActivationCache {
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            states: Vec::with_capacity(n_layers),
        }
    }

    /// Add one layer's state, already cut to the window
    pub fn push(&mut self, tensor: Tensor) {
        self.states.push(tensor);
    }

    /// State for a layer, shape `(len, d_model)`
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.states.get(layer)
    }

    pub fn n_layers(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[Tensor] {
        &self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_layers_in_push_order() {
        let device = Device::Cpu;
        let mut cache = ActivationCache::with_capacity(2);
        assert!(cache.is_empty());

        let values: Vec<f32> = (0..6).map(|v| v as f32).collect();
        cache.push(Tensor::from_vec(values, (3, 2), &device).unwrap());
        cache.push(Tensor::zeros((3, 2), DType::F32, &device).unwrap());

        assert_eq!(cache.n_layers(), 2);
        assert_eq!(cache.states().len(), 2);

        let first: Vec<Vec<f32>> = cache.get_layer(0).unwrap().to_vec2().unwrap();
        assert_eq!(first[1], vec![2.0, 3.0]);
        let second: Vec<Vec<f32>> = cache.get_layer(1).unwrap().to_vec2().unwrap();
        assert_eq!(second[2], vec![0.0, 0.0]);

        assert!(cache.get_layer(2).is_none());
    }
}
