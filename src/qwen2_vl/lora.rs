use super::{ModelError, weights::canonical_key};
use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// The subset of a PEFT `adapter_config.json` that affects merging.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

impl AdapterConfig {
    pub fn scaling(&self) -> f64 {
        let rank = self.r.max(1) as f64;
        if self.use_rslora {
            self.lora_alpha / rank.sqrt()
        } else {
            self.lora_alpha / rank
        }
    }
}

#[derive(Debug)]
struct LoraPair {
    a: Tensor,
    b: Tensor,
}

/// Low-rank deltas keyed by the weight they update.
#[derive(Debug)]
pub struct LoraAdapter {
    config: AdapterConfig,
    pairs: BTreeMap<String, LoraPair>,
}

impl LoraAdapter {
    pub fn load(dir: &Path, device: &Device) -> Result<Self, ModelError> {
        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        let bytes = std::fs::read(&config_path).map_err(|source| ModelError::Io {
            path: config_path.clone(),
            source,
        })?;
        let config: AdapterConfig =
            serde_json::from_slice(&bytes).map_err(|source| ModelError::Config {
                path: config_path,
                source,
            })?;

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        if !weights_path.is_file() {
            return Err(ModelError::Adapter(format!(
                "{} does not exist",
                weights_path.display()
            )));
        }
        let tensors = candle_core::safetensors::load(&weights_path, device)?;
        log::info!(
            "Loaded LoRA adapter from {} (r={}, alpha={}, base={})",
            dir.display(),
            config.r,
            config.lora_alpha,
            config.base_model_name_or_path.as_deref().unwrap_or("unknown")
        );
        Self::from_tensors(config, tensors)
    }

    /// Pairs up `*.lora_A.weight` / `*.lora_B.weight` tensors.
    pub fn from_tensors(
        config: AdapterConfig,
        tensors: HashMap<String, Tensor>,
    ) -> Result<Self, ModelError> {
        let mut halves: BTreeMap<String, (Option<Tensor>, Option<Tensor>)> = BTreeMap::new();
        for (name, tensor) in tensors {
            let Some((module, is_a)) = split_lora_name(&name) else {
                log::warn!("Ignoring non-LoRA adapter tensor {name}");
                continue;
            };
            let entry = halves
                .entry(format!("{}.weight", canonical_key(module)))
                .or_default();
            if is_a {
                entry.0 = Some(tensor);
            } else {
                entry.1 = Some(tensor);
            }
        }

        let mut pairs = BTreeMap::new();
        for (target, halves) in halves {
            match halves {
                (Some(a), Some(b)) => {
                    pairs.insert(target, LoraPair { a, b });
                }
                _ => {
                    return Err(ModelError::Adapter(format!(
                        "incomplete LoRA pair for {target}"
                    )));
                }
            }
        }
        if pairs.is_empty() {
            return Err(ModelError::Adapter("adapter holds no LoRA weights".into()));
        }
        Ok(Self { config, pairs })
    }

    /// Folds every delta into `weights` in place and returns how many
    /// modules were updated.
    ///
    /// The sum is computed in f32 and cast back to the base weight's dtype.
    pub fn merge_into(&self, weights: &mut HashMap<String, Tensor>) -> Result<usize, ModelError> {
        let scaling = self.config.scaling();
        for (target, pair) in &self.pairs {
            let base = weights.get(target).ok_or_else(|| {
                ModelError::Adapter(format!("base checkpoint has no weight {target}"))
            })?;

            let a = pair.a.to_device(base.device())?.to_dtype(DType::F32)?;
            let b = pair.b.to_device(base.device())?.to_dtype(DType::F32)?;
            let mut delta = b.matmul(&a)?.affine(scaling, 0.0)?;
            if self.config.fan_in_fan_out {
                delta = delta.t()?;
            }
            if delta.dims() != base.dims() {
                return Err(ModelError::Adapter(format!(
                    "delta for {target} has shape {:?}, weight has {:?}",
                    delta.dims(),
                    base.dims()
                )));
            }

            let merged = base
                .to_dtype(DType::F32)?
                .add(&delta)?
                .to_dtype(base.dtype())?;
            weights.insert(target.clone(), merged);
        }
        Ok(self.pairs.len())
    }
}

// `foo.lora_A.weight` -> ("foo", true); PEFT may insert the adapter name.
fn split_lora_name(name: &str) -> Option<(&str, bool)> {
    for (marker, is_a) in [(".lora_A.", true), (".lora_B.", false)] {
        if let Some(idx) = name.find(marker) {
            if name.ends_with(".weight") {
                return Some((&name[..idx], is_a));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(r: usize, lora_alpha: f64) -> AdapterConfig {
        AdapterConfig {
            r,
            lora_alpha,
            use_rslora: false,
            fan_in_fan_out: false,
            base_model_name_or_path: None,
        }
    }

    fn adapter(config: AdapterConfig) -> LoraAdapter {
        let device = Device::Cpu;
        let a = Tensor::new(&[[1f32, 2., 3.]], &device).unwrap();
        let b = Tensor::new(&[[1f32], [0.5]], &device).unwrap();
        let tensors = HashMap::from([
            (
                "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight".to_string(),
                a,
            ),
            (
                "base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight".to_string(),
                b,
            ),
        ]);
        LoraAdapter::from_tensors(config, tensors).unwrap()
    }

    #[test]
    fn scaling_follows_rank() {
        assert_eq!(config(8, 16.0).scaling(), 2.0);
        let mut rs = config(4, 16.0);
        rs.use_rslora = true;
        assert_eq!(rs.scaling(), 8.0);
    }

    #[test]
    fn merge_adds_scaled_delta() {
        let adapter = adapter(config(1, 2.0));

        let key = "model.layers.0.self_attn.q_proj.weight".to_string();
        let mut weights = HashMap::from([(
            key.clone(),
            Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap(),
        )]);
        assert_eq!(adapter.merge_into(&mut weights).unwrap(), 1);

        let merged = weights[&key].to_vec2::<f32>().unwrap();
        assert_eq!(merged, vec![vec![3., 5., 7.], vec![2., 3., 4.]]);
    }

    #[test]
    fn fan_in_fan_out_transposes_delta() {
        let mut cfg = config(1, 1.0);
        cfg.fan_in_fan_out = true;
        let adapter = adapter(cfg);

        let key = "model.layers.0.self_attn.q_proj.weight".to_string();
        let mut weights = HashMap::from([(
            key.clone(),
            Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap(),
        )]);
        adapter.merge_into(&mut weights).unwrap();
        let merged = weights[&key].to_vec2::<f32>().unwrap();
        assert_eq!(merged, vec![vec![1., 0.5], vec![2., 1.], vec![3., 1.5]]);
    }

    #[test]
    fn missing_target_fails_the_merge() {
        let adapter = adapter(config(1, 1.0));
        let mut weights = HashMap::new();
        let err = adapter.merge_into(&mut weights).unwrap_err();
        assert!(matches!(err, ModelError::Adapter(_)));
    }

    #[test]
    fn unpaired_tensor_is_rejected() {
        let tensors = HashMap::from([(
            "base_model.model.visual.blocks.0.attn.qkv.lora_A.weight".to_string(),
            Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap(),
        )]);
        let err = LoraAdapter::from_tensors(config(1, 1.0), tensors).unwrap_err();
        assert!(matches!(err, ModelError::Adapter(ref m) if m.contains("visual.blocks.0.attn.qkv")));
    }

    #[test]
    fn lora_names_are_split() {
        assert_eq!(
            split_lora_name("m.layers.0.mlp.up_proj.lora_B.default.weight"),
            Some(("m.layers.0.mlp.up_proj", false))
        );
        assert_eq!(split_lora_name("m.layers.0.mlp.up_proj.weight"), None);
    }
}
