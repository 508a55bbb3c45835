use super::ModelError;
use candle_core::{Device, Tensor};
use hf_hub::api::sync::Api;
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const PREPROCESSOR_FILE: &str = "preprocessor_config.json";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";

/// Local paths of everything needed to build the base model.
#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub preprocessor: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

impl CheckpointFiles {
    /// Uses `model_dir` when given, otherwise downloads `model_id` from the hub.
    pub fn resolve(model_id: &str, model_dir: Option<&Path>) -> Result<Self, ModelError> {
        match model_dir {
            Some(dir) => Self::from_dir(dir),
            None => Self::from_hub(model_id),
        }
    }

    pub fn from_dir(dir: &Path) -> Result<Self, ModelError> {
        log::info!("Using local checkpoint at {}", dir.display());
        let config = require_file(dir.join(CONFIG_FILE))?;
        let tokenizer = require_file(dir.join(TOKENIZER_FILE))?;
        let preprocessor = Some(dir.join(PREPROCESSOR_FILE)).filter(|path| path.is_file());

        let index = dir.join(WEIGHTS_INDEX_FILE);
        let weights = if index.is_file() {
            shard_names(&read_file(&index)?, &index)?
                .into_iter()
                .map(|name| require_file(dir.join(name)))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![require_file(dir.join(SINGLE_WEIGHTS_FILE))?]
        };

        Ok(Self {
            config,
            tokenizer,
            preprocessor,
            weights,
        })
    }

    pub fn from_hub(model_id: &str) -> Result<Self, ModelError> {
        log::info!("Fetching checkpoint {model_id} from the Hugging Face hub");
        let api = Api::new().map_err(|err| ModelError::Hub(err.to_string()))?;
        let repo = api.model(model_id.to_string());
        let fetch = |name: &str| {
            repo.get(name)
                .map_err(|err| ModelError::Hub(format!("failed to download {name}: {err}")))
        };

        let config = fetch(CONFIG_FILE)?;
        let tokenizer = fetch(TOKENIZER_FILE)?;
        let preprocessor = fetch(PREPROCESSOR_FILE).ok();

        let weights = match fetch(WEIGHTS_INDEX_FILE) {
            Ok(index) => shard_names(&read_file(&index)?, &index)?
                .iter()
                .map(|name| fetch(name.as_str()))
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => vec![fetch(SINGLE_WEIGHTS_FILE)?],
        };

        Ok(Self {
            config,
            tokenizer,
            preprocessor,
            weights,
        })
    }
}

/// Distinct shard file names listed by a safetensors index.
pub fn shard_names(index_bytes: &[u8], index_path: &Path) -> Result<Vec<String>, ModelError> {
    let index: SafetensorsIndex =
        serde_json::from_slice(index_bytes).map_err(|source| ModelError::Config {
            path: index_path.to_path_buf(),
            source,
        })?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    if shards.is_empty() {
        return Err(ModelError::MissingWeight(format!(
            "{} lists no shards",
            index_path.display()
        )));
    }
    Ok(shards.into_iter().collect())
}

/// Maps a tensor name from any supported checkpoint layout onto the one the
/// model builder reads: `model.*` for the decoder, `visual.*` for the vision
/// tower and `lm_head.*`.
pub fn canonical_key(name: &str) -> String {
    let name = name.strip_prefix("base_model.model.").unwrap_or(name);
    if let Some(rest) = name.strip_prefix("model.language_model.") {
        format!("model.{rest}")
    } else if let Some(rest) = name.strip_prefix("model.visual.") {
        format!("visual.{rest}")
    } else {
        name.to_string()
    }
}

/// Loads every shard onto `device`, keyed by canonical tensor name.
pub fn load_tensors(
    paths: &[PathBuf],
    device: &Device,
) -> Result<HashMap<String, Tensor>, ModelError> {
    let mut tensors = HashMap::new();
    for path in paths {
        log::debug!("Loading weights from {}", path.display());
        for (name, tensor) in candle_core::safetensors::load(path, device)? {
            tensors.insert(canonical_key(&name), tensor);
        }
    }
    Ok(tensors)
}

fn read_file(path: &Path) -> Result<Vec<u8>, ModelError> {
    std::fs::read(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn require_file(path: PathBuf) -> Result<PathBuf, ModelError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(ModelError::MissingWeight(format!(
            "{} does not exist",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_handles_both_layouts() {
        assert_eq!(
            canonical_key("model.language_model.layers.0.self_attn.q_proj.weight"),
            "model.layers.0.self_attn.q_proj.weight"
        );
        assert_eq!(
            canonical_key("model.visual.blocks.3.attn.qkv.weight"),
            "visual.blocks.3.attn.qkv.weight"
        );
        assert_eq!(
            canonical_key("base_model.model.model.layers.1.mlp.up_proj.weight"),
            "model.layers.1.mlp.up_proj.weight"
        );
        assert_eq!(canonical_key("lm_head.weight"), "lm_head.weight");
    }

    #[test]
    fn shard_names_are_deduplicated_and_sorted() {
        let index = br#"{
            "metadata": {"total_size": 1},
            "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }
        }"#;
        let names = shard_names(index, Path::new("index.json")).unwrap();
        assert_eq!(
            names,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
    }

    #[test]
    fn empty_index_is_rejected() {
        let err = shard_names(br#"{"weight_map": {}}"#, Path::new("index.json")).unwrap_err();
        assert!(matches!(err, ModelError::MissingWeight(_)));
    }
}
