use std::path::{Path, PathBuf};

use hf_hub::api::sync::Api;

use crate::error::LoadError;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const VOCAB_FILE: &str = "vocab.json";
pub const MERGES_FILE: &str = "merges.txt";

/// fast tokenizer（tokenizer.json）或 save_pretrained 写出的 vocab + merges
#[derive(Debug, Clone, PartialEq)]
pub enum TokenizerFiles {
    Json(PathBuf),
    VocabMerges { vocab: PathBuf, merges: PathBuf },
}

/// 一个模型目录里推理需要的全部文件
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifacts {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub tokenizer: TokenizerFiles,
}

impl ModelArtifacts {
    /// 本地目录优先；否则把路径当作 hub 上的 repo id
    pub fn resolve(location: &Path) -> Result<Self, LoadError> {
        if location.is_dir() {
            return Self::from_dir(location);
        }
        let local_parent = location
            .parent()
            .is_some_and(|p| !p.as_os_str().is_empty() && p.is_dir());
        if location.exists() || location.is_absolute() || location.starts_with(".") || local_parent
        {
            return Err(LoadError::MissingArtifact(location.to_path_buf()));
        }
        Self::from_hub(&location.to_string_lossy())
    }

    pub fn from_dir(dir: &Path) -> Result<Self, LoadError> {
        let config = require(dir.join(CONFIG_FILE))?;
        let weights = require(dir.join(WEIGHTS_FILE))?;

        let tokenizer_json = dir.join(TOKENIZER_FILE);
        let tokenizer = if tokenizer_json.is_file() {
            TokenizerFiles::Json(tokenizer_json)
        } else {
            TokenizerFiles::VocabMerges {
                vocab: require(dir.join(VOCAB_FILE))?,
                merges: require(dir.join(MERGES_FILE))?,
            }
        };

        Ok(Self {
            config,
            weights,
            tokenizer,
        })
    }

    fn from_hub(repo: &str) -> Result<Self, LoadError> {
        let hub_err = |source| LoadError::Hub {
            repo: repo.to_string(),
            source,
        };

        tracing::info!(repo, "model path is not a local directory, fetching from the hub");
        let api = Api::new().map_err(hub_err)?;
        let api = api.model(repo.to_string());

        Ok(Self {
            config: api.get(CONFIG_FILE).map_err(hub_err)?,
            weights: api.get(WEIGHTS_FILE).map_err(hub_err)?,
            tokenizer: TokenizerFiles::Json(api.get(TOKENIZER_FILE).map_err(hub_err)?),
        })
    }
}

fn require(path: PathBuf) -> Result<PathBuf, LoadError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(LoadError::MissingArtifact(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "shakespeare-artifacts-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_local_path_is_a_load_error() {
        let err = ModelArtifacts::resolve(Path::new("./outputs/does-not-exist")).unwrap_err();
        assert!(matches!(err, LoadError::MissingArtifact(_)));
    }

    #[test]
    fn directory_without_weights_is_rejected() {
        let dir = scratch_dir("no-weights");
        fs::write(dir.join(CONFIG_FILE), "{}").unwrap();

        match ModelArtifacts::from_dir(&dir) {
            Err(LoadError::MissingArtifact(path)) => assert!(path.ends_with(WEIGHTS_FILE)),
            other => panic!("unexpected: {other:?}"),
        }
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn falls_back_to_vocab_and_merges() {
        let dir = scratch_dir("slow-tokenizer");
        for file in [CONFIG_FILE, WEIGHTS_FILE, VOCAB_FILE, MERGES_FILE] {
            fs::write(dir.join(file), "").unwrap();
        }

        let artifacts = ModelArtifacts::from_dir(&dir).unwrap();
        assert_eq!(
            artifacts.tokenizer,
            TokenizerFiles::VocabMerges {
                vocab: dir.join(VOCAB_FILE),
                merges: dir.join(MERGES_FILE),
            }
        );

        fs::write(dir.join(TOKENIZER_FILE), "").unwrap();
        let artifacts = ModelArtifacts::from_dir(&dir).unwrap();
        assert_eq!(artifacts.tokenizer, TokenizerFiles::Json(dir.join(TOKENIZER_FILE)));
        fs::remove_dir_all(&dir).unwrap();
    }
}
