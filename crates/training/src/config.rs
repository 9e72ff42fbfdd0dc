use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::SequenceCaps;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    pub training: TrainingSection,
    pub model: ModelSection,
    #[serde(default)]
    pub data: DataConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let config = Self::from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        let training = &self.training;

        if training.model_name.trim().is_empty() {
            errors.push("training.model_name must not be empty".to_string());
        } else if training
            .model_name
            .chars()
            .any(|c| std::path::is_separator(c) || c == '.')
        {
            errors.push(format!(
                "training.model_name '{}' must not contain path separators or dots",
                training.model_name
            ));
        }

        if training.epochs == 0 {
            errors.push("training.epochs must be greater than 0".to_string());
        }

        if training.batch_size == 0 {
            errors.push("training.batch_size must be greater than 0".to_string());
        }

        if !(training.learning_rate.is_finite() && training.learning_rate > 0.0) {
            errors.push("training.learning_rate must be greater than 0".to_string());
        }

        if !(training.weight_decay.is_finite() && training.weight_decay >= 0.0) {
            errors.push("training.weight_decay must be >= 0".to_string());
        }

        if training.checkpoint_interval == 0 {
            errors.push("training.checkpoint_interval must be greater than 0".to_string());
        }

        if let Some(0) = training.world_size {
            errors.push("training.world_size must be greater than 0".to_string());
        }

        if !training.rendezvous_addr.contains(':') {
            errors.push(format!(
                "training.rendezvous_addr '{}' must be a host:port pair",
                training.rendezvous_addr
            ));
        }

        if training.checkpoint_dir.as_os_str().is_empty() {
            errors.push("training.checkpoint_dir must not be empty".to_string());
        }

        if self.model.max_seq_len < MIN_MAX_SEQ_LEN {
            errors.push(format!(
                "model.max_seq_len must be at least {} so replies keep two tokens (got {})",
                MIN_MAX_SEQ_LEN, self.model.max_seq_len
            ));
        }

        if self.model.embed_dim == 0 {
            errors.push("model.embed_dim must be greater than 0".to_string());
        }

        if !(self.model.init_std.is_finite() && self.model.init_std > 0.0) {
            errors.push("model.init_std must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Length caps handed to the dataset: replies get a quarter of the window,
    /// prompts the whole of it.
    pub fn sequence_caps(&self) -> SequenceCaps {
        SequenceCaps::from_max_seq_len(self.model.max_seq_len)
    }

    pub fn max_sentence_length(&self) -> usize {
        self.sequence_caps().max_sentence_length
    }

    pub fn max_passage_length(&self) -> usize {
        self.sequence_caps().max_passage_length
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.training.checkpoint_dir, base);
        if let Some(dir) = self.training.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
        self.data.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingSection {
    pub model_name: String,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    pub checkpoint_interval: usize,
    #[serde(default)]
    pub device: DeviceKind,
    /// Number of worker processes. Unset means a single process without a
    /// process group.
    #[serde(default)]
    pub world_size: Option<usize>,
    #[serde(default = "default_rendezvous_addr")]
    pub rendezvous_addr: String,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    /// Every rank writes the shared checkpoint when set. Saves from several
    /// ranks are not mutually excluded.
    #[serde(default)]
    pub save_on_all_ranks: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSection {
    pub max_seq_len: usize,
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,
    #[serde(default = "default_init_std")]
    pub init_std: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    /// JSONL file of `{"prompt": ..., "reply": ...}` records.
    #[serde(default)]
    pub corpus: Option<PathBuf>,
    /// HuggingFace `tokenizer.json`.
    #[serde(default)]
    pub tokenizer: Option<PathBuf>,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [self.corpus.as_mut(), self.tokenizer.as_mut()]
            .into_iter()
            .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

const MIN_MAX_SEQ_LEN: usize = 8;

fn default_rendezvous_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_seed() -> u64 {
    0
}

fn default_embed_dim() -> usize {
    256
}

fn default_init_std() -> f64 {
    0.02
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("rendezvous failed: {0}")]
    Rendezvous(String),
    #[error("checkpoint at {} is corrupt: {reason}", .path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn rendezvous(message: impl Into<String>) -> Self {
        Self::Rendezvous(message.into())
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
