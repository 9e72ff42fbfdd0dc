//! On-disk training state.
//!
//! ```text
//! <root>/<model_name>/checkpoint/{model.safetensors, optimizer.json, scheduler.json, scaler.json, manifest.json}
//! <root>/<model_name>/model.safetensors
//! ```
//!
//! Saves are staged in a sibling directory and renamed into place. The
//! previous checkpoint is parked under `checkpoint.previous-<pid>-<n>` for
//! the duration of the swap, and `load` falls back to it if a crash
//! interrupted the rename.
//!
//! Several ranks may save into one root. When another writer swaps its own
//! complete checkpoint in first, the slower save is dropped with a warning.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors, Device, Tensor, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    optimizer::{GradientScalerState, OptimizationSnapshot, OptimizationState, OptimizerState},
    scheduler::SchedulerState,
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_DIRNAME: &str = "checkpoint";
const STAGING_PREFIX: &str = "checkpoint.staging-";
const PREVIOUS_PREFIX: &str = "checkpoint.previous-";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";

// Retries when another writer parks the checkpoint between our failed
// rename and the manifest check.
const SWAP_ATTEMPTS: usize = 8;

static SAVE_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub model_name: String,
    pub created_unix_timestamp: u64,
    /// Number of completed epochs.
    pub epoch: usize,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: FileRecord,
    pub scaler: FileRecord,
}

/// Everything needed to resume a run, as read back from disk.
#[derive(Debug)]
pub struct Checkpoint {
    pub directory: PathBuf,
    pub model_state: HashMap<String, Tensor>,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: SchedulerState,
    pub scaler_state: Option<GradientScalerState>,
    pub epoch: usize,
}

impl Checkpoint {
    /// Loads weights into `parameters` and every optimization sub-state into
    /// `optimization`, returning the completed-epoch count.
    pub fn restore_into(
        self,
        parameters: &[(String, Var)],
        optimization: &mut OptimizationState,
    ) -> Result<usize, TrainingError> {
        let directory = self.directory;
        let corrupt = |err: TrainingError| TrainingError::corrupt(&directory, err.to_string());

        apply_model_state(parameters, self.model_state).map_err(corrupt)?;
        optimization
            .restore(OptimizationSnapshot {
                optimizer: self.optimizer_state,
                scheduler: self.scheduler_state,
                scaler: self.scaler_state,
            })
            .map_err(corrupt)?;
        Ok(self.epoch)
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    model_dir: PathBuf,
    model_name: String,
}

impl CheckpointStore {
    pub fn new(root: impl AsRef<Path>, model_name: &str) -> Self {
        Self {
            model_dir: root.as_ref().join(model_name),
            model_name: model_name.to_string(),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.model_dir.join(CHECKPOINT_DIRNAME)
    }

    pub fn final_model_path(&self) -> PathBuf {
        self.model_dir.join(MODEL_FILENAME)
    }

    pub fn exists(&self) -> bool {
        self.locate().is_some()
    }

    pub fn load(&self, device: &Device) -> Result<Checkpoint, TrainingError> {
        let directory = self.locate().ok_or_else(|| {
            TrainingError::corrupt(self.checkpoint_dir(), "no checkpoint manifest found")
        })?;
        let corrupt = |reason: String| TrainingError::corrupt(&directory, reason);

        let manifest: CheckpointManifest =
            read_json(&directory.join(MANIFEST_FILENAME)).map_err(corrupt)?;
        if manifest.version != CHECKPOINT_VERSION {
            return Err(corrupt(format!(
                "unsupported checkpoint version {} (expected {})",
                manifest.version, CHECKPOINT_VERSION
            )));
        }
        if manifest.model_name != self.model_name {
            return Err(corrupt(format!(
                "checkpoint belongs to model '{}', not '{}'",
                manifest.model_name, self.model_name
            )));
        }

        for record in [
            &manifest.model,
            &manifest.optimizer,
            &manifest.scheduler,
            &manifest.scaler,
        ] {
            validate_file(&directory, record).map_err(corrupt)?;
        }

        let model_state = safetensors::load(directory.join(&manifest.model.filename), device)
            .map_err(|err| corrupt(format!("unreadable model weights: {err}")))?;
        let optimizer_state = read_json(&directory.join(&manifest.optimizer.filename)).map_err(corrupt)?;
        let scheduler_state = read_json(&directory.join(&manifest.scheduler.filename)).map_err(corrupt)?;
        let scaler_state = read_json(&directory.join(&manifest.scaler.filename)).map_err(corrupt)?;

        debug!(directory = %directory.display(), epoch = manifest.epoch, "checkpoint loaded");
        Ok(Checkpoint {
            directory,
            model_state,
            optimizer_state,
            scheduler_state,
            scaler_state,
            epoch: manifest.epoch,
        })
    }

    /// Writes a complete checkpoint, replacing the previous one.
    pub fn save(
        &self,
        parameters: &[(String, Var)],
        snapshot: &OptimizationSnapshot,
        epoch: usize,
    ) -> Result<PathBuf, TrainingError> {
        create_dir_all(&self.model_dir)?;
        let suffix = format!(
            "{}-{}",
            process::id(),
            SAVE_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        );
        let staging = self.model_dir.join(format!("{STAGING_PREFIX}{suffix}"));
        if staging.exists() {
            remove_dir_all(&staging)?;
        }
        create_dir_all(&staging)?;

        let model_path = staging.join(MODEL_FILENAME);
        save_model_weights(parameters, &model_path)?;
        let optimizer_path = staging.join(OPTIMIZER_FILENAME);
        write_json(&optimizer_path, &snapshot.optimizer)?;
        let scheduler_path = staging.join(SCHEDULER_FILENAME);
        write_json(&scheduler_path, &snapshot.scheduler)?;
        let scaler_path = staging.join(SCALER_FILENAME);
        write_json(&scaler_path, &snapshot.scaler)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            model_name: self.model_name.clone(),
            created_unix_timestamp: unix_timestamp(),
            epoch,
            model: file_record(&model_path)?,
            optimizer: file_record(&optimizer_path)?,
            scheduler: file_record(&scheduler_path)?,
            scaler: file_record(&scaler_path)?,
        };
        write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;

        let target = self.checkpoint_dir();
        let previous = self.model_dir.join(format!("{PREVIOUS_PREFIX}{suffix}"));
        match fs::rename(&target, &previous) {
            Ok(()) => {}
            // first save, or another writer parked it a moment ago
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(move_error(&target, &previous, err)),
        }
        let mut attempt = 0;
        while let Err(err) = fs::rename(&staging, &target) {
            if target.join(MANIFEST_FILENAME).is_file() {
                warn!(
                    directory = %target.display(),
                    epoch,
                    "another writer replaced the checkpoint first: {err}"
                );
                if let Err(err) = fs::remove_dir_all(&staging) {
                    warn!(path = %staging.display(), "failed to remove staged checkpoint: {err}");
                }
                break;
            }
            attempt += 1;
            if attempt >= SWAP_ATTEMPTS {
                return Err(move_error(&staging, &target, err));
            }
        }
        if previous.exists() {
            if let Err(err) = fs::remove_dir_all(&previous) {
                warn!(path = %previous.display(), "failed to remove replaced checkpoint: {err}");
            }
        }

        debug!(directory = %target.display(), epoch, "checkpoint saved");
        Ok(target)
    }

    /// Writes the trained weights alone to `<root>/<model_name>/model.safetensors`.
    pub fn export_final(&self, parameters: &[(String, Var)]) -> Result<PathBuf, TrainingError> {
        create_dir_all(&self.model_dir)?;
        let target = self.final_model_path();
        let partial = self.model_dir.join(format!(
            "{MODEL_FILENAME}.partial-{}-{}",
            process::id(),
            SAVE_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        save_model_weights(parameters, &partial)?;
        rename(&partial, &target)?;
        Ok(target)
    }

    fn locate(&self) -> Option<PathBuf> {
        let primary = self.checkpoint_dir();
        if primary.join(MANIFEST_FILENAME).is_file() {
            return Some(primary);
        }
        let entries = fs::read_dir(&self.model_dir).ok()?;
        let mut parked: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(PREVIOUS_PREFIX)
            })
            .map(|entry| entry.path())
            .filter(|path| path.join(MANIFEST_FILENAME).is_file())
            .collect();
        parked.sort();
        parked.pop()
    }
}

/// Copies tensors from `state` into the matching parameters, casting dtype
/// where needed. Missing, extra or mis-shaped entries are errors.
pub fn apply_model_state(
    parameters: &[(String, Var)],
    mut state: HashMap<String, Tensor>,
) -> Result<(), TrainingError> {
    for (name, var) in parameters {
        let tensor = state.remove(name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "parameter {name} has shape {:?} in the checkpoint, model expects {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype)?
        };
        var.set(&tensor.to_device(var.as_tensor().device())?)?;
    }

    if !state.is_empty() {
        let mut extra = state.into_keys().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

fn save_model_weights(parameters: &[(String, Var)], path: &Path) -> Result<(), TrainingError> {
    if parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, Tensor> = parameters
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path).map_err(|err| {
        TrainingError::runtime(format!("failed to hash {}: {err}", path.display()))
    })?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn validate_file(directory: &Path, record: &FileRecord) -> Result<(), String> {
    if record.filename.contains(['/', '\\']) {
        return Err(format!("manifest names a file outside the checkpoint: {}", record.filename));
    }
    let path = directory.join(&record.filename);
    let actual = sha256_file(&path).map_err(|err| format!("cannot read {}: {err}", record.filename))?;
    if actual != record.sha256 {
        return Err(format!("{} failed checksum validation", record.filename));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, String> {
    let file = File::open(path).map_err(|err| format!("failed to open {}: {err}", path.display()))?;
    serde_json::from_reader(io::BufReader::new(file))
        .map_err(|err| format!("failed to parse {}: {err}", path.display()))
}

fn create_dir_all(path: &Path) -> Result<(), TrainingError> {
    fs::create_dir_all(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create directory {}: {err}", path.display()))
    })
}

fn remove_dir_all(path: &Path) -> Result<(), TrainingError> {
    fs::remove_dir_all(path).map_err(|err| {
        TrainingError::runtime(format!("failed to remove directory {}: {err}", path.display()))
    })
}

fn rename(from: &Path, to: &Path) -> Result<(), TrainingError> {
    fs::rename(from, to).map_err(|err| move_error(from, to, err))
}

fn move_error(from: &Path, to: &Path, err: io::Error) -> TrainingError {
    TrainingError::runtime(format!(
        "failed to move {} to {}: {err}",
        from.display(),
        to.display()
    ))
}

#[cfg(test)]
mod tests {
    use candle_core::DType;

    use super::*;
    use crate::{
        optimizer::{AdamConfig, GradientScaler, TrainerOptimizer},
        scheduler::{CosineWarmRestarts, LRScheduler},
    };

    fn parameters(offset: f32) -> Vec<(String, Var)> {
        vec![
            (
                "a.weight".to_string(),
                Var::new(&[[0.1f32 + offset, -0.2], [0.3, 1e-7]], &Device::Cpu).unwrap(),
            ),
            (
                "b.bias".to_string(),
                Var::new(&[f32::MIN_POSITIVE, 7.0 + offset], &Device::Cpu).unwrap(),
            ),
        ]
    }

    fn snapshot(params: &[(String, Var)]) -> OptimizationSnapshot {
        let optimizer =
            TrainerOptimizer::new(params.to_vec(), AdamConfig::new(0.01, 0.0)).unwrap();
        let mut scheduler = CosineWarmRestarts::new(0.01).unwrap();
        scheduler.step();
        scheduler.step();
        OptimizationSnapshot {
            optimizer: optimizer.state().unwrap(),
            scheduler: scheduler.state(),
            scaler: Some(GradientScaler::new().state()),
        }
    }

    fn values(params: &[(String, Var)]) -> Vec<Vec<u32>> {
        params
            .iter()
            .map(|(_, var)| {
                var.as_tensor()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap()
                    .into_iter()
                    .map(f32::to_bits)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn round_trips_every_part_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "chatbot");
        assert!(!store.exists());

        let params = parameters(0.0);
        let snap = snapshot(&params);
        let written = store.save(&params, &snap, 4).unwrap();
        assert_eq!(written, dir.path().join("chatbot").join("checkpoint"));
        assert!(store.exists());

        let checkpoint = store.load(&Device::Cpu).unwrap();
        assert_eq!(checkpoint.epoch, 4);
        assert_eq!(checkpoint.optimizer_state, snap.optimizer);
        assert_eq!(checkpoint.scheduler_state, snap.scheduler);
        assert_eq!(checkpoint.scaler_state, snap.scaler);

        let target = parameters(5.0);
        apply_model_state(&target, checkpoint.model_state).unwrap();
        assert_eq!(values(&target), values(&params));
    }

    #[test]
    fn second_save_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "chatbot");
        let params = parameters(0.0);
        let snap = snapshot(&params);
        store.save(&params, &snap, 1).unwrap();
        store.save(&params, &snap, 2).unwrap();

        assert_eq!(store.load(&Device::Cpu).unwrap().epoch, 2);
        let leftovers: Vec<String> = fs::read_dir(store.model_dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["checkpoint".to_string()]);
    }

    #[test]
    fn concurrent_writers_share_one_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "chatbot");

        let writers: Vec<_> = (0..2)
            .map(|writer| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let params = parameters(writer as f32);
                    let snap = snapshot(&params);
                    for epoch in 1..=50 {
                        store.save(&params, &snap, epoch).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let checkpoint = store.load(&Device::Cpu).unwrap();
        assert_eq!(checkpoint.epoch, 50);
        let leftovers: Vec<String> = fs::read_dir(store.model_dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["checkpoint".to_string()]);
    }

    #[test]
    fn tampered_file_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "chatbot");
        let params = parameters(0.0);
        store.save(&params, &snapshot(&params), 1).unwrap();

        let scheduler = store.checkpoint_dir().join(SCHEDULER_FILENAME);
        let mut contents = fs::read_to_string(&scheduler).unwrap();
        contents.push(' ');
        fs::write(&scheduler, contents).unwrap();

        let err = store.load(&Device::Cpu).unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointCorrupt { .. }), "{err}");
    }

    #[test]
    fn missing_file_and_bad_manifest_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "chatbot");
        let params = parameters(0.0);
        store.save(&params, &snapshot(&params), 1).unwrap();

        fs::remove_file(store.checkpoint_dir().join(SCALER_FILENAME)).unwrap();
        assert!(matches!(
            store.load(&Device::Cpu),
            Err(TrainingError::CheckpointCorrupt { .. })
        ));

        fs::write(store.checkpoint_dir().join(MANIFEST_FILENAME), b"{\"version\": 1}").unwrap();
        assert!(matches!(
            store.load(&Device::Cpu),
            Err(TrainingError::CheckpointCorrupt { .. })
        ));
    }

    #[test]
    fn falls_back_to_parked_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "chatbot");
        let params = parameters(0.0);
        store.save(&params, &snapshot(&params), 3).unwrap();

        let parked = store.model_dir().join(format!("{PREVIOUS_PREFIX}1234"));
        fs::rename(store.checkpoint_dir(), &parked).unwrap();
        assert!(store.exists());
        assert_eq!(store.load(&Device::Cpu).unwrap().epoch, 3);
    }

    #[test]
    fn restore_rejects_foreign_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "chatbot");
        let params = parameters(0.0);
        store.save(&params, &snapshot(&params), 1).unwrap();

        let other = vec![(
            "a.weight".to_string(),
            Var::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
        )];
        let err = apply_model_state(&other, store.load(&Device::Cpu).unwrap().model_state)
            .unwrap_err();
        assert!(err.to_string().contains("b.bias"));
    }

    #[test]
    fn export_writes_weights_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "chatbot");
        let params = parameters(0.0);
        let path = store.export_final(&params).unwrap();
        assert_eq!(path, dir.path().join("chatbot").join("model.safetensors"));
        assert!(!store.exists());

        let loaded = safetensors::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 2);
    }
}
