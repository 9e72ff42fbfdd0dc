//! Process fan-out. `launch` either trains in the current process or spawns
//! one `worker` child per rank, handing each its own copy of the resolved
//! configuration as JSON on stdin.

use std::{
    env,
    io::{Read, Write},
    process::{Child, Command, Stdio},
    sync::Arc,
};

use tracing::{error, info};

use crate::{
    context::{TrainingContext, WorkerRole},
    data::{JsonlDialogueCorpus, TokenizerVocabulary, Vocabulary},
    distributed::ProcessGroup,
    logging,
    model::{PooledContextConfig, PooledContextModel},
    trainer::{TrainingLoop, TrainingReport},
    TrainingConfig, TrainingError,
};

/// Hidden subcommand the launcher re-executes the binary with.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Trains with `config`. A world size above one fans out to child processes
/// and fails if any of them exits unsuccessfully.
pub fn launch(config: &TrainingConfig) -> Result<(), TrainingError> {
    config.validate()?;
    require_data(config)?;
    match config.training.world_size {
        None | Some(1) => {
            run_worker(config.clone(), WorkerRole::Single)?;
            Ok(())
        }
        Some(world_size) => {
            logging::init_tracing(true);
            spawn_workers(config, world_size)
        }
    }
}

fn spawn_workers(config: &TrainingConfig, world_size: usize) -> Result<(), TrainingError> {
    let exe = env::current_exe()?;
    let payload = serde_json::to_vec(config)?;
    info!(world_size, addr = %config.training.rendezvous_addr, "spawning workers");

    let mut children: Vec<(usize, Child)> = Vec::with_capacity(world_size);
    for rank in 0..world_size {
        let spawned = Command::new(&exe)
            .arg(WORKER_SUBCOMMAND)
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--world-size")
            .arg(world_size.to_string())
            .stdin(Stdio::piped())
            .spawn()
            .and_then(|mut child| {
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(&payload)?;
                }
                Ok(child)
            });
        match spawned {
            Ok(child) => children.push((rank, child)),
            Err(err) => {
                for (_, mut child) in children {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                return Err(TrainingError::initialization(format!(
                    "failed to start worker {rank}: {err}"
                )));
            }
        }
    }

    let mut failures = Vec::new();
    for (rank, mut child) in children {
        let status = child.wait()?;
        if !status.success() {
            error!(rank, %status, "worker failed");
            failures.push(format!("worker {rank} exited with {status}"));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(TrainingError::runtime(failures.join("; ")))
    }
}

/// Reads the configuration a launcher piped to this worker.
pub fn read_worker_config(mut reader: impl Read) -> Result<TrainingConfig, TrainingError> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;
    let config: TrainingConfig = serde_json::from_slice(&raw)?;
    config.validate()?;
    Ok(config)
}

/// Builds every component for one worker and runs it to completion.
pub fn run_worker(config: TrainingConfig, role: WorkerRole) -> Result<TrainingReport, TrainingError> {
    let ctx = TrainingContext::new(role, config.training.device)?;
    logging::init_tracing(ctx.is_reporter());
    let (corpus, tokenizer) = require_data(&config)?;

    let vocabulary = TokenizerVocabulary::from_file(tokenizer)?;
    let dataset = JsonlDialogueCorpus::load(corpus, &vocabulary, config.sequence_caps())?;
    let model = PooledContextModel::new(
        PooledContextConfig {
            vocab_size: vocabulary.size(),
            max_positions: config.max_passage_length(),
            embed_dim: config.model.embed_dim,
            init_std: config.model.init_std,
        },
        ctx.device(),
    )?;

    let group = match role {
        WorkerRole::Single => None,
        WorkerRole::Distributed { rank, world_size } => Some(ProcessGroup::setup(
            rank,
            world_size,
            &config.training.rendezvous_addr,
        )?),
    };

    let pad_index = vocabulary.padding_index();
    TrainingLoop::new(config, ctx, Arc::new(dataset), pad_index, model, group)?.run()
}

fn require_data(
    config: &TrainingConfig,
) -> Result<(&std::path::Path, &std::path::Path), TrainingError> {
    let corpus = config
        .data
        .corpus
        .as_deref()
        .ok_or_else(|| TrainingError::initialization("data.corpus must point at a JSONL corpus"))?;
    let tokenizer = config.data.tokenizer.as_deref().ok_or_else(|| {
        TrainingError::initialization("data.tokenizer must point at a tokenizer.json")
    })?;
    Ok((corpus, tokenizer))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{config::tests::sample_config, data::corpus::tests::write_tokenizer, trainer::RunState};

    #[test]
    fn worker_config_round_trips_through_json() {
        let mut config = sample_config();
        config.training.world_size = Some(3);
        config.training.seed = 17;
        let payload = serde_json::to_vec(&config).unwrap();

        let decoded = read_worker_config(payload.as_slice()).unwrap();
        assert_eq!(decoded.training.world_size, Some(3));
        assert_eq!(decoded.training.seed, 17);
        assert_eq!(decoded.model.max_seq_len, config.model.max_seq_len);
    }

    #[test]
    fn worker_rejects_invalid_config() {
        let mut config = sample_config();
        config.training.epochs = 0;
        let payload = serde_json::to_vec(&config).unwrap();
        assert!(matches!(
            read_worker_config(payload.as_slice()),
            Err(TrainingError::Validation(_))
        ));
        assert!(matches!(
            read_worker_config(&b"not json"[..]),
            Err(TrainingError::ConfigFormat(_))
        ));
    }

    #[test]
    fn launch_requires_corpus_and_tokenizer() {
        let err = launch(&sample_config()).unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)), "{err}");
    }

    #[test]
    fn single_worker_trains_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = write_tokenizer(dir.path());
        let corpus = dir.path().join("dialogue.jsonl");
        fs::write(
            &corpus,
            concat!(
                "{\"prompt\": \"hello there\", \"reply\": \"hello\"}\n",
                "\n",
                "{\"prompt\": \"how are you\", \"reply\": \"fine thanks\"}\n",
                "{\"prompt\": \"bye\", \"reply\": \"bye\"}\n",
            ),
        )
        .unwrap();

        let mut config = sample_config();
        config.training.epochs = 1;
        config.training.checkpoint_dir = dir.path().join("checkpoints");
        config.data.corpus = Some(corpus);
        config.data.tokenizer = Some(tokenizer);

        let report = run_worker(config, WorkerRole::Single).unwrap();
        assert_eq!(report.run_state, RunState::Fresh);
        assert_eq!(report.epochs.len(), 1);
        assert_eq!(report.epochs[0].batches, 1);
        assert!(dir
            .path()
            .join("checkpoints/chatbot/model.safetensors")
            .is_file());
    }
}
