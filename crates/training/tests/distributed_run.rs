use std::{
    net::TcpListener,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use anyhow::Result;
use candle_core::{safetensors, Device};
use dialogue_training::{
    data::PairDataset, CheckpointStore, DialogueDataset, PooledContextConfig, PooledContextModel,
    ProcessGroup, TrainingConfig, TrainingContext, TrainingLoop, TrainingReport, WorkerRole,
};

const WORLD_SIZE: usize = 2;
const PAD: u32 = 0;

fn free_addr() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.to_string())
}

fn config(addr: &str, checkpoint_dir: &Path) -> Result<TrainingConfig> {
    Ok(serde_json::from_value(serde_json::json!({
        "training": {
            "model_name": "chatbot",
            "epochs": 2,
            "batch_size": 2,
            "learning_rate": 0.01,
            "checkpoint_interval": 1,
            "world_size": WORLD_SIZE,
            "rendezvous_addr": addr,
            "checkpoint_dir": checkpoint_dir,
            "save_on_all_ranks": true,
            "seed": 7
        },
        "model": { "max_seq_len": 16, "embed_dim": 8 }
    }))?)
}

fn dataset() -> Arc<dyn DialogueDataset> {
    Arc::new(PairDataset::new(vec![
        (vec![4, 5, 0, 0], vec![1, 9, 2, 0]),
        (vec![6, 7, 8, 0], vec![1, 10, 2, 0]),
        (vec![4, 8, 0, 0], vec![1, 9, 10, 2]),
        (vec![11, 0, 0, 0], vec![1, 11, 2, 0]),
        (vec![6, 5, 4, 0], vec![1, 10, 9, 2]),
        (vec![7, 7, 0, 0], vec![1, 4, 2, 0]),
        (vec![9, 10, 0, 0], vec![1, 5, 6, 2]),
    ]))
}

fn worker(rank: usize, config: TrainingConfig) -> Result<TrainingReport> {
    let ctx = TrainingContext::cpu(WorkerRole::Distributed {
        rank,
        world_size: WORLD_SIZE,
    });
    let group = ProcessGroup::setup(rank, WORLD_SIZE, &config.training.rendezvous_addr)?;
    // each rank draws its own initial weights; construction syncs them
    let model = PooledContextModel::new(
        PooledContextConfig {
            vocab_size: 12,
            max_positions: config.model.max_seq_len,
            embed_dim: config.model.embed_dim,
            init_std: 0.5,
        },
        &Device::Cpu,
    )?;
    Ok(TrainingLoop::new(config, ctx, dataset(), PAD, model, Some(group))?.run()?)
}

fn run_ranks(addr: &str, checkpoint_dir: impl Fn(usize) -> PathBuf) -> Result<Vec<TrainingReport>> {
    let handles: Vec<_> = (0..WORLD_SIZE)
        .map(|rank| {
            let config = config(addr, &checkpoint_dir(rank));
            thread::spawn(move || worker(rank, config?))
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("worker thread panicked"))
        .collect()
}

#[test]
fn replicas_finish_with_identical_weights() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = free_addr()?;
    let reports = run_ranks(&addr, |rank| dir.path().join(format!("rank{rank}")))?;

    for report in &reports {
        // seven samples over two ranks: four each, two batches
        assert!(report.epochs.iter().all(|summary| summary.batches == 2));
        assert_eq!(report.epochs.len(), 2);
    }

    let weights = reports
        .iter()
        .map(|report| {
            let path = report.export_path.as_ref().expect("every rank exports");
            Ok(safetensors::load(path, &Device::Cpu)?)
        })
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(weights[0].len(), weights[1].len());
    for (name, tensor) in &weights[0] {
        let left: Vec<u32> = tensor
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(f32::to_bits)
            .collect();
        let right: Vec<u32> = weights[1][name]
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(f32::to_bits)
            .collect();
        assert_eq!(left, right, "parameter {name} diverged");
    }
    Ok(())
}

#[test]
fn ranks_sharing_a_checkpoint_root_both_finish() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = free_addr()?;
    // every batch checkpoints on both ranks into the same directory
    let reports = run_ranks(&addr, |_| dir.path().to_path_buf())?;
    assert_eq!(reports.len(), WORLD_SIZE);

    let store = CheckpointStore::new(dir.path(), "chatbot");
    assert_eq!(store.load(&Device::Cpu)?.epoch, 2);
    assert!(store.final_model_path().is_file());
    Ok(())
}
