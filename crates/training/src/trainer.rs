use std::{ops::RangeInclusive, path::PathBuf, sync::Arc};

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    checkpoint::CheckpointStore,
    context::{TrainingContext, WorkerRole},
    data::{Batch, DataPipeline, DialogueDataset},
    distributed::{ProcessGroup, ReplicatedModel},
    logging::MetricsLogger,
    loss::{CrossEntropyLoss, LossMetrics, LossOutput},
    masks::MaskSet,
    metrics::{EpochMetrics, EpochSummary},
    model::Seq2SeqModel,
    optimizer::OptimizationState,
    TrainingConfig, TrainingError,
};

/// Where a run started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Fresh,
    Resumed { epoch: usize },
}

impl RunState {
    /// Completed epochs before this run.
    pub fn start_epoch(self) -> usize {
        match self {
            RunState::Fresh => 0,
            RunState::Resumed { epoch } => epoch,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub run_state: RunState,
    pub epochs: Vec<EpochSummary>,
    /// Set on workers that write artifacts.
    pub export_path: Option<PathBuf>,
}

/// Epochs `start + 1 ..= start + epochs`.
pub fn epoch_range(start: usize, epochs: usize) -> RangeInclusive<usize> {
    start + 1..=start + epochs
}

pub fn should_checkpoint(batch_index: usize, interval: usize) -> bool {
    interval > 0 && batch_index % interval == 0
}

/// Drives one worker through its epochs.
pub struct TrainingLoop<M> {
    config: TrainingConfig,
    ctx: TrainingContext,
    pipeline: DataPipeline,
    model: ReplicatedModel<M>,
    optimization: OptimizationState,
    loss: CrossEntropyLoss,
    store: CheckpointStore,
    logger: MetricsLogger,
    pad_index: u32,
    global_step: usize,
}

impl<M: Seq2SeqModel> TrainingLoop<M> {
    pub fn new(
        config: TrainingConfig,
        ctx: TrainingContext,
        dataset: Arc<dyn DialogueDataset>,
        pad_index: u32,
        model: M,
        group: Option<ProcessGroup>,
    ) -> Result<Self, TrainingError> {
        check_group_matches_role(ctx.role(), group.as_ref())?;

        let model = ReplicatedModel::new(model, group.map(Arc::new))?;
        let optimization = OptimizationState::new(
            model.parameters().to_vec(),
            config.training.learning_rate,
            config.training.weight_decay,
            &ctx,
        )?;
        let pipeline = DataPipeline::new(
            dataset,
            config.training.batch_size,
            &ctx,
            config.training.seed,
            pad_index,
        )?;
        let store = CheckpointStore::new(&config.training.checkpoint_dir, &config.training.model_name);
        let logger = MetricsLogger::new(&ctx, config.training.tensorboard_dir.as_deref())?;

        Ok(Self {
            config,
            ctx,
            pipeline,
            model,
            optimization,
            loss: CrossEntropyLoss::new().with_ignore_index(Some(pad_index)),
            store,
            logger,
            pad_index,
            global_step: 0,
        })
    }

    pub fn model(&self) -> &ReplicatedModel<M> {
        &self.model
    }

    pub fn optimization(&self) -> &OptimizationState {
        &self.optimization
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn pipeline(&self) -> &DataPipeline {
        &self.pipeline
    }

    /// Runs every epoch, exports the final weights and tears the process
    /// group down. An error anywhere returns immediately without teardown.
    pub fn run(mut self) -> Result<TrainingReport, TrainingError> {
        let run_state = self.resume()?;
        let start = run_state.start_epoch();
        info!(
            rank = self.ctx.rank(),
            world_size = self.ctx.world_size(),
            parameters = self.model.parameter_count(),
            samples = self.pipeline.samples_per_worker(),
            batches = self.pipeline.num_batches(),
            "training epochs {} to {}",
            start + 1,
            start + self.config.training.epochs
        );

        let mut epochs = Vec::with_capacity(self.config.training.epochs);
        for epoch in epoch_range(start, self.config.training.epochs) {
            epochs.push(self.run_epoch(epoch)?);
        }

        let export_path = if self.writes_artifacts() {
            let path = self.store.export_final(self.model.parameters())?;
            info!(path = %path.display(), "final model exported");
            Some(path)
        } else {
            None
        };
        self.logger.flush();

        let (_, group) = self.model.into_parts();
        if let Some(group) = group {
            let group = Arc::try_unwrap(group)
                .map_err(|_| TrainingError::runtime("process group is still shared at teardown"))?;
            group.teardown()?;
        }

        Ok(TrainingReport {
            run_state,
            epochs,
            export_path,
        })
    }

    /// Restores model and optimization state when a checkpoint exists.
    pub fn resume(&mut self) -> Result<RunState, TrainingError> {
        if !self.store.exists() {
            debug!(directory = %self.store.checkpoint_dir().display(), "no checkpoint, starting fresh");
            return Ok(RunState::Fresh);
        }
        let checkpoint = self.store.load(self.ctx.device())?;
        let directory = checkpoint.directory.clone();
        let epoch = checkpoint.restore_into(self.model.parameters(), &mut self.optimization)?;
        self.global_step = self.optimization.scheduler().steps();
        info!(epoch, directory = %directory.display(), "resumed from checkpoint");
        Ok(RunState::Resumed { epoch })
    }

    fn run_epoch(&mut self, epoch: usize) -> Result<EpochSummary, TrainingError> {
        let batches = self.pipeline.batches(epoch);
        self.logger.start_epoch(epoch, batches.len());
        let mut metrics = EpochMetrics::new();

        for (batch_index, batch) in batches.enumerate() {
            let batch = batch?;
            let batch_metrics = self.train_batch(&batch)?;
            metrics.record(&batch_metrics);

            if should_checkpoint(batch_index, self.config.training.checkpoint_interval)
                && self.writes_artifacts()
            {
                let snapshot = self.optimization.snapshot()?;
                let path = self.store.save(self.model.parameters(), &snapshot, epoch)?;
                self.logger.log_checkpoint(&path, epoch, batch_index);
            }
        }

        let summary = metrics.summary(epoch);
        self.logger.finish_epoch(&summary);
        Ok(summary)
    }

    fn train_batch(&mut self, batch: &Batch) -> Result<LossMetrics, TrainingError> {
        let (decoder_input, expected) = batch.shift_labels()?;
        let masks = MaskSet::build(&batch.prompt, &decoder_input, self.pad_index)?;
        let logits = self.model.forward(
            &batch.prompt,
            &decoder_input,
            &masks,
            self.ctx.compute_dtype(),
        )?;

        let LossOutput { loss, metrics } = self.loss.compute(&logits, &expected)?;
        let outcome = self.optimization.step(&loss, &self.model)?;

        self.logger.log_batch(
            self.global_step,
            metrics.average_loss(),
            self.optimization.learning_rate(),
            outcome,
        );
        self.global_step += 1;
        Ok(metrics)
    }

    fn writes_artifacts(&self) -> bool {
        self.ctx.is_reporter() || self.config.training.save_on_all_ranks
    }
}

fn check_group_matches_role(
    role: WorkerRole,
    group: Option<&ProcessGroup>,
) -> Result<(), TrainingError> {
    match (role, group) {
        (WorkerRole::Single, None) => Ok(()),
        (WorkerRole::Single, Some(_)) => Err(TrainingError::initialization(
            "single-process run was given a process group",
        )),
        (WorkerRole::Distributed { .. }, None) => Err(TrainingError::initialization(
            "distributed worker has no process group",
        )),
        (WorkerRole::Distributed { rank, world_size }, Some(group)) => {
            if group.rank() == rank && group.world_size() == world_size {
                Ok(())
            } else {
                Err(TrainingError::initialization(format!(
                    "process group is rank {} of {}, worker expected rank {rank} of {world_size}",
                    group.rank(),
                    group.world_size()
                )))
            }
        }
    }
}
