use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use indicatif::{ProgressBar, ProgressStyle};
use prost::Message;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    context::TrainingContext, distributed::wire::masked_crc32, metrics::EpochSummary,
    optimizer::StepOutcome, TrainingError,
};

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{prefix}] [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";
const TENSORBOARD_FLUSH_EVERY: usize = 50;

/// Installs the global subscriber. The reporter logs at `info` (or whatever
/// `RUST_LOG` asks for); every other rank only reports errors.
///
/// Later calls are no-ops, so tests and in-process workers can share one
/// subscriber.
pub fn init_tracing(reporter: bool) {
    let filter = if reporter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new("error")
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// Human and TensorBoard facing training output. Only the reporter renders
/// anything; on other ranks every method is a no-op.
pub struct MetricsLogger {
    enabled: bool,
    progress: Option<ProgressBar>,
    tensorboard: Option<TensorBoardWriter>,
}

impl MetricsLogger {
    pub fn new(ctx: &TrainingContext, tensorboard_dir: Option<&Path>) -> Result<Self, TrainingError> {
        if !ctx.is_reporter() {
            return Ok(Self::disabled());
        }
        let tensorboard = match tensorboard_dir {
            Some(dir) => Some(TensorBoardWriter::create(dir, TENSORBOARD_FLUSH_EVERY)?),
            None => None,
        };
        Ok(Self {
            enabled: true,
            progress: None,
            tensorboard,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            progress: None,
            tensorboard: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn start_epoch(&mut self, epoch: usize, batches: usize) {
        if !self.enabled {
            return;
        }
        let bar = ProgressBar::new(batches as u64);
        match ProgressStyle::with_template(PROGRESS_TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(err) => warn!("invalid progress template: {err}"),
        }
        bar.set_prefix(format!("epoch {epoch}"));
        self.progress = Some(bar);
    }

    pub fn log_batch(&mut self, global_step: usize, loss: f32, learning_rate: f64, outcome: StepOutcome) {
        if !self.enabled {
            return;
        }
        if let Some(bar) = self.progress.as_ref() {
            bar.set_message(format!("loss {loss:.4} lr {learning_rate:.3e}"));
            bar.inc(1);
        }
        if let StepOutcome::Skipped { loss_scale } = outcome {
            info!(step = global_step, loss_scale, "non-finite gradients, update skipped");
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            let step = global_step as i64;
            let mut result = writer.write_scalar("train/loss", step, loss as f64);
            result = result.and_then(|_| writer.write_scalar("train/learning_rate", step, learning_rate));
            if let StepOutcome::Skipped { loss_scale } = outcome {
                result = result.and_then(|_| writer.write_scalar("train/loss_scale", step, loss_scale as f64));
            }
            if let Err(err) = result {
                warn!("{err}");
            }
        }
    }

    pub fn log_checkpoint(&self, path: &Path, epoch: usize, batch_index: usize) {
        if self.enabled {
            info!(epoch, batch = batch_index, path = %path.display(), "checkpoint saved");
        }
    }

    pub fn finish_epoch(&mut self, summary: &EpochSummary) {
        if !self.enabled {
            return;
        }
        if let Some(bar) = self.progress.take() {
            bar.finish_and_clear();
        }
        info!(
            epoch = summary.epoch,
            batches = summary.batches,
            "epoch {} loss {:.4} accuracy {:.2}%",
            summary.epoch,
            summary.average_loss,
            summary.accuracy * 100.0
        );
        if let Some(writer) = self.tensorboard.as_mut() {
            let step = summary.epoch as i64;
            let result = writer
                .write_scalar("epoch/loss", step, summary.average_loss)
                .and_then(|_| writer.write_scalar("epoch/accuracy", step, summary.accuracy));
            if let Err(err) = result {
                warn!("{err}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                warn!("{err}");
            }
        }
    }
}

struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    // TFRecord framing: len u64 | masked crc(len) | data | masked crc(data)
    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to write tensorboard event to {}: {err}",
                    self.path.display()
                ))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
