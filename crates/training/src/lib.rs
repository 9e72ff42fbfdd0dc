pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod distributed;
pub mod launcher;
pub mod logging;
pub mod loss;
pub mod masks;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{DeviceKind, TrainingConfig, TrainingError};
pub use context::{is_main_process, TrainingContext, WorkerRole};
pub use data::{Batch, DataPipeline, DialogueDataset, SequenceCaps, Vocabulary};
pub use distributed::{ProcessGroup, ReplicatedModel};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use masks::MaskSet;
pub use metrics::{EpochMetrics, EpochSummary};
pub use model::{PooledContextConfig, PooledContextModel, Seq2SeqModel};
pub use optimizer::{OptimizationState, PrecisionPolicy, TrainerOptimizer};
pub use scheduler::{CosineWarmRestarts, LRScheduler};
pub use trainer::{RunState, TrainingLoop, TrainingReport};
