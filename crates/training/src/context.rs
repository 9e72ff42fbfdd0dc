use candle_core::{DType, Device};

use crate::{config::DeviceKind, TrainingError};

/// Where this process sits in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Single,
    Distributed { rank: usize, world_size: usize },
}

impl WorkerRole {
    /// Rank as the launcher reports it, `-1` outside a process group.
    pub fn rank(self) -> i64 {
        match self {
            WorkerRole::Single => -1,
            WorkerRole::Distributed { rank, .. } => rank as i64,
        }
    }

    pub fn world_size(self) -> i64 {
        match self {
            WorkerRole::Single => -1,
            WorkerRole::Distributed { world_size, .. } => world_size as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionKind {
    /// Half-precision forward with a dynamic loss scaler.
    Scaled,
    Unscaled,
}

/// Per-worker run state handed to every component constructor.
#[derive(Debug, Clone)]
pub struct TrainingContext {
    role: WorkerRole,
    device: Device,
    precision: PrecisionKind,
}

impl TrainingContext {
    pub fn new(role: WorkerRole, device: DeviceKind) -> Result<Self, TrainingError> {
        let (device, precision) = match device {
            DeviceKind::Cpu => (Device::Cpu, PrecisionKind::Unscaled),
            DeviceKind::Cuda => {
                let ordinal = match role {
                    WorkerRole::Single => 0,
                    WorkerRole::Distributed { rank, .. } => rank,
                };
                let device = Device::new_cuda(ordinal).map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to open cuda device {ordinal}: {err}"
                    ))
                })?;
                (device, PrecisionKind::Scaled)
            }
        };

        if let WorkerRole::Distributed { rank, world_size } = role {
            if world_size == 0 || rank >= world_size {
                return Err(TrainingError::initialization(format!(
                    "rank {rank} is outside a world of size {world_size}"
                )));
            }
        }

        Ok(Self {
            role,
            device,
            precision,
        })
    }

    pub fn cpu(role: WorkerRole) -> Self {
        Self {
            role,
            device: Device::Cpu,
            precision: PrecisionKind::Unscaled,
        }
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn precision(&self) -> PrecisionKind {
        self.precision
    }

    pub fn rank(&self) -> i64 {
        self.role.rank()
    }

    pub fn world_size(&self) -> i64 {
        self.role.world_size()
    }

    pub fn is_reporter(&self) -> bool {
        is_main_process(self.rank(), self.world_size())
    }

    pub fn compute_dtype(&self) -> DType {
        match self.precision {
            PrecisionKind::Scaled => DType::F16,
            PrecisionKind::Unscaled => DType::F32,
        }
    }
}

/// True for the single process of a non-distributed run, or for rank 0 of a
/// distributed one.
pub fn is_main_process(rank: i64, world_size: i64) -> bool {
    (rank == -1 && world_size == -1) || (rank == 0 && world_size > 0)
}
