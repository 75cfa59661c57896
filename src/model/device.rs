//! Compute device selection for ONNX Runtime sessions and candle tensors.

use std::fmt;
use std::str::FromStr;

use ort::execution_providers::{CUDAExecutionProvider, ExecutionProviderDispatch};
use thiserror::Error;

use crate::error::Error as CrateError;

/// Device string that is neither `cpu` nor `cuda[:N]`.
#[derive(Error, Debug)]
#[error("unknown device '{0}', expected cpu, cuda or cuda:N")]
pub struct ParseDeviceError(String);

/// Device the diffusion models run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Host CPU.
    Cpu,
    /// NVIDIA GPU with the given ordinal.
    Cuda(i32),
}

impl Default for Device {
    fn default() -> Self {
        Self::Cuda(0)
    }
}

impl Device {
    /// Execution providers to register on a session for this device.
    ///
    /// CUDA is registered with `error_on_failure`, so an unavailable GPU fails
    /// session creation instead of quietly running on the CPU.
    pub(crate) fn execution_providers(self) -> Vec<ExecutionProviderDispatch> {
        match self {
            Self::Cpu => Vec::new(),
            Self::Cuda(id) => vec![CUDAExecutionProvider::default()
                .with_device_id(id)
                .build()
                .error_on_failure()],
        }
    }

    /// The candle device for this selection. Fails when CUDA support is not
    /// compiled in or the GPU is absent, mirroring `error_on_failure` above.
    pub(crate) fn candle_device(self) -> crate::Result<candle_core::Device> {
        match self {
            Self::Cpu => Ok(candle_core::Device::Cpu),
            Self::Cuda(id) => {
                let ordinal = usize::try_from(id)
                    .map_err(|_| CrateError::invalid("device", format!("bad CUDA ordinal {id}")))?;
                Ok(candle_core::Device::new_cuda(ordinal)?)
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

impl FromStr for Device {
    type Err = ParseDeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            _ => lower
                .strip_prefix("cuda:")
                .and_then(|id| id.parse::<i32>().ok())
                .filter(|id| *id >= 0)
                .map(Self::Cuda)
                .ok_or_else(|| ParseDeviceError(s.to_string())),
        }
    }
}
