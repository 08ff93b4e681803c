use candle_core::{DType, Device};

use crate::config::{DTypePreference, DevicePreference};
use crate::error::{EngineError, Result};

/// Resolve the compute device. `Auto` falls back to the CPU when no CUDA
/// device is usable.
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => Device::new_cuda(0).map_err(|e| EngineError::Initialization {
            message: "CUDA device requested but unavailable".to_string(),
            source: Some(Box::new(e)),
        }),
        DevicePreference::Auto => Ok(Device::cuda_if_available(0).unwrap_or(Device::Cpu)),
    }
}

/// Half precision on GPU, full precision on CPU unless forced
pub fn select_dtype(preference: DTypePreference, device: &Device) -> DType {
    match preference {
        DTypePreference::F32 => DType::F32,
        DTypePreference::F16 => DType::F16,
        DTypePreference::Bf16 => DType::BF16,
        DTypePreference::Auto if device.is_cuda() => DType::F16,
        DTypePreference::Auto => DType::F32,
    }
}
