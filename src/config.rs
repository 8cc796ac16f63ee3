//! Run configuration shared by the binary and the training loops

use std::fmt::{self, Display};

use candle_core::Device;
use clap::ValueEnum;
use thiserror::Error;

/// Errors for run configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown device '{0}', expected cpu, cuda or cuda:<n>")]
    InvalidDevice(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Toggles between the models this crate can train
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum UseCase {
    Skipgram,
    Glove,
    Lm,
}

impl Display for UseCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UseCase::Skipgram => write!(f, "skipgram"),
            UseCase::Glove => write!(f, "glove"),
            UseCase::Lm => write!(f, "lm"),
        }
    }
}

/// Parses `cpu`, `cuda` or `cuda:<n>`.
///
/// CUDA requests fall back to the CPU when this build has no CUDA support.
pub fn parse_device(spec: &str) -> Result<Device, ConfigError> {
    let spec = spec.trim().to_lowercase();
    let ordinal = match spec.as_str() {
        "cpu" => return Ok(Device::Cpu),
        "cuda" => 0,
        other => other
            .strip_prefix("cuda:")
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| ConfigError::InvalidDevice(spec.clone()))?,
    };
    let device = Device::cuda_if_available(ordinal)?;
    if device.is_cpu() {
        log::warn!("CUDA device {ordinal} requested but not available, using the CPU");
    }
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert!(parse_device("cpu").unwrap().is_cpu());
        assert!(parse_device(" CPU ").unwrap().is_cpu());
        assert!(matches!(
            parse_device("tpu"),
            Err(ConfigError::InvalidDevice(d)) if d == "tpu"
        ));
        assert!(matches!(
            parse_device("cuda:x"),
            Err(ConfigError::InvalidDevice(_))
        ));
    }

    #[test]
    fn test_use_case_display() {
        assert_eq!(UseCase::Skipgram.to_string(), "skipgram");
        assert_eq!(UseCase::Glove.to_string(), "glove");
        assert_eq!(UseCase::Lm.to_string(), "lm");
    }
}
