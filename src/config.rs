// SPDX-License-Identifier: GPL-3.0-only

//! Environment-variable configuration.
//!
//! No persistence, no config file: everything is read once from `std::env`
//! at startup and never mutated afterward, matching the process-wide,
//! read-once-at-init posture the teacher uses for its own global log level.

use std::path::PathBuf;

use tracing::warn;

/// Which implementation serves the low-resolution JPEG path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpegEncoderChoice {
    Hardware,
    Cpu,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `tracing_subscriber::EnvFilter` directive derived from `OCTOWATCH_LOG_LEVEL`.
    pub log_filter: &'static str,
    /// `OCTOWATCH_JPEG_QUALITY`, clamped to `[0, 100]`; defaults to 95.
    pub jpeg_quality: u8,
    /// `OCTOWATCH_JPEG_ENCODER`.
    pub jpeg_encoder: JpegEncoderChoice,
    /// Thermal semaphore file path, from `HOME` or the hardcoded fallback.
    pub thermal_semaphore_path: PathBuf,
}

impl Config {
    /// Assemble configuration from the process environment. Never fails:
    /// every malformed value is logged and replaced with its default.
    pub fn from_env() -> Self {
        Config {
            log_filter: log_filter_from_env(std::env::var("OCTOWATCH_LOG_LEVEL").ok().as_deref()),
            jpeg_quality: jpeg_quality_from_env(std::env::var("OCTOWATCH_JPEG_QUALITY").ok()),
            jpeg_encoder: jpeg_encoder_from_env(std::env::var("OCTOWATCH_JPEG_ENCODER").ok()),
            thermal_semaphore_path: thermal_semaphore_path(std::env::var("HOME").ok()),
        }
    }
}

fn log_filter_from_env(value: Option<&str>) -> &'static str {
    match value {
        Some("DEBUG") => "debug",
        Some("INFO") => "info",
        Some("WARNING") => "warn",
        Some("ERROR") => "error",
        Some("OFF") => "off",
        Some(other) => {
            warn!(value = other, "unrecognized OCTOWATCH_LOG_LEVEL, defaulting to INFO");
            "info"
        }
        None => "info",
    }
}

fn jpeg_quality_from_env(value: Option<String>) -> u8 {
    match value {
        None => crate::constants::DEFAULT_JPEG_QUALITY,
        Some(raw) => match raw.parse::<i64>() {
            Ok(q) if (0..=100).contains(&q) => q as u8,
            _ => {
                warn!(
                    raw,
                    "invalid OCTOWATCH_JPEG_QUALITY, defaulting to {}",
                    crate::constants::DEFAULT_JPEG_QUALITY
                );
                crate::constants::DEFAULT_JPEG_QUALITY
            }
        },
    }
}

fn jpeg_encoder_from_env(value: Option<String>) -> JpegEncoderChoice {
    match value.as_deref() {
        Some("CPU") => JpegEncoderChoice::Cpu,
        _ => JpegEncoderChoice::Hardware,
    }
}

fn thermal_semaphore_path(home: Option<String>) -> PathBuf {
    match home {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".temperatureTooHigh"),
        _ => PathBuf::from("/home/tux/.temperatureTooHigh"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_maps_known_levels() {
        assert_eq!(log_filter_from_env(Some("DEBUG")), "debug");
        assert_eq!(log_filter_from_env(Some("WARNING")), "warn");
        assert_eq!(log_filter_from_env(Some("OFF")), "off");
        assert_eq!(log_filter_from_env(None), "info");
        assert_eq!(log_filter_from_env(Some("bogus")), "info");
    }

    #[test]
    fn jpeg_quality_defaults_on_garbage() {
        assert_eq!(jpeg_quality_from_env(Some("abc".into())), 95);
        assert_eq!(jpeg_quality_from_env(Some("250".into())), 95);
        assert_eq!(jpeg_quality_from_env(Some("-1".into())), 95);
        assert_eq!(jpeg_quality_from_env(Some("42".into())), 42);
        assert_eq!(jpeg_quality_from_env(None), 95);
    }

    #[test]
    fn jpeg_encoder_selects_cpu_only_on_exact_match() {
        assert_eq!(jpeg_encoder_from_env(Some("CPU".into())), JpegEncoderChoice::Cpu);
        assert_eq!(
            jpeg_encoder_from_env(Some("cpu".into())),
            JpegEncoderChoice::Hardware
        );
        assert_eq!(jpeg_encoder_from_env(None), JpegEncoderChoice::Hardware);
    }

    #[test]
    fn thermal_path_uses_home_or_fallback() {
        assert_eq!(
            thermal_semaphore_path(Some("/home/alice".into())),
            PathBuf::from("/home/alice/.temperatureTooHigh")
        );
        assert_eq!(
            thermal_semaphore_path(None),
            PathBuf::from("/home/tux/.temperatureTooHigh")
        );
        assert_eq!(
            thermal_semaphore_path(Some(String::new())),
            PathBuf::from("/home/tux/.temperatureTooHigh")
        );
    }
}
