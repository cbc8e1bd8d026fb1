// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for environment-variable configuration.

use octowatch::config::{Config, JpegEncoderChoice};

#[test]
fn defaults_are_sane_with_no_environment_overrides() {
    // from_env reads live process env, so only assert invariants that hold
    // regardless of whatever OCTOWATCH_* vars happen to be set in CI.
    let config = Config::from_env();
    assert!(config.jpeg_quality <= 100);
    assert!(matches!(config.jpeg_encoder, JpegEncoderChoice::Hardware | JpegEncoderChoice::Cpu));
    assert!(config.thermal_semaphore_path.to_string_lossy().ends_with(".temperatureTooHigh"));
}
