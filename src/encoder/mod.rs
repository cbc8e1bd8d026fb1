// SPDX-License-Identifier: GPL-3.0-only

//! Encoder subsystem: the shared hardware M2M state machine, the CPU JPEG
//! fallback, and the worker-loop building block both depend on.

pub mod cpu_jpeg;
pub mod hardware;
pub mod loop_controller;

pub use cpu_jpeg::CpuJpegEncoder;
pub use hardware::{EncodedPayload, EncoderKind, HardwareEncoder, HardwareEncoderConfig};
pub use loop_controller::{EncoderRole, LoopStep, WorkerLoop};

/// Shared contract both encoder implementations satisfy, per spec.md's
/// "polymorphism over encoder kind": a source buffer in, an encoded payload
/// out via callback. The hardware and CPU encoders differ in how they get
/// there, not in this shape.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, dma_fd: std::os::unix::io::RawFd, plane_length: usize, plane_offset: usize, timestamp_micros: i64);
}

impl FrameEncoder for HardwareEncoder {
    fn encode(&self, dma_fd: std::os::unix::io::RawFd, plane_length: usize, plane_offset: usize, timestamp_micros: i64) {
        HardwareEncoder::encode(self, dma_fd, plane_length, plane_offset, timestamp_micros)
    }
}

impl FrameEncoder for CpuJpegEncoder {
    fn encode(&self, dma_fd: std::os::unix::io::RawFd, plane_length: usize, plane_offset: usize, timestamp_micros: i64) {
        CpuJpegEncoder::encode(self, dma_fd, plane_length, plane_offset, timestamp_micros)
    }
}
