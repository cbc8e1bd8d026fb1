// SPDX-License-Identifier: GPL-3.0-only

//! Data model: stream configuration, frame request, DMA-backed buffer.
//!
//! Adapted from the teacher's `backends/camera/types.rs`, trimmed to the
//! two fixed YUV420 tiers this daemon supports instead of the teacher's
//! open-ended pixel-format/rotation/GPU-conversion surface.

use std::os::unix::io::RawFd;

use crate::constants::Tier;

/// `(width, height, stride, pixelFormat, colorSpace, frameByteSize)` for one
/// resolution tier. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub tier: Tier,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub frame_byte_size: usize,
}

impl StreamConfig {
    /// YUV420 planar: Y plane is `stride * height`, each chroma plane is
    /// `(stride/2) * (height/2)`.
    pub fn for_tier(tier: Tier) -> Self {
        let (width, height) = tier.dimensions();
        let stride = width;
        let y_size = (stride * height) as usize;
        let chroma_size = ((stride / 2) * (height / 2)) as usize;
        StreamConfig {
            tier,
            width,
            height,
            stride,
            frame_byte_size: y_size + 2 * chroma_size,
        }
    }
}

/// Kernel-allocated memory region identified by a file descriptor. Owned by
/// the camera pipeline for its full lifetime; encoders reference the fd but
/// never close it.
#[derive(Debug)]
pub struct DmaBuffer {
    pub fd: RawFd,
    pub length: usize,
    pub offset: usize,
}

/// Sensor/ISP metadata attached to a completed capture, reconstructed from
/// request metadata with a microsecond timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameMetadata {
    pub sensor_timestamp_ns: Option<i64>,
}

/// Which life-cycle state a pooled request is in. Exactly one holds at any
/// moment for a given request: idle pool, in-flight in the driver, or being
/// observed by the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    InFlight,
    Observed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_tier_frame_byte_size() {
        let cfg = StreamConfig::for_tier(Tier::High);
        assert_eq!(cfg.width, 1920);
        assert_eq!(cfg.height, 1080);
        // 1920*1080 + 2*(960*540) = 2073600 + 1036800 = 3110400
        assert_eq!(cfg.frame_byte_size, 3_110_400);
    }

    #[test]
    fn low_tier_frame_byte_size() {
        let cfg = StreamConfig::for_tier(Tier::Low);
        assert_eq!(cfg.width, 800);
        assert_eq!(cfg.height, 600);
        assert_eq!(cfg.frame_byte_size, 800 * 600 + 2 * (400 * 300));
    }
}
