// SPDX-License-Identifier: GPL-3.0-only

//! Pure-software YUV420 -> JPEG fallback, used when `OCTOWATCH_JPEG_ENCODER`
//! is not `CPU`'s hardware counterpart (§4.4) but the environment still asks
//! for software encoding, or when the hardware JPEG device is unavailable.
//!
//! Grounded on the `image` crate's `JpegEncoder`, the same crate the
//! `other_examples` MJPEG stream example (`paxswill/r-u-still-there`) uses
//! for on-the-fly JPEG encoding. Runs single-threaded: one `encode()` call
//! does the full YUV420->RGB conversion and JPEG compression inline on the
//! caller's thread rather than spawning poll/deliver workers.

use std::os::unix::io::RawFd;

use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::{ImageBuffer, Rgb};
use tracing::warn;

use crate::camera::types::StreamConfig;

pub struct CpuJpegEncoder {
    config: StreamConfig,
    quality: u8,
    on_payload: Box<dyn Fn(&[u8], i64) + Send + Sync>,
}

impl CpuJpegEncoder {
    pub fn new(config: StreamConfig, quality: u8, on_payload: impl Fn(&[u8], i64) + Send + Sync + 'static) -> Self {
        CpuJpegEncoder { config, quality, on_payload: Box::new(on_payload) }
    }

    /// Maps `dma_fd` read-only, converts the YUV420 plane to RGB, and
    /// compresses it to JPEG. Unlike the hardware encoder, there is no input
    /// slot to exhaust: a slow JPEG compression simply delays this call's
    /// return, backing up whichever thread drives the MJPEG adapter.
    pub fn encode(&self, dma_fd: RawFd, plane_length: usize, plane_offset: usize, timestamp_micros: i64) {
        let yuv = match map_plane(dma_fd, plane_length, plane_offset) {
            Some(bytes) => bytes,
            None => {
                warn!("cpu jpeg encoder: failed to map source plane");
                return;
            }
        };

        let rgb = yuv420_to_rgb(&yuv, self.config.width, self.config.height, self.config.stride);

        let mut jpeg_bytes = Vec::new();
        let mut encoder = ImageJpegEncoder::new_with_quality(&mut jpeg_bytes, self.quality);
        if let Err(e) = encoder.encode_image(&rgb) {
            warn!(error = %e, "cpu jpeg encoder: compression failed");
            return;
        }

        (self.on_payload)(&jpeg_bytes, timestamp_micros);
    }
}

fn map_plane(fd: RawFd, length: usize, offset: usize) -> Option<Vec<u8>> {
    let ptr = unsafe {
        libc::mmap(std::ptr::null_mut(), length, libc::PROT_READ, libc::MAP_SHARED, fd, offset as libc::off_t)
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    let slice = unsafe { std::slice::from_raw_parts(ptr as *const u8, length) };
    let owned = slice.to_vec();
    unsafe {
        libc::munmap(ptr, length);
    }
    Some(owned)
}

/// BT.601 full-range YUV420 planar -> RGB8, matching the conversion the
/// original `CpuJpegEncoder.cpp` performs before handing off to libjpeg.
fn yuv420_to_rgb(yuv: &[u8], width: u32, height: u32, stride: u32) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    let y_plane_size = (stride * height) as usize;
    let chroma_stride = stride / 2;
    let chroma_height = height / 2;
    let chroma_plane_size = (chroma_stride * chroma_height) as usize;

    let y_plane = &yuv[..y_plane_size.min(yuv.len())];
    let u_plane = yuv.get(y_plane_size..y_plane_size + chroma_plane_size).unwrap_or(&[]);
    let v_plane =
        yuv.get(y_plane_size + chroma_plane_size..y_plane_size + 2 * chroma_plane_size).unwrap_or(&[]);

    ImageBuffer::from_fn(width, height, |x, y| {
        let y_index = (y * stride + x) as usize;
        let c_index = ((y / 2) * chroma_stride + (x / 2)) as usize;

        let y_val = *y_plane.get(y_index).unwrap_or(&0) as f32;
        let u_val = *u_plane.get(c_index).unwrap_or(&128) as f32 - 128.0;
        let v_val = *v_plane.get(c_index).unwrap_or(&128) as f32 - 128.0;

        let r = (y_val + 1.402 * v_val).clamp(0.0, 255.0) as u8;
        let g = (y_val - 0.344_136 * u_val - 0.714_136 * v_val).clamp(0.0, 255.0) as u8;
        let b = (y_val + 1.772 * u_val).clamp(0.0, 255.0) as u8;

        Rgb([r, g, b])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::Tier;

    #[test]
    fn flat_gray_yuv_converts_to_neutral_rgb() {
        let config = StreamConfig::for_tier(Tier::Low);
        let mut yuv = vec![128u8; config.frame_byte_size];
        for byte in yuv.iter_mut().take((config.stride * config.height) as usize) {
            *byte = 128;
        }
        let rgb = yuv420_to_rgb(&yuv, config.width, config.height, config.stride);
        let pixel = rgb.get_pixel(config.width / 2, config.height / 2);
        assert!(pixel.0.iter().all(|&c| (120..=136).contains(&c)));
    }

    #[test]
    fn output_dimensions_match_source_tier() {
        let config = StreamConfig::for_tier(Tier::Low);
        let yuv = vec![128u8; config.frame_byte_size];
        let rgb = yuv420_to_rgb(&yuv, config.width, config.height, config.stride);
        assert_eq!(rgb.width(), config.width);
        assert_eq!(rgb.height(), config.height);
    }
}
