// SPDX-License-Identifier: GPL-3.0-only

//! Stream adapters: pair one encoder with one single-subscriber TCP sink.

pub mod h264;
pub mod mjpeg;

pub use h264::H264Stream;
pub use mjpeg::MjpegStream;
