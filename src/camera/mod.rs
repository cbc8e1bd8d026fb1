// SPDX-License-Identifier: GPL-3.0-only

//! Camera subsystem: libcamera session management and the fixed two-tier
//! data model it produces.

pub mod pipeline;
pub mod types;

pub use pipeline::{CameraPipeline, DeliveredTier, FrameSubscriber};
