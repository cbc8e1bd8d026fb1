// SPDX-License-Identifier: GPL-3.0-only

//! Top-level wiring (§4.8): starts the camera only while at least one
//! stream adapter has a subscriber, fans out captured frames to whichever
//! adapters are attached, tears both adapters down and rebuilds them when
//! the thermal watchdog trips, and keeps the capability table and remote
//! control reachable regardless of any of the above.
//!
//! Grounded on `Main.cpp`'s `Impl`: `mpjpegConnected`/`h264Connected`
//! booleans gate `updateCameraState()`; `systemTemperatureTooHigh(true)`
//! destroys both stream adapters outright, `false` rebuilds them. The one
//! deliberate divergence is `CameraControl`: the original constructs it
//! once, entirely decoupled from the camera start/stop cycle the stream
//! adapters drive. This crate keeps the same independence, but expresses it
//! with [`crate::capability::PendingControlRouter`] instead of a
//! long-lived, always-acquired camera handle — see DESIGN.md.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::camera::pipeline::CameraPipeline;
use crate::capability::{self, CapabilityTable, PendingControlRouter};
use crate::config::Config;
use crate::constants::{self, Tier};
use crate::encoder::{EncoderKind, HardwareEncoderConfig};
use crate::errors::InitResult;
use crate::remote_control::RemoteControl;
use crate::stream::{H264Stream, MjpegStream};
use crate::thermal::SystemTemperature;

struct Streams {
    h264: H264Stream,
    mjpeg: MjpegStream,
}

struct Inner {
    router: Arc<PendingControlRouter>,
    config: Config,

    streams: Mutex<Option<Streams>>,
    pipeline: Mutex<Option<CameraPipeline>>,

    h264_connected: AtomicBool,
    mjpeg_connected: AtomicBool,
}

/// Owns every long-lived piece of the daemon. Nothing outside `main` holds
/// a reference to the pieces directly; they are only reachable through the
/// callbacks wired up in [`Orchestrator::start`].
pub struct Orchestrator {
    inner: Arc<Inner>,
    _remote_control: RemoteControl,
    _thermal: SystemTemperature,
}

impl Orchestrator {
    pub fn start(config: Config) -> InitResult<Self> {
        let router = PendingControlRouter::new();
        let raw_controls = capability::discover_controls()?;
        let capabilities =
            Arc::new(CapabilityTable::from_raw_controls(raw_controls, router.clone()));

        let inner = Arc::new(Inner {
            router,
            config,
            streams: Mutex::new(None),
            pipeline: Mutex::new(None),
            h264_connected: AtomicBool::new(false),
            mjpeg_connected: AtomicBool::new(false),
        });

        spawn_streams(&inner)?;

        let remote_control = RemoteControl::start(capabilities)?;

        let thermal_inner = inner.clone();
        let thermal = SystemTemperature::start(inner.config.thermal_semaphore_path.clone(), move |too_high| {
            on_thermal_changed(&thermal_inner, too_high);
        });

        Ok(Orchestrator { inner, _remote_control: remote_control, _thermal: thermal })
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        *self.inner.streams.lock().unwrap() = None;
        *self.inner.pipeline.lock().unwrap() = None;
    }
}

fn h264_config() -> HardwareEncoderConfig {
    let (width, height) = Tier::High.dimensions();
    HardwareEncoderConfig {
        kind: EncoderKind::H264,
        device_path: constants::H264_ENCODER_DEVICE,
        input_width: width,
        input_height: height,
        input_stride: width,
        output_width: constants::H264_OUTPUT_WIDTH,
        output_height: constants::H264_OUTPUT_HEIGHT,
        output_buffer_size: constants::H264_OUTPUT_BUFFER_SIZE,
        input_buffer_count: constants::H264_INPUT_BUFFER_COUNT,
        output_buffer_count: constants::H264_OUTPUT_BUFFER_COUNT,
        jpeg_quality: 0,
    }
}

/// Builds both stream adapters. Each adapter's connect/disconnect callback
/// flips this daemon's view of whether a subscriber is attached and asks
/// `update_camera_state` to reconcile the capture pipeline accordingly.
fn spawn_streams(inner: &Arc<Inner>) -> InitResult<()> {
    let h264_inner = inner.clone();
    let h264 = H264Stream::start(h264_config(), move |connected| {
        h264_inner.h264_connected.store(connected, Ordering::SeqCst);
        update_camera_state(&h264_inner);
    })?;

    let mjpeg_inner = inner.clone();
    let mjpeg =
        MjpegStream::start(inner.config.jpeg_encoder, inner.config.jpeg_quality, move |connected| {
            mjpeg_inner.mjpeg_connected.store(connected, Ordering::SeqCst);
            update_camera_state(&mjpeg_inner);
        })?;

    *inner.streams.lock().unwrap() = Some(Streams { h264, mjpeg });
    Ok(())
}

/// §4.8: start the camera if at least one adapter is connected and it isn't
/// already running; stop it if neither is connected.
fn update_camera_state(inner: &Arc<Inner>) {
    let any_connected =
        inner.h264_connected.load(Ordering::SeqCst) || inner.mjpeg_connected.load(Ordering::SeqCst);

    let mut pipeline = inner.pipeline.lock().unwrap();
    match (any_connected, pipeline.is_some()) {
        (true, false) => {
            let frame_inner = inner.clone();
            let router = inner.router.clone();
            match CameraPipeline::start(
                router,
                Box::new(move |high, low, timestamp_micros| {
                    on_new_frame(&frame_inner, high, low, timestamp_micros);
                }),
            ) {
                Ok(p) => {
                    info!("camera pipeline started");
                    *pipeline = Some(p);
                }
                Err(e) => error!(error = %e, "failed to start camera pipeline"),
            }
        }
        (false, true) => {
            info!("no subscribers remain, stopping camera pipeline");
            *pipeline = None;
        }
        _ => {}
    }
}

fn on_new_frame(
    inner: &Arc<Inner>,
    high: crate::camera::DeliveredTier,
    low: crate::camera::DeliveredTier,
    timestamp_micros: i64,
) {
    let guard = inner.streams.lock().unwrap();
    let Some(streams) = guard.as_ref() else { return };

    if inner.h264_connected.load(Ordering::SeqCst) {
        streams.h264.send(high.buffer.fd, high.buffer.length, high.buffer.offset, timestamp_micros);
    }
    if inner.mjpeg_connected.load(Ordering::SeqCst) {
        streams.mjpeg.send(low.buffer.fd, low.buffer.length, low.buffer.offset, timestamp_micros);
    }
}

/// §4.8: a thermal trip destroys both stream adapters outright (dropping
/// their hardware encoders and closing their listening sockets); clearing
/// the trip rebuilds them from scratch. The capability table, its router,
/// and remote control are untouched either way.
fn on_thermal_changed(inner: &Arc<Inner>, too_high: bool) {
    if too_high {
        warn!("system temperature too high, tearing down stream adapters");
        *inner.streams.lock().unwrap() = None;
        *inner.pipeline.lock().unwrap() = None;
        inner.h264_connected.store(false, Ordering::SeqCst);
        inner.mjpeg_connected.store(false, Ordering::SeqCst);
    } else {
        info!("system temperature normal, rebuilding stream adapters");
        if let Err(e) = spawn_streams(inner) {
            error!(error = %e, "failed to rebuild stream adapters after thermal recovery");
        }
    }
}
