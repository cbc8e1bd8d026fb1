// SPDX-License-Identifier: GPL-3.0-only

//! Camera pipeline: owns the libcamera session, the three-request pool, and
//! the completion callback that turns finished requests back into frames.
//!
//! Grounded on the teacher's `libcamera/native/capture_thread.rs`, which runs
//! all libcamera objects (`CameraManager`, `ActiveCamera`, allocated frame
//! buffers) on one dedicated thread to avoid `Send` trouble with libcamera's
//! raw pointers. That shape is kept; what runs on the thread is rewritten
//! for this daemon's fixed two-tier, three-request, DMA-BUF-to-encoder
//! pipeline instead of the teacher's UI preview/still/record paths. As in
//! the teacher, a request's frame buffers stay attached across completions:
//! `req.reuse(ReuseFlag::REUSE_BUFFERS)` means buffers are never re-added.
//!
//! Request-pool buffers come from `FrameBufferAllocator`, not from a
//! directly-opened DMA heap: the original C++ allocates DMA-BUF fds itself
//! and wraps them into `FrameBuffer::Plane`s by hand, but the `libcamera`
//! crate exposes no constructor for a `FrameBuffer` from an externally
//! allocated fd — `FrameBufferAllocator::alloc` is the only way this crate
//! produces one. The hardware encoders still get their DMA-BUF input
//! without a separate heap allocation: each encoded frame's input is the
//! same dma-buf fd the camera already captured into, imported by the V4L2
//! M2M device rather than copied. See `crate::dma_heap` and DESIGN.md.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use libcamera::camera::{ActiveCamera, CameraConfigurationStatus};
use libcamera::camera_manager::CameraManager;
use libcamera::framebuffer::AsFrameBuffer;
use libcamera::framebuffer_allocator::{FrameBuffer, FrameBufferAllocator};
use libcamera::framebuffer_map::MemoryMappedFrameBuffer;
use libcamera::request::{Request, RequestStatus, ReuseFlag};
use libcamera::stream::StreamRole;
use tracing::{debug, error, info, warn};

use crate::camera::types::{DmaBuffer, FrameMetadata, RequestState, StreamConfig};
use crate::capability::{PendingControl, PendingControlRouter, PendingControlSink};
use crate::constants::{self, Tier};
use crate::errors::{InitError, InitResult};

type MappedFrameBuffer = MemoryMappedFrameBuffer<FrameBuffer>;

/// One resolution tier's buffer, as delivered to the subscriber callback.
pub struct DeliveredTier {
    pub config: StreamConfig,
    pub buffer: DmaBuffer,
    pub metadata: FrameMetadata,
}

pub type FrameSubscriber = Box<dyn Fn(DeliveredTier, DeliveredTier, i64) + Send + Sync>;

struct PendingControls(Mutex<Vec<PendingControl>>);

impl PendingControlSink for PendingControls {
    fn push(&self, control: PendingControl) {
        self.0.lock().unwrap().push(control);
    }
}

struct SharedState {
    started: AtomicBool,
    pending_count: AtomicU32,
    pending_controls: Arc<PendingControls>,
}

/// Owns the dedicated libcamera thread. All libcamera objects live on that
/// thread; this struct only holds the join handle and the shared atomics.
///
/// The capability table lives above this type, in the orchestrator, because
/// it must stay queryable and mutable across pipeline restarts (§4.8's
/// subscriber-driven start/stop cycle must not make remote control go dark).
/// `start` instead takes a [`PendingControlRouter`] and attaches this
/// session's own pending-controls sink to it for as long as the session
/// runs, detaching on `stop`/`Drop`.
pub struct CameraPipeline {
    thread: Option<JoinHandle<()>>,
    shared: Arc<SharedState>,
    router: Arc<PendingControlRouter>,
}

impl CameraPipeline {
    /// Starts the libcamera session on a dedicated thread and blocks until
    /// either initialization succeeds or fails; matches spec.md §4.2's
    /// "start the framework, enumerate, configure, request pool, start".
    pub fn start(router: Arc<PendingControlRouter>, on_frame: FrameSubscriber) -> InitResult<Self> {
        let pending_controls = Arc::new(PendingControls(Mutex::new(Vec::new())));
        router.attach(pending_controls.clone());
        let shared = Arc::new(SharedState {
            started: AtomicBool::new(true),
            pending_count: AtomicU32::new(0),
            pending_controls,
        });

        let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<InitResult<()>>(1);
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("camera-pipeline".to_string())
            .spawn(move || {
                if let Err(e) = run(&thread_shared, &on_frame, &init_tx) {
                    let _ = init_tx.send(Err(e));
                }
            })
            .map_err(|e| InitError::InvalidConfiguration(format!("spawn camera thread: {e}")))?;

        if let Err(e) = init_rx
            .recv()
            .map_err(|_| InitError::InvalidConfiguration("camera thread died during init".to_string()))
            .and_then(|r| r)
        {
            router.detach();
            return Err(e);
        }

        Ok(CameraPipeline { thread: Some(thread), shared, router })
    }

    /// §4.2 "Stop": flip `started`, drain the pending count, join the thread.
    /// Blocks until no completion callback can still fire.
    pub fn stop(&mut self) {
        self.router.detach();
        self.shared.started.store(false, Ordering::SeqCst);
        while self.shared.pending_count.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        if let Some(handle) = self.thread.take() {
            if let Err(e) = handle.join() {
                warn!("camera thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for CameraPipeline {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn run(shared: &Arc<SharedState>, on_frame: &FrameSubscriber, init_tx: &std::sync::mpsc::SyncSender<InitResult<()>>) -> InitResult<()> {
    let manager =
        CameraManager::new().map_err(|e| InitError::InvalidConfiguration(format!("CameraManager::new: {e}")))?;

    let cameras = manager.cameras();
    match cameras.len() {
        1 => {}
        0 => return Err(InitError::NoCamera),
        n => return Err(InitError::MultipleCameras(n)),
    }
    let camera = cameras.get(0).ok_or(InitError::NoCamera)?;
    let mut active = camera
        .acquire()
        .map_err(|e| InitError::InvalidConfiguration(format!("camera acquire: {e}")))?;

    let mut config = active
        .generate_configuration(&[StreamRole::Raw, StreamRole::ViewFinder])
        .ok_or_else(|| InitError::InvalidConfiguration("no default configuration".to_string()))?;

    apply_tier_overrides(&mut config, Tier::High, 0);
    apply_tier_overrides(&mut config, Tier::Low, 1);

    match config.validate() {
        CameraConfigurationStatus::Valid | CameraConfigurationStatus::Adjusted => {}
        CameraConfigurationStatus::Invalid => {
            return Err(InitError::InvalidConfiguration("camera rejected stream configuration".to_string()));
        }
    }

    active
        .configure(&mut config)
        .map_err(|e| InitError::InvalidConfiguration(format!("camera configure: {e}")))?;

    let stream_high = config
        .get(0)
        .and_then(|c| c.stream())
        .ok_or_else(|| InitError::InvalidConfiguration("no high-tier stream after configure".to_string()))?;
    let stream_low = config
        .get(1)
        .and_then(|c| c.stream())
        .ok_or_else(|| InitError::InvalidConfiguration("no low-tier stream after configure".to_string()))?;

    let mut allocator = FrameBufferAllocator::new(active.camera());

    let mut requests: Vec<Request> = Vec::with_capacity(constants::REQUEST_POOL_SIZE);
    let request_states: Vec<Mutex<RequestState>> =
        (0..constants::REQUEST_POOL_SIZE).map(|_| Mutex::new(RequestState::Idle)).collect();

    for i in 0..constants::REQUEST_POOL_SIZE {
        let high_buffer = allocator
            .alloc(&stream_high)
            .map_err(|e| InitError::InvalidConfiguration(format!("alloc high-tier buffer: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| InitError::InvalidConfiguration("no high-tier buffer allocated".to_string()))?;
        let low_buffer = allocator
            .alloc(&stream_low)
            .map_err(|e| InitError::InvalidConfiguration(format!("alloc low-tier buffer: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| InitError::InvalidConfiguration("no low-tier buffer allocated".to_string()))?;

        let high_mapped = MemoryMappedFrameBuffer::new(high_buffer)
            .map_err(|e| InitError::InvalidConfiguration(format!("mmap high buffer: {e}")))?;
        let low_mapped = MemoryMappedFrameBuffer::new(low_buffer)
            .map_err(|e| InitError::InvalidConfiguration(format!("mmap low buffer: {e}")))?;

        let mut request = active
            .create_request(Some(i as u64))
            .ok_or_else(|| InitError::InvalidConfiguration("failed to create request".to_string()))?;
        request
            .add_buffer(&stream_high, high_mapped)
            .map_err(|e| InitError::InvalidConfiguration(format!("attach high buffer: {e}")))?;
        request
            .add_buffer(&stream_low, low_mapped)
            .map_err(|e| InitError::InvalidConfiguration(format!("attach low buffer: {e}")))?;

        requests.push(request);
    }

    let rx = active.subscribe_request_completed();

    active.start(None).map_err(|e| InitError::InvalidConfiguration(format!("camera start: {e}")))?;

    for (i, request) in requests.into_iter().enumerate() {
        if let Err((_, e)) = active.queue_request(request) {
            error!(error = %e, "failed to queue initial request");
            continue;
        }
        *request_states[i].lock().unwrap() = RequestState::InFlight;
        shared.pending_count.fetch_add(1, Ordering::SeqCst);
    }

    info!("camera pipeline started, request pool queued");
    let _ = init_tx.send(Ok(()));

    while shared.started.load(Ordering::SeqCst) || shared.pending_count.load(Ordering::SeqCst) > 0 {
        let mut req = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(req) => req,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };

        shared.pending_count.fetch_sub(1, Ordering::SeqCst);

        let slot = request_states.get(req.cookie() as usize);

        if req.status() != RequestStatus::Complete {
            warn!(status = ?req.status(), "dropping non-complete request");
            if shared.started.load(Ordering::SeqCst) {
                req.reuse(ReuseFlag::REUSE_BUFFERS);
                requeue(&mut active, req, shared);
                if let Some(slot) = slot {
                    *slot.lock().unwrap() = RequestState::InFlight;
                }
            } else if let Some(slot) = slot {
                *slot.lock().unwrap() = RequestState::Idle;
            }
            continue;
        }

        if !shared.started.load(Ordering::SeqCst) {
            // Stop was requested while this request was in flight; drop it
            // without re-enqueue so pending_count can reach zero.
            if let Some(slot) = slot {
                *slot.lock().unwrap() = RequestState::Idle;
            }
            continue;
        }

        if let Some(slot) = slot {
            *slot.lock().unwrap() = RequestState::Observed;
        }
        deliver(&req, &stream_high, &stream_low, on_frame);

        req.reuse(ReuseFlag::REUSE_BUFFERS);
        requeue(&mut active, req, shared);
        if let Some(slot) = slot {
            *slot.lock().unwrap() = RequestState::InFlight;
        }
    }

    let _ = active.stop();
    Ok(())
}

fn apply_tier_overrides(config: &mut libcamera::camera::CameraConfiguration, tier: Tier, index: usize) {
    let stream_cfg = StreamConfig::for_tier(tier);
    if let Some(mut cfg) = config.get_mut(index) {
        cfg.set_size(libcamera::geometry::Size::new(stream_cfg.width, stream_cfg.height));
        cfg.set_pixel_format(libcamera::pixel_format::PixelFormat::new(libcamera::formats::YUV420.fourcc(), 0));
    }
}

/// §4.2 re-enqueue protocol: move queued controls onto the request under the
/// pending-controls lock, release it, then queue under the driver, only
/// incrementing the pending count on success.
fn requeue(active: &mut ActiveCamera<'_>, mut request: Request, shared: &Arc<SharedState>) {
    let pending = {
        let mut guard = shared.pending_controls.0.lock().unwrap();
        std::mem::take(&mut *guard)
    };
    for control in pending {
        apply_control_to_request(&mut request, control);
    }

    match active.queue_request(request) {
        Ok(()) => {
            shared.pending_count.fetch_add(1, Ordering::SeqCst);
        }
        Err((_, e)) => error!(error = %e, "failed to re-queue request"),
    }
}

fn apply_control_to_request(request: &mut Request, control: PendingControl) {
    debug!(id = control.id, value = ?control.value, "applying pending control to request");
    if let Err(e) = request.controls_mut().set_raw(control.id, control.value.into()) {
        warn!(id = control.id, error = %e, "driver rejected pending control");
    }
}

fn extract_metadata(req: &Request, high: &MappedFrameBuffer) -> FrameMetadata {
    use libcamera::controls::SensorTimestamp;

    let from_metadata = req.metadata().get::<SensorTimestamp>().ok().map(|v| v.0 as i64);
    let from_buffer = high.metadata().map(|m| m.timestamp() as i64);
    FrameMetadata { sensor_timestamp_ns: from_metadata.or(from_buffer) }
}

fn deliver(req: &Request, stream_high: &libcamera::stream::Stream, stream_low: &libcamera::stream::Stream, on_frame: &FrameSubscriber) {
    let (Some(high), Some(low)) =
        (req.buffer::<MappedFrameBuffer>(stream_high), req.buffer::<MappedFrameBuffer>(stream_low))
    else {
        warn!("completed request missing a tier buffer");
        return;
    };

    let (Some(high_plane), Some(low_plane)) = (high.data().first(), low.data().first()) else {
        warn!("completed request missing plane data");
        return;
    };

    let metadata = extract_metadata(req, high);
    let timestamp_micros = metadata.sensor_timestamp_ns.unwrap_or(0) / 1_000;

    let high_tier = DeliveredTier {
        config: StreamConfig::for_tier(Tier::High),
        buffer: DmaBuffer { fd: plane_fd(high, 0), length: high_plane.len(), offset: 0 },
        metadata,
    };
    let low_tier = DeliveredTier {
        config: StreamConfig::for_tier(Tier::Low),
        buffer: DmaBuffer { fd: plane_fd(low, 0), length: low_plane.len(), offset: 0 },
        metadata,
    };

    on_frame(high_tier, low_tier, timestamp_micros);
}

/// `AsFrameBuffer::planes()` is what exposes each plane's backing dma-buf
/// fd; `MemoryMappedFrameBuffer` forwards it from the buffer it wraps.
fn plane_fd(mapped: &MappedFrameBuffer, index: usize) -> RawFd {
    mapped.planes().get(index).map(|p| p.fd()).unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_pool_size_matches_spec() {
        assert_eq!(constants::REQUEST_POOL_SIZE, 3);
    }

    #[test]
    fn pending_controls_sink_accumulates_and_drains() {
        let sink = PendingControls(Mutex::new(Vec::new()));
        sink.push(PendingControl { id: 1, value: crate::capability::ControlValue::Int32(5) });
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        let drained = std::mem::take(&mut *sink.0.lock().unwrap());
        assert_eq!(drained.len(), 1);
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
