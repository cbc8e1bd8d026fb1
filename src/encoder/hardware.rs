// SPDX-License-Identifier: GPL-3.0-only

//! Hardware encoder core: the V4L2 M2M buffer-exchange state machine shared
//! by the H.264 and JPEG hardware encoders. They differ only in pixel
//! formats, device path, buffer counts, and whether keyframe flags matter;
//! this module implements the shared shape once, the way spec.md allows.
//!
//! ioctl plumbing follows the same direct `libc::ioctl` style as
//! `capability.rs`'s raw V4L2 control layer, generalized to the
//! multiplanar M2M formats and buffer-queue ioctls this encoder needs.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{error, warn};

use crate::encoder::loop_controller::{EncoderRole, LoopStep, WorkerLoop};
use crate::errors::{InitResult, IoctlErrno, IoctlError};

// ===== ioctl number construction, matching Linux's _IOC encoding =====

const fn v4l2_ioctl(dir: u32, nr: u32, size: usize) -> libc::c_ulong {
    ((dir as libc::c_ulong) << 30)
        | ((size as libc::c_ulong) << 16)
        | (('V' as libc::c_ulong) << 8)
        | (nr as libc::c_ulong)
}

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const IOC_READ_WRITE: u32 = 3;

const VIDIOC_S_FMT_NR: u32 = 5;
const VIDIOC_REQBUFS_NR: u32 = 8;
const VIDIOC_QUERYBUF_NR: u32 = 9;
const VIDIOC_QBUF_NR: u32 = 15;
const VIDIOC_DQBUF_NR: u32 = 17;
const VIDIOC_STREAMON_NR: u32 = 18;
const VIDIOC_STREAMOFF_NR: u32 = 19;
const VIDIOC_S_PARM_NR: u32 = 22;
const VIDIOC_S_CTRL_NR: u32 = 28;

// V4L2 buffer types (multiplanar).
const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 = 9;
const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 10;
const V4L2_MEMORY_MMAP: u32 = 1;
const V4L2_MEMORY_DMABUF: u32 = 4;
const V4L2_PIX_FMT_YUV420: u32 = fourcc(b"YU12");
const V4L2_PIX_FMT_H264: u32 = fourcc(b"H264");
const V4L2_PIX_FMT_MJPEG: u32 = fourcc(b"MJPG");
const V4L2_BUF_FLAG_KEYFRAME: u32 = 0x0008;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2PlanePixFormat {
    sizeimage: u32,
    bytesperline: u32,
    reserved: [u16; 6],
}

#[repr(C)]
struct V4l2PixFormatMplane {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    colorspace: u32,
    plane_fmt: [V4l2PlanePixFormat; 8],
    num_planes: u8,
    flags: u8,
    ycbcr_enc: u8,
    quantization: u8,
    xfer_func: u8,
    reserved: [u8; 7],
}

#[repr(C)]
struct V4l2FormatMplane {
    buf_type: u32,
    pix_mp: V4l2PixFormatMplane,
    padding: [u8; 94],
}

#[repr(C)]
struct V4l2RequestBuffers {
    count: u32,
    buf_type: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

#[repr(C)]
struct V4l2Plane {
    bytesused: u32,
    length: u32,
    m: V4l2PlaneUnion,
    data_offset: u32,
    reserved: [u32; 11],
}

#[repr(C)]
union V4l2PlaneUnion {
    mem_offset: u32,
    userptr: u64,
    fd: i32,
}

#[repr(C)]
struct V4l2Buffer {
    index: u32,
    buf_type: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp_sec: i64,
    timestamp_usec: i64,
    timecode: [u8; 16],
    sequence: u32,
    memory: u32,
    planes_ptr: u64,
    length: u32,
    reserved2: u32,
    request_fd_or_reserved: i32,
}

#[repr(C)]
struct V4l2Control {
    id: u32,
    value: i32,
}

#[repr(C)]
struct V4l2StreamParm {
    buf_type: u32,
    timeperframe_numerator: u32,
    timeperframe_denominator: u32,
    padding: [u8; 188],
}

fn checked_ioctl(fd: RawFd, call: &'static str, request: libc::c_ulong, arg: *mut libc::c_void) -> Result<(), IoctlError> {
    loop {
        let result = unsafe { libc::ioctl(fd, request, arg) };
        if result >= 0 {
            return Ok(());
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        let classified = IoctlErrno::from_errno(errno);
        if classified == IoctlErrno::Interrupted {
            continue;
        }
        warn!(call, ?classified, "ioctl failed");
        return Err(IoctlError { call, errno: classified });
    }
}

/// What the hardware encoder produces per output round-trip.
pub struct EncodedPayload {
    pub data: *const u8,
    pub bytes_used: usize,
    pub buffer_index: u32,
    pub keyframe: bool,
    pub timestamp_micros: i64,
}

unsafe impl Send for EncodedPayload {}

/// Which concrete hardware codec this instance drives. Only affects device
/// controls, output pixel format, and whether keyframe flags are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    H264,
    Jpeg,
}

pub struct HardwareEncoderConfig {
    pub kind: EncoderKind,
    pub device_path: &'static str,
    pub input_width: u32,
    pub input_height: u32,
    pub input_stride: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub output_buffer_size: usize,
    pub input_buffer_count: usize,
    pub output_buffer_count: usize,
    pub jpeg_quality: u8,
}

struct MappedOutputBuffer {
    ptr: *mut libc::c_void,
    len: usize,
}
unsafe impl Send for MappedOutputBuffer {}

/// Shared state between the poll thread and the owner's `encode()` calls.
/// `available`, `in_flight`, and `ready_to_reuse` partition the input buffer
/// index space; `available.len() + in_flight + ready_to_reuse.len() ==
/// input_buffer_count` always holds.
///
/// `ready_to_reuse` exists only for the JPEG encoder's `N=1` input/output
/// pairing: the poll thread dequeues a completed input buffer there instead
/// of `available` so it cannot be republished before the matching output
/// round-trip finishes; the deliver thread moves it to `available` once that
/// output buffer has been re-queued to the driver.
struct InputSlots {
    available: VecDeque<u32>,
    in_flight: usize,
    ready_to_reuse: VecDeque<u32>,
}

struct ReadyQueue {
    queue: VecDeque<EncodedPayload>,
    shutdown: bool,
}

pub struct HardwareEncoder {
    device: File,
    config: HardwareEncoderConfig,
    input_slots: Arc<Mutex<InputSlots>>,
    ready: Arc<(Mutex<ReadyQueue>, Condvar)>,
    output_buffers: Arc<Vec<MappedOutputBuffer>>,
    poll_thread: Option<WorkerLoop>,
    deliver_thread: Option<WorkerLoop>,
    poisoned: Arc<std::sync::atomic::AtomicBool>,
}

impl HardwareEncoder {
    /// Runs the full initialization sequence from spec.md §4.4: open,
    /// device-specific controls, input/output format, buffer requests,
    /// stream-on, then spawns the poll and deliver threads. Any failure
    /// fatally poisons construction — there is no partially-initialized
    /// encoder.
    pub fn open(
        config: HardwareEncoderConfig,
        on_payload: impl Fn(EncodedPayload) + Send + Sync + 'static,
    ) -> InitResult<Self> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(config.device_path)
            .map_err(|source| crate::errors::InitError::DeviceOpen { path: config.device_path.to_string(), source })?;
        let fd = device.as_raw_fd();

        Self::apply_device_controls(fd, &config)?;
        Self::set_input_format(fd, &config)?;
        Self::set_output_format(fd, &config)?;
        if config.kind == EncoderKind::H264 {
            Self::set_frame_interval(fd)?;
        }

        Self::request_buffers(
            fd,
            V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            V4L2_MEMORY_DMABUF,
            config.input_buffer_count as u32,
        )?;
        Self::request_buffers(
            fd,
            V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            V4L2_MEMORY_MMAP,
            config.output_buffer_count as u32,
        )?;

        let output_buffers = Self::mmap_and_queue_outputs(fd, config.output_buffer_count)?;

        Self::stream_on(fd, V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE)?;
        Self::stream_on(fd, V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE)?;

        let input_slots = Arc::new(Mutex::new(InputSlots {
            available: (0..config.input_buffer_count as u32).collect(),
            in_flight: 0,
            ready_to_reuse: VecDeque::new(),
        }));
        let ready = Arc::new((Mutex::new(ReadyQueue { queue: VecDeque::new(), shutdown: false }), Condvar::new()));
        let output_buffers = Arc::new(output_buffers);
        let poisoned = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let poll_fd = fd;
        let poll_input_slots = input_slots.clone();
        let poll_ready = ready.clone();
        let poll_output_buffers = output_buffers.clone();
        let poll_kind = config.kind;
        let poll_poisoned = poisoned.clone();
        let poll_thread = WorkerLoop::start(EncoderRole::Poll, move || {
            poll_iteration(poll_fd, poll_kind, &poll_input_slots, &poll_ready, &poll_output_buffers, &poll_poisoned)
        });

        let deliver_fd = fd;
        let deliver_ready = ready.clone();
        let deliver_kind = config.kind;
        let deliver_input_slots = input_slots.clone();
        let deliver_thread = WorkerLoop::start(EncoderRole::Deliver, move || {
            deliver_iteration(deliver_fd, deliver_kind, &deliver_input_slots, &deliver_ready, &on_payload)
        });

        Ok(HardwareEncoder {
            device,
            config,
            input_slots,
            ready,
            output_buffers,
            poll_thread: Some(poll_thread),
            deliver_thread: Some(deliver_thread),
            poisoned,
        })
    }

    /// Claims one free input slot and queues `fd`'s plane to the driver.
    /// Drops the frame with a warning if no slot is free — never blocks.
    pub fn encode(&self, dma_fd: RawFd, plane_length: usize, plane_offset: usize, timestamp_micros: i64) {
        if self.poisoned.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }

        let index = {
            let mut slots = self.input_slots.lock().unwrap();
            match slots.available.pop_front() {
                Some(i) => {
                    slots.in_flight += 1;
                    i
                }
                None => {
                    warn!(device = self.config.device_path, "no free input slot, dropping frame");
                    return;
                }
            }
        };

        let mut plane = V4l2Plane {
            bytesused: plane_length as u32,
            length: (plane_length + plane_offset) as u32,
            m: V4l2PlaneUnion { fd: dma_fd },
            data_offset: plane_offset as u32,
            reserved: [0; 11],
        };

        let mut buf = V4l2Buffer {
            index,
            buf_type: V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            bytesused: 0,
            flags: 0,
            field: 0,
            timestamp_sec: timestamp_micros / 1_000_000,
            timestamp_usec: timestamp_micros % 1_000_000,
            timecode: [0; 16],
            sequence: 0,
            memory: V4L2_MEMORY_DMABUF,
            planes_ptr: &mut plane as *mut V4l2Plane as u64,
            length: 1,
            reserved2: 0,
            request_fd_or_reserved: 0,
        };

        let result = checked_ioctl(
            self.device.as_raw_fd(),
            "VIDIOC_QBUF(input)",
            v4l2_ioctl(IOC_READ_WRITE, VIDIOC_QBUF_NR, std::mem::size_of::<V4l2Buffer>()),
            &mut buf as *mut V4l2Buffer as *mut libc::c_void,
        );

        if let Err(e) = result {
            error!(device = self.config.device_path, error = %e, "failed to queue input buffer, poisoning encoder");
            self.poisoned.store(true, std::sync::atomic::Ordering::Relaxed);
            let mut slots = self.input_slots.lock().unwrap();
            slots.in_flight -= 1;
            slots.available.push_back(index);
        }
    }

    fn apply_device_controls(fd: RawFd, config: &HardwareEncoderConfig) -> InitResult<()> {
        const V4L2_CID_JPEG_COMPRESSION_QUALITY: u32 = 0x009e0900 + 3;
        const V4L2_CID_MPEG_VIDEO_REPEAT_SEQ_HEADER: u32 = 0x00990000 + 0x99;

        let (id, value) = match config.kind {
            EncoderKind::Jpeg => (V4L2_CID_JPEG_COMPRESSION_QUALITY, config.jpeg_quality as i32),
            EncoderKind::H264 => (V4L2_CID_MPEG_VIDEO_REPEAT_SEQ_HEADER, 1),
        };
        let mut ctrl = V4l2Control { id, value };
        checked_ioctl(
            fd,
            "VIDIOC_S_CTRL",
            v4l2_ioctl(IOC_READ_WRITE, VIDIOC_S_CTRL_NR, std::mem::size_of::<V4l2Control>()),
            &mut ctrl as *mut V4l2Control as *mut libc::c_void,
        )?;
        Ok(())
    }

    fn set_input_format(fd: RawFd, config: &HardwareEncoderConfig) -> InitResult<()> {
        let mut plane_fmt = [V4l2PlanePixFormat { sizeimage: 0, bytesperline: config.input_stride, reserved: [0; 6] }; 8];
        plane_fmt[0].sizeimage = config.input_stride * config.input_height * 3 / 2;

        let mut fmt = V4l2FormatMplane {
            buf_type: V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            pix_mp: V4l2PixFormatMplane {
                width: config.input_width,
                height: config.input_height,
                pixelformat: V4L2_PIX_FMT_YUV420,
                field: 0,
                colorspace: 0,
                plane_fmt,
                num_planes: 1,
                flags: 0,
                ycbcr_enc: 0,
                quantization: 0,
                xfer_func: 0,
                reserved: [0; 7],
            },
            padding: [0; 94],
        };

        checked_ioctl(
            fd,
            "VIDIOC_S_FMT(input)",
            v4l2_ioctl(IOC_READ_WRITE, VIDIOC_S_FMT_NR, std::mem::size_of::<V4l2FormatMplane>()),
            &mut fmt as *mut V4l2FormatMplane as *mut libc::c_void,
        )?;
        Ok(())
    }

    fn set_output_format(fd: RawFd, config: &HardwareEncoderConfig) -> InitResult<()> {
        let pixelformat = match config.kind {
            EncoderKind::H264 => V4L2_PIX_FMT_H264,
            EncoderKind::Jpeg => V4L2_PIX_FMT_MJPEG,
        };
        let mut plane_fmt = [V4l2PlanePixFormat { sizeimage: 0, bytesperline: 0, reserved: [0; 6] }; 8];
        plane_fmt[0].sizeimage = config.output_buffer_size as u32;

        let mut fmt = V4l2FormatMplane {
            buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            pix_mp: V4l2PixFormatMplane {
                width: config.output_width,
                height: config.output_height,
                pixelformat,
                field: 0,
                colorspace: 0,
                plane_fmt,
                num_planes: 1,
                flags: 0,
                ycbcr_enc: 0,
                quantization: 0,
                xfer_func: 0,
                reserved: [0; 7],
            },
            padding: [0; 94],
        };

        checked_ioctl(
            fd,
            "VIDIOC_S_FMT(output)",
            v4l2_ioctl(IOC_READ_WRITE, VIDIOC_S_FMT_NR, std::mem::size_of::<V4l2FormatMplane>()),
            &mut fmt as *mut V4l2FormatMplane as *mut libc::c_void,
        )?;
        Ok(())
    }

    fn set_frame_interval(fd: RawFd) -> InitResult<()> {
        let mut parm = V4l2StreamParm {
            buf_type: V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            timeperframe_numerator: crate::constants::H264_FRAME_INTERVAL.0,
            timeperframe_denominator: crate::constants::H264_FRAME_INTERVAL.1,
            padding: [0; 188],
        };
        checked_ioctl(
            fd,
            "VIDIOC_S_PARM",
            v4l2_ioctl(IOC_READ_WRITE, VIDIOC_S_PARM_NR, std::mem::size_of::<V4l2StreamParm>()),
            &mut parm as *mut V4l2StreamParm as *mut libc::c_void,
        )?;
        Ok(())
    }

    fn request_buffers(fd: RawFd, buf_type: u32, memory: u32, count: u32) -> InitResult<()> {
        let mut req = V4l2RequestBuffers { count, buf_type, memory, capabilities: 0, flags: 0, reserved: [0; 3] };
        checked_ioctl(
            fd,
            "VIDIOC_REQBUFS",
            v4l2_ioctl(IOC_READ_WRITE, VIDIOC_REQBUFS_NR, std::mem::size_of::<V4l2RequestBuffers>()),
            &mut req as *mut V4l2RequestBuffers as *mut libc::c_void,
        )?;
        Ok(())
    }

    fn mmap_and_queue_outputs(fd: RawFd, count: usize) -> InitResult<Vec<MappedOutputBuffer>> {
        let mut buffers = Vec::with_capacity(count);
        for index in 0..count as u32 {
            let mut plane = V4l2Plane {
                bytesused: 0,
                length: 0,
                m: V4l2PlaneUnion { mem_offset: 0 },
                data_offset: 0,
                reserved: [0; 11],
            };
            let mut buf = V4l2Buffer {
                index,
                buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
                bytesused: 0,
                flags: 0,
                field: 0,
                timestamp_sec: 0,
                timestamp_usec: 0,
                timecode: [0; 16],
                sequence: 0,
                memory: V4L2_MEMORY_MMAP,
                planes_ptr: &mut plane as *mut V4l2Plane as u64,
                length: 1,
                reserved2: 0,
                request_fd_or_reserved: 0,
            };
            checked_ioctl(
                fd,
                "VIDIOC_QUERYBUF",
                v4l2_ioctl(IOC_READ_WRITE, VIDIOC_QUERYBUF_NR, std::mem::size_of::<V4l2Buffer>()),
                &mut buf as *mut V4l2Buffer as *mut libc::c_void,
            )?;

            let len = unsafe { plane.length as usize };
            let offset = unsafe { plane.m.mem_offset as libc::off_t };
            let ptr = unsafe {
                libc::mmap(std::ptr::null_mut(), len, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED, fd, offset)
            };
            if ptr == libc::MAP_FAILED {
                return Err(crate::errors::InitError::Ioctl(IoctlError {
                    call: "mmap(output buffer)",
                    errno: IoctlErrno::from_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0)),
                }));
            }

            checked_ioctl(
                fd,
                "VIDIOC_QBUF(output,init)",
                v4l2_ioctl(IOC_READ_WRITE, VIDIOC_QBUF_NR, std::mem::size_of::<V4l2Buffer>()),
                &mut buf as *mut V4l2Buffer as *mut libc::c_void,
            )?;

            buffers.push(MappedOutputBuffer { ptr, len });
        }
        Ok(buffers)
    }

    fn stream_on(fd: RawFd, mut buf_type: u32) -> InitResult<()> {
        checked_ioctl(
            fd,
            "VIDIOC_STREAMON",
            v4l2_ioctl(IOC_WRITE, VIDIOC_STREAMON_NR, std::mem::size_of::<u32>()),
            &mut buf_type as *mut u32 as *mut libc::c_void,
        )?;
        Ok(())
    }

    fn stream_off(fd: RawFd, mut buf_type: u32) {
        let _ = checked_ioctl(
            fd,
            "VIDIOC_STREAMOFF",
            v4l2_ioctl(IOC_WRITE, VIDIOC_STREAMOFF_NR, std::mem::size_of::<u32>()),
            &mut buf_type as *mut u32 as *mut libc::c_void,
        );
    }
}

impl Drop for HardwareEncoder {
    /// §4.4.3: signal both threads, join them, then stream off, unmap, and
    /// let `self.device` close on drop. ioctl failures during teardown are
    /// logged and ignored — nothing escapes a destructor.
    fn drop(&mut self) {
        {
            let (lock, condvar) = &*self.ready;
            lock.lock().unwrap().shutdown = true;
            condvar.notify_all();
        }
        if let Some(mut poll) = self.poll_thread.take() {
            poll.stop();
        }
        if let Some(mut deliver) = self.deliver_thread.take() {
            deliver.stop();
        }

        let fd = self.device.as_raw_fd();
        Self::stream_off(fd, V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE);
        Self::stream_off(fd, V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE);

        for buffer in self.output_buffers.iter() {
            unsafe {
                libc::munmap(buffer.ptr, buffer.len);
            }
        }
    }
}

/// One poll-thread iteration. Returns `LoopStep::Stop` once shutdown has
/// been requested and all input slots have returned to `available`.
fn poll_iteration(
    fd: RawFd,
    kind: EncoderKind,
    input_slots: &Arc<Mutex<InputSlots>>,
    ready: &Arc<(Mutex<ReadyQueue>, Condvar)>,
    output_buffers: &Arc<Vec<MappedOutputBuffer>>,
    poisoned: &Arc<std::sync::atomic::AtomicBool>,
) -> LoopStep {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    let timeout_ms = crate::constants::ENCODER_POLL_TIMEOUT.as_millis() as libc::c_int;
    let result = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };

    if result == 0 {
        let shutting_down = ready.0.lock().unwrap().shutdown;
        let slots = input_slots.lock().unwrap();
        if shutting_down && slots.in_flight == 0 && slots.ready_to_reuse.is_empty() {
            return LoopStep::Stop;
        }
        return LoopStep::Continue;
    }

    if result < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if IoctlErrno::from_errno(errno) == IoctlErrno::Interrupted {
            return LoopStep::Continue;
        }
        error!(?errno, "encoder poll() failed, poisoning encoder");
        poisoned.store(true, std::sync::atomic::Ordering::Relaxed);
        return LoopStep::Stop;
    }

    if pfd.revents & libc::POLLIN != 0 {
        if let Some(index) = dequeue_input(fd) {
            let mut slots = input_slots.lock().unwrap();
            slots.in_flight = slots.in_flight.saturating_sub(1);
            // §4.4.1 step 1: JPEG's N=1 input/output pairing must not let
            // this index become available again until the matching output
            // round-trip has completed (see deliver_iteration).
            match kind {
                EncoderKind::Jpeg => slots.ready_to_reuse.push_back(index),
                EncoderKind::H264 => slots.available.push_back(index),
            }
        }

        if let Some((index, bytes_used, keyframe, timestamp_micros)) = dequeue_output(fd, kind) {
            let buffer = &output_buffers[index as usize];
            let payload = EncodedPayload {
                data: buffer.ptr as *const u8,
                bytes_used,
                buffer_index: index,
                keyframe,
                timestamp_micros,
            };
            let (lock, condvar) = &**ready;
            lock.lock().unwrap().queue.push_back(payload);
            condvar.notify_one();
        }
    }

    LoopStep::Continue
}

fn dequeue_input(fd: RawFd) -> Option<u32> {
    let mut plane = V4l2Plane { bytesused: 0, length: 0, m: V4l2PlaneUnion { fd: 0 }, data_offset: 0, reserved: [0; 11] };
    let mut buf = V4l2Buffer {
        index: 0,
        buf_type: V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
        bytesused: 0,
        flags: 0,
        field: 0,
        timestamp_sec: 0,
        timestamp_usec: 0,
        timecode: [0; 16],
        sequence: 0,
        memory: V4L2_MEMORY_DMABUF,
        planes_ptr: &mut plane as *mut V4l2Plane as u64,
        length: 1,
        reserved2: 0,
        request_fd_or_reserved: 0,
    };
    checked_ioctl(
        fd,
        "VIDIOC_DQBUF(input)",
        v4l2_ioctl(IOC_READ_WRITE, VIDIOC_DQBUF_NR, std::mem::size_of::<V4l2Buffer>()),
        &mut buf as *mut V4l2Buffer as *mut libc::c_void,
    )
    .ok()?;
    Some(buf.index)
}

fn dequeue_output(fd: RawFd, kind: EncoderKind) -> Option<(u32, usize, bool, i64)> {
    let mut plane = V4l2Plane { bytesused: 0, length: 0, m: V4l2PlaneUnion { mem_offset: 0 }, data_offset: 0, reserved: [0; 11] };
    let mut buf = V4l2Buffer {
        index: 0,
        buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        bytesused: 0,
        flags: 0,
        field: 0,
        timestamp_sec: 0,
        timestamp_usec: 0,
        timecode: [0; 16],
        sequence: 0,
        memory: V4L2_MEMORY_MMAP,
        planes_ptr: &mut plane as *mut V4l2Plane as u64,
        length: 1,
        reserved2: 0,
        request_fd_or_reserved: 0,
    };
    checked_ioctl(
        fd,
        "VIDIOC_DQBUF(output)",
        v4l2_ioctl(IOC_READ_WRITE, VIDIOC_DQBUF_NR, std::mem::size_of::<V4l2Buffer>()),
        &mut buf as *mut V4l2Buffer as *mut libc::c_void,
    )
    .ok()?;

    let bytes_used = unsafe { plane.bytesused as usize };
    let keyframe = kind == EncoderKind::H264 && (buf.flags & V4L2_BUF_FLAG_KEYFRAME != 0);
    let timestamp_micros = buf.timestamp_sec * 1_000_000 + buf.timestamp_usec;
    Some((buf.index, bytes_used, keyframe, timestamp_micros))
}

/// One deliver-thread iteration: wait for a ready payload (or shutdown),
/// invoke the consumer callback, then re-queue the output buffer.
fn deliver_iteration(
    fd: RawFd,
    kind: EncoderKind,
    input_slots: &Arc<Mutex<InputSlots>>,
    ready: &Arc<(Mutex<ReadyQueue>, Condvar)>,
    on_payload: &(impl Fn(EncodedPayload) + Send + Sync + 'static),
) -> LoopStep {
    let (lock, condvar) = &**ready;
    let mut guard = lock.lock().unwrap();
    while guard.queue.is_empty() {
        if guard.shutdown {
            return LoopStep::Stop;
        }
        let (g, _timeout) = condvar.wait_timeout(guard, crate::constants::ENCODER_DELIVER_TIMEOUT).unwrap();
        guard = g;
    }

    let payload = guard.queue.pop_front().unwrap();
    drop(guard);

    let index = payload.buffer_index;
    on_payload(payload);

    requeue_output(fd, index);

    // §4.4.2 step 5 (JPEG only): only now may one staged input index rejoin
    // availableInputSlots, preserving the 1:1 input/output pairing at N=1.
    if kind == EncoderKind::Jpeg {
        let mut slots = input_slots.lock().unwrap();
        if let Some(reused) = slots.ready_to_reuse.pop_front() {
            slots.available.push_back(reused);
        }
    }

    LoopStep::Continue
}

fn requeue_output(fd: RawFd, index: u32) {
    let mut plane = V4l2Plane { bytesused: 0, length: 0, m: V4l2PlaneUnion { mem_offset: 0 }, data_offset: 0, reserved: [0; 11] };
    let mut buf = V4l2Buffer {
        index,
        buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        bytesused: 0,
        flags: 0,
        field: 0,
        timestamp_sec: 0,
        timestamp_usec: 0,
        timecode: [0; 16],
        sequence: 0,
        memory: V4L2_MEMORY_MMAP,
        planes_ptr: &mut plane as *mut V4l2Plane as u64,
        length: 1,
        reserved2: 0,
        request_fd_or_reserved: 0,
    };
    let _ = checked_ioctl(
        fd,
        "VIDIOC_QBUF(output,requeue)",
        v4l2_ioctl(IOC_READ_WRITE, VIDIOC_QBUF_NR, std::mem::size_of::<V4l2Buffer>()),
        &mut buf as *mut V4l2Buffer as *mut libc::c_void,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_codes_match_v4l2_headers() {
        assert_eq!(V4L2_PIX_FMT_YUV420, 0x3231_5559);
        assert_eq!(V4L2_PIX_FMT_H264, 0x3436_3248);
        assert_eq!(V4L2_PIX_FMT_MJPEG, 0x47_50_4A_4D);
    }

    #[test]
    fn ioctl_numbers_use_expected_direction_bits() {
        let streamon = v4l2_ioctl(IOC_WRITE, VIDIOC_STREAMON_NR, std::mem::size_of::<u32>());
        assert_eq!((streamon >> 30) & 0b11, IOC_WRITE as libc::c_ulong);
        let qbuf = v4l2_ioctl(IOC_READ_WRITE, VIDIOC_QBUF_NR, std::mem::size_of::<V4l2Buffer>());
        assert_eq!((qbuf >> 30) & 0b11, IOC_READ_WRITE as libc::c_ulong);
    }

    #[test]
    fn errno_classification_matches_spec_tags() {
        assert_eq!(IoctlErrno::from_errno(libc::EINVAL), IoctlErrno::InvalidArgument);
        assert_eq!(IoctlErrno::from_errno(libc::EBADF), IoctlErrno::BadFd);
        assert_eq!(IoctlErrno::from_errno(libc::ENOTTY), IoctlErrno::NotTty);
        assert_eq!(IoctlErrno::from_errno(libc::EFAULT), IoctlErrno::Fault);
        assert_eq!(IoctlErrno::from_errno(libc::EINTR), IoctlErrno::Interrupted);
    }

    #[test]
    fn input_slot_invariant_holds_after_claim_and_return() {
        let slots =
            Mutex::new(InputSlots { available: (0..6u32).collect(), in_flight: 0, ready_to_reuse: VecDeque::new() });
        {
            let mut s = slots.lock().unwrap();
            let claimed = s.available.pop_front().unwrap();
            s.in_flight += 1;
            assert_eq!(s.available.len() + s.in_flight, 6);
            s.in_flight -= 1;
            s.available.push_back(claimed);
        }
        let s = slots.lock().unwrap();
        assert_eq!(s.available.len(), 6);
        assert_eq!(s.in_flight, 0);
    }

    #[test]
    fn jpeg_input_stays_staged_until_output_round_trip_completes() {
        let slots = Mutex::new(InputSlots {
            available: VecDeque::new(),
            in_flight: 1,
            ready_to_reuse: VecDeque::new(),
        });
        {
            // poll_iteration's dequeue step, JPEG branch.
            let mut s = slots.lock().unwrap();
            s.in_flight -= 1;
            s.ready_to_reuse.push_back(0);
        }
        assert!(slots.lock().unwrap().available.is_empty(), "must not be reusable before output round-trip");
        {
            // deliver_iteration's post-requeue step, JPEG branch.
            let mut s = slots.lock().unwrap();
            let reused = s.ready_to_reuse.pop_front().unwrap();
            s.available.push_back(reused);
        }
        assert_eq!(slots.lock().unwrap().available.len(), 1);
    }
}
