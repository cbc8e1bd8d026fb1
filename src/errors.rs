// SPDX-License-Identifier: MPL-2.0

//! Crate-wide error taxonomy.
//!
//! Three families, matching the three places a fallible operation can
//! actually surface a caller-visible error: startup, a control mutation,
//! and a raw ioctl. Per-frame drops and shutdown races are not modeled as
//! errors at all — they are logged and discarded at the call site.

use std::fmt;

/// Result alias for fatal startup failures.
pub type InitResult<T> = Result<T, InitError>;

/// Fatal initialization failure. Returned up to `main`, which logs it and
/// exits with a non-zero status.
#[derive(Debug)]
pub enum InitError {
    /// No camera was found, or more than one was present.
    NoCamera,
    MultipleCameras(usize),
    /// The camera framework rejected the requested stream configuration.
    InvalidConfiguration(String),
    /// A kernel device node could not be opened or configured.
    DeviceOpen { path: String, source: std::io::Error },
    /// No DMA heap candidate could be opened.
    UnavailableHeap,
    /// A DMA heap allocation ioctl failed.
    AllocFailed { name: String, source: IoctlError },
    /// An ioctl issued during encoder or camera setup failed.
    Ioctl(IoctlError),
    /// A TCP listener could not bind its port.
    BindFailed { port: u16, source: std::io::Error },
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::NoCamera => write!(f, "no camera found"),
            InitError::MultipleCameras(n) => write!(f, "expected exactly one camera, found {n}"),
            InitError::InvalidConfiguration(msg) => {
                write!(f, "camera rejected stream configuration: {msg}")
            }
            InitError::DeviceOpen { path, source } => {
                write!(f, "failed to open {path}: {source}")
            }
            InitError::UnavailableHeap => write!(f, "no DMA heap device could be opened"),
            InitError::AllocFailed { name, source } => {
                write!(f, "DMA allocation for {name} failed: {source}")
            }
            InitError::Ioctl(e) => write!(f, "{e}"),
            InitError::BindFailed { port, source } => {
                write!(f, "failed to bind port {port}: {source}")
            }
        }
    }
}

impl std::error::Error for InitError {}

impl From<IoctlError> for InitError {
    fn from(e: IoctlError) -> Self {
        InitError::Ioctl(e)
    }
}

/// A failed V4L2 or DMA-heap ioctl, tagged with the call that produced it.
///
/// The `errno` classification mirrors the tags spec.md calls out explicitly:
/// `InvalidArgument` (EINVAL), `BadFd` (EBADF), `NotTty` (ENOTTY, meaning
/// "not a V4L2 device"), `Fault` (EFAULT), and `Interrupted` (EINTR, which
/// callers generally retry rather than surface).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlErrno {
    InvalidArgument,
    BadFd,
    NotTty,
    Fault,
    Interrupted,
    Other(i32),
}

impl IoctlErrno {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINVAL => IoctlErrno::InvalidArgument,
            libc::EBADF => IoctlErrno::BadFd,
            libc::ENOTTY => IoctlErrno::NotTty,
            libc::EFAULT => IoctlErrno::Fault,
            libc::EINTR => IoctlErrno::Interrupted,
            other => IoctlErrno::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IoctlError {
    pub call: &'static str,
    pub errno: IoctlErrno,
}

impl fmt::Display for IoctlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {:?}", self.call, self.errno)
    }
}

impl std::error::Error for IoctlError {}

/// Error returned when a remote-control command cannot be applied. These
/// never abort anything; the caller converts them to an outbound `error`
/// JSON message and leaves state untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlError {
    UnknownCapability(String),
    OutOfRange { name: String, value: f64, min: f64, max: f64 },
    UnsupportedType(String),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::UnknownCapability(name) => {
                write!(f, "unknown capability: {name}")
            }
            ControlError::OutOfRange { name, value, min, max } => {
                write!(f, "{name}={value} out of range [{min}, {max}]")
            }
            ControlError::UnsupportedType(name) => {
                write!(f, "unsupported control type: {name}")
            }
        }
    }
}

impl std::error::Error for ControlError {}
