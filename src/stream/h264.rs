// SPDX-License-Identifier: GPL-3.0-only

//! H.264 stream adapter (§4.6): one hardware H.264 encoder paired with a
//! single-subscriber raw TCP sink on port 8888.
//!
//! Grounded on `H264Stream.cpp`: a new connection is stored under a mutex
//! and the orchestrator is told a subscriber now exists; `send` forwards to
//! the encoder only while a subscriber is attached; the encoder's own
//! deliver thread, not this adapter, pushes each encoded NAL onward.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::constants::H264_PORT;
use crate::encoder::{EncoderKind, HardwareEncoder, HardwareEncoderConfig};
use crate::errors::{InitError, InitResult};
use crate::network::tcp_server::{Connection, TcpServer, TcpServerListener};

struct Shared {
    connection: Mutex<Option<Connection>>,
}

pub struct H264Stream {
    encoder: HardwareEncoder,
    server: TcpServer,
    shared: Arc<Shared>,
}

impl H264Stream {
    /// Opens the hardware encoder and starts listening on 8888.
    /// `connected_callback` fires `false` immediately (no subscriber yet,
    /// matching the teacher's constructor-time reset) and again on every
    /// attach/detach.
    pub fn start(
        config: HardwareEncoderConfig,
        connected_callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> InitResult<Self> {
        debug_assert_eq!(config.kind, EncoderKind::H264);

        let shared = Arc::new(Shared { connection: Mutex::new(None) });

        let delivery_shared = shared.clone();
        let encoder = HardwareEncoder::open(config, move |payload| {
            let guard = delivery_shared.connection.lock().unwrap();
            if let Some(conn) = guard.as_ref() {
                let bytes = unsafe { std::slice::from_raw_parts(payload.data, payload.bytes_used) }.to_vec();
                debug!(size = bytes.len(), timestamp_micros = payload.timestamp_micros, "h264 nal ready");
                conn.send(bytes);
            }
        })?;

        let connected_callback: Arc<dyn Fn(bool) + Send + Sync> = Arc::new(connected_callback);
        connected_callback(false);

        let listener: Arc<dyn TcpServerListener> =
            Arc::new(Listener { shared: shared.clone(), connected_callback });
        let server = TcpServer::start(H264_PORT, "h264", listener)
            .map_err(|source| InitError::BindFailed { port: H264_PORT, source })?;

        Ok(H264Stream { encoder, server, shared })
    }

    /// Forwards a captured high-tier frame to the encoder, only if a
    /// subscriber is currently attached (§4.6).
    pub fn send(&self, dma_fd: RawFd, plane_length: usize, plane_offset: usize, timestamp_micros: i64) {
        if self.shared.connection.lock().unwrap().is_some() {
            self.encoder.encode(dma_fd, plane_length, plane_offset, timestamp_micros);
        }
    }

    pub fn stop(&mut self) {
        self.server.stop();
    }
}

struct Listener {
    shared: Arc<Shared>,
    connected_callback: Arc<dyn Fn(bool) + Send + Sync>,
}

impl TcpServerListener for Listener {
    fn on_new_connection(&self, connection: Connection) {
        *self.shared.connection.lock().unwrap() = Some(connection);
        (self.connected_callback)(true);
    }

    fn on_connection_closed(&self) {
        *self.shared.connection.lock().unwrap() = None;
        (self.connected_callback)(false);
    }

    fn on_command_received(&self, _command: &str) {
        // Raw byte stream, no inbound protocol to parse.
    }
}
