// SPDX-License-Identifier: GPL-3.0-only

//! MJPEG stream adapter (§4.7): one JPEG encoder (hardware by default, CPU
//! if selected by the environment) paired with a single-subscriber
//! `multipart/x-mixed-replace` HTTP sink on port 8887.
//!
//! Grounded on `MultipartJpegHttpStream.cpp`: encoder choice is resolved
//! once at construction from the JPEG encoder environment override, the
//! multipart framing is built exactly as the original composes it, and the
//! response headers are sent the moment the blank line terminating the
//! inbound HTTP request arrives.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::camera::types::StreamConfig;
use crate::config::JpegEncoderChoice;
use crate::constants::{self, MJPEG_PORT, Tier};
use crate::encoder::{CpuJpegEncoder, EncoderKind, FrameEncoder, HardwareEncoder, HardwareEncoderConfig};
use crate::errors::{InitError, InitResult};
use crate::network::tcp_server::{Connection, TcpServer, TcpServerListener};

struct Shared {
    connection: Mutex<Option<Connection>>,
}

pub struct MjpegStream {
    encoder: Box<dyn FrameEncoder>,
    server: TcpServer,
    shared: Arc<Shared>,
}

impl MjpegStream {
    pub fn start(
        jpeg_choice: JpegEncoderChoice,
        jpeg_quality: u8,
        connected_callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> InitResult<Self> {
        let shared = Arc::new(Shared { connection: Mutex::new(None) });

        let encoder: Box<dyn FrameEncoder> = match jpeg_choice {
            JpegEncoderChoice::Cpu => {
                let stream_config = StreamConfig::for_tier(Tier::Low);
                let delivery_shared = shared.clone();
                Box::new(CpuJpegEncoder::new(stream_config, jpeg_quality, move |bytes, timestamp_micros| {
                    send_multipart_frame(&delivery_shared, bytes, timestamp_micros);
                }))
            }
            JpegEncoderChoice::Hardware => {
                let delivery_shared = shared.clone();
                let config = HardwareEncoderConfig {
                    kind: EncoderKind::Jpeg,
                    device_path: constants::JPEG_ENCODER_DEVICE,
                    input_width: constants::Tier::Low.dimensions().0,
                    input_height: constants::Tier::Low.dimensions().1,
                    input_stride: constants::Tier::Low.dimensions().0,
                    output_width: constants::JPEG_OUTPUT_WIDTH,
                    output_height: constants::JPEG_OUTPUT_HEIGHT,
                    output_buffer_size: (constants::JPEG_OUTPUT_WIDTH * constants::JPEG_OUTPUT_HEIGHT) as usize,
                    input_buffer_count: constants::JPEG_INPUT_BUFFER_COUNT,
                    output_buffer_count: constants::JPEG_OUTPUT_BUFFER_COUNT,
                    jpeg_quality,
                };
                Box::new(HardwareEncoder::open(config, move |payload| {
                    let bytes = unsafe { std::slice::from_raw_parts(payload.data, payload.bytes_used) };
                    send_multipart_frame(&delivery_shared, bytes, payload.timestamp_micros);
                })?)
            }
        };

        let connected_callback: Arc<dyn Fn(bool) + Send + Sync> = Arc::new(connected_callback);
        connected_callback(false);

        let listener: Arc<dyn TcpServerListener> =
            Arc::new(Listener { shared: shared.clone(), connected_callback });
        let server = TcpServer::start(MJPEG_PORT, "mjpeg", listener)
            .map_err(|source| InitError::BindFailed { port: MJPEG_PORT, source })?;

        Ok(MjpegStream { encoder, server, shared })
    }

    /// Forwards a captured low-tier frame to the encoder, only if a
    /// subscriber is currently attached (§4.7).
    pub fn send(&self, dma_fd: RawFd, plane_length: usize, plane_offset: usize, timestamp_micros: i64) {
        if self.shared.connection.lock().unwrap().is_some() {
            self.encoder.encode(dma_fd, plane_length, plane_offset, timestamp_micros);
        }
    }

    pub fn stop(&mut self) {
        self.server.stop();
    }
}

fn send_multipart_frame(shared: &Arc<Shared>, data: &[u8], _timestamp_micros: i64) {
    let guard = shared.connection.lock().unwrap();
    if let Some(conn) = guard.as_ref() {
        let mut frame = Vec::with_capacity(data.len() + 64);
        frame.extend_from_slice(b"--FRAME\r\n");
        frame.extend_from_slice(format!("Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", data.len()).as_bytes());
        frame.extend_from_slice(data);
        frame.extend_from_slice(b"\r\n\r\n");
        conn.send(frame);
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

    /// `tcp_server` already strips the trailing CRLF, so the blank line
    /// terminating the inbound HTTP request arrives here as an empty
    /// string rather than the literal `"\r"` the original reads.
    fn on_command_received(&self, command: &str) {
        if command.is_empty() {
            let guard = self.shared.connection.lock().unwrap();
            if let Some(conn) = guard.as_ref() {
                conn.send(
                    b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace;boundary=FRAME\r\n\r\n".to_vec(),
                );
            }
        }
    }
}
