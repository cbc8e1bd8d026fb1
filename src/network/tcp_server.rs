// SPDX-License-Identifier: GPL-3.0-only

//! Single-subscriber TCP accept/connection plumbing shared by the H.264,
//! MJPEG, and remote-control adapters.
//!
//! One thread blocks in `accept()`, a second per-connection thread blocks
//! reading lines, and a third per-connection thread drains an outbound
//! queue — the same start/atomic-flag/join shape as the teacher's
//! `backends/camera/frame_loop.rs` (`CaptureLoopController`), applied here
//! to socket I/O instead of a capture loop. No async runtime: this daemon
//! is one thread per role everywhere, and introducing tokio/axum just for
//! the network edge would split its concurrency model in two.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{error, info, warn};

/// Callbacks an adapter implements to react to connection lifecycle and
/// inbound lines. A narrow trait rather than a virtual listener base class,
/// per the cyclic-ownership-removal note: no back-reference from
/// `Connection` to its owning adapter.
pub trait TcpServerListener: Send + Sync {
    fn on_new_connection(&self, connection: Connection);
    fn on_connection_closed(&self);
    fn on_command_received(&self, command: &str);
}

/// Outbound half of an accepted connection. `send` enqueues and returns
/// immediately; a dedicated writer thread drains the queue so the caller
/// (which may be an encoder's deliver thread) never blocks on the network.
pub struct Connection {
    raw: TcpStream,
    queue: Arc<(Mutex<VecDeque<Vec<u8>>>, Condvar)>,
    closing: Arc<AtomicBool>,
    writer_thread: Option<JoinHandle<()>>,
}

impl Connection {
    fn spawn(stream: TcpStream, name: &'static str) -> std::io::Result<Self> {
        let writer_stream = stream.try_clone()?;
        let queue: Arc<(Mutex<VecDeque<Vec<u8>>>, Condvar)> =
            Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        let closing = Arc::new(AtomicBool::new(false));

        let thread_queue = queue.clone();
        let thread_closing = closing.clone();
        let writer_thread = std::thread::spawn(move || {
            write_loop(writer_stream, &thread_queue, &thread_closing, name);
        });

        Ok(Connection { raw: stream, queue, closing, writer_thread: Some(writer_thread) })
    }

    /// Enqueue bytes for the writer thread. Never blocks on I/O; a closed
    /// connection silently drops the payload.
    pub fn send(&self, bytes: Vec<u8>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let (lock, condvar) = &*self.queue;
        lock.lock().unwrap().push_back(bytes);
        condvar.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.raw.shutdown(Shutdown::Both);
        self.closing.store(true, Ordering::SeqCst);
        self.queue.1.notify_all();
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

fn write_loop(
    mut stream: TcpStream,
    queue: &Arc<(Mutex<VecDeque<Vec<u8>>>, Condvar)>,
    closing: &Arc<AtomicBool>,
    name: &'static str,
) {
    let (lock, condvar) = &**queue;
    loop {
        let mut guard = lock.lock().unwrap();
        while guard.is_empty() && !closing.load(Ordering::SeqCst) {
            guard = condvar.wait(guard).unwrap();
        }
        let chunk = match guard.pop_front() {
            Some(chunk) => chunk,
            None => return,
        };
        drop(guard);

        if let Err(e) = stream.write_all(&chunk) {
            warn!(name, error = %e, "tcp write failed, closing connection");
            closing.store(true, Ordering::SeqCst);
            return;
        }
    }
}

pub struct TcpServer {
    port: u16,
    stopped: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl TcpServer {
    pub fn start(port: u16, name: &'static str, listener: Arc<dyn TcpServerListener>) -> std::io::Result<Self> {
        let tcp_listener = TcpListener::bind(("0.0.0.0", port))?;
        let stopped = Arc::new(AtomicBool::new(false));
        let thread_stopped = stopped.clone();
        // Bumped by `accept_one` before every `on_new_connection` call, so a
        // superseded connection's reader thread can tell it is no longer the
        // live one by the time its blocked read unblocks.
        let generation = Arc::new(AtomicU64::new(0));

        let accept_thread = std::thread::spawn(move || {
            info!(port, name, "listening");
            for incoming in tcp_listener.incoming() {
                if thread_stopped.load(Ordering::SeqCst) {
                    break;
                }
                match incoming {
                    Ok(stream) => accept_one(stream, name, &listener, &generation),
                    Err(e) => {
                        if thread_stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(name, error = %e, "accept failed");
                    }
                }
            }
            info!(name, "left accept loop");
        });

        Ok(TcpServer { port, stopped, accept_thread: Some(accept_thread) })
    }

    /// Flips the stop flag, then connects to the listening port itself to
    /// unblock the accept thread's blocking `accept()` call, and joins it.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if self.accept_thread.is_some() {
            self.stop();
        }
    }
}

fn accept_one(stream: TcpStream, name: &'static str, listener: &Arc<dyn TcpServerListener>, generation: &Arc<AtomicU64>) {
    info!(name, "accepted new connection");

    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!(name, error = %e, "failed to clone accepted stream");
            return;
        }
    };

    let connection = match Connection::spawn(stream, name) {
        Ok(c) => c,
        Err(e) => {
            error!(name, error = %e, "failed to spawn connection writer");
            return;
        }
    };

    // Must happen before `on_new_connection`: that call may synchronously
    // drop the previous connection, whose reader thread is blocked on
    // `read_line` and wakes once its socket is shut down. Bumping first
    // means that thread's later generation check always observes the bump.
    let my_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;

    listener.on_new_connection(connection);

    let listener = listener.clone();
    let generation = generation.clone();
    std::thread::spawn(move || {
        let mut reader = BufReader::new(reader_stream);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => listener.on_command_received(line.trim_end_matches(['\r', '\n'])),
            }
        }
        // A newer accepted connection may already have replaced this one;
        // only the reader thread for the currently live connection may
        // report the close, or it would wipe out the new one's state.
        if generation.load(Ordering::SeqCst) == my_generation {
            listener.on_connection_closed();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superseded_generation_does_not_match_after_new_connection() {
        let generation = Arc::new(AtomicU64::new(0));

        let first_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
        let second_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;

        assert_ne!(first_generation, second_generation);
        assert_eq!(generation.load(Ordering::SeqCst), second_generation);
        assert!(generation.load(Ordering::SeqCst) != first_generation);
    }

    #[test]
    fn sole_connections_generation_still_matches_on_its_own_close() {
        let generation = Arc::new(AtomicU64::new(0));
        let my_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(generation.load(Ordering::SeqCst), my_generation);
    }
}
