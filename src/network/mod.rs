// SPDX-License-Identifier: GPL-3.0-only

//! Networking surroundings: the shared TCP accept/connection abstraction
//! every external interface (§6) is built on.

pub mod tcp_server;

pub use tcp_server::{Connection, TcpServer, TcpServerListener};
