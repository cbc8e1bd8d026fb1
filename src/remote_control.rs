// SPDX-License-Identifier: GPL-3.0-only

//! Remote-control adapter (§4.8/§6): a single-subscriber, line-delimited
//! JSON control channel on port 8889.
//!
//! Grounded on `RemoteControl.cpp`: one connection at a time, capabilities
//! sent once per connection, current values sent on connect and after every
//! accepted mutation, errors echo the offending command so the client can
//! correlate the failure. Unlike the stream adapters this one is wired
//! directly to the orchestrator's long-lived [`CapabilityTable`], not to a
//! pipeline session, since tuning must stay available whether or not a
//! video subscriber is currently attached.

use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::capability::{Capability, CapabilityListener, CapabilityTable};
use crate::constants::REMOTE_CONTROL_PORT;
use crate::errors::{ControlError, InitError, InitResult};
use crate::network::tcp_server::{Connection, TcpServer, TcpServerListener};

#[derive(Debug, Deserialize)]
struct Inbound {
    #[serde(rename = "type")]
    kind: String,
    content: InboundContent,
}

#[derive(Debug, Deserialize)]
struct InboundContent {
    control: String,
    value: f64,
}

fn capabilities_message(capabilities: &[Capability]) -> Vec<u8> {
    let content: serde_json::Map<String, serde_json::Value> = capabilities
        .iter()
        .map(|c| {
            (
                c.name.clone(),
                json!({
                    "type": c.ctrl_type.label(),
                    "minimum": c.min,
                    "maximum": c.max,
                    "default": c.default,
                }),
            )
        })
        .collect();
    line(&json!({"type": "capabilities", "content": content}))
}

fn current_values_message(current: &std::collections::HashMap<String, f64>) -> Vec<u8> {
    line(&json!({"type": "currentValues", "content": current}))
}

fn error_message(original_command: &str, message: &str) -> Vec<u8> {
    line(&json!({
        "type": "error",
        "content": {"message": format!("{original_command}: {message}")},
    }))
}

fn line(value: &serde_json::Value) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(value).unwrap_or_default();
    bytes.push(b'\n');
    bytes
}

struct Shared {
    connection: Mutex<Option<Connection>>,
}

/// Replays the capability table to whichever connection is currently
/// attached; installed as the table's single listener for this daemon's
/// lifetime.
struct Forwarder {
    shared: Arc<Shared>,
}

impl CapabilityListener for Forwarder {
    fn on_capabilities_changed(&self, capabilities: &[Capability]) {
        if let Some(conn) = self.shared.connection.lock().unwrap().as_ref() {
            conn.send(capabilities_message(capabilities));
        }
    }

    fn on_current_values_changed(&self, current: &std::collections::HashMap<String, f64>) {
        if let Some(conn) = self.shared.connection.lock().unwrap().as_ref() {
            conn.send(current_values_message(current));
        }
    }
}

pub struct RemoteControl {
    server: TcpServer,
}

impl RemoteControl {
    /// Starts listening on 8889. `capabilities` must already hold this
    /// daemon's full control set; its listener is replaced with this
    /// adapter's forwarder, so any previously attached listener stops
    /// receiving events.
    pub fn start(capabilities: Arc<CapabilityTable>) -> InitResult<Self> {
        let shared = Arc::new(Shared { connection: Mutex::new(None) });
        capabilities.set_listener(Box::new(Forwarder { shared: shared.clone() }));

        let listener: Arc<dyn TcpServerListener> = Arc::new(Listener { shared, capabilities });
        let server = RemoteControlServer::bind(listener)?;

        Ok(RemoteControl { server })
    }

    pub fn stop(&mut self) {
        self.server.stop();
    }
}

/// Thin wrapper so `TcpServer::start`'s port/name are spelled in one place.
struct RemoteControlServer;
impl RemoteControlServer {
    fn bind(listener: Arc<dyn TcpServerListener>) -> InitResult<TcpServer> {
        TcpServer::start(REMOTE_CONTROL_PORT, "remote-control", listener)
            .map_err(|source| InitError::BindFailed { port: REMOTE_CONTROL_PORT, source })
    }
}

struct Listener {
    shared: Arc<Shared>,
    capabilities: Arc<CapabilityTable>,
}

impl TcpServerListener for Listener {
    /// §6: "Exactly one connection at a time; on a second accept the
    /// adapter may close the previous." Dropping the old `Connection` here
    /// shuts its socket down and joins its writer thread before replacing
    /// it, closing the previous subscriber outright.
    fn on_new_connection(&self, connection: Connection) {
        *self.shared.connection.lock().unwrap() = Some(connection);
        // Re-attaching the forwarder as the table's listener triggers its
        // mandatory replay (capabilities, then current values), which now
        // reaches the connection just stored above.
        self.capabilities.set_listener(Box::new(Forwarder { shared: self.shared.clone() }));
    }

    fn on_connection_closed(&self) {
        *self.shared.connection.lock().unwrap() = None;
    }

    fn on_command_received(&self, command: &str) {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return;
        }

        let parsed: Result<Inbound, _> = serde_json::from_str(trimmed);
        let Ok(inbound) = parsed else {
            warn!(command = trimmed, "unparseable remote-control command");
            self.send_error(trimmed, "malformed command");
            return;
        };

        if inbound.kind != "setControl" {
            self.send_error(trimmed, &format!("unknown command type: {}", inbound.kind));
            return;
        }

        match self.capabilities.set_value(&inbound.content.control, inbound.content.value, true) {
            Ok(()) => {}
            Err(e) => self.send_control_error(trimmed, &e),
        }
    }
}

impl Listener {
    fn send_error(&self, original_command: &str, message: &str) {
        let guard = self.shared.connection.lock().unwrap();
        if let Some(conn) = guard.as_ref() {
            conn.send(error_message(original_command, message));
        }
    }

    fn send_control_error(&self, original_command: &str, err: &ControlError) {
        self.send_error(original_command, &err.to_string());
    }
}
