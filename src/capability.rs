// SPDX-License-Identifier: GPL-3.0-only

//! Capability table: discovers, clamps, and applies sensor/ISP controls.
//!
//! `discover_controls` below builds the control set from libcamera's own
//! `ControlInfoMap` (`Camera::controls()`), the same map `CameraCapabilities`
//! is constructed from in the original implementation. It opens its own
//! short-lived `CameraManager` session purely to read that map; it does not
//! acquire the camera, so it never contends with `camera::pipeline`'s own
//! acquire/configure/start cycle (see DESIGN.md for why capability discovery
//! and the streaming session stay on separate camera handles here). The
//! `CapabilityTable` below is the component the rest of the daemon talks to:
//! it coerces every control's min/max/default/current to `f64` for a
//! uniform external (JSON) surface while remembering each control's
//! original numeric type so mutations can be down-converted before they
//! reach the driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use libcamera::camera_manager::CameraManager;
use libcamera::control::ControlInfoMap;
use libcamera::control_value::ControlValue as LibControlValue;
use libcamera::controls::ControlId;
use tracing::debug;

use crate::errors::{ControlError, InitError, InitResult};

// ===== discovery from libcamera's control info map =====

/// One entry of the framework's `(controlId -> controlInfo)` map, already
/// coerced to `f64`, before materializing a [`Capability`].
#[derive(Debug, Clone)]
pub struct RawControlInfo {
    pub id: u32,
    pub name: String,
    pub ctrl_type: ControlType,
    pub minimum: f64,
    pub maximum: f64,
    pub default_value: f64,
}

/// Opens a `CameraManager`, finds the one camera this daemon supports, and
/// reads its control info map. Does not `acquire()` the camera: `controls()`
/// is available on the plain, unacquired `Camera`, so this can run (and this
/// `CameraManager` can be dropped) independently of whether a streaming
/// session is currently active.
pub fn discover_controls() -> InitResult<Vec<RawControlInfo>> {
    let manager =
        CameraManager::new().map_err(|e| InitError::InvalidConfiguration(format!("CameraManager::new: {e}")))?;
    let cameras = manager.cameras();
    match cameras.len() {
        1 => {}
        0 => return Err(InitError::NoCamera),
        n => return Err(InitError::MultipleCameras(n)),
    }
    let camera = cameras.get(0).ok_or(InitError::NoCamera)?;
    Ok(controls_from_map(camera.controls()))
}

/// Skips any entry whose min, max, or default isn't a plain scalar bool,
/// byte, or integer/float control, and any whose min exceeds its max.
fn controls_from_map(map: &ControlInfoMap) -> Vec<RawControlInfo> {
    map.into_iter()
        .filter_map(|(id, info)| {
            let (ctrl_type, minimum) = scalar(&info.min())?;
            let (_, maximum) = scalar(&info.max())?;
            let (_, default_value) = scalar(&info.def())?;
            if minimum > maximum {
                return None;
            }
            let name = ControlId::try_from(id)
                .map(|known| format!("{known:?}"))
                .unwrap_or_else(|_| format!("control-{id}"));
            Some(RawControlInfo { id, name, ctrl_type, minimum, maximum, default_value })
        })
        .collect()
}

fn scalar(value: &LibControlValue) -> Option<(ControlType, f64)> {
    match value {
        LibControlValue::Bool(v) => v.first().map(|b| (ControlType::Bool, if *b { 1.0 } else { 0.0 })),
        LibControlValue::Byte(v) => v.first().map(|b| (ControlType::Byte, *b as f64)),
        LibControlValue::Int32(v) => v.first().map(|i| (ControlType::Int32, *i as f64)),
        LibControlValue::Int64(v) => v.first().map(|i| (ControlType::Int64, *i as f64)),
        LibControlValue::Float(v) => v.first().map(|f| (ControlType::Float, *f as f64)),
        _ => None,
    }
}

// ===== capability table =====

/// The original numeric type a capability's driver control used, kept so
/// `setValue`'s float surface can be down-converted before reaching the
/// driver. Mirrors SPEC_FULL.md's `ControlValue` tagged union.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Bool,
    Byte,
    Int32,
    Int64,
    Float,
}

impl ControlType {
    pub fn label(self) -> &'static str {
        match self {
            ControlType::Bool => "bool",
            ControlType::Byte => "byte",
            ControlType::Int32 => "int32",
            ControlType::Int64 => "int64",
            ControlType::Float => "float",
        }
    }
}

/// A down-converted control value ready to hand to the camera pipeline's
/// pending-controls sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlValue {
    Bool(bool),
    Byte(u8),
    Int32(i32),
    Int64(i64),
    Float(f32),
}

impl From<ControlValue> for LibControlValue {
    fn from(value: ControlValue) -> Self {
        match value {
            ControlValue::Bool(v) => LibControlValue::from(v),
            ControlValue::Byte(v) => LibControlValue::from(v),
            ControlValue::Int32(v) => LibControlValue::from(v),
            ControlValue::Int64(v) => LibControlValue::from(v),
            ControlValue::Float(v) => LibControlValue::from(v),
        }
    }
}

fn down_convert(ty: ControlType, value: f64) -> ControlValue {
    match ty {
        ControlType::Bool => ControlValue::Bool(value != 0.0),
        ControlType::Byte => ControlValue::Byte(value.clamp(0.0, 255.0) as u8),
        ControlType::Int32 => ControlValue::Int32(value as i32),
        ControlType::Int64 => ControlValue::Int64(value as i64),
        ControlType::Float => ControlValue::Float(value as f32),
    }
}

/// `(id, name, type, min, max, default, current)` with `min <= current <= max`.
#[derive(Debug, Clone)]
pub struct Capability {
    pub id: u32,
    pub name: String,
    pub ctrl_type: ControlType,
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub current: f64,
}

/// A single queued driver control, produced by `setValue` and handed to the
/// camera pipeline to attach to the next enqueued request.
#[derive(Debug, Clone)]
pub struct PendingControl {
    pub id: u32,
    pub value: ControlValue,
}

/// Receives queued controls from a `CapabilityTable`. The camera pipeline
/// implements this to fold them into its pending-controls list; tests use
/// an in-memory `Vec` instead.
pub trait PendingControlSink: Send + Sync {
    fn push(&self, control: PendingControl);
}

/// Forwards pending-control pushes to whichever camera session is currently
/// running. The capability table and the remote-control surface built on it
/// outlive any single capture session, so the table is handed a router
/// instead of a session's own sink; the orchestrator attaches the running
/// session's sink on start and detaches it on stop. While nothing is
/// attached, mutations still update `CapabilityTable`'s own current-value
/// state (and notify listeners) but have no effect on the driver, since
/// there is no running session to queue the control onto.
pub struct PendingControlRouter {
    target: Mutex<Option<Arc<dyn PendingControlSink>>>,
}

impl PendingControlRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(PendingControlRouter { target: Mutex::new(None) })
    }

    pub fn attach(&self, sink: Arc<dyn PendingControlSink>) {
        *self.target.lock().unwrap() = Some(sink);
    }

    pub fn detach(&self) {
        *self.target.lock().unwrap() = None;
    }
}

impl PendingControlSink for PendingControlRouter {
    fn push(&self, control: PendingControl) {
        if let Some(target) = self.target.lock().unwrap().as_ref() {
            target.push(control);
        }
    }
}

/// Fired on listener attach (replay) and after every successful mutation.
pub trait CapabilityListener: Send {
    fn on_capabilities_changed(&self, capabilities: &[Capability]);
    fn on_current_values_changed(&self, current: &HashMap<String, f64>);
}

struct NoopListener;
impl CapabilityListener for NoopListener {
    fn on_capabilities_changed(&self, _capabilities: &[Capability]) {}
    fn on_current_values_changed(&self, _current: &HashMap<String, f64>) {}
}

pub struct CapabilityTable {
    capabilities: Mutex<Vec<Capability>>,
    listener: Mutex<Box<dyn CapabilityListener>>,
    sink: Arc<dyn PendingControlSink>,
}

impl CapabilityTable {
    /// Build from the already-filtered output of [`discover_controls`].
    /// `from_raw_controls` no longer does any filtering of its own: an
    /// entry only reaches here once `controls_from_map` has confirmed it is
    /// a supported scalar type with `min <= max`.
    ///
    /// `sink` is shared rather than owned outright because the table
    /// outlives any one camera session: the orchestrator hands it a
    /// [`PendingControlRouter`] it can re-point at each session in turn.
    pub fn from_raw_controls(raw: Vec<RawControlInfo>, sink: Arc<dyn PendingControlSink>) -> Self {
        let capabilities = raw
            .into_iter()
            .map(|info| Capability {
                id: info.id,
                name: info.name,
                ctrl_type: info.ctrl_type,
                min: info.minimum,
                max: info.maximum,
                default: info.default_value,
                current: info.default_value,
            })
            .collect();

        CapabilityTable { capabilities: Mutex::new(capabilities), listener: Mutex::new(Box::new(NoopListener)), sink }
    }

    /// Replace the listener and immediately replay the full table and the
    /// current-value map, so a late subscriber catches up.
    pub fn set_listener(&self, listener: Box<dyn CapabilityListener>) {
        let caps = self.capabilities.lock().unwrap();
        listener.on_capabilities_changed(&caps);
        listener.on_current_values_changed(&Self::current_map(&caps));
        *self.listener.lock().unwrap() = listener;
    }

    fn current_map(caps: &[Capability]) -> HashMap<String, f64> {
        caps.iter().map(|c| (c.name.clone(), c.current)).collect()
    }

    pub fn snapshot(&self) -> Vec<Capability> {
        self.capabilities.lock().unwrap().clone()
    }

    /// Case-insensitive lookup and clamp-checked mutation. On success,
    /// queues a down-converted driver control and optionally notifies the
    /// listener; on failure, state is untouched.
    pub fn set_value(&self, name: &str, value: f64, notify_listener: bool) -> Result<(), ControlError> {
        let mut caps = self.capabilities.lock().unwrap();
        let Some(cap) = caps.iter_mut().find(|c| c.name.eq_ignore_ascii_case(name)) else {
            return Err(ControlError::UnknownCapability(name.to_string()));
        };

        if value < cap.min || value > cap.max {
            return Err(ControlError::OutOfRange {
                name: cap.name.clone(),
                value,
                min: cap.min,
                max: cap.max,
            });
        }

        cap.current = value;
        let id = cap.id;
        let ctrl_type = cap.ctrl_type;
        debug!(name = %cap.name, value, ty = ctrl_type.label(), "capability mutated");

        self.sink.push(PendingControl { id, value: down_convert(ctrl_type, value) });

        if notify_listener {
            let current = Self::current_map(&caps);
            self.listener.lock().unwrap().on_current_values_changed(&current);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink(StdMutex<Vec<PendingControl>>);
    impl PendingControlSink for RecordingSink {
        fn push(&self, control: PendingControl) {
            self.0.lock().unwrap().push(control);
        }
    }

    struct RecordingListener {
        capabilities_calls: std::sync::Arc<StdMutex<usize>>,
        values_calls: std::sync::Arc<StdMutex<Vec<HashMap<String, f64>>>>,
    }
    impl CapabilityListener for RecordingListener {
        fn on_capabilities_changed(&self, _capabilities: &[Capability]) {
            *self.capabilities_calls.lock().unwrap() += 1;
        }
        fn on_current_values_changed(&self, current: &HashMap<String, f64>) {
            self.values_calls.lock().unwrap().push(current.clone());
        }
    }

    fn sample_table() -> CapabilityTable {
        let raw = vec![RawControlInfo {
            id: 1,
            name: "Brightness".to_string(),
            ctrl_type: ControlType::Int32,
            minimum: -1.0,
            maximum: 1.0,
            default_value: 0.0,
        }];
        CapabilityTable::from_raw_controls(raw, Arc::new(RecordingSink(StdMutex::new(Vec::new()))))
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let table = sample_table();
        assert_eq!(
            table.set_value("Nope", 1.0, true),
            Err(ControlError::UnknownCapability("Nope".to_string()))
        );
    }

    #[test]
    fn case_insensitive_lookup() {
        let table = sample_table();
        assert!(table.set_value("brightness", 0.5, true).is_ok());
        assert_eq!(table.snapshot()[0].current, 0.5);
    }

    #[test]
    fn boundaries_accept_min_max_reject_beyond() {
        let table = sample_table();
        assert!(table.set_value("Brightness", -1.0, true).is_ok());
        assert!(table.set_value("Brightness", 1.0, true).is_ok());
        assert!(matches!(
            table.set_value("Brightness", -1.0001, true),
            Err(ControlError::OutOfRange { .. })
        ));
        assert!(matches!(
            table.set_value("Brightness", 1.0001, true),
            Err(ControlError::OutOfRange { .. })
        ));
    }

    #[test]
    fn listener_attach_replays_current_state() {
        let table = sample_table();
        let capabilities_calls = std::sync::Arc::new(StdMutex::new(0));
        let values_calls = std::sync::Arc::new(StdMutex::new(Vec::new()));
        let listener = RecordingListener {
            capabilities_calls: capabilities_calls.clone(),
            values_calls: values_calls.clone(),
        };
        table.set_listener(Box::new(listener));

        assert_eq!(*capabilities_calls.lock().unwrap(), 1);
        assert_eq!(values_calls.lock().unwrap().len(), 1);
        assert_eq!(values_calls.lock().unwrap()[0].get("Brightness"), Some(&0.0));
    }

    #[test]
    fn out_of_range_mutation_leaves_value_unchanged() {
        let table = sample_table();
        assert!(table.set_value("Brightness", 5.0, true).is_err());
        assert_eq!(table.snapshot()[0].current, 0.0);
    }

    #[test]
    fn scalar_extracts_first_element_of_each_variant() {
        assert_eq!(scalar(&LibControlValue::from(true)), Some((ControlType::Bool, 1.0)));
        assert_eq!(scalar(&LibControlValue::from(7u8)), Some((ControlType::Byte, 7.0)));
        assert_eq!(scalar(&LibControlValue::from(-3i32)), Some((ControlType::Int32, -3.0)));
        assert_eq!(scalar(&LibControlValue::from(42i64)), Some((ControlType::Int64, 42.0)));
        assert_eq!(scalar(&LibControlValue::from(1.5f32)), Some((ControlType::Float, 1.5)));
        assert_eq!(scalar(&LibControlValue::None), None);
    }

    #[test]
    fn control_value_round_trips_into_libcamera_control_value() {
        assert!(matches!(LibControlValue::from(ControlValue::Int32(5)), LibControlValue::Int32(v) if v[0] == 5));
        assert!(matches!(LibControlValue::from(ControlValue::Float(1.5)), LibControlValue::Float(v) if v[0] == 1.5));
    }
}
