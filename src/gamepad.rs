//! Input device aggregation
//!
//! Devices come and go through an [`InputBackend`]; the [`SlotTable`] binds
//! them to the six joystick slots the control packet carries. A slot can also
//! hold a reservation (a locked device name) that outlives the device, so a
//! controller that is unplugged and plugged back in lands where the operator
//! put it.
//!
//! The poller runs on its own OS thread because device libraries want a
//! plain synchronous loop.

use crate::error::CommandRefused;
use crate::events::StationEvents;
use crate::types::{GamepadInfo, JoystickState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SLOT_COUNT: usize = 6;
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(20);

/// Raw device activity reported by a backend
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Connected { id: usize, name: String },
    Disconnected { id: usize },
    Axis { id: usize, index: usize, value: f32 },
    Button { id: usize, index: usize, pressed: bool },
    Pov { id: usize, index: usize, angle: i16 },
}

/// Source of input events, polled from the input thread
///
/// Backends are created on the poller thread and never leave it.
pub trait InputBackend {
    /// Drain everything that happened since the last poll
    fn poll_events(&mut self) -> Vec<InputEvent>;

    fn name(&self) -> &'static str;
}

/// Backend with no devices, used when no device library is compiled in
#[derive(Debug, Default)]
pub struct NoInputBackend;

impl InputBackend for NoInputBackend {
    fn poll_events(&mut self) -> Vec<InputEvent> {
        Vec::new()
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Backend fed by hand; clones share one queue
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    queue: Arc<Mutex<VecDeque<InputEvent>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: InputEvent) {
        self.queue.lock().push_back(event);
    }
}

impl InputBackend for ScriptedBackend {
    fn poll_events(&mut self) -> Vec<InputEvent> {
        self.queue.lock().drain(..).collect()
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[derive(Debug, Clone)]
struct TrackedDevice {
    id: usize,
    name: String,
    state: JoystickState,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    device: Option<TrackedDevice>,
    reservation: Option<String>,
}

/// One row of the slot listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotView {
    pub slot: usize,
    pub locked_name: Option<String>,
    pub device: Option<GamepadInfo>,
}

/// Slot -> device binding with optional per-slot reservations
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self {
            slots: vec![Slot::default(); SLOT_COUNT],
        }
    }
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one backend event; returns true when the set of devices changed
    pub fn apply(&mut self, event: InputEvent) -> bool {
        match event {
            InputEvent::Connected { id, name } => self.connect(id, name),
            InputEvent::Disconnected { id } => self.disconnect(id),
            InputEvent::Axis { id, index, value } => {
                if let Some(device) = self.device_mut(id) {
                    if let Some(axis) = device.state.axes.get_mut(index) {
                        *axis = value.clamp(-1.0, 1.0);
                    }
                }
                false
            }
            InputEvent::Button { id, index, pressed } => {
                if let Some(device) = self.device_mut(id) {
                    if let Some(button) = device.state.buttons.get_mut(index) {
                        *button = pressed;
                    }
                }
                false
            }
            InputEvent::Pov { id, index, angle } => {
                if let Some(device) = self.device_mut(id) {
                    if let Some(pov) = device.state.povs.get_mut(index) {
                        *pov = angle;
                    }
                }
                false
            }
        }
    }

    fn connect(&mut self, id: usize, name: String) -> bool {
        if self.slot_of(id).is_some() {
            return false;
        }

        let reserved = self.slots.iter().position(|slot| {
            slot.device.is_none() && slot.reservation.as_deref() == Some(name.as_str())
        });
        let free = || {
            self.slots
                .iter()
                .position(|slot| slot.device.is_none() && slot.reservation.is_none())
        };

        let Some(index) = reserved.or_else(free) else {
            warn!("No free joystick slot for '{}', ignoring device", name);
            return false;
        };

        info!("Gamepad connected: {} (slot {})", name, index);
        self.slots[index].device = Some(TrackedDevice {
            id,
            name,
            state: JoystickState::gamepad(),
        });
        true
    }

    fn disconnect(&mut self, id: usize) -> bool {
        let Some(index) = self.slot_of(id) else {
            return false;
        };
        let slot = &mut self.slots[index];
        if let Some(device) = slot.device.take() {
            match &slot.reservation {
                Some(_) => info!("Gamepad disconnected: {} (slot {} stays locked)", device.name, index),
                None => info!("Gamepad disconnected: {} (slot {})", device.name, index),
            }
        }
        true
    }

    fn slot_of(&self, id: usize) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.device.as_ref().map(|d| d.id) == Some(id))
    }

    fn device_mut(&mut self, id: usize) -> Option<&mut TrackedDevice> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.device.as_mut())
            .find(|device| device.id == id)
    }

    fn check_slot(slot: usize) -> Result<(), CommandRefused> {
        if slot >= SLOT_COUNT {
            return Err(CommandRefused::InvalidSlot(slot));
        }
        Ok(())
    }

    fn info(&self, index: usize) -> Option<GamepadInfo> {
        let slot = &self.slots[index];
        slot.device.as_ref().map(|device| GamepadInfo {
            id: device.id,
            name: device.name.clone(),
            slot: index,
            axes: device.state.axes.clone(),
            buttons: device.state.buttons.clone(),
            povs: device.state.povs.clone(),
            locked: slot.reservation.as_deref() == Some(device.name.as_str()),
        })
    }

    /// Always six entries, in slot order
    pub fn list(&self) -> Vec<SlotView> {
        (0..SLOT_COUNT)
            .map(|index| SlotView {
                slot: index,
                locked_name: self.slots[index].reservation.clone(),
                device: self.info(index),
            })
            .collect()
    }

    /// Connected devices only
    pub fn gamepads(&self) -> Vec<GamepadInfo> {
        (0..SLOT_COUNT).filter_map(|index| self.info(index)).collect()
    }

    /// Reserve a slot for the name of the device currently in it
    pub fn lock(&mut self, slot: usize) -> Result<(), CommandRefused> {
        Self::check_slot(slot)?;
        let target = &mut self.slots[slot];
        let name = target
            .device
            .as_ref()
            .map(|device| device.name.clone())
            .ok_or(CommandRefused::EmptySlot(slot))?;
        info!("Locking slot {} to '{}'", slot, name);
        target.reservation = Some(name);
        Ok(())
    }

    pub fn unlock(&mut self, slot: usize) -> Result<(), CommandRefused> {
        Self::check_slot(slot)?;
        if self.slots[slot].reservation.take().is_some() {
            info!("Unlocked slot {}", slot);
        }
        Ok(())
    }

    /// Move the device in `from` to `to`, swapping if `to` is occupied
    ///
    /// Reservations stay attached to their slots.
    pub fn reorder(&mut self, from: usize, to: usize) -> Result<(), CommandRefused> {
        Self::check_slot(from)?;
        Self::check_slot(to)?;
        if self.slots[from].device.is_none() {
            return Err(CommandRefused::EmptySlot(from));
        }
        if from == to {
            return Ok(());
        }

        let moving = self.slots[from].device.take();
        let displaced = std::mem::replace(&mut self.slots[to].device, moving);
        self.slots[from].device = displaced;
        info!("Moved gamepad from slot {} to slot {}", from, to);
        Ok(())
    }

    /// Joysticks in slot order, up to the highest connected or locked slot
    ///
    /// Gaps are sent as empty joysticks so later slots keep their position.
    pub fn snapshot(&self) -> Vec<JoystickState> {
        let Some(highest) = self
            .slots
            .iter()
            .rposition(|slot| slot.device.is_some() || slot.reservation.is_some())
        else {
            return Vec::new();
        };

        self.slots[..=highest]
            .iter()
            .map(|slot| {
                slot.device
                    .as_ref()
                    .map(|device| device.state.clone())
                    .unwrap_or_default()
            })
            .collect()
    }
}

/// Shared input state: the slot table plus the per-tick snapshot the
/// transmitter reads
pub struct InputAggregator {
    table: Mutex<SlotTable>,
    snapshot: RwLock<Vec<JoystickState>>,
    events: Arc<StationEvents>,
}

impl InputAggregator {
    pub fn new(events: Arc<StationEvents>) -> Self {
        Self {
            table: Mutex::new(SlotTable::new()),
            snapshot: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Apply a batch of backend events and refresh the snapshot
    pub fn apply_events(&self, batch: Vec<InputEvent>) {
        if batch.is_empty() {
            return;
        }
        let mut table = self.table.lock();
        for event in batch {
            table.apply(event);
        }
        self.sync(&table);
    }

    pub fn snapshot(&self) -> Vec<JoystickState> {
        self.snapshot.read().clone()
    }

    pub fn list(&self) -> Vec<SlotView> {
        self.table.lock().list()
    }

    pub fn lock_slot(&self, slot: usize) -> Result<(), CommandRefused> {
        self.with_table(|table| table.lock(slot))
    }

    pub fn unlock_slot(&self, slot: usize) -> Result<(), CommandRefused> {
        self.with_table(|table| table.unlock(slot))
    }

    pub fn reorder(&self, from: usize, to: usize) -> Result<(), CommandRefused> {
        self.with_table(|table| table.reorder(from, to))
    }

    fn with_table<R>(
        &self,
        edit: impl FnOnce(&mut SlotTable) -> Result<R, CommandRefused>,
    ) -> Result<R, CommandRefused> {
        let mut table = self.table.lock();
        let result = edit(&mut table)?;
        self.sync(&table);
        Ok(result)
    }

    fn sync(&self, table: &SlotTable) {
        *self.snapshot.write() = table.snapshot();
        self.events.publish_gamepads(table.gamepads());
    }
}

/// Run a backend on a dedicated thread until `stop` is set
pub fn spawn_poller<F>(
    aggregator: Arc<InputAggregator>,
    make_backend: F,
    period: Duration,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() -> Box<dyn InputBackend> + Send + 'static,
{
    std::thread::Builder::new()
        .name("input-poller".to_string())
        .spawn(move || {
            let mut backend = make_backend();
            info!("Input poller started ({} backend, {} ms)", backend.name(), period.as_millis());
            while !stop.load(Ordering::Relaxed) {
                aggregator.apply_events(backend.poll_events());
                std::thread::sleep(period);
            }
            debug!("Input poller stopped");
        })
}

/// Best backend compiled into this build
pub fn default_backend() -> Box<dyn InputBackend> {
    #[cfg(feature = "gamepad")]
    {
        match gilrs_backend::GilrsBackend::new() {
            Ok(backend) => return Box::new(backend),
            Err(e) => warn!("Gamepad library unavailable, running without input: {}", e),
        }
    }
    Box::new(NoInputBackend)
}

#[cfg(feature = "gamepad")]
pub mod gilrs_backend {
    //! Backend over the `gilrs` device library, using the WPILib axis and
    //! button numbering

    use super::{InputBackend, InputEvent};
    use crate::error::{DsError, Result};
    use gilrs::{Axis, Button, Event, EventType, GamepadId, Gilrs};
    use std::collections::HashMap;

    fn axis_index(axis: Axis) -> Option<usize> {
        match axis {
            Axis::LeftStickX => Some(0),
            Axis::LeftStickY => Some(1),
            Axis::LeftZ => Some(2),
            Axis::RightStickX => Some(3),
            Axis::RightStickY => Some(4),
            Axis::RightZ => Some(5),
            _ => None,
        }
    }

    fn button_index(button: Button) -> Option<usize> {
        match button {
            Button::South => Some(0),
            Button::East => Some(1),
            Button::West => Some(2),
            Button::North => Some(3),
            Button::LeftTrigger => Some(4),
            Button::RightTrigger => Some(5),
            Button::Select => Some(6),
            Button::Start => Some(7),
            Button::LeftThumb => Some(8),
            Button::RightThumb => Some(9),
            Button::LeftTrigger2 => Some(10),
            Button::RightTrigger2 => Some(11),
            Button::C => Some(12),
            Button::Z => Some(13),
            Button::Mode => Some(14),
            Button::Unknown => Some(15),
            _ => None,
        }
    }

    /// D-pad to POV angle; -1 when released or contradictory
    pub fn dpad_to_pov(up: bool, right: bool, down: bool, left: bool) -> i16 {
        match (up, right, down, left) {
            (true, false, false, false) => 0,
            (true, true, false, false) => 45,
            (false, true, false, false) => 90,
            (false, true, true, false) => 135,
            (false, false, true, false) => 180,
            (false, false, true, true) => 225,
            (false, false, false, true) => 270,
            (true, false, false, true) => 315,
            _ => -1,
        }
    }

    #[derive(Default, Clone, Copy)]
    struct DPad {
        up: bool,
        right: bool,
        down: bool,
        left: bool,
    }

    pub struct GilrsBackend {
        gilrs: Gilrs,
        dpads: HashMap<GamepadId, DPad>,
        pending: Vec<InputEvent>,
    }

    impl GilrsBackend {
        pub fn new() -> Result<Self> {
            let gilrs = Gilrs::new().map_err(|e| DsError::Input(e.to_string()))?;
            let pending = gilrs
                .gamepads()
                .filter(|(_, gamepad)| gamepad.is_connected())
                .map(|(id, gamepad)| InputEvent::Connected {
                    id: id.into(),
                    name: gamepad.name().to_string(),
                })
                .collect();
            Ok(Self {
                gilrs,
                dpads: HashMap::new(),
                pending,
            })
        }
    }

    impl InputBackend for GilrsBackend {
        fn poll_events(&mut self) -> Vec<InputEvent> {
            let mut events = std::mem::take(&mut self.pending);

            while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
                let device: usize = id.into();
                match event {
                    EventType::Connected => {
                        let name = self.gilrs.gamepad(id).name().to_string();
                        events.push(InputEvent::Connected { id: device, name });
                    }
                    EventType::Disconnected => {
                        self.dpads.remove(&id);
                        events.push(InputEvent::Disconnected { id: device });
                    }
                    EventType::AxisChanged(axis, value, _) => {
                        if let Some(index) = axis_index(axis) {
                            events.push(InputEvent::Axis { id: device, index, value });
                        }
                    }
                    EventType::ButtonChanged(button, value, _) => {
                        let pressed = value > 0.5;
                        let dpad = self.dpads.entry(id).or_default();
                        match button {
                            Button::DPadUp => dpad.up = pressed,
                            Button::DPadRight => dpad.right = pressed,
                            Button::DPadDown => dpad.down = pressed,
                            Button::DPadLeft => dpad.left = pressed,
                            other => {
                                if let Some(index) = button_index(other) {
                                    events.push(InputEvent::Button { id: device, index, pressed });
                                }
                                continue;
                            }
                        }
                        let angle = dpad_to_pov(dpad.up, dpad.right, dpad.down, dpad.left);
                        events.push(InputEvent::Pov { id: device, index: 0, angle });
                    }
                    _ => {}
                }
            }
            events
        }

        fn name(&self) -> &'static str {
            "gilrs"
        }
    }

}
