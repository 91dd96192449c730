//! Wired-OR SCSI bus
//!
//! Every participant drives its own slot. The lines seen by everyone are the
//! logical OR of all slot contributions. Control line changes are latched so
//! the owner of the bus can notify all participants after the fact, which
//! keeps participants from ever being re-entered from within a signal write.

use anyhow::{Result, bail};

use crate::debuggable::{Debuggable, DebuggableProperties, DebuggableProperty, DebuggablePropertyValue};
use crate::types::LatchingEvent;
use crate::x68k::scsi::ScsiSignals;
use crate::{dbgprop_bool, dbgprop_byte, dbgprop_enum, dbgprop_group, dbgprop_word_bin};

/// Amount of bus addresses (SCSI IDs)
pub const BUS_SLOTS: usize = 8;

/// Observer called synchronously with the new combined control lines
pub type BusMonitor = Box<dyn FnMut(ScsiSignals)>;

/// Kind of participant occupying a bus address
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum ScsiParticipant {
    Initiator,
    Target,
}

pub struct ScsiBus {
    /// Combined control lines
    ctrl: ScsiSignals,

    /// Combined data lines
    data: u8,

    slot_ctrl: [ScsiSignals; BUS_SLOTS],
    slot_data: [u8; BUS_SLOTS],
    occupants: [Option<ScsiParticipant>; BUS_SLOTS],

    /// Combined control lines changed since last taken
    changed: LatchingEvent,

    monitor: Option<BusMonitor>,
}

impl ScsiBus {
    pub fn new() -> Self {
        Self {
            ctrl: ScsiSignals::NONE,
            data: 0,
            slot_ctrl: [ScsiSignals::NONE; BUS_SLOTS],
            slot_data: [0; BUS_SLOTS],
            occupants: [None; BUS_SLOTS],
            changed: LatchingEvent::default(),
            monitor: None,
        }
    }

    /// Places a participant at a bus address, replacing the previous occupant.
    pub fn attach(&mut self, id: usize, participant: ScsiParticipant) -> Result<()> {
        if id >= BUS_SLOTS {
            bail!("Invalid SCSI ID {}", id);
        }
        if let Some(prev) = self.occupants[id] {
            log::debug!("Replacing {:?} at SCSI ID {}", prev, id);
        }
        self.occupants[id] = Some(participant);
        self.release_slot(id);
        Ok(())
    }

    /// Removes the participant at a bus address and releases whatever it drove.
    pub fn detach(&mut self, id: usize) {
        if id >= BUS_SLOTS {
            return;
        }
        self.occupants[id] = None;
        self.release_slot(id);
    }

    pub fn occupant(&self, id: usize) -> Option<ScsiParticipant> {
        self.occupants.get(id).copied().flatten()
    }

    /// Drives the control lines selected by `mask` for a single slot.
    pub fn set_control(&mut self, id: usize, value: ScsiSignals, mask: ScsiSignals) {
        let Some(slot) = self.slot_ctrl.get_mut(id) else {
            log::error!("Control write from invalid SCSI ID {}", id);
            return;
        };
        *slot = (*slot & !mask) | (value & mask);
        self.recombine();
    }

    /// Drives the data lines of a single slot. Data has no edge semantics,
    /// so this never counts as a change.
    pub fn set_data(&mut self, id: usize, value: u8) {
        let Some(slot) = self.slot_data.get_mut(id) else {
            log::error!("Data write from invalid SCSI ID {}", id);
            return;
        };
        *slot = value;
        self.data = self.slot_data.iter().fold(0, |acc, &d| acc | d);
    }

    pub fn get_control(&self) -> ScsiSignals {
        self.ctrl
    }

    pub fn get_data(&self) -> u8 {
        self.data
    }

    /// Neither BSY nor SEL asserted
    pub fn is_bus_free(&self) -> bool {
        !self.ctrl.intersects(ScsiSignals::BSY | ScsiSignals::SEL)
    }

    /// Returns whether the control lines changed since the last call.
    pub fn take_changed(&mut self) -> bool {
        self.changed.get_clear()
    }

    /// Releases every line driven by every participant.
    pub fn reset(&mut self) {
        self.slot_ctrl = [ScsiSignals::NONE; BUS_SLOTS];
        self.slot_data = [0; BUS_SLOTS];
        self.data = 0;
        self.recombine();
    }

    pub fn set_monitor(&mut self, monitor: Option<BusMonitor>) {
        self.monitor = monitor;
    }

    fn release_slot(&mut self, id: usize) {
        self.slot_ctrl[id] = ScsiSignals::NONE;
        self.slot_data[id] = 0;
        self.data = self.slot_data.iter().fold(0, |acc, &d| acc | d);
        self.recombine();
    }

    fn recombine(&mut self) {
        let ctrl = self
            .slot_ctrl
            .iter()
            .fold(ScsiSignals::NONE, |acc, &s| acc | s);
        if ctrl == self.ctrl {
            return;
        }
        self.ctrl = ctrl;
        self.changed.set();
        if let Some(monitor) = self.monitor.as_mut() {
            monitor(ctrl);
        }
    }
}

impl Debuggable for ScsiBus {
    fn get_debug_properties(&self) -> DebuggableProperties {
        let ctrl = self.ctrl;
        vec![
            dbgprop_word_bin!("Control", ctrl.0),
            dbgprop_byte!("Data", self.data),
            dbgprop_bool!("Bus free", self.is_bus_free()),
            dbgprop_group!(
                "Occupants",
                self.occupants
                    .iter()
                    .enumerate()
                    .filter_map(|(id, o)| o.map(|o| dbgprop_enum!(format!("ID {}", id), o)))
                    .collect()
            ),
        ]
    }
}
