//! SCSI target generic/shared code

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::debuggable::Debuggable;
use crate::x68k::scsi::bus::ScsiBus;
use crate::x68k::scsi::{ScsiPhase, ScsiSignals};

#[derive(Debug, Clone, Copy, Eq, PartialEq, strum::IntoStaticStr, strum::Display)]
/// Enumeration of supported emulated SCSI target types (devices)
pub enum ScsiTargetType {
    Disk,
}

/// An abstraction of a generic SCSI target.
///
/// Targets only ever talk to the initiator through the bus lines.
pub trait ScsiTarget: Debuggable {
    fn target_type(&self) -> ScsiTargetType;

    /// Connects the target to a bus address.
    fn attach(&mut self, id: usize);

    /// Disconnects the target from its bus address.
    fn detach(&mut self);

    fn bus_id(&self) -> Option<usize>;

    /// Called after every change of the combined control lines.
    fn bus_changed(&mut self, bus: &mut ScsiBus);

    /// Aborts everything in flight and releases the bus.
    fn reset(&mut self, bus: &mut ScsiBus);

    /// Responds to selection
    fn is_ready(&self) -> bool;

    /// Returns the drives total capacity in bytes
    fn capacity(&self) -> Option<u64>;

    fn image_path(&self) -> Option<&Path>;

    /// Flushes and drops the medium.
    fn eject(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
/// Target side of the REQ/ACK handshake
enum Handshake {
    /// Not connected to an initiator
    BusFree,
    /// BSY asserted in response to selection, waiting for SEL to drop
    Selected,
    /// Connected, no byte in flight
    Connected,
    /// REQ asserted, waiting for ACK
    Requesting,
    /// REQ released after ACK, waiting for ACK to drop
    Acknowledged,
}

/// Events observed on the bus that a target has to act upon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// RST asserted on the bus
    Reset,
    /// Selection completed, with the state of ATN as SEL was released
    Selected { atn: bool },
    /// The initiator completed the handshake of one byte.
    /// Carries the byte latched from the bus on output phases.
    Transferred(u8),
}

/// Target side of the bus protocol: responding to selection and pacing
/// single bytes through REQ/ACK.
#[derive(Debug, Serialize, Deserialize)]
pub struct TargetLink {
    id: Option<usize>,
    handshake: Handshake,
    phase: Option<ScsiPhase>,
    /// Byte latched from the bus on ACK
    latched: u8,
}

impl TargetLink {
    pub fn new() -> Self {
        Self {
            id: None,
            handshake: Handshake::BusFree,
            phase: None,
            latched: 0,
        }
    }

    pub fn id(&self) -> Option<usize> {
        self.id
    }

    pub fn attach(&mut self, id: usize) {
        self.id = Some(id);
        self.handshake = Handshake::BusFree;
        self.phase = None;
    }

    pub fn detach(&mut self) {
        self.id = None;
        self.handshake = Handshake::BusFree;
        self.phase = None;
    }

    pub fn is_connected(&self) -> bool {
        self.handshake != Handshake::BusFree
    }

    pub fn phase(&self) -> Option<ScsiPhase> {
        self.phase
    }

    pub fn handshake_name(&self) -> &'static str {
        self.handshake.into()
    }

    /// Follows the bus lines. `selectable` gates the response to selection.
    pub fn bus_changed(&mut self, bus: &mut ScsiBus, selectable: bool) -> Option<LinkEvent> {
        let id = self.id?;
        let ctrl = bus.get_control();

        if ctrl.rst() {
            if self.handshake != Handshake::BusFree {
                self.release(bus);
            }
            return Some(LinkEvent::Reset);
        }

        match self.handshake {
            Handshake::BusFree => {
                if selectable
                    && ctrl.sel()
                    && !ctrl.bsy()
                    && bus.get_data() & (1 << id) != 0
                {
                    bus.set_control(id, ScsiSignals::BSY, ScsiSignals::BSY);
                    self.handshake = Handshake::Selected;
                }
                None
            }
            Handshake::Selected => {
                if ctrl.sel() {
                    return None;
                }
                self.handshake = Handshake::Connected;
                Some(LinkEvent::Selected { atn: ctrl.atn() })
            }
            Handshake::Connected => None,
            Handshake::Requesting => {
                if !ctrl.ack() {
                    return None;
                }
                if self.phase.is_some_and(|p| !p.is_input()) {
                    self.latched = bus.get_data();
                }
                bus.set_control(id, ScsiSignals::NONE, ScsiSignals::REQ);
                self.handshake = Handshake::Acknowledged;
                None
            }
            Handshake::Acknowledged => {
                if ctrl.ack() {
                    return None;
                }
                self.handshake = Handshake::Connected;
                Some(LinkEvent::Transferred(self.latched))
            }
        }
    }

    /// Switches to `phase` and requests one byte. On input phases `data`
    /// is driven onto the bus before REQ is asserted.
    pub fn request(&mut self, bus: &mut ScsiBus, phase: ScsiPhase, data: u8) {
        let Some(id) = self.id else {
            return;
        };
        bus.set_data(id, if phase.is_input() { data } else { 0 });
        bus.set_control(
            id,
            ScsiSignals::BSY | phase.signals() | ScsiSignals::REQ,
            ScsiSignals::BSY | ScsiSignals::PHASE_MASK | ScsiSignals::REQ,
        );
        self.latched = 0;
        self.phase = Some(phase);
        self.handshake = Handshake::Requesting;
    }

    /// Releases every line, freeing the bus.
    pub fn release(&mut self, bus: &mut ScsiBus) {
        if let Some(id) = self.id {
            bus.set_data(id, 0);
            bus.set_control(id, ScsiSignals::NONE, ScsiSignals::ALL);
        }
        self.phase = None;
        self.handshake = Handshake::BusFree;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INITIATOR: usize = 7;

    fn selected_link(bus: &mut ScsiBus, id: usize) -> TargetLink {
        let mut link = TargetLink::new();
        link.attach(id);
        bus.set_data(INITIATOR, (1 << INITIATOR) | (1 << id));
        bus.set_control(INITIATOR, ScsiSignals::SEL, ScsiSignals::ALL);
        assert_eq!(link.bus_changed(bus, true), None);
        assert!(bus.get_control().bsy());
        bus.set_control(INITIATOR, ScsiSignals::NONE, ScsiSignals::ALL);
        bus.set_data(INITIATOR, 0);
        assert_eq!(link.bus_changed(bus, true), Some(LinkEvent::Selected { atn: false }));
        link
    }

    #[test]
    fn ignores_other_ids() {
        let mut bus = ScsiBus::new();
        let mut link = TargetLink::new();
        link.attach(3);
        bus.set_data(INITIATOR, 0x81);
        bus.set_control(INITIATOR, ScsiSignals::SEL, ScsiSignals::ALL);
        assert_eq!(link.bus_changed(&mut bus, true), None);
        assert!(!bus.get_control().bsy());
        assert!(!link.is_connected());
    }

    #[test]
    fn not_selectable() {
        let mut bus = ScsiBus::new();
        let mut link = TargetLink::new();
        link.attach(0);
        bus.set_data(INITIATOR, 0x81);
        bus.set_control(INITIATOR, ScsiSignals::SEL, ScsiSignals::ALL);
        assert_eq!(link.bus_changed(&mut bus, false), None);
        assert!(!bus.get_control().bsy());
    }

    #[test]
    fn output_byte_handshake() {
        let mut bus = ScsiBus::new();
        let mut link = selected_link(&mut bus, 0);

        link.request(&mut bus, ScsiPhase::Command, 0xFF);
        let ctrl = bus.get_control();
        assert!(ctrl.req() && ctrl.bsy() && ctrl.cd() && !ctrl.io());
        // Target does not drive data on output phases
        assert_eq!(bus.get_data(), 0);

        bus.set_data(INITIATOR, 0x28);
        bus.set_control(INITIATOR, ScsiSignals::ACK, ScsiSignals::ACK);
        assert_eq!(link.bus_changed(&mut bus, true), None);
        assert!(!bus.get_control().req());

        bus.set_control(INITIATOR, ScsiSignals::NONE, ScsiSignals::ACK);
        assert_eq!(link.bus_changed(&mut bus, true), Some(LinkEvent::Transferred(0x28)));
    }

    #[test]
    fn input_byte_drives_data() {
        let mut bus = ScsiBus::new();
        let mut link = selected_link(&mut bus, 2);

        link.request(&mut bus, ScsiPhase::Status, 0x02);
        assert_eq!(bus.get_data(), 0x02);
        assert_eq!(ScsiPhase::from_signals(bus.get_control()), Some(ScsiPhase::Status));

        link.release(&mut bus);
        assert!(bus.is_bus_free());
        assert_eq!(bus.get_data(), 0);
    }

    #[test]
    fn reset_releases() {
        let mut bus = ScsiBus::new();
        let mut link = selected_link(&mut bus, 1);
        link.request(&mut bus, ScsiPhase::DataIn, 0x55);
        bus.set_control(INITIATOR, ScsiSignals::RST, ScsiSignals::RST);
        assert_eq!(link.bus_changed(&mut bus, true), Some(LinkEvent::Reset));
        assert!(!link.is_connected());
        assert_eq!(bus.get_control(), ScsiSignals::RST);
    }
}
