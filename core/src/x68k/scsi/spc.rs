//! Fujitsu MB89352 SCSI protocol controller (SPC)

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::debuggable::{Debuggable, DebuggableProperties, DebuggableProperty, DebuggablePropertyValue};
use crate::tickable::Ticks;
use crate::types::Field24;
use crate::x68k::scsi::bus::ScsiBus;
use crate::x68k::scsi::{INITIATOR_ID, ScsiPhase, ScsiSignals, SignalLine};
use crate::{
    dbgprop_bool, dbgprop_byte, dbgprop_byte_bin, dbgprop_enum, dbgprop_group, dbgprop_header,
    dbgprop_long, dbgprop_string, dbgprop_udec,
};

const SPC_TRACE: bool = false;

/// Settle time between most protocol steps
pub const SPC_DELAY_SHORT: Ticks = 10;
/// Arbitration delay
pub const SPC_DELAY_MEDIUM: Ticks = 32;
/// Not used by any transition, kept with the other timing constants
pub const SPC_DELAY_LONG: Ticks = 100;
/// Bus free time before an initiator connection is considered dropped
pub const SPC_BUS_FREE_DELAY: Ticks = 100_000;

pub const SPC_FIFO_SIZE: usize = 8;

#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, strum::IntoStaticStr)]
pub enum SpcReg {
    /// Bus Device ID (0)
    BDID = 0,
    /// SPC Control (1)
    SCTL = 1,
    /// SPC Command (2)
    SCMD = 2,
    /// Interrupt Sense (4)
    INTS = 4,
    /// Phase Sense (read) / SPC Diagnostic Control (write) (5)
    PSNS_SDGC = 5,
    /// SPC Status (6)
    SSTS = 6,
    /// SPC Error Status (7)
    SERR = 7,
    /// Phase Control (8)
    PCTL = 8,
    /// Modified Byte Counter (9)
    MBC = 9,
    /// Data Register (10)
    DREG = 10,
    /// Temporary Register (11)
    TEMP = 11,
    /// Transfer Counter High (12)
    TCH = 12,
    /// Transfer Counter Middle (13)
    TCM = 13,
    /// Transfer Counter Low (14)
    TCL = 14,
}

bitfield! {
    /// SPC Control
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcRegSctl(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub int_en: bool @ 0,
        pub resel_en: bool @ 1,
        pub sel_en: bool @ 2,
        pub parity_en: bool @ 3,
        pub arb_en: bool @ 4,
        pub diag: bool @ 5,
        pub ctrl_reset: bool @ 6,
        /// Reset and disable
        pub reset_disable: bool @ 7,
    }
}

bitfield! {
    /// SPC Command
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcRegScmd(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub term_mode: bool @ 0,
        /// Program transfer (as opposed to DMA)
        pub prg_xfer: bool @ 2,
        pub intercept: bool @ 3,
        pub rst_out: bool @ 4,
        pub cmd: u8 @ 5..=7,
    }
}

bitfield! {
    /// Interrupt Sense
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcRegInts(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub reset: bool @ 0,
        pub hard_err: bool @ 1,
        pub timeout: bool @ 2,
        pub service_req: bool @ 3,
        pub cmd_complete: bool @ 4,
        pub disconnected: bool @ 5,
        pub reselected: bool @ 6,
        pub selected: bool @ 7,
    }
}

bitfield! {
    /// SPC Status
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcRegSsts(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub dreq_empty: bool @ 0,
        pub dreq_full: bool @ 1,
        pub tc_zero: bool @ 2,
        pub scsi_rst: bool @ 3,
        pub xfer_in_progress: bool @ 4,
        pub spc_busy: bool @ 5,
        pub targ_conn: bool @ 6,
        pub init_conn: bool @ 7,
    }
}

bitfield! {
    /// SPC Error Status
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcRegSerr(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Transfer out, program transfer needs service
        pub xfer_out: bool @ 5,
    }
}

bitfield! {
    /// SPC Diagnostic Control
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcRegSdgc(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub io: bool @ 0,
        pub cd: bool @ 1,
        pub msg: bool @ 2,
        pub bsy: bool @ 3,
        pub xfer_en: bool @ 5,
        pub ack: bool @ 6,
        pub req: bool @ 7,
    }
}

bitfield! {
    /// Phase Control
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcRegPctl(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub phase: u8 @ 0..=2,
        pub bus_free_ie: bool @ 7,
    }
}

bitfield! {
    /// Phase Sense
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpcRegPsns(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub io: bool @ 0,
        pub cd: bool @ 1,
        pub msg: bool @ 2,
        pub bsy: bool @ 3,
        pub sel: bool @ 4,
        pub atn: bool @ 5,
        pub ack: bool @ 6,
        pub req: bool @ 7,
    }
}

/// Commands in SCMD bits 7..5
#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, strum::IntoStaticStr)]
pub enum SpcCommand {
    BusRelease = 0,
    Select = 1,
    ResetAtn = 2,
    SetAtn = 3,
    Transfer = 4,
    TransferPause = 5,
    ResetAckReq = 6,
    SetAckReq = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum SpcState {
    Idle,
    ArbWaitFree,
    ArbAssertBsy,
    ArbWait,
    ArbAssertSel,
    SelWaitFree,
    SelAssertId,
    SelAssertSel,
    SelWaitBsy,
    Selection,
    XferWaitReq,
    XferSend,
    XferRecv,
    XferSendAck,
    XferWaitDeassertReq,
    XferDeassertAck,
    XferWaitFifoEmpty,
}

/// 8-byte data FIFO between DREG/DMA and the bus
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SpcFifo {
    buf: [u8; SPC_FIFO_SIZE],
    head: usize,
    tail: usize,
    count: usize,
}

impl SpcFifo {
    /// Pushes a byte, dropping it if full. Returns whether it was stored.
    pub fn push(&mut self, val: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.buf[self.tail] = val;
        self.tail = (self.tail + 1) % SPC_FIFO_SIZE;
        self.count += 1;
        true
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let val = self.buf[self.head];
        self.head = (self.head + 1) % SPC_FIFO_SIZE;
        self.count -= 1;
        Some(val)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count >= SPC_FIFO_SIZE
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }
}

/// MB89352 SCSI protocol controller, always initiator at ID 7
pub struct Mb89352 {
    bdid: u8,
    sctl: SpcRegSctl,
    scmd: SpcRegScmd,
    ints: SpcRegInts,
    sdgc: SpcRegSdgc,
    ssts: SpcRegSsts,
    serr: SpcRegSerr,
    pctl: SpcRegPctl,
    dreg: u8,
    temp: u8,
    tc: Field24,

    fifo: SpcFifo,

    state: SpcState,
    /// Delayed transition (target, remaining cycles)
    pending: Option<(SpcState, Ticks)>,
    /// Selection timeout, remaining cycles
    sel_timer: Option<Ticks>,
    /// Bus free detection, remaining cycles
    bus_free_timer: Option<Ticks>,

    /// Phase latched by the transfer command
    xfer_phase: u8,
    /// Own signals in diagnostic mode
    diag_signals: ScsiSignals,
    /// ATN to assert during selection
    send_atn: bool,
    dma: bool,

    irq: bool,
    drq: bool,
    irq_line: Option<Box<dyn SignalLine>>,
    drq_line: Option<Box<dyn SignalLine>>,
}

impl Mb89352 {
    pub fn new() -> Self {
        Self {
            bdid: 0,
            sctl: SpcRegSctl(0).with_reset_disable(true),
            scmd: SpcRegScmd(0),
            ints: SpcRegInts(0),
            sdgc: SpcRegSdgc(0),
            ssts: SpcRegSsts(0),
            serr: SpcRegSerr(0),
            pctl: SpcRegPctl(0),
            dreg: 0,
            temp: 0,
            tc: Field24::default(),
            fifo: SpcFifo::default(),
            state: SpcState::Idle,
            pending: None,
            sel_timer: None,
            bus_free_timer: None,
            xfer_phase: 0,
            diag_signals: ScsiSignals::NONE,
            send_atn: false,
            dma: false,
            irq: false,
            drq: false,
            irq_line: None,
            drq_line: None,
        }
    }

    /// Power-on/hardware reset. Releases all own bus lines.
    pub fn reset(&mut self, bus: &mut ScsiBus) {
        self.bdid = 0;
        self.sctl = SpcRegSctl(0).with_reset_disable(true);
        self.scmd.0 = 0;
        self.ints.0 = 0;
        self.sdgc.0 = 0;
        self.ssts.0 = 0;
        self.serr.0 = 0;
        self.pctl.0 = 0;
        self.dreg = 0;
        self.temp = 0;
        self.tc = Field24::default();
        self.fifo.clear();
        self.state = SpcState::Idle;
        self.pending = None;
        self.sel_timer = None;
        self.bus_free_timer = None;
        self.xfer_phase = 0;
        self.diag_signals = ScsiSignals::NONE;
        self.send_atn = false;
        self.dma = false;

        bus.set_control(INITIATOR_ID, ScsiSignals::NONE, ScsiSignals::ALL);
        bus.set_data(INITIATOR_ID, 0);

        self.set_drq(false);
        self.update_ints();
    }

    pub fn set_irq_line(&mut self, line: Option<Box<dyn SignalLine>>) {
        self.irq_line = line;
    }

    pub fn set_drq_line(&mut self, line: Option<Box<dyn SignalLine>>) {
        self.drq_line = line;
    }

    pub fn get_irq(&self) -> bool {
        self.irq
    }

    pub fn get_drq(&self) -> bool {
        self.drq
    }

    pub fn state(&self) -> SpcState {
        self.state
    }

    pub fn fifo_len(&self) -> usize {
        self.fifo.len()
    }

    fn update_ints(&mut self) {
        let irq = self.sctl.int_en() && (self.ints.0 != 0 || self.serr.xfer_out());
        if irq != self.irq {
            self.irq = irq;
            if SPC_TRACE {
                log::debug!("IRQ: {}", irq);
            }
            if let Some(line) = self.irq_line.as_mut() {
                line.set_level(irq);
            }
        }
    }

    fn set_drq(&mut self, drq: bool) {
        if drq != self.drq {
            self.drq = drq;
            if let Some(line) = self.drq_line.as_mut() {
                line.set_level(drq);
            }
        }
    }

    fn update_ssts(&mut self, bus: &ScsiBus) {
        self.ssts.set_tc_zero(self.tc.is_zero());
        self.ssts.set_dreq_empty(self.fifo.is_empty());
        self.ssts.set_dreq_full(self.fifo.is_full());
        self.ssts.set_scsi_rst(bus.get_control().rst());
    }

    /// Drives own control lines, or the local shadow in diagnostic mode.
    fn set_signals(&mut self, bus: &mut ScsiBus, value: ScsiSignals, mask: ScsiSignals) {
        if self.sctl.diag() {
            self.diag_signals = (self.diag_signals & !mask) | (value & mask);
        } else {
            bus.set_control(INITIATOR_ID, value, mask);
        }
    }

    fn set_data(bus: &mut ScsiBus, value: u8) {
        bus.set_data(INITIATOR_ID, value);
    }

    /// Control lines as seen by the controller.
    fn signals(&self, bus: &ScsiBus) -> ScsiSignals {
        let ctrl = bus.get_control();
        if !self.sctl.diag() {
            return ctrl;
        }

        let own = self.diag_signals;
        let sdgc = self.sdgc;
        let mut result = ctrl & (ScsiSignals::SEL | ScsiSignals::ATN);
        for (diag, shadow, signal) in [
            (sdgc.io(), own.io(), ScsiSignals::IO),
            (sdgc.cd(), own.cd(), ScsiSignals::CD),
            (sdgc.msg(), own.msg(), ScsiSignals::MSG),
            (sdgc.bsy(), own.bsy(), ScsiSignals::BSY),
            (sdgc.ack(), own.ack(), ScsiSignals::ACK),
            (sdgc.req(), own.req(), ScsiSignals::REQ),
        ] {
            if diag || shadow {
                result = result | signal;
            }
        }
        result
    }

    fn psns(&self, bus: &ScsiBus) -> SpcRegPsns {
        let ctrl = self.signals(bus);
        SpcRegPsns(0)
            .with_io(ctrl.io())
            .with_cd(ctrl.cd())
            .with_msg(ctrl.msg())
            .with_bsy(ctrl.bsy())
            .with_sel(ctrl.sel())
            .with_atn(ctrl.atn())
            .with_ack(ctrl.ack())
            .with_req(ctrl.req())
    }

    fn transition(&mut self, state: SpcState, delay: Ticks) {
        if SPC_TRACE {
            log::debug!("State {:?} -> {:?} ({} cycles)", self.state, state, delay);
        }
        if delay > 0 {
            self.pending = Some((state, delay));
        } else {
            self.pending = None;
            self.state = state;
        }
    }

    fn command_complete(&mut self) {
        if SPC_TRACE {
            log::debug!("Command complete");
        }
        self.ints.set_cmd_complete(true);
        self.ssts.set_spc_busy(false);
        self.ssts.set_xfer_in_progress(false);
        self.transition(SpcState::Idle, 0);
    }

    fn disconnect(&mut self, bus: &mut ScsiBus) {
        if SPC_TRACE {
            log::debug!("Disconnect, tc = {}", self.tc.get());
        }
        self.ssts.set_init_conn(false);
        self.ssts.set_targ_conn(false);
        self.ssts.set_spc_busy(false);
        self.ssts.set_xfer_in_progress(false);
        self.ints = SpcRegInts(0).with_disconnected(true);
        self.transition(SpcState::Idle, 0);
        self.set_signals(bus, ScsiSignals::NONE, ScsiSignals::ALL);
    }

    /// Cycles until the next timed event, if any is armed.
    pub fn next_event(&self) -> Option<Ticks> {
        [
            self.pending.map(|(_, remaining)| remaining),
            self.sel_timer,
            self.bus_free_timer,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Advances all timers. Expired timers are acted upon by `fire_due`.
    pub fn elapse(&mut self, ticks: Ticks) {
        if let Some((_, remaining)) = self.pending.as_mut() {
            *remaining = remaining.saturating_sub(ticks);
        }
        for timer in [&mut self.sel_timer, &mut self.bus_free_timer]
            .into_iter()
            .flatten()
        {
            *timer = timer.saturating_sub(ticks);
        }
    }

    /// Performs expired delayed transitions and timeouts.
    pub fn fire_due(&mut self, bus: &mut ScsiBus) {
        if let Some((state, 0)) = self.pending {
            self.pending = None;
            self.state = state;
            self.step(bus, false);
        }

        if self.sel_timer == Some(0) {
            self.sel_timer = None;
            self.step(bus, true);
        }

        if self.bus_free_timer == Some(0) {
            self.bus_free_timer = None;
            if self.ssts.init_conn() {
                self.disconnect(bus);
            }
        }

        self.update_ints();
    }

    /// Combined control lines changed
    pub fn bus_changed(&mut self, bus: &mut ScsiBus) {
        self.step(bus, false);
        self.update_ints();
    }

    fn abort(&mut self, bus: &mut ScsiBus) {
        if SPC_TRACE {
            log::debug!("Reset and disable in state {:?}", self.state);
        }
        self.set_signals(bus, ScsiSignals::NONE, ScsiSignals::ALL);
        Self::set_data(bus, 0);
        self.ssts.set_spc_busy(false);
        self.ssts.set_xfer_in_progress(false);
        self.fifo.clear();
        self.sel_timer = None;
        self.transition(SpcState::Idle, 0);
    }

    fn step(&mut self, bus: &mut ScsiBus, timeout: bool) {
        let ctrl = self.signals(bus);

        if ctrl.bsy() || ctrl.sel() {
            self.bus_free_timer = None;
        } else if self.ssts.init_conn() && self.bus_free_timer.is_none() {
            self.bus_free_timer = Some(SPC_BUS_FREE_DELAY);
        }

        if self.sctl.reset_disable() && (self.state != SpcState::Idle || self.pending.is_some()) {
            self.abort(bus);
            return;
        }

        while self.pending.is_none() && self.run_state(bus, timeout) {}
    }

    /// Evaluates the current state once. Returns true if the new state has
    /// to be evaluated right away.
    fn run_state(&mut self, bus: &mut ScsiBus, timeout: bool) -> bool {
        let ctrl = self.signals(bus);
        let data = bus.get_data();

        match self.state {
            SpcState::Idle => {
                if ctrl.is_empty() && self.pctl.bus_free_ie() {
                    self.ints.set_disconnected(true);
                }
            }
            SpcState::ArbWaitFree => {
                if !ctrl.bsy() && !ctrl.sel() {
                    self.transition(SpcState::ArbAssertBsy, SPC_DELAY_SHORT);
                }
            }
            SpcState::ArbAssertBsy => {
                self.set_signals(bus, ScsiSignals::BSY, ScsiSignals::BSY);
                Self::set_data(bus, 1 << self.bdid);
                self.transition(SpcState::ArbWait, SPC_DELAY_MEDIUM);
            }
            SpcState::ArbWait => {
                let higher = !((2u16 << self.bdid) - 1) as u8;
                if data & higher != 0 {
                    log::debug!("Arbitration lost (data {:02X})", data);
                    self.set_signals(bus, ScsiSignals::NONE, ScsiSignals::BSY);
                    Self::set_data(bus, 0);
                    self.ssts.set_spc_busy(false);
                    self.transition(SpcState::Idle, 0);
                } else {
                    self.transition(SpcState::ArbAssertSel, SPC_DELAY_SHORT);
                }
            }
            SpcState::ArbAssertSel => {
                self.set_signals(bus, ScsiSignals::SEL, ScsiSignals::SEL);
                self.transition(SpcState::SelAssertId, SPC_DELAY_SHORT);
            }
            SpcState::SelWaitFree => {
                if !ctrl.bsy() && !ctrl.sel() {
                    self.transition(SpcState::SelAssertId, SPC_DELAY_SHORT);
                }
            }
            SpcState::SelAssertId => {
                self.ssts.set_init_conn(true);
                self.ssts.set_targ_conn(false);
                Self::set_data(bus, self.temp);
                self.transition(SpcState::SelAssertSel, SPC_DELAY_SHORT);
            }
            SpcState::SelAssertSel => {
                let mut sel = ScsiSignals::SEL;
                if self.send_atn {
                    sel = sel | ScsiSignals::ATN;
                }
                self.set_signals(
                    bus,
                    sel,
                    ScsiSignals::ATN | ScsiSignals::SEL | ScsiSignals::BSY,
                );
                let timeout = ((Ticks::from(self.tc.get()) & !0xFF) + 15) * 2;
                self.sel_timer = Some(timeout);
                self.transition(SpcState::SelWaitBsy, 0);
            }
            SpcState::SelWaitBsy => {
                if timeout {
                    log::debug!("Selection timeout (TEMP {:02X})", self.temp);
                    self.tc = Field24::default();
                    self.ints = SpcRegInts(0).with_timeout(true);
                    self.set_signals(bus, ScsiSignals::NONE, ScsiSignals::ALL);
                    Self::set_data(bus, 0);
                    self.ssts.set_init_conn(false);
                    self.ssts.set_spc_busy(false);
                    self.transition(SpcState::Idle, 0);
                    return false;
                }
                let response = ctrl
                    & (ScsiSignals::REQ
                        | ScsiSignals::BSY
                        | ScsiSignals::MSG
                        | ScsiSignals::CD
                        | ScsiSignals::IO);
                if response == ScsiSignals::BSY {
                    self.sel_timer = None;
                    self.transition(SpcState::Selection, SPC_DELAY_SHORT);
                }
            }
            SpcState::Selection => {
                if ctrl.sel() {
                    self.set_signals(bus, ScsiSignals::NONE, ScsiSignals::SEL);
                    Self::set_data(bus, 0);
                    self.command_complete();
                }
            }
            SpcState::XferWaitReq => {
                if !ctrl.req() {
                    return false;
                }
                if ctrl.phase() != self.xfer_phase {
                    if SPC_TRACE {
                        log::debug!(
                            "Phase {:?} during transfer, expected {:?}",
                            ScsiPhase::from_signals(ctrl),
                            ScsiPhase::from_bits(self.xfer_phase)
                        );
                    }
                    self.ints.set_service_req(true);
                    self.ssts.set_spc_busy(false);
                    self.ssts.set_xfer_in_progress(false);
                    if self.xfer_phase & 1 == 0 {
                        // Output the target no longer accepts
                        self.fifo.clear();
                        self.set_drq(false);
                    }
                    Self::set_data(bus, 0);
                    self.transition(SpcState::Idle, 0);
                    return false;
                }
                if self.tc.is_zero() && !self.scmd.term_mode() {
                    Self::set_data(bus, 0);
                    self.command_complete();
                    return false;
                }
                if ctrl.io() {
                    self.transition(SpcState::XferRecv, 0);
                } else {
                    self.transition(SpcState::XferSend, 0);
                    if self.dma && !self.tc.is_zero() && !self.fifo.is_full() {
                        self.set_drq(true);
                    }
                }
                return true;
            }
            SpcState::XferRecv => {
                if self.tc.is_zero() && self.scmd.term_mode() {
                    self.transition(SpcState::XferSendAck, SPC_DELAY_SHORT);
                    return false;
                }
                if self.tc.is_zero() || self.fifo.is_full() {
                    if self.sdgc.xfer_en() {
                        self.serr.set_xfer_out(true);
                    }
                    return false;
                }
                self.fifo.push(data);
                if self.sdgc.xfer_en() {
                    self.serr.set_xfer_out(true);
                }
                self.transition(SpcState::XferSendAck, SPC_DELAY_SHORT);
                if self.dma {
                    self.set_drq(true);
                }
            }
            SpcState::XferSend => {
                if !self.tc.is_zero() {
                    match self.fifo.pop() {
                        Some(val) => {
                            Self::set_data(bus, val);
                            self.transition(SpcState::XferSendAck, SPC_DELAY_SHORT);
                        }
                        None => {
                            if self.sdgc.xfer_en() {
                                self.serr.set_xfer_out(true);
                            }
                        }
                    }
                } else if self.scmd.term_mode() {
                    Self::set_data(bus, self.temp);
                    self.transition(SpcState::XferSendAck, SPC_DELAY_SHORT);
                }
            }
            SpcState::XferSendAck => {
                if !self.scmd.term_mode() && !ctrl.io() {
                    self.temp = data;
                }
                self.set_signals(bus, ScsiSignals::ACK, ScsiSignals::ACK);
                self.transition(SpcState::XferWaitDeassertReq, SPC_DELAY_SHORT);
            }
            SpcState::XferWaitDeassertReq => {
                if !ctrl.req() {
                    self.transition(SpcState::XferDeassertAck, SPC_DELAY_SHORT);
                }
            }
            SpcState::XferDeassertAck => {
                self.tc.decrement();
                let phase = ScsiPhase::from_signals(ctrl);
                if self.tc.is_zero() && phase == Some(ScsiPhase::MessageOut) && self.send_atn {
                    self.send_atn = false;
                    self.set_signals(bus, ScsiSignals::NONE, ScsiSignals::ATN | ScsiSignals::ACK);
                } else if !self.tc.is_zero() || phase != Some(ScsiPhase::MessageIn) {
                    // ACK stays asserted after the last MESSAGE IN byte until
                    // the host resets it, so the target holds the bus.
                    self.set_signals(bus, ScsiSignals::NONE, ScsiSignals::ACK);
                }
                if self.tc.is_zero() {
                    self.transition(SpcState::XferWaitFifoEmpty, SPC_DELAY_SHORT);
                } else {
                    self.transition(SpcState::XferWaitReq, SPC_DELAY_SHORT);
                }
            }
            SpcState::XferWaitFifoEmpty => {
                if self.fifo.is_empty() {
                    Self::set_data(bus, 0);
                    self.command_complete();
                }
            }
        }
        false
    }

    fn write_scmd(&mut self, bus: &mut ScsiBus, val: u8) {
        self.scmd.0 = val;

        if !self.sctl.reset_disable() {
            let rst = if self.scmd.rst_out() {
                ScsiSignals::RST
            } else {
                ScsiSignals::NONE
            };
            self.set_signals(bus, rst, ScsiSignals::RST);
        }

        let Some(cmd) = SpcCommand::from_u8(self.scmd.cmd()) else {
            return;
        };
        if SPC_TRACE {
            log::debug!("Command {:?} ({:02X})", cmd, val);
        }

        match cmd {
            SpcCommand::BusRelease => {
                self.send_atn = false;
                if self.state == SpcState::SelWaitFree && self.pending.is_none() {
                    self.ssts.set_init_conn(false);
                    self.ssts.set_targ_conn(false);
                    self.ssts.set_spc_busy(false);
                    self.transition(SpcState::Idle, 0);
                }
            }
            SpcCommand::Select => {
                self.ssts.set_spc_busy(true);
                if self.sctl.arb_en() {
                    self.transition(SpcState::ArbWaitFree, SPC_DELAY_SHORT);
                } else {
                    self.transition(SpcState::SelWaitFree, SPC_DELAY_SHORT);
                }
                self.step(bus, false);
            }
            SpcCommand::ResetAtn => {
                self.send_atn = false;
                self.set_signals(bus, ScsiSignals::NONE, ScsiSignals::ATN);
            }
            SpcCommand::SetAtn => {
                if self.state == SpcState::Idle && self.pending.is_none() {
                    self.send_atn = true;
                } else {
                    self.set_signals(bus, ScsiSignals::ATN, ScsiSignals::ATN);
                }
            }
            SpcCommand::Transfer => {
                if !self.ssts.init_conn() && !self.ssts.targ_conn() {
                    log::warn!("Transfer command while not connected");
                    return;
                }
                self.dma = !self.scmd.prg_xfer();
                if !self.dma {
                    self.set_drq(false);
                }
                self.ssts.set_spc_busy(true);
                self.ssts.set_xfer_in_progress(true);
                self.transition(SpcState::XferWaitReq, SPC_DELAY_SHORT);
            }
            SpcCommand::TransferPause => (),
            SpcCommand::ResetAckReq => {
                if self.ssts.init_conn() {
                    self.set_signals(bus, ScsiSignals::NONE, ScsiSignals::ACK);
                }
            }
            SpcCommand::SetAckReq => {
                if self.ssts.init_conn() {
                    if self.signals(bus).io() {
                        self.temp = bus.get_data();
                    } else {
                        Self::set_data(bus, self.temp);
                    }
                    self.set_signals(bus, ScsiSignals::ACK, ScsiSignals::ACK);
                }
            }
        }
    }

    /// Register read. Reading DREG and TEMP has side effects.
    pub fn read_reg(&mut self, bus: &mut ScsiBus, reg: usize) -> u8 {
        let val = match SpcReg::from_usize(reg) {
            Some(SpcReg::BDID) => 1 << self.bdid,
            Some(SpcReg::SCTL) => self.sctl.0,
            Some(SpcReg::SCMD) => self.scmd.0,
            Some(SpcReg::INTS) => self.ints.0,
            Some(SpcReg::PSNS_SDGC) => self.psns(bus).0,
            Some(SpcReg::SSTS) => {
                self.update_ssts(bus);
                self.ssts.0
            }
            Some(SpcReg::SERR) => self.serr.0,
            Some(SpcReg::PCTL) => self.pctl.0,
            Some(SpcReg::MBC) => 0,
            Some(SpcReg::DREG) => {
                if let Some(val) = self.fifo.pop() {
                    self.dreg = val;
                }
                self.serr.set_xfer_out(false);
                self.step(bus, false);
                self.dreg
            }
            Some(SpcReg::TEMP) => {
                self.step(bus, false);
                self.temp
            }
            Some(SpcReg::TCH) => self.tc.high(),
            Some(SpcReg::TCM) => self.tc.mid(),
            Some(SpcReg::TCL) => self.tc.low(),
            None => 0xFF,
        };
        self.update_ints();
        val
    }

    pub fn write_reg(&mut self, bus: &mut ScsiBus, reg: usize, val: u8) {
        match SpcReg::from_usize(reg) {
            Some(SpcReg::BDID) => self.bdid = val & 7,
            Some(SpcReg::SCTL) => {
                self.sctl.0 = val;
                if self.sctl.reset_disable()
                    && (self.state != SpcState::Idle || self.pending.is_some())
                {
                    self.abort(bus);
                }
            }
            Some(SpcReg::SCMD) => self.write_scmd(bus, val),
            Some(SpcReg::INTS) => self.ints.0 &= !val,
            Some(SpcReg::PSNS_SDGC) => {
                self.sdgc.0 = val;
                self.step(bus, false);
            }
            Some(SpcReg::PCTL) => {
                self.pctl.0 = val;
                self.xfer_phase = self.pctl.phase();
                if self.pctl.bus_free_ie() {
                    self.step(bus, false);
                }
            }
            Some(SpcReg::DREG) => {
                self.dreg = val;
                self.fifo.push(val);
                self.serr.set_xfer_out(false);
                self.step(bus, false);
            }
            Some(SpcReg::TEMP) => {
                self.temp = val;
                self.step(bus, false);
            }
            Some(SpcReg::TCH) => self.tc.set_high(val),
            Some(SpcReg::TCM) => self.tc.set_mid(val),
            Some(SpcReg::TCL) => self.tc.set_low(val),
            Some(r @ (SpcReg::SSTS | SpcReg::SERR | SpcReg::MBC)) => {
                log::warn!("Write to read-only register {:?}: {:02X}", r, val);
            }
            None => (),
        }
        self.update_ints();
    }

    /// DMA read from the FIFO, or the data register when empty
    pub fn dma_read(&mut self, bus: &mut ScsiBus) -> u8 {
        let val = self.fifo.pop().unwrap_or(self.dreg);
        if self.fifo.is_empty() {
            self.set_drq(false);
        }
        self.step(bus, false);
        self.update_ints();
        val
    }

    /// DMA write into the FIFO
    pub fn dma_write(&mut self, bus: &mut ScsiBus, val: u8) {
        self.dreg = val;
        if self.fifo.push(val) && self.fifo.is_full() {
            self.set_drq(false);
        }
        self.step(bus, false);
        self.update_ints();
    }
}

impl Debuggable for Mb89352 {
    fn get_debug_properties(&self) -> DebuggableProperties {
        let pending = match self.pending {
            Some((state, remaining)) => {
                format!("{} in {}", <&str>::from(state), remaining)
            }
            None => "-".to_string(),
        };

        vec![
            dbgprop_enum!("State", self.state),
            dbgprop_string!("Pending", pending),
            dbgprop_group!(
                "Registers",
                vec![
                    dbgprop_udec!("BDID", self.bdid),
                    dbgprop_byte_bin!("SCTL", self.sctl.0),
                    dbgprop_byte!("SCMD", self.scmd.0),
                    dbgprop_byte_bin!("INTS", self.ints.0),
                    dbgprop_byte_bin!("SDGC", self.sdgc.0),
                    dbgprop_byte_bin!("SSTS", self.ssts.0),
                    dbgprop_byte_bin!("SERR", self.serr.0),
                    dbgprop_byte!("PCTL", self.pctl.0),
                    dbgprop_byte!("DREG", self.dreg),
                    dbgprop_byte!("TEMP", self.temp),
                    dbgprop_long!("TC", self.tc.get()),
                ]
            ),
            dbgprop_header!("Timers"),
            dbgprop_string!(
                "Selection timeout",
                self.sel_timer.map_or("-".to_string(), |t| t.to_string())
            ),
            dbgprop_string!(
                "Bus free",
                self.bus_free_timer.map_or("-".to_string(), |t| t.to_string())
            ),
            dbgprop_udec!("FIFO", self.fifo.len() as u64),
            dbgprop_bool!("ATN queued", self.send_atn),
            dbgprop_bool!("DMA", self.dma),
            dbgprop_bool!("IRQ", self.irq),
            dbgprop_bool!("DRQ", self.drq),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::x68k::scsi::bus::ScsiParticipant;

    fn setup() -> (Mb89352, ScsiBus) {
        let mut bus = ScsiBus::new();
        bus.attach(INITIATOR_ID, ScsiParticipant::Initiator).unwrap();
        let mut spc = Mb89352::new();
        spc.reset(&mut bus);
        (spc, bus)
    }

    /// Advances time the way the port does, without targets.
    fn run(spc: &mut Mb89352, bus: &mut ScsiBus, mut ticks: Ticks) {
        while let Some(due) = spc.next_event().filter(|&d| d <= ticks) {
            spc.elapse(due);
            ticks -= due;
            spc.fire_due(bus);
            while bus.take_changed() {
                spc.bus_changed(bus);
            }
        }
        spc.elapse(ticks);
    }

    fn write(spc: &mut Mb89352, bus: &mut ScsiBus, reg: SpcReg, val: u8) {
        spc.write_reg(bus, reg as usize, val);
        while bus.take_changed() {
            spc.bus_changed(bus);
        }
    }

    fn read(spc: &mut Mb89352, bus: &mut ScsiBus, reg: SpcReg) -> u8 {
        spc.read_reg(bus, reg as usize)
    }

    /// Starts a selection of target 0 without arbitration
    fn select(spc: &mut Mb89352, bus: &mut ScsiBus, tc: u32) {
        write(spc, bus, SpcReg::BDID, 7);
        write(spc, bus, SpcReg::SCTL, 0x00);
        write(spc, bus, SpcReg::TEMP, 0x81);
        write(spc, bus, SpcReg::TCH, (tc >> 16) as u8);
        write(spc, bus, SpcReg::TCM, (tc >> 8) as u8);
        write(spc, bus, SpcReg::TCL, tc as u8);
        write(spc, bus, SpcReg::SCMD, 0x20);
    }

    /// Selects target 0, which answers with BSY, and acknowledges the
    /// completion interrupt.
    fn connect(spc: &mut Mb89352, bus: &mut ScsiBus) {
        bus.attach(0, ScsiParticipant::Target).unwrap();
        select(spc, bus, 0x100);
        run(spc, bus, 3 * SPC_DELAY_SHORT);
        bus.set_control(0, ScsiSignals::BSY, ScsiSignals::BSY);
        spc.bus_changed(bus);
        run(spc, bus, SPC_DELAY_SHORT);
        assert_eq!(read(spc, bus, SpcReg::INTS), 0x10);
        write(spc, bus, SpcReg::INTS, 0xFF);
    }

    /// Target side line change, delivered like the port does
    fn target_lines(spc: &mut Mb89352, bus: &mut ScsiBus, lines: ScsiSignals) {
        bus.set_control(0, lines, ScsiSignals::ALL);
        while bus.take_changed() {
            spc.bus_changed(bus);
        }
    }

        #[test]
    fn fifo_capacity() {
        let mut fifo = SpcFifo::default();
        for i in 0..9 {
            fifo.push(i);
        }
        assert_eq!(fifo.len(), SPC_FIFO_SIZE);
        assert!(fifo.is_full());
        for i in 0..8 {
            assert_eq!(fifo.pop(), Some(i));
        }
        assert_eq!(fifo.pop(), None);
    }

    #[test]
    fn fifo_through_dreg() {
        let (mut spc, mut bus) = setup();
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0x03, 0x01);
        for i in 0..9 {
            write(&mut spc, &mut bus, SpcReg::DREG, i);
        }
        assert_eq!(spc.fifo_len(), 8);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0x03, 0x02);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::DREG), 0);
        assert_eq!(spc.fifo_len(), 7);
    }

    #[test]
    fn transfer_counter_views() {
        let (mut spc, mut bus) = setup();
        assert_ne!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0x04, 0);
        write(&mut spc, &mut bus, SpcReg::TCH, 0x12);
        write(&mut spc, &mut bus, SpcReg::TCM, 0x34);
        write(&mut spc, &mut bus, SpcReg::TCL, 0x56);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::TCH), 0x12);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::TCM), 0x34);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::TCL), 0x56);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0x04, 0);
    }

    #[test]
    fn bdid_and_unmapped() {
        let (mut spc, mut bus) = setup();
        write(&mut spc, &mut bus, SpcReg::BDID, 0xFE);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::BDID), 0x40);
        assert_eq!(spc.read_reg(&mut bus, 3), 0xFF);
        assert_eq!(spc.read_reg(&mut bus, 15), 0xFF);
        spc.write_reg(&mut bus, 3, 0x12);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::MBC), 0);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SCTL), 0x80);
    }

    #[test]
    fn selection_timeout_exact() {
        let (mut spc, mut bus) = setup();
        select(&mut spc, &mut bus, 0x100);
        assert_ne!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0x20, 0);

        // Three settle delays until SEL is driven
        run(&mut spc, &mut bus, 3 * SPC_DELAY_SHORT);
        assert!(bus.get_control().sel());
        assert_eq!(bus.get_data(), 0x81);
        assert_eq!(spc.state(), SpcState::SelWaitBsy);

        let timeout = ((0x100 + 15) * 2) as Ticks;
        run(&mut spc, &mut bus, timeout - 1);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS), 0);
        run(&mut spc, &mut bus, 1);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS), 0x04);
        assert_eq!(spc.state(), SpcState::Idle);
        assert!(bus.get_control().is_empty());
        assert_eq!(bus.get_data(), 0);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0xA0, 0);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::TCL), 0);
    }

    #[test]
    fn timeout_survives_bus_activity() {
        let (mut spc, mut bus) = setup();
        select(&mut spc, &mut bus, 0x100);
        run(&mut spc, &mut bus, 3 * SPC_DELAY_SHORT);

        // Unrelated line activity while waiting for BSY
        bus.attach(5, ScsiParticipant::Target).unwrap();
        bus.set_control(5, ScsiSignals::ATN, ScsiSignals::ATN);
        spc.bus_changed(&mut bus);
        bus.set_control(5, ScsiSignals::NONE, ScsiSignals::ATN);
        spc.bus_changed(&mut bus);

        run(&mut spc, &mut bus, 542);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS), 0x04);
    }

    #[test]
    fn selection_success() {
        let (mut spc, mut bus) = setup();
        bus.attach(0, ScsiParticipant::Target).unwrap();
        select(&mut spc, &mut bus, 0x100);
        run(&mut spc, &mut bus, 3 * SPC_DELAY_SHORT);

        bus.set_control(0, ScsiSignals::BSY, ScsiSignals::BSY);
        spc.bus_changed(&mut bus);
        run(&mut spc, &mut bus, SPC_DELAY_SHORT);
        assert!(!bus.get_control().sel());
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS), 0x10);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0xA0, 0x80);

        run(&mut spc, &mut bus, 10_000);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS) & 0x04, 0);
    }

    #[test]
    fn arbitration_lost() {
        let (mut spc, mut bus) = setup();
        bus.attach(5, ScsiParticipant::Initiator).unwrap();
        write(&mut spc, &mut bus, SpcReg::BDID, 3);
        write(&mut spc, &mut bus, SpcReg::SCTL, 0x10);
        write(&mut spc, &mut bus, SpcReg::SCMD, 0x20);

        run(&mut spc, &mut bus, 2 * SPC_DELAY_SHORT);
        assert!(bus.get_control().bsy());
        assert_eq!(bus.get_data(), 0x08);

        bus.set_data(5, 0x20);
        run(&mut spc, &mut bus, SPC_DELAY_MEDIUM);
        assert_eq!(spc.state(), SpcState::Idle);
        assert!(!bus.get_control().bsy());
        assert_eq!(bus.get_data(), 0x20);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0x20, 0);
    }

    #[test]
    fn arbitration_won() {
        let (mut spc, mut bus) = setup();
        write(&mut spc, &mut bus, SpcReg::BDID, 7);
        write(&mut spc, &mut bus, SpcReg::SCTL, 0x10);
        write(&mut spc, &mut bus, SpcReg::TEMP, 0x82);
        write(&mut spc, &mut bus, SpcReg::SCMD, 0x20);

        run(&mut spc, &mut bus, 2 * SPC_DELAY_SHORT + SPC_DELAY_MEDIUM);
        assert!(bus.get_control().bsy());
        assert!(!bus.get_control().sel());
        run(&mut spc, &mut bus, 3 * SPC_DELAY_SHORT);
        assert_eq!(spc.state(), SpcState::SelWaitBsy);
        assert!(bus.get_control().sel());
        assert!(!bus.get_control().bsy());
        assert_eq!(bus.get_data(), 0x82);
    }

    #[test]
    fn reset_and_disable_aborts() {
        let (mut spc, mut bus) = setup();
        select(&mut spc, &mut bus, 0x100);
        run(&mut spc, &mut bus, 3 * SPC_DELAY_SHORT);
        write(&mut spc, &mut bus, SpcReg::DREG, 0x55);
        assert!(bus.get_control().sel());

        write(&mut spc, &mut bus, SpcReg::SCTL, 0x80);
        assert_eq!(spc.state(), SpcState::Idle);
        assert!(bus.get_control().is_empty());
        assert_eq!(spc.fifo_len(), 0);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0x20, 0);

        run(&mut spc, &mut bus, 10_000);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS) & 0x04, 0);
    }

    #[test]
    fn bus_release_cancels_wait_free() {
        let (mut spc, mut bus) = setup();
        bus.attach(2, ScsiParticipant::Target).unwrap();
        bus.set_control(2, ScsiSignals::BSY, ScsiSignals::BSY);
        select(&mut spc, &mut bus, 0x100);
        run(&mut spc, &mut bus, 100);
        assert_eq!(spc.state(), SpcState::SelWaitFree);

        write(&mut spc, &mut bus, SpcReg::SCMD, 0x00);
        assert_eq!(spc.state(), SpcState::Idle);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0xE0, 0);
    }

    #[test]
    fn irq_edges() {
        let (mut spc, mut bus) = setup();
        let edges = Rc::new(RefCell::new(vec![]));
        let sink = edges.clone();
        spc.set_irq_line(Some(Box::new(move |level: bool| sink.borrow_mut().push(level))));

        select(&mut spc, &mut bus, 0);
        write(&mut spc, &mut bus, SpcReg::SCTL, 0x01);
        run(&mut spc, &mut bus, 1000);
        assert!(spc.get_irq());
        // Polling does not re-fire
        read(&mut spc, &mut bus, SpcReg::INTS);
        read(&mut spc, &mut bus, SpcReg::SSTS);
        assert_eq!(*edges.borrow(), vec![true]);

        write(&mut spc, &mut bus, SpcReg::INTS, 0x04);
        assert!(!spc.get_irq());
        assert_eq!(*edges.borrow(), vec![true, false]);
    }

    #[test]
    fn irq_masked() {
        let (mut spc, mut bus) = setup();
        select(&mut spc, &mut bus, 0);
        run(&mut spc, &mut bus, 1000);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS), 0x04);
        assert!(!spc.get_irq());
        write(&mut spc, &mut bus, SpcReg::SCTL, 0x01);
        assert!(spc.get_irq());
    }

    #[test]
    fn ints_write_one_to_clear() {
        let (mut spc, mut bus) = setup();
        write(&mut spc, &mut bus, SpcReg::SCTL, 0x00);
        write(&mut spc, &mut bus, SpcReg::PCTL, 0x80);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS), 0x20);
        write(&mut spc, &mut bus, SpcReg::INTS, 0x10);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS), 0x20);
        write(&mut spc, &mut bus, SpcReg::PCTL, 0x00);
        write(&mut spc, &mut bus, SpcReg::INTS, 0x20);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS), 0);
    }

    #[test]
    fn diagnostic_signals() {
        let (mut spc, mut bus) = setup();
        bus.attach(0, ScsiParticipant::Target).unwrap();
        write(&mut spc, &mut bus, SpcReg::SCTL, 0x20);

        write(&mut spc, &mut bus, SpcReg::PSNS_SDGC, 0x80 | 0x08 | 0x01);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::PSNS_SDGC), 0x89);

        // SEL and ATN come from the bus, the rest only from SDGC/shadow
        bus.set_control(
            0,
            ScsiSignals::SEL | ScsiSignals::ATN | ScsiSignals::CD,
            ScsiSignals::ALL,
        );
        assert_eq!(read(&mut spc, &mut bus, SpcReg::PSNS_SDGC), 0x89 | 0x30);

        write(&mut spc, &mut bus, SpcReg::PSNS_SDGC, 0x40);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::PSNS_SDGC), 0x70);
    }

    #[test]
    fn diagnostic_writes_stay_local() {
        let (mut spc, mut bus) = setup();
        write(&mut spc, &mut bus, SpcReg::SCTL, 0x30);
        write(&mut spc, &mut bus, SpcReg::BDID, 7);
        write(&mut spc, &mut bus, SpcReg::SCMD, 0x20);
        run(&mut spc, &mut bus, 2 * SPC_DELAY_SHORT);

        // BSY driven into the shadow only, data still on the bus
        assert!(!bus.get_control().bsy());
        assert_eq!(bus.get_data(), 0x80);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::PSNS_SDGC) & 0x08, 0x08);
    }

    #[test]
    fn rst_out() {
        let (mut spc, mut bus) = setup();
        // Ignored while reset-and-disable
        write(&mut spc, &mut bus, SpcReg::SCMD, 0x10);
        assert!(!bus.get_control().rst());

        write(&mut spc, &mut bus, SpcReg::SCTL, 0x00);
        write(&mut spc, &mut bus, SpcReg::SCMD, 0x10);
        assert!(bus.get_control().rst());
        assert_ne!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0x08, 0);
        write(&mut spc, &mut bus, SpcReg::SCMD, 0x00);
        assert!(!bus.get_control().rst());
    }

    #[test]
    fn transfer_requires_connection() {
        let (mut spc, mut bus) = setup();
        write(&mut spc, &mut bus, SpcReg::SCTL, 0x00);
        write(&mut spc, &mut bus, SpcReg::SCMD, 0x84);
        assert_eq!(spc.next_event(), None);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0x30, 0);
    }

    #[test]
    fn termination_mode_sends_temp() {
        let (mut spc, mut bus) = setup();
        connect(&mut spc, &mut bus);
        write(&mut spc, &mut bus, SpcReg::PCTL, ScsiPhase::DataOut as u8);
        write(&mut spc, &mut bus, SpcReg::TEMP, 0x5A);
        write(&mut spc, &mut bus, SpcReg::TCH, 0);
        write(&mut spc, &mut bus, SpcReg::TCM, 0);
        write(&mut spc, &mut bus, SpcReg::TCL, 0);
        target_lines(&mut spc, &mut bus, ScsiSignals::BSY | ScsiSignals::REQ);

        // Program transfer, termination mode
        write(&mut spc, &mut bus, SpcReg::SCMD, 0x85);
        run(&mut spc, &mut bus, SPC_DELAY_SHORT);
        assert_eq!(spc.state(), SpcState::XferSend);
        assert_eq!(bus.get_data(), 0x5A);
        assert!(!bus.get_control().ack());

        run(&mut spc, &mut bus, SPC_DELAY_SHORT);
        assert!(bus.get_control().ack());
        run(&mut spc, &mut bus, SPC_DELAY_SHORT);
        assert_eq!(spc.state(), SpcState::XferWaitDeassertReq);

        target_lines(&mut spc, &mut bus, ScsiSignals::BSY);
        run(&mut spc, &mut bus, SPC_DELAY_SHORT);
        assert!(!bus.get_control().ack());
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS), 0);

        run(&mut spc, &mut bus, SPC_DELAY_SHORT);
        assert_eq!(spc.state(), SpcState::Idle);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS), 0x10);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0x30, 0);
        // The counter does not wrap below zero
        assert_eq!(read(&mut spc, &mut bus, SpcReg::TCH), 0);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::TCM), 0);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::TCL), 0);

        // Exactly one byte: a further request is not answered
        target_lines(&mut spc, &mut bus, ScsiSignals::BSY | ScsiSignals::REQ);
        run(&mut spc, &mut bus, 100);
        assert!(!bus.get_control().ack());
        assert_eq!(bus.get_data(), 0);
    }

    #[test]
    fn phase_change_ends_dma_send() {
        let (mut spc, mut bus) = setup();
        let edges = Rc::new(RefCell::new(vec![]));
        let sink = edges.clone();
        spc.set_drq_line(Some(Box::new(move |level: bool| sink.borrow_mut().push(level))));

        connect(&mut spc, &mut bus);
        write(&mut spc, &mut bus, SpcReg::PCTL, ScsiPhase::DataOut as u8);
        write(&mut spc, &mut bus, SpcReg::TCH, 0);
        write(&mut spc, &mut bus, SpcReg::TCM, 0);
        write(&mut spc, &mut bus, SpcReg::TCL, 4);
        target_lines(&mut spc, &mut bus, ScsiSignals::BSY | ScsiSignals::REQ);

        // DMA transfer
        write(&mut spc, &mut bus, SpcReg::SCMD, 0x80);
        run(&mut spc, &mut bus, SPC_DELAY_SHORT);
        assert!(spc.get_drq());
        spc.dma_write(&mut bus, 0x11);
        spc.dma_write(&mut bus, 0x22);
        spc.dma_write(&mut bus, 0x33);
        assert_eq!(bus.get_data(), 0x11);
        assert_eq!(spc.fifo_len(), 2);

        run(&mut spc, &mut bus, SPC_DELAY_SHORT);
        assert!(bus.get_control().ack());
        target_lines(&mut spc, &mut bus, ScsiSignals::BSY);
        run(&mut spc, &mut bus, 2 * SPC_DELAY_SHORT);
        assert!(!bus.get_control().ack());
        assert_eq!(read(&mut spc, &mut bus, SpcReg::TCL), 3);

        // Target skips ahead to STATUS
        target_lines(
            &mut spc,
            &mut bus,
            ScsiSignals::BSY | ScsiSignals::REQ | ScsiSignals::CD | ScsiSignals::IO,
        );
        run(&mut spc, &mut bus, SPC_DELAY_SHORT);
        assert_eq!(spc.state(), SpcState::Idle);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::INTS), 0x08);
        assert_eq!(spc.fifo_len(), 0);
        assert!(!spc.get_drq());
        assert_eq!(*edges.borrow(), vec![true, false]);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::SSTS) & 0x31, 0x01);
        assert_eq!(read(&mut spc, &mut bus, SpcReg::TCL), 3);
        assert!(!bus.get_control().ack());
    }
}
