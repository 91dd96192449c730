//! Register-level SCSI initiator routines, the way the boot firmware's
//! SCSI IOCS calls drive the MB89352.

use thiserror::Error;

use crate::tickable::{Tickable, Ticks};
use crate::x68k::scsi::port::ScsiPort;
use crate::x68k::scsi::spc::{
    SpcCommand, SpcReg, SpcRegInts, SpcRegPsns, SpcRegScmd, SpcRegSctl, SpcRegSsts,
};
use crate::x68k::scsi::{INITIATOR_ID, MAX_TARGETS, ScsiPhase, ScsiSignals};

const IOCS_TRACE: bool = false;

/// Cycles advanced between two register polls
const POLL_TICKS: Ticks = 16;

/// Cycles a single wait may take before the controller is considered stuck
const WAIT_LIMIT: Ticks = 2_000_000;

/// Transfer counter programmed for selection, about 0.8 ms at 10 MHz
const SELECT_TC: u32 = 0x00_0F_00;

/// RST hold time for a bus reset
const RESET_HOLD_TICKS: Ticks = 250;

/// IDENTIFY message, LUN 0, no disconnect privilege
const MSG_IDENTIFY: u8 = 0x80;

#[derive(Debug, Error)]
pub enum IocsError {
    #[error("Invalid SCSI ID {0}")]
    InvalidId(usize),

    #[error("Selection of SCSI ID {0} timed out")]
    SelectionTimeout(usize),

    #[error("Unexpected {actual} phase")]
    UnexpectedPhase { actual: &'static str },

    #[error("Target released the bus before completion")]
    BusFree,

    #[error("Controller stalled waiting for {0}")]
    Stall(&'static str),

    #[error(transparent)]
    Emulation(#[from] anyhow::Error),
}

/// Data phase of a command
#[derive(Debug, Clone, Copy)]
pub enum DataPhase<'a> {
    None,
    /// Up to this many bytes from the target
    In(usize),
    Out(&'a [u8]),
}

/// Result of a completed command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: u8,
    pub message: u8,
    pub data: Vec<u8>,
}

impl CommandOutcome {
    pub fn is_good(&self) -> bool {
        self.status == super::STATUS_GOOD
    }
}

/// Initiator routines operating one port through its registers
pub struct ScsiIocs<'a> {
    port: &'a mut ScsiPort,
    dma: bool,
}

impl<'a> ScsiIocs<'a> {
    /// Programs the controller as initiator at ID 7.
    pub fn new(port: &'a mut ScsiPort) -> Self {
        port.write_reg(SpcReg::SCTL, SpcRegSctl(0).with_reset_disable(true).0);
        port.write_reg(SpcReg::BDID, INITIATOR_ID as u8);
        port.write_reg(SpcReg::SCTL, SpcRegSctl(0).with_arb_en(true).0);
        port.write_reg(SpcReg::INTS, 0xFF);
        Self { port, dma: false }
    }

    /// Moves data through the DMA handshake instead of DREG.
    pub fn with_dma(mut self, dma: bool) -> Self {
        self.dma = dma;
        self
    }

    pub fn port(&mut self) -> &mut ScsiPort {
        self.port
    }

    fn ints(&mut self) -> SpcRegInts {
        SpcRegInts(self.port.read_reg(SpcReg::INTS))
    }

    fn clear_ints(&mut self, ints: SpcRegInts) {
        self.port.write_reg(SpcReg::INTS, ints.0);
    }

    fn ssts(&mut self) -> SpcRegSsts {
        SpcRegSsts(self.port.read_reg(SpcReg::SSTS))
    }

    fn psns(&mut self) -> SpcRegPsns {
        SpcRegPsns(self.port.read_reg(SpcReg::PSNS_SDGC))
    }

    fn command_reg(&mut self, cmd: SpcCommand, scmd: SpcRegScmd) {
        self.port
            .write_reg(SpcReg::SCMD, scmd.with_cmd(cmd as u8).0);
    }

    fn tc(&mut self) -> u32 {
        u32::from_be_bytes([
            0,
            self.port.read_reg(SpcReg::TCH),
            self.port.read_reg(SpcReg::TCM),
            self.port.read_reg(SpcReg::TCL),
        ])
    }

    fn set_tc(&mut self, tc: u32) {
        self.port.write_reg(SpcReg::TCH, (tc >> 16) as u8);
        self.port.write_reg(SpcReg::TCM, (tc >> 8) as u8);
        self.port.write_reg(SpcReg::TCL, tc as u8);
    }

    /// Lets time pass until `cond` holds.
    fn wait(
        &mut self,
        what: &'static str,
        mut cond: impl FnMut(&mut Self) -> bool,
    ) -> Result<(), IocsError> {
        let mut waited = 0;
        while !cond(self) {
            if waited >= WAIT_LIMIT {
                log::warn!("SCSI stall waiting for {}", what);
                return Err(IocsError::Stall(what));
            }
            self.port.tick(POLL_TICKS)?;
            waited += POLL_TICKS;
        }
        Ok(())
    }

    /// Arbitrates and selects a target. With `atn`, ATN is raised during
    /// selection so the target starts with MESSAGE OUT.
    pub fn select(&mut self, id: usize, atn: bool) -> Result<(), IocsError> {
        if id >= MAX_TARGETS {
            return Err(IocsError::InvalidId(id));
        }
        self.clear_ints(SpcRegInts(0xFF));
        if atn {
            self.command_reg(SpcCommand::SetAtn, SpcRegScmd(0));
        }
        self.port
            .write_reg(SpcReg::TEMP, ((1 << id) | (1 << INITIATOR_ID)) as u8);
        self.set_tc(SELECT_TC);
        self.command_reg(SpcCommand::Select, SpcRegScmd(0));

        let mut ints = SpcRegInts(0);
        self.wait("selection", |s| {
            ints = s.ints();
            ints.cmd_complete() || ints.timeout()
        })?;
        self.clear_ints(ints);

        if ints.timeout() {
            if IOCS_TRACE {
                log::debug!("No target at ID {}", id);
            }
            return Err(IocsError::SelectionTimeout(id));
        }
        Ok(())
    }

    /// Waits for the target to request a byte and returns the phase.
    fn wait_req(&mut self) -> Result<ScsiPhase, IocsError> {
        let mut psns = SpcRegPsns(0);
        self.wait("REQ", |s| {
            psns = s.psns();
            psns.req() || !psns.bsy()
        })?;
        if !psns.bsy() {
            return Err(IocsError::BusFree);
        }
        ScsiPhase::from_bits(psns.0 & 7).ok_or(IocsError::UnexpectedPhase {
            actual: "reserved",
        })
    }

    fn start_transfer(&mut self, phase: ScsiPhase, len: usize) {
        self.port.write_reg(SpcReg::PCTL, phase.bits());
        self.set_tc(len as u32);
        self.command_reg(
            SpcCommand::Transfer,
            SpcRegScmd(0).with_prg_xfer(!self.dma),
        );
    }

    /// Sends bytes in an output phase. Returns how many the target took
    /// before the transfer completed or the phase changed.
    fn transfer_out(&mut self, phase: ScsiPhase, data: &[u8]) -> Result<usize, IocsError> {
        self.start_transfer(phase, data.len());

        let mut pos = 0;
        let mut waited = 0;
        loop {
            let ints = self.ints();
            if ints.cmd_complete() || ints.service_req() {
                self.clear_ints(ints);
                // The counter only advances for bytes the target acknowledged
                return Ok(data.len().saturating_sub(self.tc() as usize));
            }

            if pos < data.len() {
                let ready = if self.dma {
                    self.port.get_drq()
                } else {
                    !self.ssts().dreq_full()
                };
                if ready {
                    if self.dma {
                        self.port.dma_write(data[pos]);
                    } else {
                        self.port.write_reg(SpcReg::DREG, data[pos]);
                    }
                    pos += 1;
                    continue;
                }
            }

            if waited >= WAIT_LIMIT {
                return Err(IocsError::Stall("output transfer"));
            }
            self.port.tick(POLL_TICKS)?;
            waited += POLL_TICKS;
        }
    }

    /// Receives up to `len` bytes in an input phase.
    fn transfer_in(&mut self, phase: ScsiPhase, len: usize) -> Result<Vec<u8>, IocsError> {
        self.start_transfer(phase, len);

        let mut result = Vec::with_capacity(len);
        let mut waited = 0;
        loop {
            let ints = self.ints();
            if self.dma {
                while self.port.get_drq() {
                    result.push(self.port.dma_read());
                }
            } else {
                while !self.ssts().dreq_empty() {
                    result.push(self.port.read_reg(SpcReg::DREG));
                }
            }
            if ints.cmd_complete() || ints.service_req() {
                self.clear_ints(ints);
                return Ok(result);
            }

            if waited >= WAIT_LIMIT {
                return Err(IocsError::Stall("input transfer"));
            }
            self.port.tick(POLL_TICKS)?;
            waited += POLL_TICKS;
        }
    }

    /// Releases ACK held after MESSAGE IN and waits for the target to
    /// leave the bus.
    fn finish(&mut self) -> Result<(), IocsError> {
        self.command_reg(SpcCommand::ResetAckReq, SpcRegScmd(0));
        let mut ints = SpcRegInts(0);
        self.wait("disconnect", |s| {
            ints = s.ints();
            ints.disconnected()
        })?;
        self.clear_ints(ints);
        Ok(())
    }

    /// Runs a complete command: selection, CDB, data, status and message.
    pub fn command(
        &mut self,
        id: usize,
        cdb: &[u8],
        data: DataPhase<'_>,
    ) -> Result<CommandOutcome, IocsError> {
        self.command_atn(id, cdb, data, false)
    }

    /// Like `command`, optionally starting with an IDENTIFY message.
    pub fn command_atn(
        &mut self,
        id: usize,
        cdb: &[u8],
        data: DataPhase<'_>,
        atn: bool,
    ) -> Result<CommandOutcome, IocsError> {
        let (mut data_in, mut data_out) = match data {
            DataPhase::None => (0, &[][..]),
            DataPhase::In(len) => (len, &[][..]),
            DataPhase::Out(out) => (0, out),
        };

        self.select(id, atn)?;

        let mut outcome = CommandOutcome::default();
        let mut cdb_sent = false;
        loop {
            let phase = self.wait_req()?;
            if IOCS_TRACE {
                log::debug!("Phase {:?}", phase);
            }
            let unexpected = IocsError::UnexpectedPhase {
                actual: phase.into(),
            };

            match phase {
                ScsiPhase::MessageOut => {
                    self.transfer_out(phase, &[MSG_IDENTIFY])?;
                }
                ScsiPhase::Command => {
                    if cdb_sent {
                        return Err(unexpected);
                    }
                    self.transfer_out(phase, cdb)?;
                    cdb_sent = true;
                }
                ScsiPhase::DataOut => {
                    if data_out.is_empty() {
                        return Err(unexpected);
                    }
                    let sent = self.transfer_out(phase, data_out)?;
                    data_out = &data_out[sent..];
                }
                ScsiPhase::DataIn => {
                    if data_in == 0 {
                        return Err(unexpected);
                    }
                    let bytes = self.transfer_in(phase, data_in)?;
                    data_in -= bytes.len();
                    outcome.data.extend(bytes);
                }
                ScsiPhase::Status => {
                    let bytes = self.transfer_in(phase, 1)?;
                    outcome.status = bytes.first().copied().unwrap_or(0xFF);
                }
                ScsiPhase::MessageIn => {
                    let bytes = self.transfer_in(phase, 1)?;
                    outcome.message = bytes.first().copied().unwrap_or(0xFF);
                    self.finish()?;
                    return Ok(outcome);
                }
            }
        }
    }

    /// Pulses RST, returning every target to bus free.
    pub fn bus_reset(&mut self) -> Result<(), IocsError> {
        self.port
            .write_reg(SpcReg::SCTL, SpcRegSctl(0).with_reset_disable(true).0);
        self.port.write_reg(SpcReg::SCTL, SpcRegSctl(0).with_arb_en(true).0);
        self.command_reg(SpcCommand::BusRelease, SpcRegScmd(0).with_rst_out(true));
        self.port.tick(RESET_HOLD_TICKS)?;
        self.command_reg(SpcCommand::BusRelease, SpcRegScmd(0));

        if self.ssts().init_conn() {
            self.wait("bus free", |s| s.ints().disconnected())?;
        }
        self.clear_ints(SpcRegInts(0xFF));
        debug_assert!(!self.port.bus().get_control().intersects(ScsiSignals::RST));
        Ok(())
    }

    pub fn test_unit_ready(&mut self, id: usize) -> Result<CommandOutcome, IocsError> {
        self.command(id, &[0x00, 0, 0, 0, 0, 0], DataPhase::None)
    }

    pub fn request_sense(&mut self, id: usize, alloc: u8) -> Result<CommandOutcome, IocsError> {
        let len = if alloc == 0 { 4 } else { alloc as usize };
        self.command(id, &[0x03, 0, 0, 0, alloc, 0], DataPhase::In(len))
    }

    pub fn inquiry(&mut self, id: usize, alloc: u8) -> Result<CommandOutcome, IocsError> {
        self.command(id, &[0x12, 0, 0, 0, alloc, 0], DataPhase::In(alloc as usize))
    }

    pub fn mode_sense(&mut self, id: usize, page: u8, alloc: u8) -> Result<CommandOutcome, IocsError> {
        self.command(
            id,
            &[0x1A, 0, page & 0x3F, 0, alloc, 0],
            DataPhase::In(alloc as usize),
        )
    }

    /// Returns the outcome and, on success, (last LBA, block length).
    pub fn read_capacity(
        &mut self,
        id: usize,
    ) -> Result<(CommandOutcome, Option<(u32, u32)>), IocsError> {
        let outcome = self.command(id, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], DataPhase::In(8))?;
        let capacity = match outcome.data[..] {
            [a, b, c, d, e, f, g, h] if outcome.is_good() => Some((
                u32::from_be_bytes([a, b, c, d]),
                u32::from_be_bytes([e, f, g, h]),
            )),
            _ => None,
        };
        Ok((outcome, capacity))
    }

    pub fn read10(&mut self, id: usize, lba: u32, blocks: u16) -> Result<CommandOutcome, IocsError> {
        let mut cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        self.command(id, &cdb, DataPhase::In(blocks as usize * 512))
    }

    pub fn write10(&mut self, id: usize, lba: u32, data: &[u8]) -> Result<CommandOutcome, IocsError> {
        let blocks = (data.len() / 512) as u16;
        let mut cdb = [0x2A, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        self.command(id, &cdb, DataPhase::Out(data))
    }
}
