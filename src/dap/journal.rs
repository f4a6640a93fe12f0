//! The per-DAP queue of DP/AP transactions.
//!
//! Queue operations only record commands.  Nothing reaches the wire until the transport's
//! `run`, which executes the journal front to back and hands back the values of the queued
//! reads as a [`DeferredResults`] set.
use std::collections::{HashMap, VecDeque};
use std::fmt;

use super::{
    DP_ABORT, DP_CTRL_STAT, DP_RDBUFF, DP_SELECT, MEM_AP_BASE, MEM_AP_BD0, MEM_AP_BD1,
    MEM_AP_BD2, MEM_AP_BD3, MEM_AP_CFG, MEM_AP_CSW, MEM_AP_DRW, MEM_AP_IDR, MEM_AP_TAR,
};
use crate::error::DapError;

/// Which DP register file a command goes to.  The values are the JTAG-DP IR opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DpInstruction {
    Abort = 0x8,
    Dpacc = 0xa,
    Apacc = 0xb,
}

/// Handle to the value of a queued read, valid in the results of the next `run`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeferredRead(usize);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DapCommand {
    pub instr: DpInstruction,
    pub reg_addr: u8,
    pub rnw: bool,
    pub out_value: u32,
    /// Value captured by the last execution.
    pub in_value: u32,
    pub memaccess_tck: u32,
    /// DP SELECT cached when the command was queued.
    pub dp_select: Option<u32>,
    /// Acknowledge of the last execution.
    pub ack: u8,
    pub result: Option<DeferredRead>,
}

impl DapCommand {
    fn new(instr: DpInstruction, reg_addr: u8, rnw: bool, out_value: u32) -> Self {
        Self {
            instr,
            reg_addr,
            rnw,
            out_value,
            in_value: 0,
            memaccess_tck: 0,
            dp_select: None,
            ack: 0,
            result: None,
        }
    }

    pub fn dp_read(reg_addr: u8) -> Self {
        Self::new(DpInstruction::Dpacc, reg_addr, true, 0)
    }

    pub fn dp_write(reg_addr: u8, value: u32) -> Self {
        Self::new(DpInstruction::Dpacc, reg_addr, false, value)
    }

    pub fn ap_read(reg_addr: u8, memaccess_tck: u32) -> Self {
        Self {
            memaccess_tck,
            ..Self::new(DpInstruction::Apacc, reg_addr, true, 0)
        }
    }

    pub fn ap_write(reg_addr: u8, value: u32, memaccess_tck: u32) -> Self {
        Self {
            memaccess_tck,
            ..Self::new(DpInstruction::Apacc, reg_addr, false, value)
        }
    }

    pub fn abort(value: u32) -> Self {
        Self::new(DpInstruction::Abort, 0, false, value)
    }

    /// DRW and the banked data registers start a bus access.
    pub fn starts_memory_access(&self) -> bool {
        self.instr == DpInstruction::Apacc
            && (self.reg_addr == MEM_AP_DRW || self.reg_addr & 0xf0 == MEM_AP_BD0)
    }

    pub fn register_name(&self) -> &'static str {
        match (self.instr, self.reg_addr) {
            (DpInstruction::Abort, _) => "ABORT",
            (DpInstruction::Dpacc, DP_ABORT) => "ABORT",
            (DpInstruction::Dpacc, DP_CTRL_STAT) => "CTRL/STAT",
            (DpInstruction::Dpacc, DP_SELECT) => "SELECT",
            (DpInstruction::Dpacc, DP_RDBUFF) => "RDBUFF",
            (DpInstruction::Apacc, MEM_AP_CSW) => "CSW",
            (DpInstruction::Apacc, MEM_AP_TAR) => "TAR",
            (DpInstruction::Apacc, MEM_AP_DRW) => "DRW",
            (DpInstruction::Apacc, MEM_AP_BD0) => "BD0",
            (DpInstruction::Apacc, MEM_AP_BD1) => "BD1",
            (DpInstruction::Apacc, MEM_AP_BD2) => "BD2",
            (DpInstruction::Apacc, MEM_AP_BD3) => "BD3",
            (DpInstruction::Apacc, MEM_AP_CFG) => "CFG",
            (DpInstruction::Apacc, MEM_AP_BASE) => "BASE",
            (DpInstruction::Apacc, MEM_AP_IDR) => "IDR",
            _ => "UNK",
        }
    }
}

impl fmt::Display for DapCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = match self.instr {
            DpInstruction::Apacc => "AP",
            _ => "DP",
        };
        let (dir, value) = if self.rnw {
            ("READ", self.in_value)
        } else {
            ("WRITE", self.out_value)
        };
        write!(
            f,
            "{port:>2} {:>9} {dir:>5} {value:#010x} ack {}",
            self.register_name(),
            self.ack
        )
    }
}

/// FIFO of commands waiting for the next `run`.
#[derive(Debug, Default)]
pub struct Journal {
    commands: VecDeque<DapCommand>,
    next_read: usize,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cmd: DapCommand) {
        self.commands.push_back(cmd);
    }

    /// Queue a command whose captured value is wanted back.
    pub fn push_read(&mut self, mut cmd: DapCommand) -> DeferredRead {
        let handle = DeferredRead(self.next_read);
        self.next_read += 1;
        cmd.result = Some(handle);
        self.commands.push_back(cmd);
        handle
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DapCommand> {
        self.commands.iter()
    }

    /// Take every queued command, oldest first, leaving the journal empty.
    pub fn take_all(&mut self) -> Vec<DapCommand> {
        self.commands.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

/// The values read by one `run`.
#[derive(Debug, Default)]
pub struct DeferredResults(HashMap<DeferredRead, u32>);

impl DeferredResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, handle: DeferredRead, value: u32) {
        self.0.insert(handle, value);
    }

    /// Take the value of a queued read.
    pub fn take(&mut self, handle: DeferredRead) -> Result<u32, DapError> {
        self.0
            .remove(&handle)
            .ok_or(DapError::MissingResult(handle.0))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn commands_leave_in_submission_order() {
        let mut journal = Journal::new();
        journal.push(DapCommand::dp_write(DP_SELECT, 0x0100_00f0));
        let read = journal.push_read(DapCommand::ap_read(MEM_AP_IDR, 0));
        journal.push(DapCommand::abort(1));

        let names: Vec<_> = journal.iter().map(DapCommand::register_name).collect();
        assert_eq!(names, vec!["SELECT", "IDR", "ABORT"]);

        let cmds = journal.take_all();
        assert!(journal.is_empty());
        assert_eq!(cmds[1].result, Some(read));
    }

    #[test]
    fn read_handles_are_distinct() {
        let mut journal = Journal::new();
        let a = journal.push_read(DapCommand::dp_read(DP_CTRL_STAT));
        let b = journal.push_read(DapCommand::dp_read(DP_CTRL_STAT));
        assert_ne!(a, b);
    }

    #[test]
    fn results_are_taken_once() {
        let mut journal = Journal::new();
        let handle = journal.push_read(DapCommand::dp_read(DP_RDBUFF));
        let mut results = DeferredResults::new();
        results.push(handle, 0xdead_beef);
        assert_eq!(results.take(handle).unwrap(), 0xdead_beef);
        assert!(matches!(results.take(handle), Err(DapError::MissingResult(0))));
    }

    #[test]
    fn memory_access_registers() {
        assert!(DapCommand::ap_read(MEM_AP_DRW, 8).starts_memory_access());
        assert!(DapCommand::ap_write(MEM_AP_BD2, 0, 8).starts_memory_access());
        assert!(!DapCommand::ap_read(MEM_AP_CSW, 8).starts_memory_access());
        assert!(!DapCommand::dp_read(DP_RDBUFF).starts_memory_access());
    }

    #[test]
    fn display_shows_direction_and_value() {
        let cmd = DapCommand::dp_write(DP_CTRL_STAT, 0x5000_0000);
        assert_eq!(cmd.to_string(), "DP CTRL/STAT WRITE 0x50000000 ack 0");
    }
}
