//! JTAG-DP: DP and AP accesses as 35-bit DPACC/APACC scans on the DAP's TAP.
//!
//! Every read is posted.  The scan that issues a read captures the result of the previous one,
//! so each queued read is followed by an RDBUFF read that collects it.  After a batch the DP's
//! CTRL/STAT is checked: a sticky error fails the batch, an overrun (some access answered WAIT)
//! replays it.
use bitvec::prelude::*;

use super::{
    dp_init, Dap, DapCommand, DapOps, DeferredRead, DeferredResults, DpInstruction, DP_CTRL_STAT,
    DP_RDBUFF, DP_SELECT, STICKYERR, STICKYORUN,
};
use crate::error::{DapError, JtagError};
use crate::statemachine::Register;
use crate::taps::{field, ScanChain, TapId};

/// Width of a DPACC/APACC/ABORT scan: 3 bits of address and RnW, then 32 bits of data.
pub const DR_BITS: usize = 35;

pub const ACK_OK_FAULT: u8 = 0x2;
pub const ACK_WAIT: u8 = 0x1;

/// WAIT answers tolerated for one access while replaying a batch.
const MAX_WAIT_RETRIES: usize = 64;

/// Both power-up acknowledges and both requests.
const POWER_BITS: u32 = 0xf000_0000;

pub struct JtagDp<'a, C: ScanChain + ?Sized> {
    chain: &'a mut C,
    // IR contents, to skip redundant IR scans
    ir: Option<(TapId, DpInstruction)>,
}

impl<'a, C: ScanChain + ?Sized> JtagDp<'a, C> {
    pub fn new(chain: &'a mut C) -> Self {
        Self { chain, ir: None }
    }

    /// Scan one command and record its acknowledge and captured value in it.
    fn scan(&mut self, tap: TapId, cmd: &mut DapCommand) -> Result<(), DapError> {
        if self.ir != Some((tap, cmd.instr)) {
            let irlen = self.chain.tap(tap).ok_or(JtagError::NoSuchTap(tap))?.irlen;
            self.chain.shift(
                tap,
                Register::Instruction,
                irlen,
                &field(cmd.instr as u64, irlen),
            )?;
            self.ir = Some((tap, cmd.instr));
        }

        let request = u64::from(((cmd.reg_addr >> 1) & 0x6) | u8::from(cmd.rnw))
            | u64::from(cmd.out_value) << 3;
        let captured = self
            .chain
            .shift(tap, Register::Data, DR_BITS, &field(request, DR_BITS))?;
        if captured.len() < DR_BITS.div_ceil(8) {
            return Err(JtagError::BufferTooShort {
                bits: DR_BITS,
                needed: DR_BITS.div_ceil(8),
                got: captured.len(),
            }
            .into());
        }
        let captured = captured.view_bits::<Lsb0>()[..DR_BITS].load_le::<u64>();
        cmd.ack = (captured & 0x7) as u8;
        cmd.in_value = (captured >> 3) as u32;

        // Give the AP time to finish the bus access before the next scan.
        if cmd.starts_memory_access() && cmd.memaccess_tck != 0 {
            self.chain.idle(cmd.memaccess_tck as usize)?;
        }
        Ok(())
    }

    /// Read CTRL/STAT outside the journal.
    fn read_ctrl_stat(&mut self, tap: TapId) -> Result<u32, DapError> {
        self.scan(tap, &mut DapCommand::dp_read(DP_CTRL_STAT))?;
        let mut rdbuff = DapCommand::dp_read(DP_RDBUFF);
        self.scan(tap, &mut rdbuff)?;
        Ok(rdbuff.in_value)
    }

    fn execute(
        &mut self,
        dap: &Dap,
        batch: &mut [DapCommand],
    ) -> Result<DeferredResults, DapError> {
        let tap = dap.tap();
        let mut results = DeferredResults::new();
        for cmd in batch.iter_mut() {
            self.scan(tap, cmd)?;
            tracing::trace!("LOG: {}", cmd);
            if let Some(handle) = cmd.result {
                results.push(handle, cmd.in_value);
            }
        }

        let mut ctrl_stat = self.read_ctrl_stat(tap)?;
        tracing::debug!("CTRL/STAT {:#010x}", ctrl_stat);

        if ctrl_stat & STICKYERR != 0 {
            tracing::debug!("jtag-dp: CTRL/STAT error, {:#010x}", ctrl_stat);
            if ctrl_stat & POWER_BITS != POWER_BITS {
                tracing::error!(
                    "Debug regions are unpowered, an unexpected reset might have happened"
                );
                return Err(DapError::DebugPowerLost(ctrl_stat));
            }
            tracing::error!("JTAG-DP STICKY ERROR");
            self.scan(
                tap,
                &mut DapCommand::dp_write(DP_CTRL_STAT, dap.dp_ctrl_stat() | STICKYERR),
            )?;
            let cleared = self.read_ctrl_stat(tap)?;
            tracing::debug!("jtag-dp: CTRL/STAT {:#010x}", cleared);
            return Err(DapError::StickyError(ctrl_stat));
        }

        if ctrl_stat & STICKYORUN != 0 {
            // Clear the overrun flag, then replay the batch
            ctrl_stat |= STICKYORUN;
            self.scan(tap, &mut DapCommand::dp_write(DP_CTRL_STAT, ctrl_stat))?;
            let recovered = self.read_ctrl_stat(tap)?;
            tracing::debug!("Recover: CTRL/STAT {:#010x}", recovered);

            for cmd in batch.iter_mut() {
                let mut waits = 0;
                loop {
                    self.scan(tap, cmd)?;
                    tracing::trace!("REC: {}", cmd);
                    if cmd.ack != ACK_WAIT {
                        break;
                    }
                    waits += 1;
                    if waits >= MAX_WAIT_RETRIES {
                        return Err(DapError::WaitResponse);
                    }
                }
                if let Some(handle) = cmd.result {
                    results.push(handle, cmd.in_value);
                }
            }
        }
        Ok(results)
    }
}

impl<C: ScanChain + ?Sized> DapOps for JtagDp<'_, C> {
    fn queue_dp_read(&mut self, dap: &mut Dap, reg: u8) -> DeferredRead {
        dap.enqueue(DapCommand::dp_read(reg));
        dap.enqueue_read(DapCommand::dp_read(DP_RDBUFF))
    }

    fn queue_dp_write(&mut self, dap: &mut Dap, reg: u8, value: u32) {
        dap.enqueue(DapCommand::dp_write(reg, value));
    }

    fn queue_ap_read(&mut self, dap: &mut Dap, ap_num: u8, reg: u8) -> DeferredRead {
        if let Some(select) = dap.bank_select(ap_num, reg) {
            self.queue_dp_write(dap, DP_SELECT, select);
        }
        let tck = dap.ap(ap_num).memaccess_tck();
        dap.enqueue(DapCommand::ap_read(reg, tck));
        dap.enqueue_read(DapCommand::dp_read(DP_RDBUFF))
    }

    fn queue_ap_write(&mut self, dap: &mut Dap, ap_num: u8, reg: u8, value: u32) {
        if let Some(select) = dap.bank_select(ap_num, reg) {
            self.queue_dp_write(dap, DP_SELECT, select);
        }
        let tck = dap.ap(ap_num).memaccess_tck();
        dap.enqueue(DapCommand::ap_write(reg, value, tck));
    }

    fn queue_ap_abort(&mut self, dap: &mut Dap) {
        // The only valid ABORT operation on JTAG
        dap.enqueue(DapCommand::abort(1));
    }

    fn run(&mut self, dap: &mut Dap) -> Result<DeferredResults, DapError> {
        let mut batch = dap.take_journal();
        let result = self.execute(dap, &mut batch);
        dap.flush_journal();
        if result.is_err() {
            dap.invalidate_select();
        }
        result
    }

    fn connect(&mut self, dap: &mut Dap) -> Result<(), DapError> {
        dp_init(self, dap)
    }
}
