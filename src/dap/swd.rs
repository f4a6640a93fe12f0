//! SWD transport.  The wire itself (turnaround, parity, line timing) belongs to the adapter and
//! is reached through [`SwdWire`]; this module sequences the DP/AP accesses on top of it.
use super::{
    dp_init, Dap, DapCommand, DapOps, DeferredRead, DeferredResults, DpInstruction, DP_ABORT,
    DP_DPIDR, DP_RDBUFF, DP_SELECT, DAPABORT, ORUNERRCLR, STKCMPCLR, STKERRCLR, WDERRCLR,
};
use crate::error::DapError;

/// WAIT answers tolerated for one access.
const MAX_WAIT_RETRIES: usize = 64;

/// Write to ABORT that clears every sticky flag.
const CLEAR_STICKY: u32 = STKCMPCLR | STKERRCLR | WDERRCLR | ORUNERRCLR;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Port {
    Dp,
    Ap,
}

/// One SWD packet at a time.  Only bits 3:2 of `addr` go on the wire; AP banks come from DP
/// SELECT.  A WAIT or FAULT acknowledge is reported as `DapError::WaitResponse` or
/// `DapError::FaultResponse`.
pub trait SwdWire {
    /// Switch the target from JTAG to SWD and reset the line.
    fn line_reset(&mut self) -> Result<(), DapError>;

    fn read(&mut self, port: Port, addr: u8) -> Result<u32, DapError>;

    fn write(&mut self, port: Port, addr: u8, value: u32) -> Result<(), DapError>;

    /// Idle cycles after an AP access.
    fn idle(&mut self, _cycles: u32) -> Result<(), DapError> {
        Ok(())
    }
}

pub struct SwdDp<'a> {
    wire: &'a mut dyn SwdWire,
}

impl<'a> SwdDp<'a> {
    pub fn new(wire: &'a mut dyn SwdWire) -> Self {
        Self { wire }
    }

    /// Carry out one access, retrying while the target answers WAIT.
    fn transfer(&mut self, cmd: &mut DapCommand) -> Result<(), DapError> {
        let port = match cmd.instr {
            DpInstruction::Apacc => Port::Ap,
            DpInstruction::Dpacc | DpInstruction::Abort => Port::Dp,
        };
        let mut waits = 0;
        loop {
            let result = if cmd.rnw {
                self.wire.read(port, cmd.reg_addr).map(|v| cmd.in_value = v)
            } else {
                self.wire.write(port, cmd.reg_addr, cmd.out_value)
            };
            match result {
                Err(DapError::WaitResponse) if waits < MAX_WAIT_RETRIES => waits += 1,
                other => {
                    other?;
                    break;
                }
            }
        }
        if port == Port::Ap && cmd.memaccess_tck != 0 {
            self.wire.idle(cmd.memaccess_tck)?;
        }
        tracing::trace!("SWD: {}", cmd);
        Ok(())
    }

    fn clear_sticky_errors(&mut self) -> Result<(), DapError> {
        self.wire.write(Port::Dp, DP_ABORT, CLEAR_STICKY)
    }

    fn execute(&mut self, batch: &mut [DapCommand]) -> Result<DeferredResults, DapError> {
        let mut results = DeferredResults::new();
        for cmd in batch.iter_mut() {
            self.transfer(cmd)?;
            if let Some(handle) = cmd.result {
                results.push(handle, cmd.in_value);
            }
        }
        Ok(results)
    }
}

impl DapOps for SwdDp<'_> {
    fn queue_dp_read(&mut self, dap: &mut Dap, reg: u8) -> DeferredRead {
        dap.enqueue_read(DapCommand::dp_read(reg))
    }

    fn queue_dp_write(&mut self, dap: &mut Dap, reg: u8, value: u32) {
        dap.enqueue(DapCommand::dp_write(reg, value));
    }

    fn queue_ap_read(&mut self, dap: &mut Dap, ap_num: u8, reg: u8) -> DeferredRead {
        if let Some(select) = dap.bank_select(ap_num, reg) {
            self.queue_dp_write(dap, DP_SELECT, select);
        }
        // AP reads are posted; RDBUFF returns the value without starting another access.
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
        dap.enqueue(DapCommand::abort(DAPABORT | CLEAR_STICKY));
    }

    fn run(&mut self, dap: &mut Dap) -> Result<DeferredResults, DapError> {
        let mut batch = dap.take_journal();
        if dap.reconnect_pending() {
            tracing::debug!("DAP {}: reconnecting SWD before the next batch", dap.name());
            self.connect(dap)?;
        }

        let result = self.execute(&mut batch);
        dap.flush_journal();
        if let Err(e) = &result {
            // The target may have dropped any packet of the batch, SELECT included.
            dap.invalidate_select();
            dap.set_reconnect(true);
            if matches!(e, DapError::FaultResponse) {
                tracing::debug!("SWD FAULT, clearing sticky errors");
                self.clear_sticky_errors()?;
            }
        }
        result
    }

    fn connect(&mut self, dap: &mut Dap) -> Result<(), DapError> {
        dap.set_reconnect(false);
        if let Err(e) = self.wire.line_reset() {
            dap.set_reconnect(true);
            return Err(e);
        }
        dap.invalidate_select();

        let dpidr = self.queue_dp_read(dap, DP_DPIDR);
        dap.enqueue(DapCommand::abort(CLEAR_STICKY));
        let dpidr = self.run(dap)?.take(dpidr)?;
        tracing::info!("SWD DPIDR {:#010x}", dpidr);

        dp_init(self, dap)
    }
}
