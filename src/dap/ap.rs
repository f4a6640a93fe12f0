//! Per-AP settings.

/// The most conservative number of idle clocks after a memory access.
pub const DEFAULT_MEMACCESS_TCK: u32 = 255;
/// TAR auto-increment wraps at least every 1KiB; implementations may go further.
pub const DEFAULT_TAR_AUTOINCR_BLOCK: u32 = 1 << 10;

/// One of the 256 Access Port slots of a DAP.  It is only reachable through the owning
/// [`Dap`](super::Dap).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessPort {
    ap_num: u8,
    memaccess_tck: u32,
    tar_autoincr_block: u32,
}

impl AccessPort {
    pub(crate) fn new(ap_num: u8) -> Self {
        Self {
            ap_num,
            memaccess_tck: DEFAULT_MEMACCESS_TCK,
            tar_autoincr_block: DEFAULT_TAR_AUTOINCR_BLOCK,
        }
    }

    pub fn ap_num(&self) -> u8 {
        self.ap_num
    }

    /// Run-Test/Idle clocks spent after each DRW or BDx access so the bus access can finish.
    pub fn memaccess_tck(&self) -> u32 {
        self.memaccess_tck
    }

    pub fn set_memaccess_tck(&mut self, tck: u32) {
        self.memaccess_tck = tck;
    }

    /// Size in bytes of the block inside which TAR auto-increments.
    pub fn tar_autoincr_block(&self) -> u32 {
        self.tar_autoincr_block
    }

    pub fn set_tar_autoincr_block(&mut self, bytes: u32) {
        self.tar_autoincr_block = bytes;
    }

    /// The DP SELECT value that addresses the bank holding `reg` on this AP.
    pub fn bank_select(&self, reg: u8) -> u32 {
        (u32::from(self.ap_num) << 24) | u32::from(reg & 0xf0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_select_combines_apsel_and_bank() {
        let ap = AccessPort::new(0x12);
        assert_eq!(ap.bank_select(0xfc), 0x1200_00f0);
        assert_eq!(ap.bank_select(0x0c), 0x1200_0000);
    }
}
