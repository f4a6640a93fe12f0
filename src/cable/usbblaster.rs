//! Implement the `Cable` trait for Altera USB Blaster and clones.  This is the usual way to reach
//! the SLD hub of an Altera FPGA.
use libftd2xx::{Ftdi, FtdiCommon};

use crate::cable::{total_bits, Cable};
use crate::error::CableError;

pub struct UsbBlaster {
    ft: Ftdi,
    tdi: u8,
    tdo: u8,
    tms: u8,
    clk: u8,
}

/// Ask the adapter to sample TDO for this clock and return it.
const READ_CMD: u8 = 1 << 6;

impl UsbBlaster {
    /// Open the first USB Blaster found.
    pub fn new() -> Result<Self, CableError> {
        #[cfg(target_os = "linux")]
        libftd2xx::set_vid_pid(0x09fb, 0x6001).map_err(CableError::adapter)?;
        let mut ft = Ftdi::with_description("USB-Blaster").map_err(CableError::adapter)?;
        ft.purge_all().map_err(CableError::adapter)?;

        Ok(Self {
            ft,
            tdi: 0,
            tdo: 4,
            tms: 1,
            clk: 0,
        })
    }

    /// Every response byte carries one TDO sample; pack them into bits, LSB first.
    fn select_bit(recv: &[u8], tdi: u8) -> Vec<u8> {
        let mut recv_bits = vec![0u8; recv.len().div_ceil(8)];
        for (i, x) in recv.iter().enumerate() {
            if x & (1 << tdi) != 0 {
                recv_bits[i / 8] |= 1 << (i % 8);
            }
        }
        recv_bits
    }

    fn edge(&self, tms: bool, tdi: bool) -> u8 {
        (tms as u8) << self.tms | (tdi as u8) << self.tdo
    }
}

impl Cable for UsbBlaster {
    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), CableError> {
        let mut buf = Vec::with_capacity(tms.len() * 2);

        for &x in tms {
            let level = self.edge(x, tdi);
            buf.push(level);
            buf.push(level | 1 << self.clk);
        }
        self.ft.write_all(&buf).map_err(CableError::adapter)
    }

    fn read_data(&mut self, bits: usize) -> Result<Vec<u8>, CableError> {
        let bytes = bits.div_ceil(8);
        let last = match bits % 8 {
            0 => 8,
            n => n as u8,
        };
        self.read_write_data(&vec![0xff; bytes], last, false)
    }

    fn write_data(&mut self, data: &[u8], bits: u8, pause_after: bool) -> Result<(), CableError> {
        self.read_write_data(data, bits, pause_after).map(|_| ())
    }

    fn read_write_data(
        &mut self,
        data: &[u8],
        bits: u8,
        pause_after: bool,
    ) -> Result<Vec<u8>, CableError> {
        let total = total_bits(data.len(), bits.clamp(1, 8));
        let mut buf = Vec::with_capacity(total * 2 + 2);

        for i in 0..total {
            let tdi = data[i / 8] & (1 << (i % 8)) != 0;
            let tms = pause_after && i == total - 1;
            let level = self.edge(tms, tdi);
            buf.push(level);
            buf.push(READ_CMD | level | 1 << self.clk);
        }
        if pause_after && total > 0 {
            // Exit1-xR -> Pause-xR, nothing to sample
            buf.push(0);
            buf.push(1 << self.clk);
        }

        let mut recv = vec![0; total];
        self.ft.write_all(&buf).map_err(CableError::adapter)?;
        self.ft.read_all(&mut recv).map_err(CableError::adapter)?;
        Ok(Self::select_bit(&recv, self.tdi))
    }
}
