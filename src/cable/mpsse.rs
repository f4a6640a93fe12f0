//! Implement the `Cable` trait for any FTDI chip with an MPSSE engine.  Writes are batched into a
//! command buffer and only pushed to the adapter when it fills up or when data must be read back.
use ftdi_mpsse::{ClockTMS, ClockTMSOut};
use libftd2xx::{ClockBits, ClockBitsOut, ClockData, ClockDataOut};
use libftd2xx::{FtdiMpsse, MpsseCmdBuilder, MpsseCmdExecutor};

use crate::cable::Cable;
use crate::error::CableError;

/// Bytes of queued MPSSE commands before the buffer is sent.
const BUFFER_LIMIT: usize = 4096;

pub struct Mpsse<T> {
    pub(crate) ft: T,
    // Data to send to the adapter
    buffer: Vec<u8>,
}

impl<T: FtdiMpsse + MpsseCmdExecutor> Mpsse<T>
where
    <T as MpsseCmdExecutor>::Error: core::fmt::Debug,
{
    pub fn new(mut ft: T, clock: u32) -> Result<Self, CableError> {
        ft.initialize_mpsse_default().map_err(CableError::adapter)?;
        ft.set_clock(clock).map_err(CableError::adapter)?;

        let builder = MpsseCmdBuilder::new()
            .disable_3phase_data_clocking()
            .disable_adaptive_data_clocking();
        ft.send(builder.as_slice()).map_err(CableError::adapter)?;

        Ok(Self { ft, buffer: vec![] })
    }

    fn queue(&mut self, builder: MpsseCmdBuilder) -> Result<(), CableError> {
        if builder.as_slice().len() + self.buffer.len() > BUFFER_LIMIT {
            self.flush()?;
        }
        self.buffer.extend_from_slice(builder.as_slice());
        Ok(())
    }

    /// Send everything queued plus `builder`, and read back `bytes` bytes.
    fn transfer(&mut self, builder: MpsseCmdBuilder, bytes: usize) -> Result<Vec<u8>, CableError> {
        self.buffer.extend_from_slice(builder.as_slice());
        let mut recv = vec![0; bytes];
        self.ft
            .xfer(&self.buffer, &mut recv)
            .map_err(CableError::adapter)?;
        self.buffer.clear();
        Ok(recv)
    }
}

impl<T: FtdiMpsse + MpsseCmdExecutor> Cable for Mpsse<T>
where
    <T as MpsseCmdExecutor>::Error: core::fmt::Debug,
{
    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), CableError> {
        let mut builder = MpsseCmdBuilder::new();

        // clock_tms_out carries at most 7 TMS bits per command
        for chunk in tms.chunks(7) {
            let mut buf = 0u8;
            for (i, &x) in chunk.iter().enumerate() {
                if x {
                    buf |= 1 << i;
                }
            }
            builder = builder.clock_tms_out(ClockTMSOut::NegEdge, buf, tdi, chunk.len() as u8);
        }
        self.queue(builder)
    }

    fn read_data(&mut self, bits: usize) -> Result<Vec<u8>, CableError> {
        let bytes = bits / 8;
        let rem = bits % 8;
        let mut builder = MpsseCmdBuilder::new();
        if bytes > 0 {
            builder = builder.clock_data(ClockData::LsbPosIn, &vec![0xff; bytes]);
        }
        if rem > 0 {
            builder = builder.clock_bits(ClockBits::LsbPosIn, 0xff, rem as u8);
        }

        let mut buf = self.transfer(builder, bits.div_ceil(8))?;
        if rem > 0 {
            // Partial bytes arrive MSB-aligned
            let last_idx = buf.len() - 1;
            buf[last_idx] >>= 8 - rem;
        }
        Ok(buf)
    }

    fn write_data(&mut self, data: &[u8], bits: u8, pause_after: bool) -> Result<(), CableError> {
        let mut builder = MpsseCmdBuilder::new();
        let Some((&last_byte, body)) = data.split_last() else {
            return Ok(());
        };

        // We will send the last bit using clock_tms
        let bits = bits.clamp(1, 8) - 1;

        if !body.is_empty() {
            builder = builder.clock_data_out(ClockDataOut::LsbNeg, body);
        }
        if bits >= 1 {
            builder = builder.clock_bits_out(ClockBitsOut::LsbNeg, last_byte, bits);
        }
        let last_bit = last_byte & (1 << bits) != 0;
        if pause_after {
            builder = builder.clock_tms_out(ClockTMSOut::NegEdge, 0b01, last_bit, 2);
        } else {
            builder = builder.clock_tms_out(ClockTMSOut::NegEdge, 0, last_bit, 1);
        }
        self.queue(builder)
    }

    fn read_write_data(
        &mut self,
        data: &[u8],
        bits: u8,
        pause_after: bool,
    ) -> Result<Vec<u8>, CableError> {
        let mut builder = MpsseCmdBuilder::new();
        let Some((&last_byte, body)) = data.split_last() else {
            return Ok(Vec::new());
        };

        // We will send the last bit using clock_tms
        let bits = bits.clamp(1, 8) - 1;
        let mut read_bytes = 1;

        if !body.is_empty() {
            builder = builder.clock_data(ClockData::LsbPosIn, body);
            read_bytes += body.len();
        }
        if bits >= 1 {
            builder = builder.clock_bits(ClockBits::LsbPosIn, last_byte, bits);
            read_bytes += 1;
        }
        let last_bit = last_byte & (1 << bits) != 0;
        let tms = if pause_after { 0b01 } else { 0 };
        let tms_clocks = if pause_after { 2 } else { 1 };
        builder = builder.clock_tms(ClockTMS::NegTMSPosTDO, tms, last_bit, tms_clocks);

        let mut buf = self.transfer(builder, read_bytes)?;

        // The TMS command returns its sampled bit at the top of the byte; the first clock is the
        // last data bit.
        let tms_byte = buf.pop().unwrap_or_default();
        let last_recv = if pause_after {
            (tms_byte >> (8 - tms_clocks)) & 1
        } else {
            tms_byte >> 7
        };

        if bits >= 1 {
            let idx = buf.len() - 1;
            buf[idx] >>= 8 - bits;
            buf[idx] |= last_recv << bits;
        } else {
            buf.push(last_recv);
        }
        Ok(buf)
    }

    fn flush(&mut self) -> Result<(), CableError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.ft.send(&self.buffer).map_err(CableError::adapter)?;
        self.buffer.clear();
        Ok(())
    }
}
