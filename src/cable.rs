//! Implementations for different JTAG hardware adapters live here.  Hardware adapters implement
//! the `Cable` trait, which is the only thing the upper layers know about the physical wire.
use crate::error::CableError;

pub mod gpio;
#[cfg(feature = "ftdi")]
pub mod jtagkey;
#[cfg(feature = "ftdi")]
pub mod mpsse;
#[cfg(feature = "ftdi")]
pub mod usbblaster;

pub trait Cable {
    /// Clock out a series of TMS values to change the state of the JTAG chain.  Each element of
    /// `tms` is the level of TMS for one clock.  `tdi` is the level held on TDI meanwhile.
    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), CableError>;
    /// Shift in bits from the TDO line.  `bits` is the total number of bits to read.  Should be
    /// called with state = ShiftIR or ShiftDR, and will remain in that state.  Clocks out all
    /// ones on TDI.
    fn read_data(&mut self, bits: usize) -> Result<Vec<u8>, CableError>;
    /// Shift out bits on the TDI line.  `bits` is the number of bits to send from the last byte.
    /// Should be called with state = ShiftIR or ShiftDR.  State won't change unless `pause_after`
    /// is true, in which case it will be PauseIR or PauseDR on exit.
    fn write_data(&mut self, data: &[u8], bits: u8, pause_after: bool) -> Result<(), CableError>;
    /// Like `write_data`, but returns the bits captured on TDO while shifting.
    fn read_write_data(
        &mut self,
        data: &[u8],
        bits: u8,
        pause_after: bool,
    ) -> Result<Vec<u8>, CableError>;
    /// Push out anything the adapter has buffered.
    fn flush(&mut self) -> Result<(), CableError> {
        Ok(())
    }
}

impl<C: Cable + ?Sized> Cable for Box<C> {
    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), CableError> {
        (**self).change_mode(tms, tdi)
    }

    fn read_data(&mut self, bits: usize) -> Result<Vec<u8>, CableError> {
        (**self).read_data(bits)
    }

    fn write_data(&mut self, data: &[u8], bits: u8, pause_after: bool) -> Result<(), CableError> {
        (**self).write_data(data, bits, pause_after)
    }

    fn read_write_data(
        &mut self,
        data: &[u8],
        bits: u8,
        pause_after: bool,
    ) -> Result<Vec<u8>, CableError> {
        (**self).read_write_data(data, bits, pause_after)
    }

    fn flush(&mut self) -> Result<(), CableError> {
        (**self).flush()
    }
}

/// Number of bits in a buffer of `len` bytes whose final byte holds `last_bits` bits.
pub(crate) fn total_bits(len: usize, last_bits: u8) -> usize {
    match len {
        0 => 0,
        n => (n - 1) * 8 + last_bits as usize,
    }
}

/// Open a cable by name.  `clock` is the TCK frequency in hertz where the adapter supports it.
#[cfg(feature = "ftdi")]
pub fn new_from_string(name: &str, clock: u32) -> Result<Box<dyn Cable>, CableError> {
    match name {
        "usbblaster" => Ok(Box::new(usbblaster::UsbBlaster::new()?)),
        "jtagkey" => Ok(Box::new(jtagkey::JtagKey::new(clock, true)?)),
        _ => Err(CableError::UnknownCable(name.to_string())),
    }
}

/// Open a cable by name.  Without the `ftdi` feature no adapter can be opened by name.
#[cfg(not(feature = "ftdi"))]
pub fn new_from_string(name: &str, _clock: u32) -> Result<Box<dyn Cable>, CableError> {
    Err(CableError::UnknownCable(name.to_string()))
}
