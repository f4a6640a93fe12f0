//! Implement the `Cable` trait for "jtagkey" compatible hardware adapters like the Bus Blaster
use std::time::Duration;

use libftd2xx::{Ft2232h, Ftdi, FtdiCommon, FtdiMpsse, MpsseCmdBuilder, MpsseCmdExecutor};

use crate::cable::mpsse::Mpsse;
use crate::cable::Cable;
use crate::error::CableError;

// Lower pins
const PIN_TCK: u8 = 1;
const PIN_TDI: u8 = 1 << 1;
const PIN_TMS: u8 = 1 << 3;
const PIN_N_OE: u8 = 1 << 4;
const LOWER_OUTPUT_PINS: u8 = PIN_TCK | PIN_TDI | PIN_TMS | PIN_N_OE;

// Upper pins
const PIN_N_TRST: u8 = 1;
const PIN_N_SRST: u8 = 1 << 1;
const PIN_N_TRST_OE: u8 = 1 << 2;
const PIN_N_SRST_OE: u8 = 1 << 3;
const UPPER_OUTPUT_PINS: u8 = PIN_N_TRST | PIN_N_SRST | PIN_N_TRST_OE | PIN_N_SRST_OE;

pub struct JtagKey {
    ft: Mpsse<Ft2232h>,
}

impl JtagKey {
    /// Create a new JtagKey.  FT2232-based adapters like JtagKey have both an "A" interface and a
    /// "B" interface.  `primary` controls which to use. `clock` controls the speed of TCLK in hertz.
    pub fn new(clock: u32, primary: bool) -> Result<Self, CableError> {
        let description = if primary {
            "Dual RS232-HS A"
        } else {
            "Dual RS232-HS B"
        };
        let ft = Ftdi::with_description(description).map_err(CableError::adapter)?;
        let ft = Ft2232h::try_from(ft).map_err(CableError::adapter)?;
        let mut ft = Mpsse::new(ft, clock)?;
        ft.ft
            .set_latency_timer(Duration::from_millis(0))
            .map_err(CableError::adapter)?;
        ft.ft
            .set_gpio_upper(PIN_N_TRST | PIN_N_SRST, UPPER_OUTPUT_PINS)
            .map_err(CableError::adapter)?;

        let builder = MpsseCmdBuilder::new().set_gpio_lower(PIN_TMS, LOWER_OUTPUT_PINS);
        ft.ft.send(builder.as_slice()).map_err(CableError::adapter)?;

        Ok(JtagKey { ft })
    }

    /// Put the system in reset through the SRST signal.
    pub fn assert_srst(&mut self) -> Result<(), CableError> {
        self.ft.flush()?;
        self.ft
            .ft
            .set_gpio_upper(PIN_N_TRST, UPPER_OUTPUT_PINS)
            .map_err(CableError::adapter)
    }

    /// Take the system out of reset through the SRST signal.
    pub fn deassert_srst(&mut self) -> Result<(), CableError> {
        self.ft.flush()?;
        self.ft
            .ft
            .set_gpio_upper(PIN_N_TRST | PIN_N_SRST, UPPER_OUTPUT_PINS)
            .map_err(CableError::adapter)
    }
}

impl Cable for JtagKey {
    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), CableError> {
        self.ft.change_mode(tms, tdi)
    }

    fn read_data(&mut self, bits: usize) -> Result<Vec<u8>, CableError> {
        self.ft.read_data(bits)
    }

    fn write_data(&mut self, data: &[u8], bits: u8, pause_after: bool) -> Result<(), CableError> {
        self.ft.write_data(data, bits, pause_after)
    }

    fn read_write_data(
        &mut self,
        data: &[u8],
        bits: u8,
        pause_after: bool,
    ) -> Result<Vec<u8>, CableError> {
        self.ft.read_write_data(data, bits, pause_after)
    }

    fn flush(&mut self) -> Result<(), CableError> {
        self.ft.flush()
    }
}
