//! Implement the `Cable` trait by bit-banging four GPIO pins through `embedded-hal`.
use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin, PinState},
};

use crate::cable::{total_bits, Cable};
use crate::error::CableError;

pub struct Gpio<Clk, Tdi, Tdo, Tms, Delay>
where
    Clk: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    Tms: OutputPin,
    Delay: DelayNs,
{
    half_period: u32,
    delay: Delay,
    clock: Clk,
    tdi: Tdi,
    tdo: Tdo,
    tms: Tms,
}

impl<Clk, Tdi, Tdo, Tms, Delay> Gpio<Clk, Tdi, Tdo, Tms, Delay>
where
    Clk: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    Tms: OutputPin,
    Delay: DelayNs,
{
    pub fn new(freq_khz: u32, clock: Clk, tdi: Tdi, tdo: Tdo, tms: Tms, delay: Delay) -> Self {
        let period_ns = 1_000_000 / freq_khz.max(1);
        let half_period = period_ns / 2;
        Gpio {
            half_period,
            clock,
            tdi,
            tdo,
            tms,
            delay,
        }
    }

    /// One full TCK period.  TDO is sampled on the rising edge.
    fn pulse(&mut self) -> Result<bool, CableError> {
        self.clock.set_high().map_err(|_| CableError::Pin)?;
        let tdo = self.tdo.is_high().map_err(|_| CableError::Pin)?;
        self.delay.delay_ns(self.half_period);
        self.clock.set_low().map_err(|_| CableError::Pin)?;
        self.delay.delay_ns(self.half_period);
        Ok(tdo)
    }

    fn set_tms(&mut self, high: bool) -> Result<(), CableError> {
        self.tms
            .set_state(PinState::from(high))
            .map_err(|_| CableError::Pin)
    }
}

impl<Clk, Tdi, Tdo, Tms, Delay> Cable for Gpio<Clk, Tdi, Tdo, Tms, Delay>
where
    Clk: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    Tms: OutputPin,
    Delay: DelayNs,
{
    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), CableError> {
        // clock starts low
        self.tdi
            .set_state(PinState::from(tdi))
            .map_err(|_| CableError::Pin)?;

        for &level in tms {
            self.set_tms(level)?;
            self.pulse()?;
        }
        Ok(())
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
        // Constrain `bits` to be between 1 and 8
        let bits = bits.clamp(1, 8);
        let total = total_bits(data.len(), bits);
        let mut out_buffer = vec![0u8; data.len()];

        self.set_tms(false)?;
        for i in 0..total {
            // Bits go out LSB first, same as every other cable
            let tdi = data[i / 8] & (1 << (i % 8)) != 0;
            self.tdi
                .set_state(PinState::from(tdi))
                .map_err(|_| CableError::Pin)?;

            if i == total - 1 && pause_after {
                // Last bit leaves Shift-xR for Exit1-xR
                self.set_tms(true)?;
            }

            if self.pulse()? {
                out_buffer[i / 8] |= 1 << (i % 8);
            }
        }

        if pause_after && total > 0 {
            // Exit1-xR -> Pause-xR
            self.set_tms(false)?;
            self.pulse()?;
        }
        Ok(out_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    /// TDI wired straight back to TDO through a one-bit latch updated on each rising edge.
    #[derive(Default)]
    struct Wire {
        tdi: bool,
        tms: bool,
        latched: bool,
        tms_edges: Vec<bool>,
    }

    #[derive(Clone)]
    struct Pin(Rc<RefCell<Wire>>, u8);

    impl ErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.set(true);
            Ok(())
        }
    }

    impl InputPin for Pin {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(self.0.borrow().latched)
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(!self.0.borrow().latched)
        }
    }

    impl Pin {
        fn set(&self, level: bool) {
            let mut wire = self.0.borrow_mut();
            match self.1 {
                0 if level => {
                    wire.latched = wire.tdi;
                    let tms = wire.tms;
                    wire.tms_edges.push(tms);
                }
                0 => {}
                1 => wire.tdi = level,
                _ => wire.tms = level,
            }
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    #[test]
    fn shifts_lsb_first_and_pauses() {
        let wire = Rc::new(RefCell::new(Wire::default()));
        let mut gpio = Gpio::new(
            1000,
            Pin(wire.clone(), 0),
            Pin(wire.clone(), 1),
            Pin(wire.clone(), 3),
            Pin(wire.clone(), 2),
            NoDelay,
        );

        let out = gpio.read_write_data(&[0b1011_0001, 0b101], 3, true).unwrap();
        assert_eq!(out, vec![0b1011_0001, 0b101]);

        // 11 shift clocks, the last with TMS high, then one more clock into Pause
        let edges = wire.borrow().tms_edges.clone();
        assert_eq!(edges.len(), 12);
        assert_eq!(&edges[9..], &[false, true, false]);
    }

    #[test]
    fn change_mode_clocks_each_tms_level() {
        let wire = Rc::new(RefCell::new(Wire::default()));
        let mut gpio = Gpio::new(
            1000,
            Pin(wire.clone(), 0),
            Pin(wire.clone(), 1),
            Pin(wire.clone(), 3),
            Pin(wire.clone(), 2),
            NoDelay,
        );
        gpio.change_mode(&[true, true, false], true).unwrap();
        assert_eq!(wire.borrow().tms_edges, vec![true, true, false]);
    }
}
