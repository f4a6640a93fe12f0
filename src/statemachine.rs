//! This provides a higher-level interface than the `Cable` trait.  Specifically, it keeps track of
//! the state of the JTAG state machine, and allows setting the state to any desired state.
//! `JtagSM` will get to that state by the most efficient path, based on the current state.
use crate::cable::Cable;
use crate::error::CableError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Data,
    Instruction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JtagState {
    Reset = 0,
    Idle = 1,
    SelectDR = 2,
    CaptureDR = 3,
    ShiftDR = 4,
    Exit1DR = 5,
    PauseDR = 6,
    Exit2DR = 7,
    UpdateDR = 8,
    SelectIR = 9,
    CaptureIR = 10,
    ShiftIR = 11,
    Exit1IR = 12,
    PauseIR = 13,
    Exit2IR = 14,
    UpdateIR = 15,
}

impl JtagState {
    /// The state reached from `self` by one TCK with TMS low and with TMS high.
    fn edges(self) -> [JtagState; 2] {
        use JtagState::*;
        match self {
            Reset => [Idle, Reset],
            Idle => [Idle, SelectDR],
            SelectDR => [CaptureDR, SelectIR],
            CaptureDR => [ShiftDR, Exit1DR],
            ShiftDR => [ShiftDR, Exit1DR],
            Exit1DR => [PauseDR, UpdateDR],
            PauseDR => [PauseDR, Exit2DR],
            Exit2DR => [ShiftDR, UpdateDR],
            UpdateDR => [Idle, SelectDR],
            SelectIR => [CaptureIR, Reset],
            CaptureIR => [ShiftIR, Exit1IR],
            ShiftIR => [ShiftIR, Exit1IR],
            Exit1IR => [PauseIR, UpdateIR],
            PauseIR => [PauseIR, Exit2IR],
            Exit2IR => [ShiftIR, UpdateIR],
            UpdateIR => [Idle, SelectIR],
        }
    }
}

/// TMS sequence that reaches Test-Logic-Reset from any state and then parks in Run-Test/Idle.
const RESET_SEQUENCE: [bool; 6] = [true, true, true, true, true, false];

#[derive(Clone)]
struct Path {
    tms: Vec<bool>,
    state: JtagState,
}

pub struct JtagSM<T> {
    pub cable: T,
    state: JtagState,
}

impl<T, U> JtagSM<T>
where
    T: core::ops::DerefMut<Target = U>,
    U: Cable + ?Sized,
{
    /// Create a JTAG state machine using an existing `Cable`.  The chain is reset on creation.
    pub fn new(mut cable: T) -> Result<Self, CableError> {
        cable.change_mode(&RESET_SEQUENCE, true)?;

        Ok(Self {
            cable,
            state: JtagState::Idle,
        })
    }

    /// The state the TAP controllers are currently in.
    pub fn state(&self) -> JtagState {
        self.state
    }

    /// Reset the scan chain by driving TMS high for 5 clocks, then park in Run-Test/Idle
    pub fn mode_reset(&mut self) -> Result<(), CableError> {
        self.cable.change_mode(&RESET_SEQUENCE, true)?;
        self.state = JtagState::Idle;
        Ok(())
    }

    fn get_path(&self, state: JtagState) -> Vec<bool> {
        let mut paths = vec![Path {
            tms: Vec::new(),
            state: self.state,
        }];

        // Every state is reachable from every other in at most 7 clocks.
        loop {
            let mut newpaths = Vec::with_capacity(paths.len() * 2);

            for p in paths {
                for (tms, next) in [false, true].into_iter().zip(p.state.edges()) {
                    let mut np = p.clone();
                    np.tms.push(tms);
                    np.state = next;

                    if next == state {
                        return np.tms;
                    }
                    newpaths.push(np);
                }
            }

            paths = newpaths;
        }
    }

    /// Use TMS to get into `state` by the most efficient path
    pub fn change_mode(&mut self, state: JtagState) -> Result<(), CableError> {
        if self.state == state {
            return Ok(());
        }

        let path = self.get_path(state);
        tracing::trace!("TMS path {:?} -> {:?}: {:?}", self.state, state, path);
        self.cable.change_mode(&path, true)?;
        self.state = state;
        Ok(())
    }

    fn enter_shift(&mut self, reg: Register) -> Result<(), CableError> {
        match reg {
            Register::Data => self.change_mode(JtagState::ShiftDR),
            Register::Instruction => self.change_mode(JtagState::ShiftIR),
        }
    }

    fn after_shift(&mut self, reg: Register, pause_after: bool) {
        if pause_after {
            self.state = match reg {
                Register::Data => JtagState::PauseDR,
                Register::Instruction => JtagState::PauseIR,
            };
        }
    }

    /// Read `bits` from either the instruction or data register
    pub fn read_reg(&mut self, reg: Register, bits: usize) -> Result<Vec<u8>, CableError> {
        self.enter_shift(reg)?;
        self.cable.read_data(bits)
    }

    /// Write `data` into either the instruction or data register.  `bits` indicates how many bits
    /// of the last byte should be written (8 indicates that the entire byte should be written).
    /// The mode will either be ShiftIR / ShiftDR if `pause_after` is false, or PauseIR / PauseDR
    /// if `pause_after` is true.  This allows for setting the register with multiple calls to
    /// `write_reg`, which may be more convenient than manual bit-shifting.
    pub fn write_reg(
        &mut self,
        reg: Register,
        data: &[u8],
        bits: u8,
        pause_after: bool,
    ) -> Result<(), CableError> {
        self.enter_shift(reg)?;
        self.cable.write_data(data, bits, pause_after)?;
        self.after_shift(reg, pause_after);
        Ok(())
    }

    /// Similar to `write_reg` except it returns the bits that were shifted out during writing.
    pub fn read_write_reg(
        &mut self,
        reg: Register,
        data: &[u8],
        bits: u8,
        pause_after: bool,
    ) -> Result<Vec<u8>, CableError> {
        self.enter_shift(reg)?;
        let data = self.cable.read_write_data(data, bits, pause_after)?;
        self.after_shift(reg, pause_after);
        Ok(data)
    }

    /// Go to Run-Test/Idle and stay there for `cycles` clocks.
    pub fn run_test(&mut self, cycles: usize) -> Result<(), CableError> {
        self.change_mode(JtagState::Idle)?;
        if cycles > 0 {
            self.cable.change_mode(&vec![false; cycles], true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::testing::LoopbackCable;
    use pretty_assertions::assert_eq;

    fn machine() -> JtagSM<Box<LoopbackCable>> {
        JtagSM::new(Box::new(LoopbackCable::new())).unwrap()
    }

    #[test]
    fn new_parks_in_idle() {
        let sm = machine();
        assert_eq!(sm.state(), JtagState::Idle);
        assert_eq!(sm.cable.state, JtagState::Idle);
    }

    #[test]
    fn shortest_path_to_shift_dr() {
        let mut sm = machine();
        sm.cable.tms_log.clear();
        sm.change_mode(JtagState::ShiftDR).unwrap();
        assert_eq!(sm.cable.tms_log, vec![true, false, false]);
        assert_eq!(sm.cable.state, JtagState::ShiftDR);
    }

    #[test]
    fn shortest_path_to_shift_ir() {
        let mut sm = machine();
        sm.cable.tms_log.clear();
        sm.change_mode(JtagState::ShiftIR).unwrap();
        assert_eq!(sm.cable.tms_log, vec![true, true, false, false]);
    }

    #[test]
    fn every_state_is_reachable() {
        use JtagState::*;
        let mut sm = machine();
        for target in [
            Reset, Idle, SelectDR, CaptureDR, ShiftDR, Exit1DR, PauseDR, Exit2DR, UpdateDR,
            SelectIR, CaptureIR, ShiftIR, Exit1IR, PauseIR, Exit2IR, UpdateIR,
        ] {
            sm.change_mode(target).unwrap();
            assert_eq!(sm.cable.state, target);
        }
    }

    #[test]
    fn write_then_read_data_register() {
        let mut sm = machine();
        sm.write_reg(Register::Data, &[0xa5], 8, true).unwrap();
        assert_eq!(sm.state(), JtagState::PauseDR);
        assert_eq!(sm.cable.state, JtagState::PauseDR);
        let back = sm.read_reg(Register::Data, 8).unwrap();
        assert_eq!(back, vec![0xa5]);
    }

    #[test]
    fn run_test_clocks_in_idle() {
        let mut sm = machine();
        sm.change_mode(JtagState::PauseDR).unwrap();
        sm.run_test(5).unwrap();
        assert_eq!(sm.cable.state, JtagState::Idle);
        assert_eq!(sm.cable.idle_clocks, 5);
    }
}
