//! A convenience wrapper for JTAG scan chains with multiple TAPs present.  `Taps` allows the
//! client to interact with one selected TAP as if it were the only TAP in the chain, so that the
//! client doesn't have to deal with putting the other TAPs into bypass and shifting data through
//! the bypass registers.
//!
//! TAP positions follow the usual convention: position 0 is the TAP closest to TDI, so its bits
//! are the last ones shifted into the chain.
use bitvec::prelude::*;

use crate::cable::Cable;
use crate::error::JtagError;
use crate::statemachine::{JtagSM, JtagState, Register};

/// Position of a TAP on the scan chain.
pub type TapId = usize;

/// One Test Access Port on the scan chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tap {
    pub name: String,
    pub irlen: usize,
    pub enabled: bool,
    pub expected_id: Option<u32>,
}

impl Tap {
    pub fn new(name: impl Into<String>, irlen: usize) -> Self {
        Self {
            name: name.into(),
            irlen,
            enabled: true,
            expected_id: None,
        }
    }
}

/// The scan primitive everything above the chain is built on.
///
/// `shift` is synchronous: it returns once the bits have been clocked through the chain.
pub trait ScanChain {
    fn tap_count(&self) -> usize;

    fn tap(&self, tap: TapId) -> Option<&Tap>;

    fn tap_by_name(&self, name: &str) -> Option<TapId> {
        (0..self.tap_count()).find(|&id| self.tap(id).is_some_and(|t| t.name == name))
    }

    /// Put every TAP into Test-Logic-Reset, then park in Run-Test/Idle.
    fn reset(&mut self) -> Result<(), JtagError>;

    /// Shift the low `bits` bits of `out` into the IR or DR of `tap`, with every other TAP in
    /// BYPASS, and return the `bits` bits captured from `tap`.  The chain ends in Run-Test/Idle.
    fn shift(
        &mut self,
        tap: TapId,
        register: Register,
        bits: usize,
        out: &[u8],
    ) -> Result<Vec<u8>, JtagError>;

    /// Clock `cycles` TCKs in Run-Test/Idle.
    fn idle(&mut self, cycles: usize) -> Result<(), JtagError>;
}

impl<S: ScanChain + ?Sized> ScanChain for &mut S {
    fn tap_count(&self) -> usize {
        (**self).tap_count()
    }

    fn tap(&self, tap: TapId) -> Option<&Tap> {
        (**self).tap(tap)
    }

    fn reset(&mut self) -> Result<(), JtagError> {
        (**self).reset()
    }

    fn shift(
        &mut self,
        tap: TapId,
        register: Register,
        bits: usize,
        out: &[u8],
    ) -> Result<Vec<u8>, JtagError> {
        (**self).shift(tap, register, bits, out)
    }

    fn idle(&mut self, cycles: usize) -> Result<(), JtagError> {
        (**self).idle(cycles)
    }
}

/// Pack the low `bits` bits of `value` into a scan buffer, zero-padded past 64 bits.
pub fn field(value: u64, bits: usize) -> Vec<u8> {
    let mut buf = vec![0u8; bits.div_ceil(8)];
    for (i, byte) in buf.iter_mut().enumerate().take(8) {
        *byte = (value >> (8 * i)) as u8;
    }
    if bits % 8 != 0 && bits <= 64 {
        if let Some(last) = buf.last_mut() {
            *last &= (1u8 << (bits % 8)) - 1;
        }
    }
    buf
}

/// Check `out` can hold `bits` bits.
pub(crate) fn check_buffer(bits: usize, out: &[u8]) -> Result<(), JtagError> {
    let needed = bits.div_ceil(8);
    if out.len() < needed {
        return Err(JtagError::BufferTooShort {
            bits,
            needed,
            got: out.len(),
        });
    }
    Ok(())
}

/// Pack a bit slice into bytes, LSB first, returning the byte buffer and the number of valid
/// bits in the final byte.
fn to_cable_bytes(bits: &BitSlice<u8>) -> (Vec<u8>, u8) {
    let mut bytes = bits.to_bitvec();
    bytes.set_uninitialized(false);
    let last = match bits.len() % 8 {
        0 => 8,
        n => n as u8,
    };
    (bytes.into_vec(), last)
}

pub struct Taps<T> {
    pub sm: JtagSM<T>,
    taps: Vec<Tap>,
}

impl<T, U> Taps<T>
where
    T: core::ops::DerefMut<Target = U>,
    U: Cable + ?Sized,
{
    /// Create an object using an existing `JtagSM` object
    pub fn new(sm: JtagSM<T>) -> Self {
        Self {
            sm,
            taps: Vec::new(),
        }
    }

    /// Add a TAP to the scan chain with the given instruction register length.  TAPs are added
    /// starting from the one nearest TDI.
    pub fn add_tap(&mut self, name: impl Into<String>, irlen: usize) -> TapId {
        self.taps.push(Tap::new(name, irlen));
        self.taps.len() - 1
    }

    /// Add a fully described TAP.
    pub fn push_tap(&mut self, tap: Tap) -> TapId {
        self.taps.push(tap);
        self.taps.len() - 1
    }

    pub fn taps(&self) -> &[Tap] {
        &self.taps
    }

    /// Enable or disable a TAP.  Disabled TAPs stay on the chain but refuse scans.
    pub fn set_enabled(&mut self, tap: TapId, enabled: bool) -> Result<(), JtagError> {
        let tap = self.taps.get_mut(tap).ok_or(JtagError::NoSuchTap(tap))?;
        tap.enabled = enabled;
        Ok(())
    }

    /// Attempt to autodetect the number of TAPs on the scan chain and the instruction register
    /// length for each.  Returns the IDCODE of each TAP found, `None` for TAPs that come up in
    /// BYPASS.  Any previously configured TAPs are replaced, with a warning for each whose
    /// expected IDCODE was not found at its position.
    pub fn detect(&mut self, max_taps: usize) -> Result<Vec<Option<u32>>, JtagError> {
        // After reset every TAP has IDCODE or BYPASS selected.  Shift ones through and stop at
        // the first all-ones word, which is our own ones coming out the other end.
        self.sm.mode_reset()?;
        let dr_bits = 32 * (max_taps + 1);
        let dr = self.sm.read_reg(Register::Data, dr_bits)?;
        let mut ids = extract_idcodes(&dr.view_bits::<Lsb0>()[..dr_bits])?;

        // The IR capture of each TAP starts with `01`.  Shift the capture out once followed by
        // ones and once followed by zeros: where the two scans part is the end of the chain.
        let ir_bits = 32 * (max_taps + 1);
        self.sm.mode_reset()?;
        let ir_ones = self.sm.read_reg(Register::Instruction, ir_bits)?;
        self.sm.mode_reset()?;
        let zeros = vec![0u8; ir_bits.div_ceil(8)];
        let ir_zeros = self.sm.read_write_reg(Register::Instruction, &zeros, 8, true)?;
        self.sm.mode_reset()?;

        let ir_ones = &ir_ones.view_bits::<Lsb0>()[..ir_bits];
        let ir_zeros = &ir_zeros.view_bits::<Lsb0>()[..ir_bits];
        let common = ir_ones
            .iter()
            .zip(ir_zeros.iter())
            .take_while(|(a, b)| **a == **b)
            .count();
        let irlens = extract_ir_lengths(&ir_ones[..common], ids.len())?;

        // Both scans list the TAP nearest TDO first.
        ids.reverse();
        let mut irlens = irlens;
        irlens.reverse();

        let configured = std::mem::take(&mut self.taps);
        unexpected_idcodes(&configured, &ids);
        for (i, (id, irlen)) in ids.iter().zip(irlens).enumerate() {
            match id {
                Some(id) => tracing::info!("Adding tap {} idcode {:#010x} irlen {}", i, id, irlen),
                None => tracing::info!("Adding tap {} in bypass, irlen {}", i, irlen),
            }
            self.push_tap(Tap {
                name: format!("tap{i}"),
                irlen,
                enabled: true,
                expected_id: *id,
            });
        }
        Ok(ids)
    }

    fn checked_tap(&self, tap: TapId) -> Result<&Tap, JtagError> {
        let t = self.taps.get(tap).ok_or(JtagError::NoSuchTap(tap))?;
        if !t.enabled {
            return Err(JtagError::TapDisabled(t.name.clone()));
        }
        Ok(t)
    }

    /// Lay out one scan of the whole chain.  Returns the bit stream and the offset of the
    /// selected TAP's field in it.
    fn chain_stream(
        &self,
        active: TapId,
        register: Register,
        bits: usize,
        out: &[u8],
    ) -> (BitVec<u8>, usize) {
        let mut stream = BitVec::<u8>::new();
        let mut offset = 0;
        // Farthest from TDI goes first.
        for (i, t) in self.taps.iter().enumerate().rev() {
            if i == active {
                offset = stream.len();
                stream.extend_from_bitslice(&out.view_bits::<Lsb0>()[..bits]);
            } else {
                let len = match register {
                    Register::Instruction => t.irlen,
                    Register::Data => 1,
                };
                // All ones is BYPASS in every IR.
                stream.resize(stream.len() + len, true);
            }
        }
        (stream, offset)
    }
}

impl<T, U> ScanChain for Taps<T>
where
    T: core::ops::DerefMut<Target = U>,
    U: Cable + ?Sized,
{
    fn tap_count(&self) -> usize {
        self.taps.len()
    }

    fn tap(&self, tap: TapId) -> Option<&Tap> {
        self.taps.get(tap)
    }

    fn reset(&mut self) -> Result<(), JtagError> {
        self.sm.mode_reset()?;
        Ok(())
    }

    fn shift(
        &mut self,
        tap: TapId,
        register: Register,
        bits: usize,
        out: &[u8],
    ) -> Result<Vec<u8>, JtagError> {
        self.checked_tap(tap)?;
        check_buffer(bits, out)?;

        let (stream, offset) = self.chain_stream(tap, register, bits, out);
        if stream.is_empty() {
            return Ok(Vec::new());
        }
        let (bytes, last) = to_cable_bytes(&stream);
        let captured = self.sm.read_write_reg(register, &bytes, last, true)?;
        self.sm.change_mode(JtagState::Idle)?;

        let captured = &captured.view_bits::<Lsb0>()[offset..offset + bits];
        Ok(to_cable_bytes(captured).0)
    }

    fn idle(&mut self, cycles: usize) -> Result<(), JtagError> {
        self.sm.run_test(cycles)?;
        Ok(())
    }
}

/// Extract IDCODEs from a DR capture taken right after reset, TDO side first.
///
/// A TAP holding IDCODE shifts out 32 bits starting with a one; a TAP in BYPASS shifts out a
/// single zero.  The scan ends at the first run of 32 ones, which can only be the filler we
/// shifted in.
fn extract_idcodes(mut dr: &BitSlice<u8>) -> Result<Vec<Option<u32>>, JtagError> {
    let mut idcodes = Vec::new();

    while !dr.is_empty() {
        if dr[0] {
            if dr.len() < 32 {
                tracing::error!("Truncated IDCODE: {dr:?}");
                return Err(JtagError::TruncatedIdCode);
            }
            let idcode = dr[0..32].load_le::<u32>();
            if idcode == u32::MAX {
                break;
            }
            // Manufacturer 0x7f is reserved; the lowest bit is always set
            if (idcode >> 1) & 0x7ff == 0x7f {
                tracing::error!("Invalid IDCODE: {idcode:#010x}");
                return Err(JtagError::InvalidIdCode(idcode));
            }
            tracing::info!("Found IDCODE: {idcode:#010x}");
            idcodes.push(Some(idcode));
            dr = &dr[32..];
        } else {
            tracing::info!("Found bypass TAP");
            idcodes.push(None);
            dr = &dr[1..];
        }
    }
    Ok(idcodes)
}

/// Split the IR capture of `n_taps` TAPs into lengths, TDO side first.  `ir` holds exactly the
/// captured bits of the whole chain.
///
/// Every IR captures `..01` (a one in the first bit shifted out, then a zero), but `10` can also
/// appear inside a capture, so this only succeeds when the split is unambiguous.
fn extract_ir_lengths(ir: &BitSlice<u8>, n_taps: usize) -> Result<Vec<usize>, JtagError> {
    let total = ir.len();

    let starts = ir
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] && !w[1])
        .map(|(i, _)| i)
        .collect::<Vec<usize>>();
    tracing::trace!("Possible IR start positions: {starts:?}");

    if n_taps == 0 || starts.first() != Some(&0) {
        tracing::error!("IR chain does not begin with a valid start pattern");
        return Err(JtagError::InvalidIr);
    }
    if n_taps == 1 {
        return Ok(vec![ir.len()]);
    }
    if starts.len() != n_taps {
        tracing::error!("IR lengths are ambiguous and must be configured explicitly");
        return Err(JtagError::InvalidIr);
    }

    let mut lens: Vec<usize> = starts.windows(2).map(|w| w[1] - w[0]).collect();
    lens.push(total - starts[starts.len() - 1]);
    Ok(lens)
}

/// Compare the IDCODEs found on the chain, TDI side first, with what the configured TAPs
/// expect.  Returns the positions that disagree.
fn unexpected_idcodes(configured: &[Tap], found: &[Option<u32>]) -> Vec<usize> {
    if !configured.is_empty() && configured.len() != found.len() {
        tracing::warn!(
            "{} TAPs configured, {} found on the chain",
            configured.len(),
            found.len()
        );
    }
    configured
        .iter()
        .zip(found)
        .enumerate()
        .filter_map(|(i, (tap, found))| {
            let expected = tap.expected_id?;
            match found {
                Some(id) if *id == expected => return None,
                Some(id) => tracing::warn!(
                    "TAP {}: expected IDCODE {:#010x}, found {:#010x}",
                    tap.name,
                    expected,
                    id
                ),
                None => tracing::warn!(
                    "TAP {}: expected IDCODE {:#010x}, found a TAP in BYPASS",
                    tap.name,
                    expected
                ),
            }
            Some(i)
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cable::testing::LoopbackCable;
    use pretty_assertions::assert_eq;

    /// A chain whose only TAP is the loopback cable, described as having the given IR length.
    pub(crate) fn loopback_chain() -> Taps<Box<LoopbackCable>> {
        let sm = JtagSM::new(Box::new(LoopbackCable::new())).unwrap();
        let mut taps = Taps::new(sm);
        taps.add_tap("loop", 4);
        taps
    }

    #[test]
    fn shift_ir_captures_01_pattern() {
        let mut taps = loopback_chain();
        let captured = taps.shift(0, Register::Instruction, 4, &[0x0e]).unwrap();
        assert_eq!(captured, vec![0b0001]);
        assert_eq!(taps.sm.cable.instruction, vec![false, true, true, true]);
        assert_eq!(taps.sm.state(), JtagState::Idle);
    }

    #[test]
    fn shift_dr_round_trips_through_loopback() {
        let mut taps = loopback_chain();
        taps.shift(0, Register::Data, 8, &[0x3c]).unwrap();
        let captured = taps.shift(0, Register::Data, 8, &[0x00]).unwrap();
        assert_eq!(captured, vec![0x3c]);
    }

    #[test]
    fn disabled_tap_refuses_scans() {
        let mut taps = loopback_chain();
        taps.set_enabled(0, false).unwrap();
        let err = taps.shift(0, Register::Data, 8, &[0]).unwrap_err();
        assert!(matches!(err, JtagError::TapDisabled(name) if name == "loop"));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut taps = loopback_chain();
        let err = taps.shift(0, Register::Data, 12, &[0]).unwrap_err();
        assert!(matches!(
            err,
            JtagError::BufferTooShort {
                bits: 12,
                needed: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn unknown_tap_is_rejected() {
        let mut taps = loopback_chain();
        assert!(matches!(
            taps.shift(3, Register::Data, 1, &[0]),
            Err(JtagError::NoSuchTap(3))
        ));
    }

    #[test]
    fn tap_lookup_by_name() {
        let mut taps = loopback_chain();
        taps.add_tap("fpga", 10);
        assert_eq!(taps.tap_by_name("fpga"), Some(1));
        assert_eq!(taps.tap_by_name("cpu"), None);
    }

    #[test]
    fn bypass_padding_places_active_field() {
        let mut taps = loopback_chain();
        taps.add_tap("fpga", 10);
        taps.add_tap("cpu", 4);

        // Active TAP 1: TAP 2 (4 bits) goes first, then ours, then TAP 0 (4 bits).
        let (stream, offset) = taps.chain_stream(1, Register::Instruction, 10, &[0xff, 0x00]);
        assert_eq!(offset, 4);
        assert_eq!(stream.len(), 18);
        assert!(stream[..12].all());
        assert!(stream[12..14].not_any());
        assert!(stream[14..].all());

        let (stream, offset) = taps.chain_stream(1, Register::Data, 3, &[0b010]);
        assert_eq!(offset, 1);
        assert_eq!(stream.len(), 5);
    }

    #[test]
    fn idcodes_with_bypass() {
        let mut dr = bitvec![u8, Lsb0; 1; 32 * 3 + 1];
        dr[0..32].store_le(0x4ba0_0477u32);
        dr.set(32, false);
        dr[33..65].store_le(0x0643_3041u32);
        let ids = extract_idcodes(&dr).unwrap();
        assert_eq!(ids, vec![Some(0x4ba0_0477), None, Some(0x0643_3041)]);
    }

    #[test]
    fn idcode_mismatch_is_reported_by_position() {
        let mut fpga = Tap::new("fpga", 10);
        fpga.expected_id = Some(0x0202_90dd);
        let mut cpu = Tap::new("cpu", 4);
        cpu.expected_id = Some(0x4ba0_0477);
        let mut spare = Tap::new("spare", 5);
        spare.expected_id = Some(0x0643_3041);
        let configured = [fpga, Tap::new("free", 8), cpu, spare];

        let found = [Some(0x0202_90dd), Some(0x1234_5677), Some(0x5ba0_0477), None];
        assert_eq!(unexpected_idcodes(&configured, &found), vec![2, 3]);
        assert!(unexpected_idcodes(&configured[..2], &found[..2]).is_empty());
        assert!(unexpected_idcodes(&[], &found).is_empty());
    }

    #[test]
    fn ir_lengths_two_taps() {
        let ir = bitvec![u8, Lsb0; 1,0,0,0, 1,0,0,0,0];
        assert_eq!(extract_ir_lengths(&ir, 2).unwrap(), vec![4, 5]);
    }

    #[test]
    fn ir_lengths_single_tap() {
        let ir = bitvec![u8, Lsb0; 1,0,1,0,0,0];
        assert_eq!(extract_ir_lengths(&ir, 1).unwrap(), vec![6]);
    }

    #[test]
    fn ir_lengths_ambiguous() {
        let ir = bitvec![u8, Lsb0; 1,0,1,0, 1,0,0,0];
        assert!(matches!(extract_ir_lengths(&ir, 2), Err(JtagError::InvalidIr)));
    }
}
