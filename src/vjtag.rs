//! Walk the Altera SLD hub behind an FPGA's TAP and route DR traffic to one of its virtual nodes.
//!
//! The hub sits behind two FPGA instructions: `VIR` selects the virtual instruction register
//! (node address plus the node's own instruction) and `VDR` selects the data register of
//! whichever node was addressed last.  The hub describes itself and its nodes through 32-bit
//! info registers that can only be read four bits per DR scan.
//!
//! # Example
//! ```no_run
//! use jtag_debug::statemachine::JtagSM;
//! use jtag_debug::taps::Taps;
//! use jtag_debug::vjtag::{HubWalker, VirtualTap};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cable = jtag_debug::cable::new_from_string("usbblaster", 6_000_000)?;
//! let mut taps = Taps::new(JtagSM::new(cable)?);
//! let fpga = taps.add_tap("fpga", 10);
//!
//! let mut vtap = VirtualTap::open(&mut taps, &HubWalker::new(fpga))?;
//! let reply = vtap.read_write_vdr(36, &[0u8; 5])?;
//! # Ok(())
//! # }
//! ```
use crate::error::VjtagError;
use crate::statemachine::Register;
use crate::taps::{field, ScanChain, TapId};

/// FPGA instruction selecting the virtual instruction register.
pub const VIR: u32 = 0x0e;
/// FPGA instruction selecting the virtual data register.
pub const VDR: u32 = 0x0c;
/// Instruction sent to the selected node once it is addressed.
pub const DEBUG_OPCODE: u64 = 0x8;

pub const VJTAG_NODE_ID: u8 = 0x08;
pub const JTAG_TO_AVALON_NODE_ID: u8 = 0x84;
pub const SIGNAL_TAP_NODE_ID: u8 = 0x00;
pub const SERIAL_FLASH_LOADER_NODE_ID: u8 = 0x04;

/// Enough zeros to clear any VIR, whatever the hub's address and instruction widths.
const VIR_CLEAR_BITS: usize = 64;

/// Human readable name of an SLD node type.
pub fn node_type_name(node_id: u8) -> &'static str {
    match node_id {
        VJTAG_NODE_ID => "Virtual JTAG",
        JTAG_TO_AVALON_NODE_ID => "JTAG to avalon bridge",
        SIGNAL_TAP_NODE_ID => "Signal TAP",
        SERIAL_FLASH_LOADER_NODE_ID => "Serial Flash Loader",
        _ => "unknown",
    }
}

/// Width of the node address field of a hub with `node_count` nodes: the number of right
/// shifts that bring `node_count` to zero.
pub fn address_width(node_count: u32) -> u32 {
    u32::BITS - node_count.leading_zeros()
}

/// The hub IP configuration register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HubInfo {
    pub version: u8,
    pub node_count: u8,
    pub manufacturer: u16,
    /// Width of the VIR instruction field (`m`).
    pub m_width: u8,
}

impl From<u32> for HubInfo {
    fn from(reg: u32) -> Self {
        Self {
            version: ((reg >> 27) & 0x1f) as u8,
            node_count: ((reg >> 19) & 0xff) as u8,
            manufacturer: ((reg >> 8) & 0x7ff) as u16,
            m_width: (reg & 0xff) as u8,
        }
    }
}

/// One SLD node, from its `SLD_NODE_INFO` register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualNode {
    /// Enumeration order, starting at 0.  The node's hub address is `index + 1`.
    pub index: usize,
    pub node_id: u8,
    pub manufacturer: u16,
    pub version: u8,
    pub instance: u8,
}

impl VirtualNode {
    fn from_register(index: usize, reg: u32) -> Self {
        Self {
            index,
            node_id: ((reg >> 19) & 0xff) as u8,
            manufacturer: ((reg >> 8) & 0x7ff) as u16,
            version: ((reg >> 27) & 0x1f) as u8,
            instance: (reg & 0xff) as u8,
        }
    }

    pub fn type_name(&self) -> &'static str {
        node_type_name(self.node_id)
    }
}

/// Everything learned from one walk of the hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualHub {
    pub tap: TapId,
    pub info: HubInfo,
    pub nodes: Vec<VirtualNode>,
    /// Hub address of the selected node, 0 if no node matched.
    pub routing_address: u32,
    /// VIR value sent to select the node.
    pub selector: u64,
    /// Width of the VIR scan carrying `selector`.
    pub selector_bits: usize,
}

impl VirtualHub {
    pub fn node_by_id(&self, node_id: u8) -> Option<&VirtualNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

/// Configures and runs the hub enumeration.
#[derive(Clone, Debug)]
pub struct HubWalker {
    tap: TapId,
    target_node: u8,
    debug_opcode: u64,
}

impl HubWalker {
    pub fn new(tap: TapId) -> Self {
        Self {
            tap,
            target_node: VJTAG_NODE_ID,
            debug_opcode: DEBUG_OPCODE,
        }
    }

    /// Route to nodes of this type instead of the Virtual JTAG node.
    pub fn target_node(mut self, node_id: u8) -> Self {
        self.target_node = node_id;
        self
    }

    /// Instruction sent along with the node address.
    pub fn debug_opcode(mut self, opcode: u64) -> Self {
        self.debug_opcode = opcode;
        self
    }

    /// Enumerate the hub and select the target node.  On return the FPGA has `VDR` selected, so
    /// every DR scan of the TAP reaches the node.
    pub fn walk<C: ScanChain + ?Sized>(&self, chain: &mut C) -> Result<VirtualHub, VjtagError> {
        let irlen = chain.tap(self.tap).ok_or(VjtagError::NoTap)?.irlen;
        tracing::debug!("Initialising Altera Virtual JTAG TAP");

        chain.reset()?;
        chain.shift(self.tap, Register::Instruction, irlen, &field(VIR.into(), irlen))?;
        chain.shift(
            self.tap,
            Register::Data,
            VIR_CLEAR_BITS,
            &[0u8; VIR_CLEAR_BITS / 8],
        )?;
        chain.shift(self.tap, Register::Instruction, irlen, &field(VDR.into(), irlen))?;

        let info = HubInfo::from(self.read_info(chain)?);
        let addr_bits = address_width(info.node_count.into());
        tracing::debug!("SLD HUB Configuration register");
        tracing::debug!("------------------------------");
        tracing::debug!("m_width         = {}", info.m_width);
        tracing::debug!("manufacturer_id = {:#04x}", info.manufacturer);
        tracing::debug!("nb_of_node      = {}", info.node_count);
        tracing::debug!("version         = {}", info.version);
        tracing::debug!("VIR length      = {}", addr_bits + u32::from(info.m_width));

        // The node registers follow HUB_INFO in the same nibble stream.
        let mut nodes = Vec::with_capacity(info.node_count.into());
        let mut routing_address = 0;
        for index in 0..usize::from(info.node_count) {
            let node = VirtualNode::from_register(index, self.read_info(chain)?);
            tracing::debug!("Node info register");
            tracing::debug!("--------------------");
            tracing::debug!("instance_id     = {}", node.instance);
            tracing::debug!("manufacturer_id = {:#04x}", node.manufacturer);
            tracing::debug!("node_id         = {} ({})", node.node_id, node.type_name());
            tracing::debug!("version         = {}", node.version);

            if node.node_id == self.target_node {
                routing_address = index as u32 + 1;
            }
            nodes.push(node);
        }
        if routing_address == 0 {
            tracing::warn!(
                "No {} node on the hub, selecting address 0",
                node_type_name(self.target_node)
            );
        }

        let selector = u64::from(routing_address)
            .checked_shl(info.m_width.into())
            .unwrap_or(0)
            | self.debug_opcode;
        let selector_bits = (addr_bits + u32::from(info.m_width)) as usize;

        let hub = VirtualHub {
            tap: self.tap,
            info,
            nodes,
            routing_address,
            selector,
            selector_bits,
        };
        select_node(chain, &hub, irlen)?;
        Ok(hub)
    }

    /// Read one 32-bit info register as eight 4-bit DR captures.  Each nibble enters at the top,
    /// so the first nibble read ends up least significant.
    fn read_info<C: ScanChain + ?Sized>(&self, chain: &mut C) -> Result<u32, VjtagError> {
        let mut acc = 0u32;
        for _ in 0..8 {
            let nibble = chain.shift(self.tap, Register::Data, 4, &[0])?;
            let nibble = u32::from(nibble.first().copied().unwrap_or(0) & 0xf);
            acc = (acc >> 4) | (nibble << 28);
        }
        Ok(acc)
    }
}

/// IR <- VIR, DR <- selector, IR <- VDR.
fn select_node<C: ScanChain + ?Sized>(
    chain: &mut C,
    hub: &VirtualHub,
    irlen: usize,
) -> Result<(), VjtagError> {
    chain.shift(hub.tap, Register::Instruction, irlen, &field(VIR.into(), irlen))?;
    chain.shift(
        hub.tap,
        Register::Data,
        hub.selector_bits,
        &field(hub.selector, hub.selector_bits),
    )?;
    chain.shift(hub.tap, Register::Instruction, irlen, &field(VDR.into(), irlen))?;
    Ok(())
}

/// A walked hub bound to its chain.  DR scans go to the selected node.
pub struct VirtualTap<C> {
    chain: C,
    hub: VirtualHub,
}

impl<C: ScanChain> VirtualTap<C> {
    /// Walk the hub with `walker` and keep the chain for node traffic.
    pub fn open(mut chain: C, walker: &HubWalker) -> Result<Self, VjtagError> {
        let hub = walker.walk(&mut chain)?;
        Ok(Self { chain, hub })
    }

    pub fn hub(&self) -> &VirtualHub {
        &self.hub
    }

    pub fn write_vdr(&mut self, bits: usize, out: &[u8]) -> Result<(), VjtagError> {
        self.chain.shift(self.hub.tap, Register::Data, bits, out)?;
        Ok(())
    }

    pub fn read_write_vdr(&mut self, bits: usize, out: &[u8]) -> Result<Vec<u8>, VjtagError> {
        Ok(self.chain.shift(self.hub.tap, Register::Data, bits, out)?)
    }

    /// Select the node again, for instance after something else used the FPGA's IR.
    pub fn reselect(&mut self) -> Result<(), VjtagError> {
        let irlen = self
            .chain
            .tap(self.hub.tap)
            .ok_or(VjtagError::NoTap)?
            .irlen;
        select_node(&mut self.chain, &self.hub, irlen)
    }

    pub fn into_inner(self) -> C {
        self.chain
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::JtagError;
    use crate::taps::Tap;
    use test_case::test_case;

    /// An FPGA TAP with an SLD hub behind it.
    pub(crate) struct SldHub {
        taps: Vec<Tap>,
        registers: Vec<u32>,
        ir: u32,
        cursor: usize,
        /// (bits, value) of every DR scan made with VIR selected.
        pub vir_writes: Vec<(usize, u64)>,
        /// DR scans made with VDR selected, other than info reads.
        pub vdr_writes: Vec<(usize, Vec<u8>)>,
        pub ir_writes: Vec<u32>,
        pub resets: usize,
    }

    pub(crate) fn hub_register(version: u32, count_or_id: u32, manufacturer: u32, low: u32) -> u32 {
        (version << 27) | (count_or_id << 19) | (manufacturer << 8) | low
    }

    impl SldHub {
        pub(crate) fn new(m_width: u32, node_ids: &[u32]) -> Self {
            let mut registers = vec![hub_register(1, node_ids.len() as u32, 0x6e, m_width)];
            registers.extend(
                node_ids
                    .iter()
                    .enumerate()
                    .map(|(i, &id)| hub_register(1, id, 0x6e, i as u32)),
            );
            Self {
                taps: vec![Tap::new("fpga", 10)],
                registers,
                ir: 0,
                cursor: 0,
                vir_writes: Vec::new(),
                vdr_writes: Vec::new(),
                ir_writes: Vec::new(),
                resets: 0,
            }
        }

        fn next_nibble(&mut self) -> u8 {
            let reg = self.registers.get(self.cursor / 8).copied().unwrap_or(0);
            let nibble = (reg >> (4 * (self.cursor % 8))) & 0xf;
            self.cursor += 1;
            nibble as u8
        }
    }

    impl ScanChain for SldHub {
        fn tap_count(&self) -> usize {
            self.taps.len()
        }

        fn tap(&self, tap: TapId) -> Option<&Tap> {
            self.taps.get(tap)
        }

        fn reset(&mut self) -> Result<(), JtagError> {
            self.resets += 1;
            self.ir = 0;
            Ok(())
        }

        fn shift(
            &mut self,
            tap: TapId,
            register: Register,
            bits: usize,
            out: &[u8],
        ) -> Result<Vec<u8>, JtagError> {
            self.tap(tap).ok_or(JtagError::NoSuchTap(tap))?;
            let mut value = 0u64;
            for (i, b) in out.iter().take(8).enumerate() {
                value |= u64::from(*b) << (8 * i);
            }
            match register {
                Register::Instruction => {
                    self.ir = value as u32;
                    self.ir_writes.push(self.ir);
                    Ok(vec![0x55; bits.div_ceil(8)])
                }
                Register::Data if self.ir == VIR => {
                    // Writing the hub's own address restarts the info stream.
                    if value == 0 {
                        self.cursor = 0;
                    }
                    self.vir_writes.push((bits, value));
                    Ok(vec![0; bits.div_ceil(8)])
                }
                Register::Data if self.ir == VDR && bits == 4 && self.vir_writes.len() == 1 => {
                    Ok(vec![self.next_nibble()])
                }
                Register::Data => {
                    self.vdr_writes.push((bits, out.to_vec()));
                    Ok(out.to_vec())
                }
            }
        }

        fn idle(&mut self, _cycles: usize) -> Result<(), JtagError> {
            Ok(())
        }
    }

    #[test_case(0 => 0)]
    #[test_case(1 => 1)]
    #[test_case(2 => 2)]
    #[test_case(3 => 2)]
    #[test_case(4 => 3)]
    #[test_case(255 => 8)]
    fn address_width_counts_shifts(n: u32) -> u32 {
        address_width(n)
    }

    #[test]
    fn two_nodes_route_to_vjtag() {
        let mut hub = SldHub::new(3, &[0x08, 0x00]);
        let walked = HubWalker::new(0).walk(&mut hub).unwrap();

        assert_eq!(walked.info.node_count, 2);
        assert_eq!(walked.info.m_width, 3);
        assert_eq!(walked.info.manufacturer, 0x6e);
        assert_eq!(walked.nodes.len(), 2);
        assert_eq!(walked.nodes[0].type_name(), "Virtual JTAG");
        assert_eq!(walked.nodes[1].type_name(), "Signal TAP");
        assert_eq!(walked.routing_address, 1);
        assert_eq!(walked.selector, (1 << 3) | DEBUG_OPCODE);
        assert_eq!(walked.selector_bits, 2 + 3);

        assert_eq!(hub.resets, 1);
        assert_eq!(hub.ir_writes, vec![VIR, VDR, VIR, VDR]);
        assert_eq!(hub.vir_writes, vec![(64, 0), (5, 0x8)]);
    }

    #[test]
    fn walk_reads_node_fields() {
        let mut hub = SldHub::new(4, &[0x84, 0x04, 0x08]);
        let walked = HubWalker::new(0).walk(&mut hub).unwrap();

        assert_eq!(
            walked.nodes[2],
            VirtualNode {
                index: 2,
                node_id: 0x08,
                manufacturer: 0x6e,
                version: 1,
                instance: 2,
            }
        );
        assert_eq!(walked.routing_address, 3);
        assert_eq!(walked.selector, (3 << 4) | 0x8);
        assert_eq!(walked.node_by_id(0x84).map(|n| n.index), Some(0));
    }

    #[test]
    fn walking_twice_gives_the_same_route() {
        let mut hub = SldHub::new(4, &[0x00, 0x08]);
        let walker = HubWalker::new(0);
        let first = walker.walk(&mut hub).unwrap();
        hub.vir_writes.clear();
        let second = walker.walk(&mut hub).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_tap_fails_before_scanning() {
        let mut hub = SldHub::new(4, &[0x08]);
        let err = HubWalker::new(5).walk(&mut hub).unwrap_err();
        assert!(matches!(err, VjtagError::NoTap));
        assert_eq!(hub.resets, 0);
        assert!(hub.ir_writes.is_empty());
    }

    #[test]
    fn no_matching_node_routes_to_zero() {
        let mut hub = SldHub::new(4, &[0x00, 0x84]);
        let walked = HubWalker::new(0).walk(&mut hub).unwrap();
        assert_eq!(walked.routing_address, 0);
        assert_eq!(walked.selector, DEBUG_OPCODE);
    }

    #[test]
    fn custom_target_and_opcode() {
        let mut hub = SldHub::new(4, &[0x08, 0x84]);
        let walked = HubWalker::new(0)
            .target_node(JTAG_TO_AVALON_NODE_ID)
            .debug_opcode(0x2)
            .walk(&mut hub)
            .unwrap();
        assert_eq!(walked.routing_address, 2);
        assert_eq!(walked.selector, (2 << 4) | 0x2);
    }

    #[test]
    fn virtual_tap_routes_dr_traffic() {
        let mut hub = SldHub::new(4, &[0x08]);
        let mut vtap = VirtualTap::open(&mut hub, &HubWalker::new(0)).unwrap();
        assert_eq!(vtap.hub().routing_address, 1);

        let reply = vtap.read_write_vdr(12, &[0xab, 0x0c]).unwrap();
        assert_eq!(reply, vec![0xab, 0x0c]);
        vtap.reselect().unwrap();
        vtap.write_vdr(4, &[0x3]).unwrap();

        let hub = vtap.into_inner();
        assert_eq!(hub.vdr_writes, vec![(12, vec![0xab, 0x0c]), (4, vec![0x3])]);
        assert_eq!(hub.ir_writes, vec![VIR, VDR, VIR, VDR, VIR, VDR]);
    }
}
