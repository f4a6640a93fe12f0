//! ARM Debug Access Ports.
//!
//! A [`DapRegistry`] owns every DAP created for the session, in creation order.  Each [`Dap`] is
//! bound to one TAP of the scan chain for its whole life, carries 256 [`AccessPort`] slots and a
//! [`Journal`] of pending transactions.  The transactions themselves are carried by a transport
//! implementing [`DapOps`]: [`JtagDp`] over the scan chain or [`SwdDp`] over an SWD wire.
use serde::{Deserialize, Serialize};

use crate::error::{DapError, JtagError};
use crate::taps::{ScanChain, TapId};

mod ap;
pub mod journal;
pub mod jtag_dp;
pub mod swd;

pub use ap::{AccessPort, DEFAULT_MEMACCESS_TCK, DEFAULT_TAR_AUTOINCR_BLOCK};
pub use journal::{DapCommand, DeferredRead, DeferredResults, DpInstruction, Journal};
pub use jtag_dp::JtagDp;
pub use swd::{Port, SwdDp, SwdWire};

// DP registers
pub const DP_DPIDR: u8 = 0x0;
pub const DP_ABORT: u8 = 0x0;
pub const DP_CTRL_STAT: u8 = 0x4;
pub const DP_SELECT: u8 = 0x8;
pub const DP_RDBUFF: u8 = 0xc;

// CTRL/STAT bits
pub const CSYSPWRUPACK: u32 = 1 << 31;
pub const CSYSPWRUPREQ: u32 = 1 << 30;
pub const CDBGPWRUPACK: u32 = 1 << 29;
pub const CDBGPWRUPREQ: u32 = 1 << 28;
pub const CDBGRSTACK: u32 = 1 << 27;
pub const CDBGRSTREQ: u32 = 1 << 26;
pub const WDATAERR: u32 = 1 << 7;
pub const READOK: u32 = 1 << 6;
pub const STICKYERR: u32 = 1 << 5;
pub const STICKYCMP: u32 = 1 << 4;
pub const STICKYORUN: u32 = 1 << 1;
pub const ORUNDETECT: u32 = 1 << 0;

// ABORT bits
pub const DAPABORT: u32 = 1 << 0;
pub const STKCMPCLR: u32 = 1 << 1;
pub const STKERRCLR: u32 = 1 << 2;
pub const WDERRCLR: u32 = 1 << 3;
pub const ORUNERRCLR: u32 = 1 << 4;

// MEM-AP registers
pub const MEM_AP_CSW: u8 = 0x00;
pub const MEM_AP_TAR: u8 = 0x04;
pub const MEM_AP_DRW: u8 = 0x0c;
pub const MEM_AP_BD0: u8 = 0x10;
pub const MEM_AP_BD1: u8 = 0x14;
pub const MEM_AP_BD2: u8 = 0x18;
pub const MEM_AP_BD3: u8 = 0x1c;
pub const MEM_AP_CFG: u8 = 0xf4;
pub const MEM_AP_BASE: u8 = 0xf8;
pub const MEM_AP_IDR: u8 = 0xfc;

/// Number of Access Port slots in every DAP.
pub const AP_COUNT: usize = 256;

/// Attempts at bringing up the DP before giving up.
const DP_INIT_ATTEMPTS: usize = 10;
/// CTRL/STAT reads while waiting for a power domain to acknowledge.
const POWER_POLL_ATTEMPTS: usize = 10;

/// The wire protocol selected for the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Jtag,
    Swd,
    /// High level adapters talk to the DAP themselves.
    Hla,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Jtag => "jtag",
            TransportKind::Swd => "swd",
            TransportKind::Hla => "hla",
        }
    }
}

/// Options accepted when creating a DAP.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DapConfig {
    /// TAP the DAP sits behind, by name or by chain position.
    pub chain_position: Option<String>,
}

impl DapConfig {
    pub fn new(chain_position: impl Into<String>) -> Self {
        Self {
            chain_position: Some(chain_position.into()),
        }
    }

    /// Resolve the TAP the DAP is bound to.
    pub fn validate<C: ScanChain + ?Sized>(&self, chain: &C) -> Result<TapId, DapError> {
        let position = self
            .chain_position
            .as_deref()
            .ok_or(DapError::MissingChainPosition)?;
        chain
            .tap_by_name(position)
            .or_else(|| {
                position
                    .parse::<TapId>()
                    .ok()
                    .filter(|&id| id < chain.tap_count())
            })
            .ok_or_else(|| DapError::InvalidChainPosition(position.to_string()))
    }
}

/// One Debug Access Port.
#[derive(Debug)]
pub struct Dap {
    name: String,
    tap: TapId,
    aps: Vec<AccessPort>,
    journal: Journal,
    /// Last value written to DP SELECT, `None` when unknown.
    pub(crate) select: Option<u32>,
    /// Value written to CTRL/STAT by the last power-up.
    pub(crate) dp_ctrl_stat: u32,
    transport: Option<TransportKind>,
    /// Set when a failed run left the link in an unknown state.
    reconnect: bool,
}

impl Dap {
    fn new(name: String, tap: TapId) -> Self {
        Self {
            name,
            tap,
            aps: (0..AP_COUNT).map(|n| AccessPort::new(n as u8)).collect(),
            journal: Journal::new(),
            select: None,
            dp_ctrl_stat: 0,
            transport: None,
            reconnect: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tap(&self) -> TapId {
        self.tap
    }

    pub fn ap(&self, ap_num: u8) -> &AccessPort {
        &self.aps[usize::from(ap_num)]
    }

    pub fn ap_mut(&mut self, ap_num: u8) -> &mut AccessPort {
        &mut self.aps[usize::from(ap_num)]
    }

    pub fn aps(&self) -> &[AccessPort] {
        &self.aps
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn select(&self) -> Option<u32> {
        self.select
    }

    pub fn dp_ctrl_stat(&self) -> u32 {
        self.dp_ctrl_stat
    }

    /// The transport that connected this DAP, `None` until `init_all` reached it.
    pub fn transport(&self) -> Option<TransportKind> {
        self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Forget the cached SELECT value so the next AP access writes it.
    pub fn invalidate_select(&mut self) {
        self.select = None;
    }

    /// Whether the next `run` brings the link up again before executing the journal.
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect
    }

    pub(crate) fn set_reconnect(&mut self, reconnect: bool) {
        self.reconnect = reconnect;
    }

    pub(crate) fn enqueue(&mut self, mut cmd: DapCommand) {
        cmd.dp_select = self.select;
        self.journal.push(cmd);
    }

    pub(crate) fn enqueue_read(&mut self, mut cmd: DapCommand) -> DeferredRead {
        cmd.dp_select = self.select;
        self.journal.push_read(cmd)
    }

    pub(crate) fn take_journal(&mut self) -> Vec<DapCommand> {
        self.journal.take_all()
    }

    pub(crate) fn flush_journal(&mut self) {
        self.journal.clear();
    }

    /// Queue a DP SELECT write when `ap_num`/`reg` needs a different bank than the cached one.
    /// Returns the value that went out, if any.
    pub(crate) fn bank_select(&mut self, ap_num: u8, reg: u8) -> Option<u32> {
        let select = self.ap(ap_num).bank_select(reg);
        if self.select == Some(select) {
            return None;
        }
        self.select = Some(select);
        Some(select)
    }
}

/// Transaction layer of a DAP transport.  Queue operations only record the access in the DAP's
/// journal; `run` executes the journal and returns the values read.
pub trait DapOps {
    fn queue_dp_read(&mut self, dap: &mut Dap, reg: u8) -> DeferredRead;

    fn queue_dp_write(&mut self, dap: &mut Dap, reg: u8, value: u32);

    fn queue_ap_read(&mut self, dap: &mut Dap, ap_num: u8, reg: u8) -> DeferredRead;

    fn queue_ap_write(&mut self, dap: &mut Dap, ap_num: u8, reg: u8, value: u32);

    /// Abort the AP transaction in progress.
    fn queue_ap_abort(&mut self, dap: &mut Dap);

    /// Execute everything queued, in order.  The journal is empty afterwards, whatever the
    /// outcome.
    fn run(&mut self, dap: &mut Dap) -> Result<DeferredResults, DapError>;

    /// Bring up the link and the DP.
    fn connect(&mut self, dap: &mut Dap) -> Result<(), DapError>;
}

/// Power up the debug and system domains and enable overrun detection, retrying the whole
/// sequence a few times.
pub fn dp_init<O: DapOps + ?Sized>(ops: &mut O, dap: &mut Dap) -> Result<(), DapError> {
    tracing::debug!("DAP {}: DP init", dap.name());
    let mut result = Ok(());
    for attempt in 0..DP_INIT_ATTEMPTS {
        // A failed attempt is retried here, not by a reconnect inside the next run.
        dap.invalidate_select();
        dap.set_reconnect(false);
        result = dp_init_once(ops, dap);
        match &result {
            Ok(()) => break,
            Err(e) => tracing::debug!("DP init attempt {} failed: {}", attempt + 1, e),
        }
    }
    result
}

fn dp_init_once<O: DapOps + ?Sized>(ops: &mut O, dap: &mut Dap) -> Result<(), DapError> {
    ops.queue_dp_read(dap, DP_CTRL_STAT);
    ops.queue_dp_write(dap, DP_CTRL_STAT, STICKYERR);
    ops.queue_dp_read(dap, DP_CTRL_STAT);

    dap.dp_ctrl_stat = CDBGPWRUPREQ | CSYSPWRUPREQ;
    ops.queue_dp_write(dap, DP_CTRL_STAT, dap.dp_ctrl_stat);

    tracing::debug!("DAP: wait CDBGPWRUPACK");
    poll_dp_register(ops, dap, DP_CTRL_STAT, CDBGPWRUPACK, CDBGPWRUPACK)?;
    tracing::debug!("DAP: wait CSYSPWRUPACK");
    poll_dp_register(ops, dap, DP_CTRL_STAT, CSYSPWRUPACK, CSYSPWRUPACK)?;

    ops.queue_dp_read(dap, DP_CTRL_STAT);
    // With debug power on we can detect overruns
    dap.dp_ctrl_stat = CDBGPWRUPREQ | CSYSPWRUPREQ | ORUNDETECT;
    ops.queue_dp_write(dap, DP_CTRL_STAT, dap.dp_ctrl_stat);
    ops.queue_dp_read(dap, DP_CTRL_STAT);
    ops.run(dap)?;
    Ok(())
}

/// Read a DP register until `reg & mask == value`.
pub fn poll_dp_register<O: DapOps + ?Sized>(
    ops: &mut O,
    dap: &mut Dap,
    reg: u8,
    mask: u32,
    value: u32,
) -> Result<(), DapError> {
    for _ in 0..POWER_POLL_ATTEMPTS {
        let read = ops.queue_dp_read(dap, reg);
        let current = ops.run(dap)?.take(read)?;
        if current & mask == value {
            return Ok(());
        }
    }
    Err(DapError::PowerUpTimeout { mask, value })
}

/// How `init_all` reaches the DAPs.
pub enum Link<'a> {
    /// JTAG-DP scans on the DAP's own TAP.
    Jtag,
    /// One SWD wire shared by every DAP.
    Swd(&'a mut dyn SwdWire),
    /// The adapter owns the DAP; nothing to do here.
    Hla,
}

impl Link<'_> {
    pub fn kind(&self) -> TransportKind {
        match self {
            Link::Jtag => TransportKind::Jtag,
            Link::Swd(_) => TransportKind::Swd,
            Link::Hla => TransportKind::Hla,
        }
    }
}

/// Every DAP of the session, in creation order.
#[derive(Debug, Default)]
pub struct DapRegistry {
    daps: Vec<Dap>,
}

impl DapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a DAP bound to the TAP named by `config`.  Nothing is registered on failure.
    pub fn create<C: ScanChain + ?Sized>(
        &mut self,
        name: &str,
        config: &DapConfig,
        chain: &C,
    ) -> Result<&mut Dap, DapError> {
        if self.find(name).is_some() {
            return Err(DapError::NameExists(name.to_string()));
        }
        let tap = config.validate(chain)?;
        tracing::debug!("Creating DAP {} on TAP #{}", name, tap);
        self.daps.push(Dap::new(name.to_string(), tap));
        let idx = self.daps.len() - 1;
        Ok(&mut self.daps[idx])
    }

    /// Names of every DAP, in creation order.
    pub fn names(&self) -> Vec<&str> {
        self.daps.iter().map(Dap::name).collect()
    }

    pub fn find(&self, name: &str) -> Option<&Dap> {
        self.daps.iter().find(|d| d.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Dap> {
        self.daps.iter_mut().find(|d| d.name == name)
    }

    /// Like [`find`](Self::find), for callers that report a missing DAP as an error.
    pub fn get(&self, name: &str) -> Result<&Dap, DapError> {
        self.find(name)
            .ok_or_else(|| DapError::NoSuchDap(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Dap, DapError> {
        self.find_mut(name)
            .ok_or_else(|| DapError::NoSuchDap(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.daps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.daps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dap> {
        self.daps.iter()
    }

    /// Connect every DAP whose TAP is enabled, in creation order.  The sweep stops at the first
    /// failure; DAPs connected before it stay connected.
    pub fn init_all<C: ScanChain + ?Sized>(
        &mut self,
        chain: &mut C,
        mut link: Link<'_>,
    ) -> Result<(), DapError> {
        if self.daps.is_empty() {
            return Ok(());
        }
        tracing::debug!("Initializing all DAPs ...");

        for dap in &mut self.daps {
            let tap = chain.tap(dap.tap).ok_or(JtagError::NoSuchTap(dap.tap))?;
            if !tap.enabled {
                tracing::debug!("Skipping DAP {} on disabled TAP {}", dap.name, tap.name);
                continue;
            }

            match &mut link {
                Link::Swd(wire) => SwdDp::new(&mut **wire).connect(dap)?,
                Link::Jtag => JtagDp::new(&mut *chain).connect(dap)?,
                Link::Hla => {}
            }
            dap.transport = Some(link.kind());
        }
        Ok(())
    }

    /// Drop every DAP.
    pub fn cleanup_all(&mut self) {
        tracing::debug!("Releasing {} DAPs", self.daps.len());
        self.daps.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dap::jtag_dp::tests::JtagDpSim;
    use crate::dap::swd::tests::SwdSim;
    use crate::statemachine::Register;
    use crate::taps::Tap;
    use pretty_assertions::assert_eq;

    /// A chain of named TAPs that records scans but answers nothing.
    pub(crate) struct FakeChain {
        pub taps: Vec<Tap>,
        pub scans: usize,
    }

    impl FakeChain {
        pub(crate) fn new(names: &[&str]) -> Self {
            Self {
                taps: names.iter().map(|n| Tap::new(*n, 4)).collect(),
                scans: 0,
            }
        }
    }

    impl ScanChain for FakeChain {
        fn tap_count(&self) -> usize {
            self.taps.len()
        }

        fn tap(&self, tap: TapId) -> Option<&Tap> {
            self.taps.get(tap)
        }

        fn reset(&mut self) -> Result<(), JtagError> {
            Ok(())
        }

        fn shift(
            &mut self,
            _tap: TapId,
            _register: Register,
            bits: usize,
            _out: &[u8],
        ) -> Result<Vec<u8>, JtagError> {
            self.scans += 1;
            Ok(vec![0; bits.div_ceil(8)])
        }

        fn idle(&mut self, _cycles: usize) -> Result<(), JtagError> {
            Ok(())
        }
    }

    #[test]
    fn new_dap_has_256_default_aps() {
        let chain = FakeChain::new(&["cpu"]);
        let mut registry = DapRegistry::new();
        let dap = registry
            .create("cpu.dap", &DapConfig::new("cpu"), &chain)
            .unwrap();

        assert_eq!(dap.aps().len(), 256);
        for (i, ap) in dap.aps().iter().enumerate() {
            assert_eq!(usize::from(ap.ap_num()), i);
            assert_eq!(ap.memaccess_tck(), 255);
            assert_eq!(ap.tar_autoincr_block(), 1024);
        }
        assert!(!dap.is_connected());
        assert!(dap.journal().is_empty());
    }

    #[test]
    fn duplicate_name_leaves_registry_untouched() {
        let chain = FakeChain::new(&["cpu", "fpga"]);
        let mut registry = DapRegistry::new();
        registry
            .create("dap", &DapConfig::new("cpu"), &chain)
            .unwrap()
            .ap_mut(1)
            .set_memaccess_tck(8);

        let err = registry
            .create("dap", &DapConfig::new("fpga"), &chain)
            .unwrap_err();
        assert!(matches!(err, DapError::NameExists(ref n) if n == "dap"));
        assert_eq!(err.to_string(), "DAP `dap` exists");

        assert_eq!(registry.len(), 1);
        let dap = registry.find("dap").unwrap();
        assert_eq!(dap.tap(), 0);
        assert_eq!(dap.ap(1).memaccess_tck(), 8);
    }

    #[test]
    fn chain_position_is_required_and_resolved() {
        let chain = FakeChain::new(&["cpu", "fpga"]);
        let mut registry = DapRegistry::new();

        let err = registry
            .create("a", &DapConfig::default(), &chain)
            .unwrap_err();
        assert_eq!(err.to_string(), "-chain-position required when creating DAP");

        let err = registry
            .create("b", &DapConfig::new("gpu"), &chain)
            .unwrap_err();
        assert!(matches!(err, DapError::InvalidChainPosition(ref p) if p == "gpu"));

        assert!(registry.is_empty());
        assert_eq!(
            registry.create("c", &DapConfig::new("1"), &chain).unwrap().tap(),
            1
        );
        assert!(registry.create("d", &DapConfig::new("2"), &chain).is_err());
    }

    #[test]
    fn names_follow_creation_order() {
        let chain = FakeChain::new(&["cpu"]);
        let mut registry = DapRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.create(name, &DapConfig::new("cpu"), &chain).unwrap();
        }
        assert_eq!(registry.names(), vec!["zeta", "alpha", "mid"]);
        assert!(registry.find("beta").is_none());
        assert!(registry.find_mut("alpha").is_some());
    }

    #[test]
    fn get_reports_unknown_names() {
        let chain = FakeChain::new(&["cpu"]);
        let mut registry = DapRegistry::new();
        registry.create("cpu.dap", &DapConfig::new("cpu"), &chain).unwrap();

        assert_eq!(registry.get("cpu.dap").unwrap().name(), "cpu.dap");
        registry.get_mut("cpu.dap").unwrap().ap_mut(0).set_memaccess_tck(0);
        assert_eq!(registry.get("cpu.dap").unwrap().ap(0).memaccess_tck(), 0);

        let err = registry.get_mut("gpu.dap").unwrap_err();
        assert!(matches!(err, DapError::NoSuchDap(ref n) if n == "gpu.dap"));
        assert_eq!(err.to_string(), "no DAP named `gpu.dap`");
    }

    #[test]
    fn empty_registry_initializes_trivially() {
        let mut chain = FakeChain::new(&[]);
        let mut registry = DapRegistry::new();
        registry.init_all(&mut chain, Link::Jtag).unwrap();
        assert_eq!(chain.scans, 0);
    }

    #[test]
    fn hla_connects_without_scanning() {
        let mut chain = FakeChain::new(&["cpu"]);
        let mut registry = DapRegistry::new();
        registry.create("dap", &DapConfig::new("cpu"), &chain).unwrap();
        registry.init_all(&mut chain, Link::Hla).unwrap();
        assert_eq!(chain.scans, 0);
        assert_eq!(registry.find("dap").unwrap().transport(), Some(TransportKind::Hla));
    }

    #[test]
    fn jtag_init_skips_disabled_taps() {
        let mut chain = JtagDpSim::new(&["a", "b"]);
        chain.taps[0].enabled = false;
        let mut registry = DapRegistry::new();
        registry.create("a.dap", &DapConfig::new("a"), &chain).unwrap();
        registry.create("b.dap", &DapConfig::new("b"), &chain).unwrap();

        registry.init_all(&mut chain, Link::Jtag).unwrap();

        assert!(!registry.find("a.dap").unwrap().is_connected());
        let b = registry.find("b.dap").unwrap();
        assert_eq!(b.transport(), Some(TransportKind::Jtag));
        assert_eq!(b.dp_ctrl_stat(), CDBGPWRUPREQ | CSYSPWRUPREQ | ORUNDETECT);
        assert!(chain.dp(1).ctrl_stat & (CDBGPWRUPACK | CSYSPWRUPACK) != 0);
        assert_eq!(chain.dp(0).scans, 0);
    }

    #[test]
    fn first_failure_stops_the_sweep() {
        let mut chain = JtagDpSim::new(&["a", "b", "c"]);
        chain.dp_mut(1).power_fails = true;
        let mut registry = DapRegistry::new();
        for name in ["a", "b", "c"] {
            registry.create(name, &DapConfig::new(name), &chain).unwrap();
        }

        let err = registry.init_all(&mut chain, Link::Jtag).unwrap_err();
        assert!(matches!(err, DapError::PowerUpTimeout { .. }));

        assert!(registry.find("a").unwrap().is_connected());
        assert!(!registry.find("b").unwrap().is_connected());
        assert!(!registry.find("c").unwrap().is_connected());
        assert_eq!(chain.dp(2).scans, 0);
    }

    #[test]
    fn swd_init_connects_over_the_wire() {
        let mut chain = FakeChain::new(&["cpu"]);
        let mut wire = SwdSim::new();
        let mut registry = DapRegistry::new();
        registry.create("dap", &DapConfig::new("cpu"), &chain).unwrap();

        registry
            .init_all(&mut chain, Link::Swd(&mut wire))
            .unwrap();

        assert_eq!(chain.scans, 0);
        assert_eq!(wire.line_resets, 1);
        assert_eq!(registry.find("dap").unwrap().transport(), Some(TransportKind::Swd));
    }

    #[test]
    fn cleanup_empties_the_registry() {
        let chain = FakeChain::new(&["cpu"]);
        let mut registry = DapRegistry::new();
        registry.create("dap", &DapConfig::new("cpu"), &chain).unwrap();
        registry.cleanup_all();
        assert!(registry.is_empty());
        assert!(registry.names().is_empty());
    }
}
