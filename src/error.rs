//! Error types for every layer of the crate, from the cable up to the trace sink.

/// Failures reported by a hardware adapter implementing [`Cable`](crate::cable::Cable).
#[derive(Debug, thiserror::Error)]
pub enum CableError {
    #[error("no cable named `{0}` is known")]
    UnknownCable(String),
    #[error("adapter transfer failed: {0}")]
    Adapter(String),
    #[error("GPIO pin access failed")]
    Pin,
}

impl CableError {
    /// Wrap a vendor error whose only useful representation is its `Debug` output.
    pub(crate) fn adapter<E: core::fmt::Debug>(error: E) -> Self {
        CableError::Adapter(format!("{error:?}"))
    }
}

/// Errors raised by the scan-chain layer.
#[derive(Debug, thiserror::Error)]
pub enum JtagError {
    #[error(transparent)]
    Cable(#[from] CableError),
    #[error("TAP #{0} is not part of the scan chain")]
    NoSuchTap(usize),
    #[error("TAP `{0}` is disabled")]
    TapDisabled(String),
    #[error("scan of {bits} bits needs {needed} bytes, got {got}")]
    BufferTooShort { bits: usize, needed: usize, got: usize },
    #[error("invalid IDCODE {0:#010x} on the scan chain")]
    InvalidIdCode(u32),
    #[error("truncated IDCODE at the end of the DR scan")]
    TruncatedIdCode,
    #[error("IR lengths cannot be derived from the IR capture")]
    InvalidIr,
}

/// Errors raised while walking a virtual JTAG hub.
#[derive(Debug, thiserror::Error)]
pub enum VjtagError {
    #[error("no TAP is bound to the virtual JTAG hub")]
    NoTap,
    #[error(transparent)]
    Jtag(#[from] JtagError),
}

/// Errors raised by the DAP registry and the DP/AP transaction layer.
#[derive(Debug, thiserror::Error)]
pub enum DapError {
    #[error("DAP `{0}` exists")]
    NameExists(String),
    #[error("-chain-position required when creating DAP")]
    MissingChainPosition,
    #[error("-chain-position `{0}` is invalid")]
    InvalidChainPosition(String),
    #[error("no DAP named `{0}`")]
    NoSuchDap(String),
    #[error(transparent)]
    Jtag(#[from] JtagError),
    #[error("target responded with WAIT too many times")]
    WaitResponse,
    #[error("target responded with FAULT")]
    FaultResponse,
    #[error("sticky error in CTRL/STAT {0:#010x}")]
    StickyError(u32),
    #[error("debug regions are unpowered (CTRL/STAT {0:#010x})")]
    DebugPowerLost(u32),
    #[error("timed out waiting for CTRL/STAT {mask:#010x} to read {value:#010x}")]
    PowerUpTimeout { mask: u32, value: u32 },
    #[error("read result #{0} is not available")]
    MissingResult(usize),
}

/// Errors raised by the SMP thread aggregator.
#[derive(Debug, thiserror::Error)]
pub enum RtosError {
    #[error("thread {0}: no target to perform access")]
    NoTarget(u64),
    #[error("core `{core}` failed to provide registers: {reason}")]
    Core { core: String, reason: String },
}

/// Errors raised by the trace sink.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("remote end of the trace connection is closed")]
    RemoteClosed,
    #[error("no trace connection #{0}")]
    NoSuchConnection(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while turning a configuration into live objects.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid trace port `{0}`, expected a port number or \"disabled\"")]
    InvalidTracePort(String),
    #[error("TAP `{0}` is configured twice")]
    DuplicateTap(String),
    #[error("TAP `{0}` has an IR length of zero")]
    ZeroIrLength(String),
    #[error(transparent)]
    Dap(#[from] DapError),
}
