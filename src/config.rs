//! The description of a debug session: the TAPs on the chain, the DAPs behind them, the wire
//! protocol and where trace data goes.  Everything deserialises with serde, so the session can
//! come from any format the caller likes.
//!
//! ```
//! use jtag_debug::config::SessionConfig;
//! use jtag_debug::trace::TracePort;
//!
//! let config: SessionConfig = serde_json::from_str(r#"{
//!     "taps": [{ "name": "cpu.tap", "irlen": 4 }],
//!     "daps": [{ "name": "cpu.dap", "chain-position": "cpu.tap" }],
//!     "trace-port": "disabled"
//! }"#).unwrap();
//! assert_eq!(config.trace_port, TracePort::Disabled);
//! ```
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::cable::Cable;
use crate::dap::{DapConfig, DapRegistry, TransportKind};
use crate::error::ConfigError;
use crate::statemachine::JtagSM;
use crate::taps::{ScanChain, Tap, Taps};
use crate::trace::TracePort;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionConfig {
    /// TAPs in chain order, nearest TDI first.
    #[serde(default)]
    pub taps: Vec<TapConfig>,
    #[serde(default)]
    pub daps: Vec<DapEntry>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub trace_port: TracePort,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TapConfig {
    pub name: String,
    pub irlen: usize,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub expected_id: Option<u32>,
}

fn enabled_by_default() -> bool {
    true
}

impl From<&TapConfig> for Tap {
    fn from(config: &TapConfig) -> Self {
        Tap {
            name: config.name.clone(),
            irlen: config.irlen,
            enabled: config.enabled,
            expected_id: config.expected_id,
        }
    }
}

/// A named DAP and its creation options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DapEntry {
    pub name: String,
    #[serde(flatten)]
    pub config: DapConfig,
}

impl SessionConfig {
    /// Put the configured TAPs on a chain driven by `sm`.
    pub fn build_chain<T, U>(&self, sm: JtagSM<T>) -> Result<Taps<T>, ConfigError>
    where
        T: core::ops::DerefMut<Target = U>,
        U: Cable + ?Sized,
    {
        let mut seen = HashSet::new();
        for tap in &self.taps {
            if !seen.insert(tap.name.as_str()) {
                return Err(ConfigError::DuplicateTap(tap.name.clone()));
            }
            if tap.irlen == 0 {
                return Err(ConfigError::ZeroIrLength(tap.name.clone()));
            }
        }

        let mut taps = Taps::new(sm);
        for tap in &self.taps {
            taps.push_tap(tap.into());
        }
        Ok(taps)
    }

    /// Create every configured DAP, in order, against `chain`.
    pub fn build_registry<C: ScanChain + ?Sized>(
        &self,
        chain: &C,
    ) -> Result<DapRegistry, ConfigError> {
        let mut registry = DapRegistry::new();
        for entry in &self.daps {
            registry.create(&entry.name, &entry.config, chain)?;
        }
        Ok(registry)
    }
}
