//! This crate turns a JTAG or SWD link into register access on a target, at a variety of levels
//! of abstraction.  At the lowest level, you can directly interact with a JTAG cable, such as
//! those based on the "jtagkey" design, an Altera USB Blaster, or four GPIO pins.  The Cable trait
//! allows for changing modes and shifting bits in and out of the JTAG chain.
//!
//! The next higher level of abstraction is the JtagSM, which keeps track of the mode of the TAPs.
//! You tell it which mode you want (e.g., Reset or Idle) and it gets there with the fewest number
//! of mode changes.  You can also read and write the instruction and data registers.
//!
//! If there are multiple TAPs in the JTAG chain, you probably want to use the Taps struct.  You
//! tell Taps which TAPs exist and what the IR length is for each one, or let it detect them.  It
//! implements the ScanChain trait, which scans the IR or DR of one TAP while putting the others in
//! BYPASS.  Everything above works on a ScanChain:
//!
//! * `vjtag` walks the virtual JTAG hub of an Altera FPGA and routes DR scans to one of its
//!   nodes.
//! * `dap` keeps the named ARM Debug Access Ports of the session, queues DP/AP accesses in a
//!   journal and runs them over JTAG-DP or SWD.
//! * `rtos` presents the cores of an SMP group as the thread list of a remote debugger.
//! * `trace` fans trace data out to every connected TCP client.
//! * `config` describes a whole session and builds the chain and the DAPs from it.
//!
//! # Example
//! ```no_run
//! use jtag_debug::dap::{DapConfig, DapRegistry, Link};
//! use jtag_debug::statemachine::JtagSM;
//! use jtag_debug::taps::Taps;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cable = jtag_debug::cable::new_from_string("jtagkey", 1 << 20)?;
//! let mut taps = Taps::new(JtagSM::new(cable)?);
//! taps.detect(8)?;
//!
//! let mut daps = DapRegistry::new();
//! daps.create("cpu.dap", &DapConfig::new("tap0"), &taps)?;
//! daps.init_all(&mut taps, Link::Jtag)?;
//! # Ok(())
//! # }
//! ```

pub mod cable;
pub mod config;
pub mod dap;
pub mod error;
pub mod rtos;
pub mod statemachine;
pub mod taps;
pub mod trace;
pub mod vjtag;

pub use error::{CableError, ConfigError, DapError, JtagError, RtosError, TraceError, VjtagError};
