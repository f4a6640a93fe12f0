//! Presents the cores of an SMP group to a remote debugger as one thread per core.
//!
//! There is no real RTOS behind this view.  Thread ids are the 1-based positions of the cores in
//! the group, recomputed on every [`SmpRtos::update_threads`] pass and on every lookup, so an id
//! only means something together with the group it was computed from.
use crate::error::RtosError;

/// 1-based thread id as seen by the remote debugger.
pub type ThreadId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreState {
    Unknown,
    Running,
    Halted,
    Reset,
    DebugRunning,
}

impl CoreState {
    pub fn as_str(self) -> &'static str {
        match self {
            CoreState::Unknown => "unknown",
            CoreState::Running => "running",
            CoreState::Halted => "halted",
            CoreState::Reset => "reset",
            CoreState::DebugRunning => "debug-running",
        }
    }
}

/// Why a core last entered debug state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugReason {
    DbgRq,
    Breakpoint,
    Watchpoint,
    WatchpointAndBreakpoint,
    SingleStep,
    NotHalted,
    ExitRequest,
    Undefined,
}

impl DebugReason {
    /// Reasons that make a halted core the natural thread to report a stop on.
    fn is_stop_event(self) -> bool {
        matches!(
            self,
            DebugReason::Breakpoint
                | DebugReason::Watchpoint
                | DebugReason::WatchpointAndBreakpoint
                | DebugReason::SingleStep
        )
    }
}

/// A register as cached by the core.  `size` is in bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreRegister {
    pub number: u32,
    pub size: u32,
    pub valid: bool,
    pub value: Vec<u8>,
}

/// Control and register access for one core of the group.
pub trait CoreControl {
    fn name(&self) -> &str;

    fn state(&self) -> CoreState;

    fn debug_reason(&self) -> DebugReason;

    /// The general register class, as currently cached.
    fn general_registers(&mut self) -> Result<Vec<CoreRegister>, RtosError>;

    /// Read one register from the hardware, updating the cache.
    fn refresh_register(&mut self, number: u32) -> Result<CoreRegister, RtosError>;
}

/// A register handed to the remote debugger.  `size` is in bits; `value` holds exactly
/// `size.div_ceil(8)` bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtosReg {
    pub number: u32,
    pub size: u32,
    pub value: Vec<u8>,
}

impl From<CoreRegister> for RtosReg {
    fn from(reg: CoreRegister) -> Self {
        let mut value = reg.value;
        value.resize(reg.size.div_ceil(8) as usize, 0);
        RtosReg {
            number: reg.number,
            size: reg.size,
            value,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadDetail {
    pub id: ThreadId,
    /// Name of the core.
    pub name: String,
    /// Execution state of the core.
    pub extra_info: String,
    pub exists: bool,
}

/// Thread list and current thread, published together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub threads: Vec<ThreadDetail>,
    pub current: ThreadId,
}

impl Default for ThreadSnapshot {
    fn default() -> Self {
        Self {
            threads: Vec::new(),
            current: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct SmpRtos {
    snapshot: ThreadSnapshot,
}

impl SmpRtos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the thread list from the current state of `cores`.
    ///
    /// The new current thread is, in order of preference: the old current thread if it stopped
    /// on a breakpoint, watchpoint or single step; the first other core that did; the old current
    /// thread if it still exists; thread 1.
    ///
    /// # Panics
    ///
    /// An empty group has no valid current thread and panics.
    pub fn update_threads<C: CoreControl>(&mut self, cores: &[C]) {
        let old_current = self.snapshot.current;
        let count = cores.len() as ThreadId;

        let mut new_current = None;
        for (id, core) in (1..).zip(cores) {
            if core.state() == CoreState::Halted
                && core.debug_reason().is_stop_event()
                && (new_current.is_none() || id == old_current)
            {
                new_current = Some(id);
            }
        }

        let mut current = new_current.unwrap_or(old_current);
        if current == 0 || current > count {
            assert!(count > 0, "SMP group has no cores");
            current = 1;
        }

        let threads = (1..)
            .zip(cores)
            .map(|(id, core)| ThreadDetail {
                id,
                name: core.name().to_string(),
                extra_info: core.state().as_str().to_string(),
                exists: true,
            })
            .collect();

        self.snapshot = ThreadSnapshot { threads, current };
        tracing::debug!(
            "SMP thread list: {} threads, current {}",
            self.snapshot.threads.len(),
            current
        );
    }

    pub fn thread_count(&self) -> usize {
        self.snapshot.threads.len()
    }

    pub fn current_thread(&self) -> ThreadId {
        self.snapshot.current
    }

    pub fn threads(&self) -> &[ThreadDetail] {
        &self.snapshot.threads
    }

    pub fn snapshot(&self) -> &ThreadSnapshot {
        &self.snapshot
    }

    /// Find the core behind thread `id`, making it the current thread if asked.
    pub fn target_for_thread<C: CoreControl>(
        &mut self,
        cores: &[C],
        id: ThreadId,
        make_current: bool,
    ) -> Option<usize> {
        let index = thread_index(cores.len(), id)?;
        if make_current {
            self.snapshot.current = id;
        }
        Some(index)
    }

    /// Copy the general registers of the core behind thread `id`, refreshing any the core
    /// has not read yet.
    pub fn thread_reg_list<C: CoreControl>(
        &self,
        cores: &mut [C],
        id: ThreadId,
    ) -> Result<Vec<RtosReg>, RtosError> {
        let Some(index) = thread_index(cores.len(), id) else {
            tracing::error!("current thread {id:#x}: no target to perform access");
            return Err(RtosError::NoTarget(id));
        };
        let core = &mut cores[index];

        core.general_registers()?
            .into_iter()
            .map(|reg| {
                let reg = if reg.valid {
                    reg
                } else {
                    core.refresh_register(reg.number)?
                };
                Ok::<_, RtosError>(RtosReg::from(reg))
            })
            .collect()
    }
}

fn thread_index(count: usize, id: ThreadId) -> Option<usize> {
    let index = usize::try_from(id).ok()?.checked_sub(1)?;
    (index < count).then_some(index)
}
