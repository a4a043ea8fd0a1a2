use std::sync::Arc;

use log::{log_enabled, Level};

use crate::state::{ExitReason, ProcessorState};

use super::{CompiledBlock, JitError, System};

enum Step {
    Lookup,
    Compile,
    Execute(Arc<CompiledBlock>),
    /// Generated code returned, or the block vanished before entry.
    ReEnter,
}

/// One emulated core: private processor state on a shared `System`.
pub struct Core {
    state: ProcessorState,
    system: Arc<System>,
    dispatches: u64,
    compiles: u64,
}

impl Drop for Core {
    fn drop(&mut self) {
        if log_enabled!(Level::Info) {
            log::info!(
                "*** Core: {} dispatches, {} compile requests",
                self.dispatches,
                self.compiles
            );
        }
    }
}

impl Core {
    pub fn new(system: Arc<System>) -> Self {
        Self {
            state: ProcessorState::new(),
            system,
            dispatches: 0,
            compiles: 0,
        }
    }

    pub fn state(&self) -> &ProcessorState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ProcessorState {
        &mut self.state
    }

    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    /// Number of times the dispatcher entered generated code.
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    /// Runs until a guest exit or until roughly `ticks` instructions have executed.
    /// Budget checks happen at block boundaries, so a slice may overrun by one block.
    pub fn run_for(&mut self, ticks: i32) -> Result<ExitReason, JitError> {
        self.state.ticks = ticks;

        let mut step = Step::Lookup;
        loop {
            step = match step {
                Step::Lookup => {
                    if let Some(exit) = self.state.take_exit() {
                        return Ok(exit);
                    }
                    if self.state.ticks <= 0 {
                        return Ok(ExitReason::BudgetExhausted);
                    }
                    match self.system.cache().lookup(self.state.pc()) {
                        Some(block) => Step::Execute(block),
                        None => Step::Compile,
                    }
                }
                Step::Compile => {
                    self.compiles += 1;
                    Step::Execute(self.system.compile_block(self.state.pc())?)
                }
                Step::Execute(block) => {
                    let system = Arc::clone(&self.system);
                    if system.cache().execute(&block, &mut self.state, &system) {
                        self.dispatches += 1;
                    }
                    Step::ReEnter
                }
                Step::ReEnter => Step::Lookup,
            };
        }
    }

    /// Runs time slices until the guest exits.
    pub fn run(&mut self) -> Result<ExitReason, JitError> {
        let timeslice = self.system.config().timeslice.max(1);
        loop {
            match self.run_for(timeslice)? {
                ExitReason::BudgetExhausted => continue,
                exit => return Ok(exit),
            }
        }
    }

    pub fn run_from(&mut self, address: u32) -> Result<ExitReason, JitError> {
        self.state.set_pc(address);
        self.run()
    }
}
