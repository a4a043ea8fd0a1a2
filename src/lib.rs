pub mod decoder;
pub mod disasm;
pub mod interpreter;
pub mod jit;
pub mod memory;
pub mod state;

use memory::GuestMemory;
use state::{ExitReason, ProcessorState};

/// An execution engine for one guest core.
pub trait Engine {
    fn state(&self) -> &ProcessorState;
    fn state_mut(&mut self) -> &mut ProcessorState;
    fn memory(&self) -> &GuestMemory;

    /// Runs until the guest raises an exit.
    fn run(&mut self) -> anyhow::Result<ExitReason>;
}
