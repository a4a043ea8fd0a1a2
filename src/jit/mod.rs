//! Dynamic binary translation of guest code into host code through Cranelift.
//!
//! A [`System`] owns guest memory and the shared [`CodeCache`]; any number of
//! [`Core`]s run on it, one per thread. Blocks are translated on first execution,
//! chained through patchable link slots, and evicted when guest code is overwritten or
//! the cache runs out of room.

pub mod abi;
pub mod cache;
pub mod compiler;
pub mod dispatcher;
mod emitter;

use std::{cell::Cell, sync::Arc};

use memoffset::offset_of;
use thiserror::Error;

pub use cache::{CodeCache, CompiledBlock};
pub use compiler::{BasicBlock, BlockExit, Strategy, StrategyTable};
pub use dispatcher::Core;

use crate::{
    decoder::DecodedInstruction,
    interpreter::{self, interpret_one, AccessKind, Bus},
    memory::{GuestMemory, MemoryFault},
    state::{ExitReason, ProcessorState},
};

use emitter::{FAULT_BIT, INVALIDATED_BIT};

#[derive(Debug, Error)]
pub enum JitError {
    #[error("code generation failed: {0}")]
    Module(#[from] cranelift_module::ModuleError),
    #[error("call-out needs {needed} register arguments, host ABI has {available}")]
    TooManyCalloutArgs { needed: usize, available: usize },
}

/// Longest block the cache will build, whatever `JitConfig` asks for.
pub const MAX_BLOCK_INSNS: usize = 1 << 16;

#[derive(Clone, Debug)]
pub struct JitConfig {
    /// Upper bound on guest instructions per block, clamped to `1..=MAX_BLOCK_INSNS`.
    pub max_block_insns: usize,
    /// Host code bytes the cache aims to stay under.
    pub cache_capacity: usize,
    /// Number of code regions the capacity is split into.
    pub cache_regions: usize,
    /// Patch static exits to jump straight into their successors.
    pub link_blocks: bool,
    /// Ticks per `run_for` slice in `Core::run`.
    pub timeslice: i32,
    pub strategy: StrategyTable,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            max_block_insns: 64,
            cache_capacity: 32 << 20,
            cache_regions: 8,
            link_blocks: true,
            timeslice: 1 << 20,
            strategy: StrategyTable::default(),
        }
    }
}

/// Helpers reachable from generated code, loaded by offset from the table pointer.
#[repr(C)]
pub(crate) struct Callouts {
    interpret: extern "C" fn(*const System, *mut ProcessorState, *const DecodedInstruction) -> u32,
    load: extern "C" fn(*const System, u32, u32) -> u64,
    store: extern "C" fn(*const System, u32, u32, u32) -> u64,
}

impl Callouts {
    const TABLE: Callouts = Callouts {
        interpret: call_interpret,
        load: call_load,
        store: call_store,
    };

    pub(crate) fn interpret_offset() -> usize {
        offset_of!(Callouts, interpret)
    }

    pub(crate) fn load_offset() -> usize {
        offset_of!(Callouts, load)
    }

    pub(crate) fn store_offset() -> usize {
        offset_of!(Callouts, store)
    }
}

/// Interprets one instruction on behalf of generated code. Nonzero when the block must
/// return to the dispatcher: an exit is pending or the instruction overwrote code.
extern "C" fn call_interpret(
    system: *const System,
    state: *mut ProcessorState,
    inst: *const DecodedInstruction,
) -> u32 {
    // SAFETY: generated code passes the `System` and state it was entered with, and a
    // pointer into the instruction array of its own block.
    let (system, state, inst) = unsafe { (&*system, &mut *state, &*inst) };
    let bus = TrackingBus::new(system);
    interpret_one(inst, state, &bus);
    (state.has_exit() || bus.invalidated.get()) as u32
}

fn fault(fault: MemoryFault) -> u64 {
    FAULT_BIT | fault.address as u64
}

extern "C" fn call_load(system: *const System, address: u32, kind: u32) -> u64 {
    // SAFETY: see `call_interpret`.
    let system = unsafe { &*system };
    let Some(kind) = AccessKind::from_raw(kind) else {
        return fault(MemoryFault { address });
    };
    match interpreter::load(&system.memory, kind, address) {
        Ok(value) => value as u64,
        Err(e) => fault(e),
    }
}

extern "C" fn call_store(system: *const System, address: u32, value: u32, kind: u32) -> u64 {
    // SAFETY: see `call_interpret`.
    let system = unsafe { &*system };
    let Some(kind) = AccessKind::from_raw(kind) else {
        return fault(MemoryFault { address });
    };
    let bus = TrackingBus::new(system);
    match interpreter::store(&bus, kind, address, value) {
        Ok(()) if bus.invalidated.get() => INVALIDATED_BIT,
        Ok(()) => 0,
        Err(e) => fault(e),
    }
}

/// Guest memory plus the translation cache shared by every core.
pub struct System {
    memory: GuestMemory,
    cache: CodeCache,
    config: JitConfig,
    callouts: Callouts,
}

impl System {
    pub fn new(memory: GuestMemory, config: JitConfig) -> Result<Self, JitError> {
        let cache = CodeCache::new(&memory, &config)?;
        Ok(Self {
            memory,
            cache,
            config,
            callouts: Callouts::TABLE,
        })
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub(crate) fn callouts(&self) -> &Callouts {
        &self.callouts
    }

    /// Translates the block at `address`, or returns the one already cached.
    pub fn compile_block(&self, address: u32) -> Result<Arc<CompiledBlock>, JitError> {
        self.cache.get_or_compile(&self.memory, address)
    }

    /// Evicts translations of `[address, address + len)`. Returns whether any existed.
    pub fn invalidate_range(&self, address: u32, len: u32) -> bool {
        self.cache.invalidate_range(address, len)
    }

    /// Host-side write of guest bytes, e.g. a loader patching code.
    pub fn write_bytes(&self, address: u32, bytes: &[u8]) -> Result<(), MemoryFault> {
        self.memory.load_image(address, bytes)?;
        self.invalidate_range(address, bytes.len() as u32);
        Ok(())
    }
}

impl Bus for System {
    fn read_u8(&self, address: u32) -> Result<u8, MemoryFault> {
        self.memory.read_u8(address)
    }

    fn read_u16(&self, address: u32) -> Result<u16, MemoryFault> {
        self.memory.read_u16(address)
    }

    fn read_u32(&self, address: u32) -> Result<u32, MemoryFault> {
        self.memory.read_u32(address)
    }

    fn write_u8(&self, address: u32, value: u8) -> Result<(), MemoryFault> {
        self.memory.write_u8(address, value)?;
        self.invalidate_range(address, 1);
        Ok(())
    }

    fn write_u16(&self, address: u32, value: u16) -> Result<(), MemoryFault> {
        self.memory.write_u16(address, value)?;
        self.invalidate_range(address, 2);
        Ok(())
    }

    fn write_u32(&self, address: u32, value: u32) -> Result<(), MemoryFault> {
        self.memory.write_u32(address, value)?;
        self.invalidate_range(address, 4);
        Ok(())
    }
}

/// `System` bus that remembers whether any write evicted compiled code.
struct TrackingBus<'a> {
    system: &'a System,
    invalidated: Cell<bool>,
}

impl<'a> TrackingBus<'a> {
    fn new(system: &'a System) -> Self {
        Self {
            system,
            invalidated: Cell::new(false),
        }
    }

    fn wrote(&self, address: u32, len: u32) {
        if self.system.invalidate_range(address, len) {
            self.invalidated.set(true);
        }
    }
}

impl Bus for TrackingBus<'_> {
    fn read_u8(&self, address: u32) -> Result<u8, MemoryFault> {
        self.system.memory.read_u8(address)
    }

    fn read_u16(&self, address: u32) -> Result<u16, MemoryFault> {
        self.system.memory.read_u16(address)
    }

    fn read_u32(&self, address: u32) -> Result<u32, MemoryFault> {
        self.system.memory.read_u32(address)
    }

    fn write_u8(&self, address: u32, value: u8) -> Result<(), MemoryFault> {
        self.system.memory.write_u8(address, value)?;
        self.wrote(address, 1);
        Ok(())
    }

    fn write_u16(&self, address: u32, value: u16) -> Result<(), MemoryFault> {
        self.system.memory.write_u16(address, value)?;
        self.wrote(address, 2);
        Ok(())
    }

    fn write_u32(&self, address: u32, value: u32) -> Result<(), MemoryFault> {
        self.system.memory.write_u32(address, value)?;
        self.wrote(address, 4);
        Ok(())
    }
}

/// Single-core translating engine.
pub struct Machine {
    core: Core,
}

impl Machine {
    pub fn new(memory: GuestMemory, config: JitConfig) -> Result<Self, JitError> {
        let base = memory.base();
        let system = Arc::new(System::new(memory, config)?);
        let mut core = Core::new(system);
        core.state_mut().set_pc(base);
        Ok(Self { core })
    }

    /// Loads a raw image at `base` and points the pc at it.
    pub fn from_bin(
        bin: &[u8],
        base: u32,
        memory_size: usize,
        config: JitConfig,
    ) -> anyhow::Result<Self> {
        if bin.len() > memory_size {
            anyhow::bail!(
                "image of {} bytes does not fit in {memory_size} bytes of memory",
                bin.len()
            );
        }
        let memory = GuestMemory::new(base, memory_size);
        memory.load_image(base, bin)?;
        Ok(Self::new(memory, config)?)
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    pub fn system(&self) -> &Arc<System> {
        self.core.system()
    }
}

impl crate::Engine for Machine {
    fn state(&self) -> &ProcessorState {
        self.core.state()
    }

    fn state_mut(&mut self) -> &mut ProcessorState {
        self.core.state_mut()
    }

    fn memory(&self) -> &GuestMemory {
        self.core.system().memory()
    }

    fn run(&mut self) -> anyhow::Result<ExitReason> {
        Ok(self.core.run()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system() -> System {
        System::new(GuestMemory::new(0x1000, 0x1000), JitConfig::default()).unwrap()
    }

    #[test]
    fn load_helper_reports_faults_in_the_high_word() {
        let sys = system();
        sys.memory().write_u32(0x1000, 0x8122_3344).unwrap();

        assert_eq!(call_load(&sys, 0x1001, AccessKind::Word as u32), 0x4481_2233);
        assert_eq!(call_load(&sys, 0x1003, AccessKind::SignedByte as u32), 0xffff_ff81);
        assert_eq!(call_load(&sys, 0x3000, AccessKind::Byte as u32), FAULT_BIT | 0x3000);
        assert_eq!(call_load(&sys, 0x1000, 99), FAULT_BIT | 0x1000);
    }

    #[test]
    fn store_helper_flags_invalidated_code() {
        let sys = system();
        // mov r0, #1 ; swi #0
        sys.write_bytes(0x1000, &0xe3a0_0001u32.to_le_bytes()).unwrap();
        sys.write_bytes(0x1004, &0xef00_0000u32.to_le_bytes()).unwrap();

        assert_eq!(call_store(&sys, 0x1800, 7, AccessKind::Word as u32), 0);

        let block = sys.compile_block(0x1000).unwrap();
        assert_eq!(
            call_store(&sys, 0x1004, 0xef00_0001, AccessKind::Word as u32),
            INVALIDATED_BIT
        );
        assert!(block.is_evicted());
        assert!(sys.cache().lookup(0x1000).is_none());

        assert_eq!(
            call_store(&sys, 0x2000, 0, AccessKind::Half as u32),
            FAULT_BIT | 0x2000
        );
    }

    #[test]
    fn bus_writes_invalidate() {
        let sys = system();
        sys.write_bytes(0x1000, &0xef00_0000u32.to_le_bytes()).unwrap();
        let block = sys.compile_block(0x1000).unwrap();

        // Same page, different word.
        sys.write_u32(0x1100, 5).unwrap();
        assert!(!block.is_evicted());

        sys.write_u8(0x1003, 0xef).unwrap();
        assert!(block.is_evicted());
    }
}
