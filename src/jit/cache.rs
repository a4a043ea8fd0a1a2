//! Shared translation cache.
//!
//! Compiled blocks are indexed by guest start address and live in code regions, each a
//! separate `JITModule`. When the configured number of regions is exceeded the oldest one
//! is retired wholesale: its blocks are evicted, then its memory is released once no core
//! is executing generated code.
//!
//! Lock order is backend, then index. Generated code only ever takes the index lock (via
//! store invalidation) while holding the execution gate for reading.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use log::{log_enabled, Level};

use crate::{memory::GuestMemory, state::ProcessorState};

use super::{
    abi,
    compiler::{build_block, BasicBlock, Compiler, StrategyTable},
    emitter::block_signature,
    Callouts, JitConfig, JitError, System,
};

const PAGE_BITS: u32 = 12;

/// Patchable exit of a compiled block: zero, or the entry of the successor block.
#[derive(Debug, Default)]
pub struct LinkSlot(AtomicUsize);

impl LinkSlot {
    pub(crate) fn addr(&self) -> usize {
        &self.0 as *const AtomicUsize as usize
    }

    fn set(&self, entry: *const u8) {
        self.0.store(entry as usize, Ordering::Release);
    }

    fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn target(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// One translated block.
#[derive(Debug)]
pub struct CompiledBlock {
    pub start: u32,
    pub len_bytes: u32,
    pub code_size: usize,
    entry: *const u8,
    links: Box<[LinkSlot]>,
    exits: Box<[u32]>,
    block: BasicBlock,
    region: u64,
    evicted: AtomicBool,
}

// SAFETY: `entry` points into a code region that is only freed after every block in it
// has been evicted and no core holds the execution gate. The rest is plain data or
// atomics.
unsafe impl Send for CompiledBlock {}
unsafe impl Sync for CompiledBlock {}

impl CompiledBlock {
    pub fn block(&self) -> &BasicBlock {
        &self.block
    }

    /// Code region the block was emitted into.
    pub fn region(&self) -> u64 {
        self.region
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Whether static exit `index` currently jumps straight into another block.
    pub fn is_linked(&self, index: usize) -> bool {
        self.links.get(index).is_some_and(|slot| slot.target() != 0)
    }

    fn overlaps(&self, address: u32, len: u32) -> bool {
        let (start, end) = (self.start as u64, self.start as u64 + self.len_bytes as u64);
        let (lo, hi) = (address as u64, address as u64 + len as u64);
        start < hi && lo < end
    }
}

/// Pages that translated code has ever been read from. Marks are never cleared, so a
/// stale mark only costs a slower store.
struct PageMap {
    base: u32,
    pages: Box<[AtomicBool]>,
}

impl PageMap {
    fn new(memory: &GuestMemory) -> Self {
        let count = memory.size().div_ceil(1 << PAGE_BITS);
        Self {
            base: memory.base(),
            pages: (0..count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn page(&self, address: u32) -> Option<&AtomicBool> {
        let index = (address.wrapping_sub(self.base) >> PAGE_BITS) as usize;
        self.pages.get(index)
    }

    fn mark(&self, address: u32) {
        if let Some(page) = self.page(address) {
            if !page.load(Ordering::Relaxed) {
                page.store(true, Ordering::SeqCst);
            }
        }
        fence(Ordering::SeqCst);
    }

    /// Pages are counted from `base`, which need not be page aligned.
    fn any_marked(&self, address: u32, len: u32) -> bool {
        let offset = address.wrapping_sub(self.base) as u64;
        let first = (offset >> PAGE_BITS) as usize;
        let last = ((offset + len.max(1) as u64 - 1) >> PAGE_BITS) as usize;
        if first >= self.pages.len() {
            return false;
        }
        let last = last.min(self.pages.len() - 1);
        self.pages[first..=last]
            .iter()
            .any(|page| page.load(Ordering::SeqCst))
    }
}

struct Region {
    id: u64,
    module: Option<JITModule>,
    bytes: usize,
    blocks: Vec<Arc<CompiledBlock>>,
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: regions are dropped only after all their blocks are evicted and the
            // execution gate is held exclusively.
            unsafe { module.free_memory() };
        }
    }
}

struct Backend {
    compiler: Compiler,
    regions: VecDeque<Region>,
    next_region: u64,
    serial: u64,
}

// SAFETY: `JITModule` holds raw code pointers; the backend is only used under its mutex.
unsafe impl Send for Backend {}

#[derive(Default)]
struct Index {
    by_pc: BTreeMap<u32, Arc<CompiledBlock>>,
    /// Predecessor exits waiting on each target address.
    incoming: HashMap<u32, Vec<(Arc<CompiledBlock>, usize)>>,
}

impl Index {
    fn overlapping(&self, address: u32, len: u32, max_span: u32) -> Vec<u32> {
        let lo = address.saturating_sub(max_span);
        self.by_pc
            .range(lo..=address.saturating_add(len.saturating_sub(1)))
            .filter(|(_, block)| block.overlaps(address, len))
            .map(|(&pc, _)| pc)
            .collect()
    }

    fn install(&mut self, block: &Arc<CompiledBlock>, link: bool) {
        if link {
            for (i, &target) in block.exits.iter().enumerate() {
                if let Some(succ) = self.by_pc.get(&target) {
                    block.links[i].set(succ.entry);
                    log::debug!("*** JIT linked {:08x} -> {target:08x}", block.start);
                }
                self.incoming
                    .entry(target)
                    .or_default()
                    .push((block.clone(), i));
            }
            if let Some(preds) = self.incoming.get(&block.start) {
                for (pred, i) in preds {
                    pred.links[*i].set(block.entry);
                    log::debug!("*** JIT linked {:08x} -> {:08x}", pred.start, block.start);
                }
            }
        }
        self.by_pc.insert(block.start, block.clone());
    }

    fn evict(&mut self, pc: u32) -> Option<Arc<CompiledBlock>> {
        let block = self.by_pc.remove(&pc)?;
        block.evicted.store(true, Ordering::Release);

        for slot in block.links.iter() {
            slot.clear();
        }
        if let Some(preds) = self.incoming.get(&pc) {
            for (pred, i) in preds {
                pred.links[*i].clear();
                log::debug!("*** JIT unlinked {:08x} -> {pc:08x}", pred.start);
            }
        }
        for (i, &target) in block.exits.iter().enumerate() {
            if let Some(preds) = self.incoming.get_mut(&target) {
                preds.retain(|(pred, j)| !(Arc::ptr_eq(pred, &block) && *j == i));
                if preds.is_empty() {
                    self.incoming.remove(&target);
                }
            }
        }
        Some(block)
    }
}

type EnterFn =
    unsafe extern "C" fn(*mut ProcessorState, *const System, *const Callouts, *const u8);

/// Host-ABI entry into tail-call block code.
struct Trampoline {
    module: Option<JITModule>,
    enter: EnterFn,
}

// SAFETY: the trampoline is immutable after construction.
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Drop for Trampoline {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: the cache is being dropped, so nothing can be executing.
            unsafe { module.free_memory() };
        }
    }
}

pub(super) fn new_module() -> Result<JITModule, JitError> {
    let builder = JITBuilder::with_flags(
        &[
            ("opt_level", "speed"),
            ("preserve_frame_pointers", "true"),
            ("unwind_info", "false"),
        ],
        cranelift_module::default_libcall_names(),
    )?;
    Ok(JITModule::new(builder))
}

impl Trampoline {
    fn new() -> Result<Self, JitError> {
        let mut module = new_module()?;
        log::info!("*** JIT target ISA: {}", module.isa().triple());

        let ptr = module.target_config().pointer_type();
        let mut ctx = module.make_context();
        let mut builder_ctx = FunctionBuilderContext::new();

        ctx.func.signature = Signature {
            params: vec![AbiParam::new(ptr); 4],
            returns: vec![],
            call_conv: module.isa().default_call_conv(),
        };

        {
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
            let block = builder.create_block();
            builder.append_block_params_for_function_params(block);
            builder.switch_to_block(block);
            builder.seal_block(block);

            let params = builder.block_params(block).to_vec();
            let sig = builder.import_signature(block_signature(ptr));
            builder
                .ins()
                .call_indirect(sig, params[3], &[params[0], params[1], params[2]]);
            builder.ins().return_(&[]);
            builder.finalize();
        }

        let id = module.declare_function("enter", Linkage::Local, &ctx.func.signature)?;
        module.define_function(id, &mut ctx)?;
        module.clear_context(&mut ctx);
        module.finalize_definitions()?;

        let code = module.get_finalized_function(id);
        // SAFETY: the function was just built with the host default calling convention
        // and the parameter list of `EnterFn`.
        let enter = unsafe { std::mem::transmute::<*const u8, EnterFn>(code) };

        Ok(Self {
            module: Some(module),
            enter,
        })
    }
}

#[derive(Default)]
struct Stats {
    compiles: AtomicU64,
    lookups: AtomicU64,
    hits: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    retired_regions: AtomicU64,
}

pub struct CodeCache {
    index: RwLock<Index>,
    backend: Mutex<Backend>,
    pages: PageMap,
    epoch: AtomicU64,
    exec_gate: RwLock<()>,
    trampoline: Trampoline,
    region_capacity: usize,
    max_regions: usize,
    max_block_insns: usize,
    link_blocks: bool,
    stats: Stats,
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        if log_enabled!(Level::Info) {
            let s = &self.stats;
            log::info!("*** JIT cache statistics:");
            log::info!("    compiles: {}", s.compiles.load(Ordering::Relaxed));
            log::info!(
                "    lookups: {} ({} hits)",
                s.lookups.load(Ordering::Relaxed),
                s.hits.load(Ordering::Relaxed)
            );
            log::info!("    evictions: {}", s.evictions.load(Ordering::Relaxed));
            log::info!(
                "    invalidations: {}",
                s.invalidations.load(Ordering::Relaxed)
            );
            log::info!(
                "    retired regions: {}",
                s.retired_regions.load(Ordering::Relaxed)
            );
            log::info!("    code bytes: {}", self.code_bytes());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl CodeCache {
    pub(crate) fn new(memory: &GuestMemory, config: &JitConfig) -> Result<Self, JitError> {
        let trampoline = Trampoline::new()?;
        let module = new_module()?;
        let compiler = Compiler::new(&module, config.strategy.clone(), abi::HOST);
        let max_regions = config.cache_regions.max(1);

        Ok(Self {
            index: RwLock::new(Index::default()),
            backend: Mutex::new(Backend {
                compiler,
                regions: VecDeque::from([Region {
                    id: 0,
                    module: Some(module),
                    bytes: 0,
                    blocks: vec![],
                }]),
                next_region: 1,
                serial: 0,
            }),
            pages: PageMap::new(memory),
            epoch: AtomicU64::new(0),
            exec_gate: RwLock::new(()),
            trampoline,
            region_capacity: (config.cache_capacity / max_regions).max(1),
            max_regions,
            max_block_insns: config.max_block_insns.clamp(1, super::MAX_BLOCK_INSNS),
            link_blocks: config.link_blocks,
            stats: Stats::default(),
        })
    }

    pub fn strategy(&self) -> StrategyTable {
        lock(&self.backend).compiler.strategy().clone()
    }

    pub fn lookup(&self, pc: u32) -> Option<Arc<CompiledBlock>> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let block = read(&self.index).by_pc.get(&pc).cloned();
        if block.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        }
        block
    }

    /// Number of blocks currently installed.
    pub fn len(&self) -> usize {
        read(&self.index).by_pc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host code bytes held by live regions, evicted blocks included.
    pub fn code_bytes(&self) -> usize {
        lock(&self.backend).regions.iter().map(|r| r.bytes).sum()
    }

    pub fn region_count(&self) -> usize {
        lock(&self.backend).regions.len()
    }

    /// Returns the block at `pc`, translating it first if needed. Concurrent callers for
    /// the same address all receive the same block.
    pub fn get_or_compile(
        &self,
        memory: &GuestMemory,
        pc: u32,
    ) -> Result<Arc<CompiledBlock>, JitError> {
        if let Some(block) = self.lookup(pc) {
            return Ok(block);
        }

        let mut backend = lock(&self.backend);
        loop {
            if let Some(block) = read(&self.index).by_pc.get(&pc).cloned() {
                return Ok(block);
            }

            let epoch = self.epoch.load(Ordering::SeqCst);
            let strategy = backend.compiler.strategy().clone();
            let block = build_block(memory, pc, self.max_block_insns, &strategy, |address| {
                self.pages.mark(address)
            });

            self.make_room(&mut backend);

            let exits: Box<[u32]> = block.exits().into();
            let links: Box<[LinkSlot]> = exits.iter().map(|_| LinkSlot::default()).collect();

            let backend = &mut *backend;
            let serial = backend.serial;
            backend.serial += 1;
            let name = format!("blk_{pc:08x}_{serial}");
            let Some(region) = backend.regions.back_mut() else {
                unreachable!("make_room always leaves an open region");
            };
            let Some(module) = region.module.as_mut() else {
                unreachable!("open region without a module");
            };
            let (entry, code_size) =
                backend
                    .compiler
                    .compile(module, &block, &links, self.link_blocks, &name)?;
            self.stats.compiles.fetch_add(1, Ordering::Relaxed);

            let compiled = Arc::new(CompiledBlock {
                start: pc,
                len_bytes: block.len_bytes(),
                code_size,
                entry,
                links,
                exits,
                block,
                region: region.id,
                evicted: AtomicBool::new(false),
            });
            region.bytes += code_size;
            region.blocks.push(compiled.clone());

            let mut index = write(&self.index);
            if self.epoch.load(Ordering::SeqCst) != epoch {
                // Guest code changed while it was being translated.
                compiled.evicted.store(true, Ordering::Release);
                log::debug!("*** JIT retranslating {pc:08x} after invalidation");
                continue;
            }
            assert!(
                !index.by_pc.contains_key(&pc),
                "block at {pc:08x} installed twice"
            );
            index.install(&compiled, self.link_blocks);
            return Ok(compiled);
        }
    }

    fn make_room(&self, backend: &mut Backend) {
        let full = backend
            .regions
            .back()
            .map_or(true, |r| r.bytes >= self.region_capacity);
        if !full {
            return;
        }

        let module = match new_module() {
            Ok(module) => module,
            Err(e) => {
                // Keep filling the current region; the bound is soft by one region.
                log::warn!("*** JIT could not open a new code region: {e}");
                return;
            }
        };
        backend.regions.push_back(Region {
            id: backend.next_region,
            module: Some(module),
            bytes: 0,
            blocks: vec![],
        });
        backend.next_region += 1;

        while backend.regions.len() > self.max_regions {
            let Some(region) = backend.regions.pop_front() else {
                break;
            };
            self.retire(region);
        }
    }

    fn retire(&self, region: Region) {
        {
            let mut index = write(&self.index);
            for block in &region.blocks {
                if !block.is_evicted() && index.evict(block.start).is_some() {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        log::debug!(
            "*** JIT retiring region {} ({} bytes, {} blocks)",
            region.id,
            region.bytes,
            region.blocks.len()
        );
        self.stats.retired_regions.fetch_add(1, Ordering::Relaxed);

        let _gate = write(&self.exec_gate);
        drop(region);
    }

    /// Evicts every block built from guest bytes in `[address, address + len)`.
    /// Returns whether any block was evicted.
    pub fn invalidate_range(&self, address: u32, len: u32) -> bool {
        fence(Ordering::SeqCst);
        if !self.pages.any_marked(address, len) {
            return false;
        }

        let max_span = (self.max_block_insns as u32).saturating_mul(4).saturating_add(4);
        let mut index = write(&self.index);
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let victims = index.overlapping(address, len, max_span);
        for &pc in &victims {
            index.evict(pc);
        }
        drop(index);

        if !victims.is_empty() {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
            self.stats
                .evictions
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
            log::debug!(
                "*** JIT invalidated {} block(s) at {address:08x}+{len}",
                victims.len()
            );
        }
        !victims.is_empty()
    }

    /// Evicts every block.
    pub fn flush(&self) {
        let mut index = write(&self.index);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let all = index.by_pc.keys().copied().collect::<Vec<_>>();
        for pc in all {
            index.evict(pc);
        }
    }

    /// Runs `block` and whatever it chains into. Returns false without running anything
    /// if the block was evicted since it was looked up.
    pub(crate) fn execute(
        &self,
        block: &CompiledBlock,
        state: &mut ProcessorState,
        system: &System,
    ) -> bool {
        let _gate = read(&self.exec_gate);
        if block.is_evicted() {
            return false;
        }
        // SAFETY: the block is installed and its region cannot be freed while the gate is
        // held. `state`, `system` and its call-out table outlive the call.
        unsafe {
            (self.trampoline.enter)(state, system, system.callouts(), block.entry);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_marks_cover_ranges() {
        let memory = GuestMemory::new(0x1_0000, 0x4000);
        let pages = PageMap::new(&memory);
        assert!(!pages.any_marked(0x1_0000, 0x4000));

        pages.mark(0x1_1ffc);
        assert!(pages.any_marked(0x1_1000, 4));
        assert!(pages.any_marked(0x1_0ffc, 8));
        assert!(!pages.any_marked(0x1_0ffc, 4));
        assert!(!pages.any_marked(0x1_2000, 0x1000));

        // Outside guest memory is never marked.
        pages.mark(0x10);
        assert!(!pages.any_marked(0x10, 4));
    }

    #[test]
    fn page_marks_follow_an_unaligned_base() {
        let memory = GuestMemory::new(0x100, 0x3000);
        let pages = PageMap::new(&memory);
        assert_eq!(pages.pages.len(), 3);

        pages.mark(0x100);
        assert!(pages.any_marked(0x100, 4));
        assert!(pages.any_marked(0x10fc, 4));
        assert!(!pages.any_marked(0x1100, 4));

        pages.mark(0x3000);
        assert!(pages.any_marked(0x30fc, 4));
        assert!(!pages.any_marked(0x2000, 0x100));
        assert!(pages.any_marked(0x20fc, 8));

        let empty = PageMap::new(&GuestMemory::new(0x100, 0));
        assert!(!empty.any_marked(0x100, 4));
    }

    #[test]
    fn link_slots_hold_entries() {
        let slot = LinkSlot::default();
        assert_eq!(slot.target(), 0);
        slot.set(0x1234 as *const u8);
        assert_eq!(slot.target(), 0x1234);
        slot.clear();
        assert_eq!(slot.target(), 0);
        assert_eq!(slot.addr(), &slot.0 as *const AtomicUsize as usize);
    }
}
