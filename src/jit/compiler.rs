use std::collections::HashMap;

use cranelift::{codegen, prelude::*};
use cranelift_jit::JITModule;
use cranelift_module::{Linkage, Module};
use log::{log_enabled, Level};

use crate::{
    decoder::{
        decode, Cond, DecodedInstruction, MemOffset, Op, OpClass, Operand, ShiftBy, ShiftType,
        UndefinedInstruction,
    },
    interpreter::AccessKind,
    memory::GuestMemory,
    state::{flag, EXIT_BREAKPOINT, EXIT_PREFETCH_ABORT, EXIT_SYSTEM_CALL, EXIT_UNDEFINED, LR, PC},
};

use super::{abi::HostAbi, cache::LinkSlot, emitter::Emitter, JitError};

/// How instructions of one class are translated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Inline host code.
    Native,
    /// A call into the interpreter for that single instruction.
    Interpreter,
}

/// Per-class translation strategy. Classes without native support always use the
/// interpreter, whatever the table says.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StrategyTable([Strategy; OpClass::COUNT]);

impl Default for StrategyTable {
    fn default() -> Self {
        let mut table = Self::all(Strategy::Native);
        for class in [
            OpClass::DataProcessingRegShift,
            OpClass::MultiplyLong,
            OpClass::BlockTransfer,
            OpClass::StatusAccess,
            OpClass::ByteReverse,
            OpClass::SaturatingArith,
            OpClass::SumAbsoluteDifference,
        ] {
            table.set(class, Strategy::Interpreter);
        }
        table
    }
}

impl StrategyTable {
    pub fn all(strategy: Strategy) -> Self {
        Self([strategy; OpClass::COUNT])
    }

    pub fn get(&self, class: OpClass) -> Strategy {
        self.0[class.index()]
    }

    pub fn set(&mut self, class: OpClass, strategy: Strategy) {
        self.0[class.index()] = strategy;
    }

    pub fn with(mut self, class: OpClass, strategy: Strategy) -> Self {
        self.set(class, strategy);
        self
    }

    /// Whether `inst` is translated inline.
    pub fn is_native(&self, inst: &DecodedInstruction) -> bool {
        self.get(inst.class) == Strategy::Native && translatable(inst)
    }
}

fn translatable(inst: &DecodedInstruction) -> bool {
    let supported = matches!(
        inst.class,
        OpClass::DataProcessing
            | OpClass::Multiply
            | OpClass::LoadStore
            | OpClass::LoadStoreExtra
            | OpClass::Branch
            | OpClass::BranchExchange
            | OpClass::SoftwareInterrupt
            | OpClass::Breakpoint
            | OpClass::CountLeadingZeros
            | OpClass::Extend
    );
    let writes_pc = inst.writes() & (1 << PC) != 0;
    supported
        && (!writes_pc
            || matches!(
                inst.class,
                OpClass::DataProcessing | OpClass::Branch | OpClass::BranchExchange
            ))
}

/// How control leaves a basic block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockExit {
    /// Ends in an always-taken direct branch.
    Unconditional(u32),
    /// Ends in a conditional direct branch.
    Conditional { taken: u32, fallthrough: u32 },
    /// Stopped at the instruction limit; execution continues at the address.
    Fallthrough(u32),
    /// The last instruction computes the next pc at run time.
    Dispatcher,
    /// The word after the last instruction does not decode.
    Fault(UndefinedInstruction),
    /// The word after the last instruction is outside guest memory.
    FetchFault(u32),
}

/// A straight-line run of guest instructions, ready for translation.
#[derive(Debug)]
pub struct BasicBlock {
    pub start: u32,
    pub insts: Box<[DecodedInstruction]>,
    pub exit: BlockExit,
}

impl BasicBlock {
    /// Bytes of guest code the block was built from, faulting word included.
    pub fn len_bytes(&self) -> u32 {
        let words = self.insts.len() + matches!(self.exit, BlockExit::Fault(_)) as usize;
        words as u32 * 4
    }

    /// Static successors, in link slot order.
    pub fn exits(&self) -> Vec<u32> {
        match self.exit {
            BlockExit::Unconditional(target) | BlockExit::Fallthrough(target) => vec![target],
            BlockExit::Conditional { taken, fallthrough } => vec![taken, fallthrough],
            _ => vec![],
        }
    }

    /// Registers r0-r14 the block reads or writes.
    fn touched(&self) -> u16 {
        self.insts
            .iter()
            .fold(0, |mask, inst| mask | inst.reads() | inst.writes())
            & !(1 << PC)
    }

    fn cost(&self) -> u32 {
        self.insts.len().max(1) as u32
    }
}

/// Decodes guest code from `start` until a terminal instruction, a decode or fetch fault,
/// or `max_insns` instructions. `mark` sees every word address before it is read.
pub fn build_block(
    memory: &GuestMemory,
    start: u32,
    max_insns: usize,
    strategy: &StrategyTable,
    mut mark: impl FnMut(u32),
) -> BasicBlock {
    let max_insns = max_insns.max(1);
    let mut insts = Vec::new();
    let mut address = start;

    let exit = loop {
        mark(address);
        let Ok(word) = memory.read_u32(address) else {
            break BlockExit::FetchFault(address);
        };
        let inst = match decode(word, address) {
            Ok(inst) => inst,
            Err(fault) => break BlockExit::Fault(fault),
        };
        insts.push(inst);

        if inst.is_terminal() {
            break match inst.branch_target() {
                Some(target) if strategy.is_native(&inst) => {
                    if inst.cond == Cond::Al {
                        BlockExit::Unconditional(target)
                    } else {
                        BlockExit::Conditional {
                            taken: target,
                            fallthrough: inst.next_address(),
                        }
                    }
                }
                _ => BlockExit::Dispatcher,
            };
        }

        address = inst.next_address();
        if insts.len() >= max_insns {
            break BlockExit::Fallthrough(address);
        }
    };

    BasicBlock {
        start,
        insts: insts.into_boxed_slice(),
        exit,
    }
}

/// Translates basic blocks into host code through Cranelift.
pub struct Compiler {
    ctx: codegen::Context,
    builder_ctx: FunctionBuilderContext,
    strategy: StrategyTable,
    abi: &'static HostAbi,
    sizes: HashMap<usize, usize>,
}

impl Drop for Compiler {
    fn drop(&mut self) {
        if log_enabled!(Level::Info) {
            log::info!("*** JIT block sizes:");

            let mut sizes = self.sizes.iter().collect::<Vec<_>>();
            sizes.sort();

            for (size, count) in sizes {
                log::info!("    {} insts: {}", size, count);
            }
        }
    }
}

impl Compiler {
    pub fn new(module: &JITModule, strategy: StrategyTable, abi: &'static HostAbi) -> Self {
        Self {
            ctx: module.make_context(),
            builder_ctx: FunctionBuilderContext::new(),
            strategy,
            abi,
            sizes: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> &StrategyTable {
        &self.strategy
    }

    /// Compiles `block` into `module` and returns its entry point and code size.
    /// `links` must outlive the generated code; exits read them on every run.
    pub fn compile(
        &mut self,
        module: &mut JITModule,
        block: &BasicBlock,
        links: &[LinkSlot],
        link_blocks: bool,
        name: &str,
    ) -> Result<(*const u8, usize), JitError> {
        if log_enabled!(Level::Info) {
            log::info!(
                "*** JIT compiling block at pc={:08x}:{:08x} ({} insts)",
                block.start,
                block.start.wrapping_add(block.len_bytes()),
                block.insts.len()
            );
            for inst in block.insts.iter() {
                log::info!("    {:#010x}: {:08x}   {inst}", inst.address, inst.word);
            }
            log::info!("    exit: {:?}", block.exit);
            log::info!("");
        }

        let result = self.define(module, block, links, link_blocks, name);
        module.clear_context(&mut self.ctx);
        let (id, code_size) = result?;

        module.finalize_definitions()?;

        *self.sizes.entry(block.insts.len()).or_default() += 1;

        Ok((module.get_finalized_function(id), code_size))
    }

    fn define(
        &mut self,
        module: &mut JITModule,
        block: &BasicBlock,
        links: &[LinkSlot],
        link_blocks: bool,
        name: &str,
    ) -> Result<(cranelift_module::FuncId, usize), JitError> {
        let ptr = module.target_config().pointer_type();
        let Self {
            ctx,
            builder_ctx,
            strategy,
            abi,
            ..
        } = self;

        let mut e = Emitter::new(
            &mut ctx.func,
            builder_ctx,
            ptr,
            *abi,
            block.touched(),
            block.cost(),
        )?;
        Translator { strategy: &*strategy }.translate(&mut e, block, links, link_blocks);
        e.finish();

        if log_enabled!(Level::Info) {
            ctx.set_disasm(true);
        }

        let id = module.declare_function(name, Linkage::Local, &ctx.func.signature)?;
        module.define_function(id, ctx)?;

        let compiled = ctx.compiled_code();
        let code_size = compiled.map_or(0, |code| code.code_buffer().len());

        if log_enabled!(Level::Info) {
            if let Some(vcode) = compiled.and_then(|code| code.vcode.as_ref()) {
                log::info!("*** Generated Assembly:");
                log::info!("{vcode}");
            }
        }

        Ok((id, code_size))
    }
}

/// Lowers guest instructions into an `Emitter` according to a strategy table.
struct Translator<'a> {
    strategy: &'a StrategyTable,
}

impl Translator<'_> {
    fn translate(
        &self,
        e: &mut Emitter,
        block: &BasicBlock,
        links: &[LinkSlot],
        link_blocks: bool,
    ) {
        let (body, last) = match block.exit {
            BlockExit::Unconditional(_) | BlockExit::Conditional { .. } | BlockExit::Dispatcher => {
                match block.insts.split_last() {
                    Some((last, body)) => (body, Some(last)),
                    None => (&block.insts[..], None),
                }
            }
            _ => (&block.insts[..], None),
        };

        for inst in body {
            self.instruction(e, inst);
        }

        match (block.exit, last) {
            (BlockExit::Unconditional(target), Some(inst)) => {
                self.link_register(e, inst);
                e.exit_linked(&links[0], target, link_blocks);
            }
            (BlockExit::Conditional { taken, fallthrough }, Some(inst)) => {
                let join = e.guard(inst.cond);
                self.link_register(e, inst);
                e.exit_linked(&links[0], taken, link_blocks);
                e.end_guard(join);
                e.exit_linked(&links[1], fallthrough, link_blocks);
            }
            (BlockExit::Dispatcher, Some(inst)) => self.terminal(e, inst),
            (BlockExit::Fallthrough(next), _) => e.exit_linked(&links[0], next, link_blocks),
            (BlockExit::Fault(fault), _) => {
                let word = e.const32(fault.word);
                e.raise(EXIT_UNDEFINED, word, fault.address);
            }
            (BlockExit::FetchFault(address), _) => {
                let info = e.const32(address);
                e.raise(EXIT_PREFETCH_ABORT, info, address);
            }
            (exit, None) => unreachable!("{exit:?} without a final instruction"),
        }
    }

    fn link_register(&self, e: &mut Emitter, inst: &DecodedInstruction) {
        if matches!(inst.op, Op::Bl | Op::Blx) {
            let ret = e.const32(inst.next_address());
            e.set_reg(LR as u8, ret);
        }
    }

    /// The final instruction of a block whose successor is only known at run time.
    fn terminal(&self, e: &mut Emitter, inst: &DecodedInstruction) {
        if !self.strategy.is_native(inst) {
            e.interpret(inst);
            e.exit_to_dispatcher(None);
            return;
        }

        let next = e.const32(inst.next_address());
        e.set_next_pc(next);
        self.instruction(e, inst);
        if !e.is_filled() {
            let target = e.next_pc();
            e.exit_to_dispatcher(Some(target));
        }
    }

    fn instruction(&self, e: &mut Emitter, inst: &DecodedInstruction) {
        if !self.strategy.is_native(inst) {
            e.interpret(inst);
            return;
        }

        let join = e.guard(inst.cond);
        match inst.class {
            OpClass::DataProcessing => self.data_processing(e, inst),
            OpClass::Multiply => self.multiply(e, inst),
            OpClass::LoadStore | OpClass::LoadStoreExtra => self.load_store(e, inst),
            OpClass::Branch | OpClass::BranchExchange => self.branch(e, inst),
            OpClass::SoftwareInterrupt => {
                let number = e.const32(imm(inst));
                e.raise(EXIT_SYSTEM_CALL, number, inst.next_address());
            }
            OpClass::Breakpoint => {
                let number = e.const32(imm(inst) & 0xffff);
                e.raise(EXIT_BREAKPOINT, number, inst.address);
            }
            OpClass::CountLeadingZeros => {
                let value = self.operand(e, inst, 1);
                let result = e.ins().clz(value);
                set_dest(e, inst, result);
            }
            OpClass::Extend => {
                let value = self.operand(e, inst, 1);
                let result = match inst.op {
                    Op::Sxtb => {
                        let narrow = e.ins().ireduce(types::I8, value);
                        e.ins().sextend(types::I32, narrow)
                    }
                    Op::Sxth => {
                        let narrow = e.ins().ireduce(types::I16, value);
                        e.ins().sextend(types::I32, narrow)
                    }
                    Op::Uxtb => e.ins().band_imm(value, 0xff),
                    _ => e.ins().band_imm(value, 0xffff),
                };
                set_dest(e, inst, result);
            }
            class => unreachable!("{class:?} has no native translation"),
        }
        e.end_guard(join);
    }

    /// Register, immediate or immediate-shifted operand value.
    fn operand(&self, e: &mut Emitter, inst: &DecodedInstruction, index: usize) -> Value {
        self.shifter(e, inst, index, false).0
    }

    fn shifter(
        &self,
        e: &mut Emitter,
        inst: &DecodedInstruction,
        index: usize,
        want_carry: bool,
    ) -> (Value, Option<Value>) {
        match inst.operands[index] {
            Operand::Reg(r) => (e.reg(r, inst.pc_value()), None),
            Operand::RotatedImm { value, rotate } => {
                let carry = (want_carry && rotate != 0).then(|| e.const32(value >> 31));
                (e.const32(value), carry)
            }
            Operand::Shifted {
                rm,
                shift,
                by: ShiftBy::Imm(amount),
            } => {
                let value = e.reg(rm, inst.pc_value());
                e.shift_imm(value, shift, amount, want_carry)
            }
            other => unreachable!("not a native shifter operand: {other:?}"),
        }
    }

    fn data_processing(&self, e: &mut Emitter, inst: &DecodedInstruction) {
        let (op2, shifter_carry) = self.shifter(e, inst, 2, inst.set_flags);
        let rn = match inst.operands[1] {
            Operand::Reg(r) => e.reg(r, inst.pc_value()),
            _ => e.const32(0),
        };

        let (result, arith) = match inst.op {
            Op::And | Op::Tst => (e.ins().band(rn, op2), None),
            Op::Eor | Op::Teq => (e.ins().bxor(rn, op2), None),
            Op::Orr => (e.ins().bor(rn, op2), None),
            Op::Bic => (e.ins().band_not(rn, op2), None),
            Op::Mov => (op2, None),
            Op::Mvn => (e.ins().bnot(op2), None),
            op => {
                let (a, b, carry_in) = match op {
                    Op::Sub | Op::Cmp => (rn, e.ins().bnot(op2), e.const32(1)),
                    Op::Rsb => (op2, e.ins().bnot(rn), e.const32(1)),
                    Op::Add | Op::Cmn => (rn, op2, e.const32(0)),
                    Op::Adc => (rn, op2, e.flag(flag::C)),
                    Op::Sbc => (rn, e.ins().bnot(op2), e.flag(flag::C)),
                    Op::Rsc => (op2, e.ins().bnot(rn), e.flag(flag::C)),
                    op => unreachable!("{op:?} is not data processing"),
                };
                let (result, carry, overflow) = e.add_with_carry(a, b, carry_in);
                (result, Some((carry, overflow)))
            }
        };

        if inst.set_flags {
            e.set_nz(result);
            match (arith, shifter_carry) {
                (Some((carry, overflow)), _) => {
                    e.set_flag(flag::C, carry);
                    e.set_flag(flag::V, overflow);
                }
                (None, Some(carry)) => e.set_flag(flag::C, carry),
                (None, None) => {}
            }
        }

        match inst.operands[0].reg() {
            Some(PC) => {
                let target = e.ins().band_imm(result, !3u32 as i64);
                e.set_next_pc(target);
            }
            Some(rd) => e.set_reg(rd as u8, result),
            None => {}
        }
    }

    fn multiply(&self, e: &mut Emitter, inst: &DecodedInstruction) {
        let rm = self.operand(e, inst, 1);
        let rs = self.operand(e, inst, 2);
        let mut result = e.ins().imul(rm, rs);
        if inst.op == Op::Mla {
            let rn = self.operand(e, inst, 3);
            result = e.ins().iadd(result, rn);
        }
        if inst.set_flags {
            e.set_nz(result);
        }
        set_dest(e, inst, result);
    }

    fn load_store(&self, e: &mut Emitter, inst: &DecodedInstruction) {
        let (Some(rt), Operand::Mem(mem)) = (inst.operands[0].reg(), inst.operands[1]) else {
            unreachable!("malformed load/store {inst:?}");
        };
        let pc_value = inst.pc_value();
        let kind = AccessKind::of(inst.op);

        let base = e.reg(mem.base, pc_value);
        let offset = match mem.offset {
            MemOffset::Imm(n) => e.const32(n),
            MemOffset::Reg { rm, shift, amount } => {
                let value = e.reg(rm, pc_value);
                match (shift, amount) {
                    (ShiftType::Lsl, 0) => value,
                    _ => e.shift_imm(value, shift, amount, false).0,
                }
            }
        };
        let offset_address = if mem.add {
            e.ins().iadd(base, offset)
        } else {
            e.ins().isub(base, offset)
        };
        let address = if mem.pre { offset_address } else { base };

        if inst.op.is_load() {
            let value = e.load_mem(address, kind, inst.address);
            if mem.writeback {
                e.set_reg(mem.base, offset_address);
            }
            e.set_reg(rt as u8, value);
        } else {
            let value = e.reg(rt as u8, pc_value);
            let status = e.store_mem(address, value, kind, inst.address);
            if mem.writeback {
                e.set_reg(mem.base, offset_address);
            }
            e.exit_if_invalidated(status, inst.next_address());
        }
    }

    fn branch(&self, e: &mut Emitter, inst: &DecodedInstruction) {
        let target = match inst.operands[0] {
            Operand::Imm(target) => e.const32(target),
            Operand::Reg(rm) => {
                let target = e.reg(rm, inst.pc_value());
                let thumb = e.ins().band_imm(target, 1);
                let fault = e.create_block();
                let ok = e.create_block();
                e.ins().brif(thumb, fault, &[], ok, &[]);

                e.switch_to(fault);
                let word = e.const32(inst.word);
                e.raise(EXIT_UNDEFINED, word, inst.address);

                e.switch_to(ok);
                e.ins().band_imm(target, !3u32 as i64)
            }
            other => unreachable!("bad branch operand {other:?}"),
        };
        self.link_register(e, inst);
        e.set_next_pc(target);
    }
}

fn imm(inst: &DecodedInstruction) -> u32 {
    match inst.operands[0] {
        Operand::Imm(value) => value,
        other => unreachable!("expected immediate operand, got {other:?}"),
    }
}

fn set_dest(e: &mut Emitter, inst: &DecodedInstruction, value: Value) {
    if let Some(rd) = inst.operands[0].reg() {
        e.set_reg(rd as u8, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(words: &[u32]) -> GuestMemory {
        let memory = GuestMemory::new(0x1000, 0x1000);
        for (i, &word) in words.iter().enumerate() {
            memory.write_u32(0x1000 + i as u32 * 4, word).unwrap();
        }
        memory
    }

    #[test]
    fn default_strategy_keeps_rare_classes_in_the_interpreter() {
        let table = StrategyTable::default();
        assert_eq!(table.get(OpClass::DataProcessing), Strategy::Native);
        assert_eq!(table.get(OpClass::LoadStore), Strategy::Native);
        assert_eq!(table.get(OpClass::BlockTransfer), Strategy::Interpreter);
        assert_eq!(table.get(OpClass::StatusAccess), Strategy::Interpreter);

        let table = table.with(OpClass::LoadStore, Strategy::Interpreter);
        assert_eq!(table.get(OpClass::LoadStore), Strategy::Interpreter);
    }

    #[test]
    fn pc_writes_outside_branches_use_the_interpreter() {
        let table = StrategyTable::all(Strategy::Native);
        // ldr pc, [sp], #4
        let pop = decode(0xe49d_f004, 0).unwrap();
        assert!(!table.is_native(&pop));
        // mov pc, lr
        let ret = decode(0xe1a0_f00e, 0).unwrap();
        assert!(table.is_native(&ret));
        // ldmia sp!, {r4, pc} has no native form at all
        let ldm = decode(0xe8bd_8010, 0).unwrap();
        assert!(!table.is_native(&ldm));
    }

    #[test]
    fn block_ends_at_branch() {
        // add r0, r0, #1 ; cmp r0, #10 ; bne 0x1000 ; mov r1, r0
        let memory = image(&[0xe280_0001, 0xe350_000a, 0x1aff_fffc, 0xe1a0_1000]);
        let mut marked = vec![];
        let block = build_block(&memory, 0x1000, 64, &StrategyTable::default(), |a| {
            marked.push(a)
        });
        assert_eq!(block.insts.len(), 3);
        assert_eq!(
            block.exit,
            BlockExit::Conditional {
                taken: 0x1000,
                fallthrough: 0x100c
            }
        );
        assert_eq!(block.exits(), vec![0x1000, 0x100c]);
        assert_eq!(block.len_bytes(), 12);
        assert_eq!(marked, vec![0x1000, 0x1004, 0x1008]);
        assert_eq!(block.touched(), 0b1);
    }

    #[test]
    fn block_respects_instruction_limit_and_faults() {
        let memory = image(&[0xe1a0_0000; 8]);
        let block = build_block(&memory, 0x1000, 3, &StrategyTable::default(), |_| {});
        assert_eq!(block.exit, BlockExit::Fallthrough(0x100c));

        let block = build_block(&memory, 0x1000, 0, &StrategyTable::default(), |_| {});
        assert_eq!(block.insts.len(), 1);

        let memory = image(&[0xe1a0_0000, 0xee00_0a10]);
        let block = build_block(&memory, 0x1000, 64, &StrategyTable::default(), |_| {});
        assert!(matches!(block.exit, BlockExit::Fault(f) if f.address == 0x1004));
        assert_eq!(block.len_bytes(), 8);

        let block = build_block(&memory, 0x1ffc, 64, &StrategyTable::default(), |_| {});
        assert_eq!(block.exit, BlockExit::FetchFault(0x2000));
    }

    #[test]
    fn compiles_a_block_into_a_module() {
        // add r0, r0, #1 ; cmp r0, #10 ; bne 0x1000
        let memory = image(&[0xe280_0001, 0xe350_000a, 0x1aff_fffc]);
        let block = build_block(&memory, 0x1000, 64, &StrategyTable::default(), |_| {});
        let links = block
            .exits()
            .iter()
            .map(|_| LinkSlot::default())
            .collect::<Vec<_>>();

        let mut module = crate::jit::cache::new_module().unwrap();
        let mut compiler = Compiler::new(&module, StrategyTable::default(), crate::jit::abi::HOST);
        let (entry, size) = compiler
            .compile(&mut module, &block, &links, true, "blk_1000")
            .unwrap();
        assert!(!entry.is_null());
        assert!(size > 0);
        assert_eq!(compiler.sizes.get(&3), Some(&1));

        drop(compiler);
        unsafe { module.free_memory() };
    }

    #[test]
    fn interpreted_branches_go_through_the_dispatcher() {
        let memory = image(&[0xea00_0000]);
        let table = StrategyTable::default().with(OpClass::Branch, Strategy::Interpreter);
        let block = build_block(&memory, 0x1000, 64, &table, |_| {});
        assert_eq!(block.exit, BlockExit::Dispatcher);
        assert!(block.exits().is_empty());
    }
}
