use cranelift::{
    codegen::ir::{Function, SigRef},
    frontend::FuncInstBuilder,
    prelude::*,
};

use crate::{
    decoder::{Cond, DecodedInstruction, ShiftType},
    interpreter::AccessKind,
    state::{flag, ProcessorState, EXIT_DATA_ABORT, PC},
};

use super::{
    abi::HostAbi,
    cache::LinkSlot,
    Callouts, JitError,
};

/// Set in a helper result when the access faulted; the low word holds the address.
pub(crate) const FAULT_BIT: u64 = 1 << 32;
/// Set in a store result when the write evicted compiled code.
pub(crate) const INVALIDATED_BIT: u64 = 1 << 33;

const NUM_CACHED: usize = 15;

/// Signature shared by every compiled block, so blocks can tail-call each other.
pub(crate) fn block_signature(ptr: Type) -> Signature {
    Signature {
        params: vec![AbiParam::new(ptr); 3],
        returns: vec![],
        call_conv: isa::CallConv::Tail,
    }
}

struct CalloutSigs {
    interpret: SigRef,
    load: SigRef,
    store: SigRef,
}

/// Function builder for one guest block.
///
/// Guest registers r0-r14 and the CPSR live in Cranelift variables for the whole block.
/// Every register the block touches is loaded on entry; `dirty` tracks which ones must be
/// written back before leaving generated code or calling into the interpreter.
pub(crate) struct Emitter<'a> {
    builder: FunctionBuilder<'a>,
    ptr: Type,
    abi: &'static HostAbi,

    state: Value,
    sys: Value,
    callouts: Value,

    regs: [Variable; NUM_CACHED],
    cpsr: Variable,
    next_pc: Variable,

    cached: u16,
    dirty: u16,
    cpsr_dirty: bool,
    filled: bool,

    block_sig: SigRef,
    sigs: CalloutSigs,
}

impl<'a> Emitter<'a> {
    pub fn new(
        func: &'a mut Function,
        builder_ctx: &'a mut FunctionBuilderContext,
        ptr: Type,
        abi: &'static HostAbi,
        cached: u16,
        cost: u32,
    ) -> Result<Self, JitError> {
        func.signature = block_signature(ptr);

        let interpret = abi.callout_signature(&[ptr, ptr, ptr], &[types::I32])?;
        let load = abi.callout_signature(&[ptr, types::I32, types::I32], &[types::I64])?;
        let store = abi.callout_signature(
            &[ptr, types::I32, types::I32, types::I32],
            &[types::I64],
        )?;

        let mut builder = FunctionBuilder::new(func, builder_ctx);

        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);

        let state = builder.block_params(entry_block)[0];
        let sys = builder.block_params(entry_block)[1];
        let callouts = builder.block_params(entry_block)[2];

        let block_sig = builder.import_signature(block_signature(ptr));
        let sigs = CalloutSigs {
            interpret: builder.import_signature(interpret),
            load: builder.import_signature(load),
            store: builder.import_signature(store),
        };

        let regs = std::array::from_fn(Variable::new);
        let cpsr = Variable::new(NUM_CACHED);
        let next_pc = Variable::new(NUM_CACHED + 1);

        let mut e = Self {
            builder,
            ptr,
            abi,
            state,
            sys,
            callouts,
            regs,
            cpsr,
            next_pc,
            cached: cached & !(1 << PC),
            dirty: 0,
            cpsr_dirty: false,
            filled: false,
            block_sig,
            sigs,
        };

        for r in 0..NUM_CACHED {
            e.builder.declare_var(e.regs[r], types::I32);
        }
        e.builder.declare_var(cpsr, types::I32);
        e.builder.declare_var(next_pc, types::I32);

        let ticks = e.load_state(ProcessorState::ticks_offset());
        let cost = e.const32(cost);
        let ticks = e.ins().isub(ticks, cost);
        e.store_state(ticks, ProcessorState::ticks_offset());

        e.reload(e.cached);
        let zero = e.const32(0);
        e.builder.def_var(next_pc, zero);

        Ok(e)
    }

    pub fn ins(&mut self) -> FuncInstBuilder<'_, 'a> {
        self.builder.ins()
    }

    pub fn const32(&mut self, value: u32) -> Value {
        self.ins().iconst(types::I32, value as i64)
    }

    fn load_state(&mut self, offset: i32) -> Value {
        let state = self.state;
        self.ins()
            .load(types::I32, MemFlags::trusted(), state, offset)
    }

    fn store_state(&mut self, value: Value, offset: i32) {
        let state = self.state;
        self.ins().store(MemFlags::trusted(), value, state, offset);
    }

    /// Reads a guest register. r15 reads as the instruction address plus 8.
    pub fn reg(&mut self, r: u8, pc_value: u32) -> Value {
        if r as usize == PC {
            self.const32(pc_value)
        } else {
            self.builder.use_var(self.regs[r as usize])
        }
    }

    pub fn set_reg(&mut self, r: u8, value: Value) {
        debug_assert!((r as usize) < NUM_CACHED);
        debug_assert!(self.cached & (1 << r) != 0, "r{r} is not cached");
        self.builder.def_var(self.regs[r as usize], value);
        self.dirty |= 1 << r;
    }

    pub fn next_pc(&mut self) -> Value {
        self.builder.use_var(self.next_pc)
    }

    pub fn set_next_pc(&mut self, value: Value) {
        self.builder.def_var(self.next_pc, value);
    }

    /// A CPSR bit as 0 or 1.
    pub fn flag(&mut self, mask: u32) -> Value {
        let cpsr = self.builder.use_var(self.cpsr);
        let bit = self.ins().ushr_imm(cpsr, mask.trailing_zeros() as i64);
        self.ins().band_imm(bit, 1)
    }

    /// Replaces one CPSR bit with `value`, which must be 0 or 1.
    pub fn set_flag(&mut self, mask: u32, value: Value) {
        let cpsr = self.builder.use_var(self.cpsr);
        let keep = self.const32(!mask);
        let cleared = self.ins().band(cpsr, keep);
        let bit = self.ins().ishl_imm(value, mask.trailing_zeros() as i64);
        let cpsr = self.ins().bor(cleared, bit);
        self.builder.def_var(self.cpsr, cpsr);
        self.cpsr_dirty = true;
    }

    pub fn set_nz(&mut self, result: Value) {
        let cpsr = self.builder.use_var(self.cpsr);
        let keep = self.const32(!(flag::N | flag::Z));
        let cleared = self.ins().band(cpsr, keep);
        let sign = self.const32(flag::N);
        let n = self.ins().band(result, sign);
        let z = self.ins().icmp_imm(IntCC::Equal, result, 0);
        let z = self.ins().uextend(types::I32, z);
        let z = self.ins().ishl_imm(z, 30);
        let nz = self.ins().bor(n, z);
        let cpsr = self.ins().bor(cleared, nz);
        self.builder.def_var(self.cpsr, cpsr);
        self.cpsr_dirty = true;
    }

    /// Evaluates a condition code against the cached CPSR. Nonzero means pass.
    pub fn condition(&mut self, cond: Cond) -> Value {
        let n = self.flag(flag::N);
        let z = self.flag(flag::Z);
        let c = self.flag(flag::C);
        let v = self.flag(flag::V);

        let not = |e: &mut Self, x: Value| e.ins().bxor_imm(x, 1);

        match cond {
            Cond::Eq => z,
            Cond::Ne => not(self, z),
            Cond::Cs => c,
            Cond::Cc => not(self, c),
            Cond::Mi => n,
            Cond::Pl => not(self, n),
            Cond::Vs => v,
            Cond::Vc => not(self, v),
            Cond::Hi | Cond::Ls => {
                let nz = not(self, z);
                let hi = self.ins().band(c, nz);
                if cond == Cond::Hi {
                    hi
                } else {
                    not(self, hi)
                }
            }
            Cond::Ge => {
                let ne = self.ins().bxor(n, v);
                not(self, ne)
            }
            Cond::Lt => self.ins().bxor(n, v),
            Cond::Gt | Cond::Le => {
                let ne = self.ins().bxor(n, v);
                let nz_or_ne = self.ins().bor(z, ne);
                if cond == Cond::Gt {
                    not(self, nz_or_ne)
                } else {
                    nz_or_ne
                }
            }
            Cond::Al => self.const32(1),
        }
    }

    /// Immediate shift with optional carry out, both as values. `amount` is normalized
    /// as decoded (1..=32, RRX by 1).
    pub fn shift_imm(
        &mut self,
        value: Value,
        shift: ShiftType,
        amount: u8,
        want_carry: bool,
    ) -> (Value, Option<Value>) {
        let n = amount as i64;
        let bit_at = |e: &mut Self, bit: i64| {
            let shifted = e.ins().ushr_imm(value, bit);
            e.ins().band_imm(shifted, 1)
        };

        let (result, carry) = match (shift, amount) {
            (ShiftType::Lsl, 0) => {
                let carry = want_carry.then(|| self.flag(flag::C));
                (value, carry)
            }
            (ShiftType::Lsl, _) => {
                let result = self.ins().ishl_imm(value, n);
                let carry = want_carry.then(|| bit_at(self, 32 - n));
                (result, carry)
            }
            (ShiftType::Lsr, 32) => {
                let result = self.const32(0);
                let carry = want_carry.then(|| bit_at(self, 31));
                (result, carry)
            }
            (ShiftType::Lsr, _) => {
                let result = self.ins().ushr_imm(value, n);
                let carry = want_carry.then(|| bit_at(self, n - 1));
                (result, carry)
            }
            (ShiftType::Asr, 32) => {
                let result = self.ins().sshr_imm(value, 31);
                let carry = want_carry.then(|| bit_at(self, 31));
                (result, carry)
            }
            (ShiftType::Asr, _) => {
                let result = self.ins().sshr_imm(value, n);
                let carry = want_carry.then(|| bit_at(self, n - 1));
                (result, carry)
            }
            (ShiftType::Ror, _) => {
                let result = self.ins().rotr_imm(value, n & 31);
                let carry = want_carry.then(|| {
                    let top = self.ins().ushr_imm(result, 31);
                    top
                });
                (result, carry)
            }
            (ShiftType::Rrx, _) => {
                let c = self.flag(flag::C);
                let top = self.ins().ishl_imm(c, 31);
                let low = self.ins().ushr_imm(value, 1);
                let result = self.ins().bor(top, low);
                let carry = want_carry.then(|| self.ins().band_imm(value, 1));
                (result, carry)
            }
        };
        (result, carry)
    }

    /// `a + b + carry_in` with carry and overflow outs as 0/1 values.
    pub fn add_with_carry(&mut self, a: Value, b: Value, carry_in: Value) -> (Value, Value, Value) {
        let a64 = self.ins().uextend(types::I64, a);
        let b64 = self.ins().uextend(types::I64, b);
        let c64 = self.ins().uextend(types::I64, carry_in);
        let sum = self.ins().iadd(a64, b64);
        let sum = self.ins().iadd(sum, c64);
        let result = self.ins().ireduce(types::I32, sum);
        let carry = self.ins().ushr_imm(sum, 32);
        let carry = self.ins().ireduce(types::I32, carry);
        let ar = self.ins().bxor(a, result);
        let br = self.ins().bxor(b, result);
        let both = self.ins().band(ar, br);
        let overflow = self.ins().ushr_imm(both, 31);
        (result, carry, overflow)
    }

    pub fn create_block(&mut self) -> Block {
        self.builder.create_block()
    }

    pub fn switch_to(&mut self, block: Block) {
        self.builder.switch_to_block(block);
        self.filled = false;
    }

    /// Branches around the following code when `cond` fails. Pair with [`Self::end_guard`].
    pub fn guard(&mut self, cond: Cond) -> Option<Block> {
        if cond == Cond::Al {
            return None;
        }
        let pass = self.condition(cond);
        let exec = self.builder.create_block();
        let join = self.builder.create_block();
        self.ins().brif(pass, exec, &[], join, &[]);
        self.switch_to(exec);
        Some(join)
    }

    pub fn end_guard(&mut self, join: Option<Block>) {
        if let Some(join) = join {
            if !self.filled {
                self.ins().jump(join, &[]);
            }
            self.switch_to(join);
        }
    }

    /// Writes dirty guest registers and the CPSR back to processor state.
    pub fn commit(&mut self) {
        for r in 0..NUM_CACHED {
            if self.dirty & (1 << r) != 0 {
                let v = self.builder.use_var(self.regs[r]);
                self.store_state(v, ProcessorState::reg_offset(r));
            }
        }
        if self.cpsr_dirty {
            let v = self.builder.use_var(self.cpsr);
            self.store_state(v, ProcessorState::cpsr_offset());
        }
    }

    fn reload(&mut self, mask: u16) {
        for r in 0..NUM_CACHED {
            if mask & self.cached & (1 << r) != 0 {
                let v = self.load_state(ProcessorState::reg_offset(r));
                self.builder.def_var(self.regs[r], v);
            }
        }
        let cpsr = self.load_state(ProcessorState::cpsr_offset());
        self.builder.def_var(self.cpsr, cpsr);
    }

    fn callout_fn(&mut self, offset: usize) -> Value {
        let (ptr, callouts) = (self.ptr, self.callouts);
        self.ins()
            .load(ptr, MemFlags::trusted(), callouts, offset as i32)
    }

    fn return_if(&mut self, cond: Value) {
        let stop = self.builder.create_block();
        let cont = self.builder.create_block();
        self.ins().brif(cond, stop, &[], cont, &[]);
        self.switch_to(stop);
        self.ins().return_(&[]);
        self.switch_to(cont);
    }

    /// Calls the interpreter for `inst`. Processor state is authoritative across the call,
    /// and a nonzero status returns to the dispatcher immediately.
    pub fn interpret(&mut self, inst: &DecodedInstruction) {
        self.commit();

        let func = self.callout_fn(Callouts::interpret_offset());
        let ptr = self.ptr;
        let inst_ptr = self
            .ins()
            .iconst(ptr, inst as *const DecodedInstruction as i64);
        let (sys, state, sig) = (self.sys, self.state, self.sigs.interpret);
        let call = self.ins().call_indirect(sig, func, &[sys, state, inst_ptr]);
        let status = self.builder.inst_results(call)[0];
        self.return_if(status);

        let live = self.cached.count_ones() as usize;
        if self.abi.keeps_live_across_call(live) {
            self.reload(inst.writes());
        } else {
            self.reload(self.cached);
        }
    }

    /// Loads through the memory helper. A fault raises a data abort at `inst_address`.
    pub fn load_mem(&mut self, address: Value, kind: AccessKind, inst_address: u32) -> Value {
        let func = self.callout_fn(Callouts::load_offset());
        let kind = self.const32(kind as u32);
        let (sys, sig) = (self.sys, self.sigs.load);
        let call = self.ins().call_indirect(sig, func, &[sys, address, kind]);
        let result = self.builder.inst_results(call)[0];
        self.fault_check(result, inst_address);
        self.ins().ireduce(types::I32, result)
    }

    /// Stores through the memory helper and returns the raw helper status.
    pub fn store_mem(
        &mut self,
        address: Value,
        value: Value,
        kind: AccessKind,
        inst_address: u32,
    ) -> Value {
        let func = self.callout_fn(Callouts::store_offset());
        let kind = self.const32(kind as u32);
        let (sys, sig) = (self.sys, self.sigs.store);
        let call = self
            .ins()
            .call_indirect(sig, func, &[sys, address, value, kind]);
        let result = self.builder.inst_results(call)[0];
        self.fault_check(result, inst_address);
        result
    }

    fn fault_check(&mut self, result: Value, inst_address: u32) {
        let fault = self.ins().band_imm(result, FAULT_BIT as i64);
        let fault_block = self.builder.create_block();
        let ok = self.builder.create_block();
        self.ins().brif(fault, fault_block, &[], ok, &[]);

        self.switch_to(fault_block);
        let address = self.ins().ireduce(types::I32, result);
        self.raise(EXIT_DATA_ABORT, address, inst_address);

        self.switch_to(ok);
    }

    /// Leaves for the dispatcher at `next` if a store evicted compiled code.
    pub fn exit_if_invalidated(&mut self, status: Value, next: u32) {
        let hit = self.ins().band_imm(status, INVALIDATED_BIT as i64);
        let stop = self.builder.create_block();
        let cont = self.builder.create_block();
        self.ins().brif(hit, stop, &[], cont, &[]);

        self.switch_to(stop);
        let next = self.const32(next);
        self.exit_to_dispatcher(Some(next));

        self.switch_to(cont);
    }

    /// Records a guest exception and returns.
    pub fn raise(&mut self, code: u32, info: Value, pc: u32) {
        let pc = self.const32(pc);
        self.store_state(pc, ProcessorState::reg_offset(PC));
        let code = self.const32(code);
        self.store_state(code, ProcessorState::exit_offset());
        self.store_state(info, ProcessorState::exit_info_offset());
        self.commit();
        self.ins().return_(&[]);
        self.filled = true;
    }

    /// Returns to the dispatcher. `None` keeps the pc a call-out already stored.
    pub fn exit_to_dispatcher(&mut self, pc: Option<Value>) {
        if let Some(pc) = pc {
            self.store_state(pc, ProcessorState::reg_offset(PC));
        }
        self.commit();
        self.ins().return_(&[]);
        self.filled = true;
    }

    /// Static exit to `target` through a link slot. The slot is read atomically and
    /// followed only while the tick budget lasts.
    pub fn exit_linked(&mut self, slot: &LinkSlot, target: u32, link: bool) {
        let pc = self.const32(target);
        self.store_state(pc, ProcessorState::reg_offset(PC));
        self.commit();

        if !link {
            self.ins().return_(&[]);
            self.filled = true;
            return;
        }

        let ticks = self.load_state(ProcessorState::ticks_offset());
        let has_budget = self.ins().icmp_imm(IntCC::SignedGreaterThan, ticks, 0);
        let ptr = self.ptr;
        let slot_addr = self.ins().iconst(ptr, slot.addr() as i64);
        let next = self
            .ins()
            .atomic_load(ptr, MemFlags::trusted(), slot_addr);
        let linked = self.ins().icmp_imm(IntCC::NotEqual, next, 0);
        let go = self.ins().band(has_budget, linked);

        let chain = self.builder.create_block();
        let ret = self.builder.create_block();
        self.ins().brif(go, chain, &[], ret, &[]);

        self.switch_to(chain);
        let (sig, state, sys, callouts) = (self.block_sig, self.state, self.sys, self.callouts);
        self.ins()
            .return_call_indirect(sig, next, &[state, sys, callouts]);

        self.switch_to(ret);
        self.ins().return_(&[]);
        self.filled = true;
    }

    pub fn is_filled(&self) -> bool {
        self.filled
    }

    pub fn finish(mut self) {
        if !self.filled {
            self.ins().return_(&[]);
        }
        self.builder.seal_all_blocks();
        self.builder.finalize();
    }
}
