use std::collections::HashMap;

use log::{log_enabled, Level};

use crate::{
    decoder::{
        decode, BlockMode, DecodedInstruction, MemOffset, MemOperand, Op, OpClass, Operand,
        ShiftBy, ShiftType,
    },
    memory::{GuestMemory, MemoryFault},
    state::{flag, ExitReason, Mode, ProcessorState, LR, PC},
};

/// Guest memory as seen by one executing instruction.
pub trait Bus {
    fn read_u8(&self, address: u32) -> Result<u8, MemoryFault>;
    fn read_u16(&self, address: u32) -> Result<u16, MemoryFault>;
    fn read_u32(&self, address: u32) -> Result<u32, MemoryFault>;
    fn write_u8(&self, address: u32, value: u8) -> Result<(), MemoryFault>;
    fn write_u16(&self, address: u32, value: u16) -> Result<(), MemoryFault>;
    fn write_u32(&self, address: u32, value: u32) -> Result<(), MemoryFault>;
}

/// Width and extension of a single load or store. The discriminants are passed to the
/// memory helpers by generated code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AccessKind {
    Word = 0,
    Byte = 1,
    Half = 2,
    SignedByte = 3,
    SignedHalf = 4,
}

impl AccessKind {
    pub fn of(op: Op) -> Self {
        match op {
            Op::Ldrb | Op::Strb => AccessKind::Byte,
            Op::Ldrh | Op::Strh => AccessKind::Half,
            Op::Ldrsb => AccessKind::SignedByte,
            Op::Ldrsh => AccessKind::SignedHalf,
            _ => AccessKind::Word,
        }
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        [
            AccessKind::Word,
            AccessKind::Byte,
            AccessKind::Half,
            AccessKind::SignedByte,
            AccessKind::SignedHalf,
        ]
        .get(raw as usize)
        .copied()
    }
}

/// Loads with ARMv6 legacy alignment: unaligned words are rotated, halfwords are
/// aligned down.
pub fn load<B: Bus + ?Sized>(bus: &B, kind: AccessKind, address: u32) -> Result<u32, MemoryFault> {
    Ok(match kind {
        AccessKind::Word => bus.read_u32(address & !3)?.rotate_right(8 * (address & 3)),
        AccessKind::Byte => bus.read_u8(address)? as u32,
        AccessKind::Half => bus.read_u16(address & !1)? as u32,
        AccessKind::SignedByte => bus.read_u8(address)? as i8 as i32 as u32,
        AccessKind::SignedHalf => bus.read_u16(address & !1)? as i16 as i32 as u32,
    })
}

/// Stores ignore the low address bits below the access size.
pub fn store<B: Bus + ?Sized>(
    bus: &B,
    kind: AccessKind,
    address: u32,
    value: u32,
) -> Result<(), MemoryFault> {
    match kind {
        AccessKind::Word => bus.write_u32(address & !3, value),
        AccessKind::Byte | AccessKind::SignedByte => bus.write_u8(address, value as u8),
        AccessKind::Half | AccessKind::SignedHalf => bus.write_u16(address & !1, value as u16),
    }
}

/// Barrel shifter. Returns the result and the shifter carry out.
pub fn shift_c(value: u32, shift: ShiftType, amount: u32, carry: bool) -> (u32, bool) {
    if amount == 0 && shift != ShiftType::Rrx {
        return (value, carry);
    }
    match shift {
        ShiftType::Lsl => match amount {
            1..=31 => (value << amount, (value >> (32 - amount)) & 1 != 0),
            32 => (0, value & 1 != 0),
            _ => (0, false),
        },
        ShiftType::Lsr => match amount {
            1..=31 => (value >> amount, (value >> (amount - 1)) & 1 != 0),
            32 => (0, value >> 31 != 0),
            _ => (0, false),
        },
        ShiftType::Asr => match amount {
            1..=31 => (
                ((value as i32) >> amount) as u32,
                (value >> (amount - 1)) & 1 != 0,
            ),
            _ => {
                let fill = ((value as i32) >> 31) as u32;
                (fill, fill & 1 != 0)
            }
        },
        ShiftType::Ror => {
            let result = value.rotate_right(amount & 31);
            (result, result >> 31 != 0)
        }
        ShiftType::Rrx => ((value >> 1) | ((carry as u32) << 31), value & 1 != 0),
    }
}

/// Returns `(result, carry, overflow)`.
pub fn add_with_carry(a: u32, b: u32, carry: bool) -> (u32, bool, bool) {
    let wide = a as u64 + b as u64 + carry as u64;
    let result = wide as u32;
    let overflow = ((a ^ result) & (b ^ result)) >> 31 != 0;
    (result, wide >> 32 != 0, overflow)
}

fn saturate(value: i64) -> (u32, bool) {
    if value > i32::MAX as i64 {
        (i32::MAX as u32, true)
    } else if value < i32::MIN as i64 {
        (i32::MIN as u32, true)
    } else {
        (value as u32, false)
    }
}

enum Fault {
    Data(u32),
    Undefined,
}

impl From<MemoryFault> for Fault {
    fn from(fault: MemoryFault) -> Self {
        Fault::Data(fault.address)
    }
}

type Exec = Result<(), Fault>;

/// Executes one decoded instruction.
///
/// The pc is advanced first, then the condition is checked. Exceptions are reported
/// through the pending exit in `state`; a faulting instruction leaves every register
/// except the pc untouched and the pc pointing at itself.
pub fn interpret_one<B: Bus + ?Sized>(
    inst: &DecodedInstruction,
    state: &mut ProcessorState,
    bus: &B,
) {
    state.regs[PC] = inst.next_address();

    if !inst.cond.passes(state.cpsr) {
        return;
    }

    let mut cpu = Cpu { inst, state, bus };
    let result = match inst.class {
        OpClass::DataProcessing | OpClass::DataProcessingRegShift => cpu.data_processing(),
        OpClass::Multiply => cpu.multiply(),
        OpClass::MultiplyLong => cpu.multiply_long(),
        OpClass::LoadStore | OpClass::LoadStoreExtra => cpu.load_store(),
        OpClass::BlockTransfer => cpu.block_transfer(),
        OpClass::Branch | OpClass::BranchExchange => cpu.branch(),
        OpClass::SoftwareInterrupt => {
            cpu.state.raise(ExitReason::SystemCall(cpu.imm(0)));
            Ok(())
        }
        OpClass::Breakpoint => {
            cpu.state.regs[PC] = inst.address;
            cpu.state.raise(ExitReason::Breakpoint(cpu.imm(0) as u16));
            Ok(())
        }
        OpClass::StatusAccess => cpu.status_access(),
        OpClass::CountLeadingZeros => {
            let value = cpu.operand(1).leading_zeros();
            cpu.set_dest(value);
            Ok(())
        }
        OpClass::Extend => cpu.extend(),
        OpClass::ByteReverse => cpu.byte_reverse(),
        OpClass::SaturatingArith => cpu.saturating(),
        OpClass::SumAbsoluteDifference => cpu.sum_absolute_difference(),
    };

    match result {
        Ok(()) => {}
        Err(Fault::Data(address)) => {
            state.regs[PC] = inst.address;
            state.raise(ExitReason::DataAbort(address));
        }
        Err(Fault::Undefined) => {
            state.regs[PC] = inst.address;
            state.raise(ExitReason::UndefinedInstructionFault {
                address: inst.address,
                word: inst.word,
            });
        }
    }
}

struct Cpu<'a, B: ?Sized> {
    inst: &'a DecodedInstruction,
    state: &'a mut ProcessorState,
    bus: &'a B,
}

impl<B: Bus + ?Sized> Cpu<'_, B> {
    fn reg(&self, r: u8) -> u32 {
        if r as usize == PC {
            self.inst.pc_value()
        } else {
            self.state.regs[r as usize]
        }
    }

    fn imm(&self, index: usize) -> u32 {
        match self.inst.operands[index] {
            Operand::Imm(value) | Operand::RotatedImm { value, .. } => value,
            other => unreachable!("expected immediate operand, got {other:?}"),
        }
    }

    fn carry(&self) -> bool {
        self.state.flag(flag::C)
    }

    /// Value of a register, immediate or shifted operand, with the shifter carry.
    fn shifter(&self, index: usize) -> (u32, bool) {
        match self.inst.operands[index] {
            Operand::Reg(r) => (self.reg(r), self.carry()),
            Operand::RotatedImm { value, rotate } => {
                let carry = if rotate == 0 {
                    self.carry()
                } else {
                    value >> 31 != 0
                };
                (value, carry)
            }
            Operand::Shifted { rm, shift, by } => {
                let (value, amount) = match by {
                    ShiftBy::Imm(n) => (self.reg(rm), n as u32),
                    // A register-specified shift reads r15 one word further ahead.
                    ShiftBy::Reg(rs) => {
                        let value = if rm as usize == PC {
                            self.inst.pc_value().wrapping_add(4)
                        } else {
                            self.reg(rm)
                        };
                        (value, self.reg(rs) & 0xff)
                    }
                };
                shift_c(value, shift, amount, self.carry())
            }
            Operand::None => (0, self.carry()),
            other => unreachable!("not a shifter operand: {other:?}"),
        }
    }

    fn operand(&self, index: usize) -> u32 {
        self.shifter(index).0
    }

    fn set_nz(&mut self, value: u32) {
        self.state.set_flag(flag::N, value >> 31 != 0);
        self.state.set_flag(flag::Z, value == 0);
    }

    fn set_dest(&mut self, value: u32) {
        if let Some(rd) = self.inst.operands[0].reg() {
            self.state.regs[rd] = value;
        }
    }

    fn data_processing(&mut self) -> Exec {
        let (op2, shifter_carry) = self.shifter(2);
        let rn = self.inst.operands[1].reg().map_or(0, |r| self.reg(r as u8));
        let c = self.carry();

        let (result, arith) = match self.inst.op {
            Op::And | Op::Tst => (rn & op2, None),
            Op::Eor | Op::Teq => (rn ^ op2, None),
            Op::Orr => (rn | op2, None),
            Op::Bic => (rn & !op2, None),
            Op::Mov => (op2, None),
            Op::Mvn => (!op2, None),
            op => {
                let (a, b, carry_in) = match op {
                    Op::Sub | Op::Cmp => (rn, !op2, true),
                    Op::Rsb => (op2, !rn, true),
                    Op::Add | Op::Cmn => (rn, op2, false),
                    Op::Adc => (rn, op2, c),
                    Op::Sbc => (rn, !op2, c),
                    Op::Rsc => (op2, !rn, c),
                    op => unreachable!("{op:?} is not data processing"),
                };
                let (result, carry, overflow) = add_with_carry(a, b, carry_in);
                (result, Some((carry, overflow)))
            }
        };

        if self.inst.set_flags {
            self.set_nz(result);
            match arith {
                Some((carry, overflow)) => {
                    self.state.set_flag(flag::C, carry);
                    self.state.set_flag(flag::V, overflow);
                }
                None => self.state.set_flag(flag::C, shifter_carry),
            }
        }

        match self.inst.operands[0].reg() {
            Some(PC) => self.state.regs[PC] = result & !3,
            Some(rd) => self.state.regs[rd] = result,
            None => {}
        }
        Ok(())
    }

    fn multiply(&mut self) -> Exec {
        let mut result = self.operand(1).wrapping_mul(self.operand(2));
        if self.inst.op == Op::Mla {
            result = result.wrapping_add(self.operand(3));
        }
        if self.inst.set_flags {
            self.set_nz(result);
        }
        self.set_dest(result);
        Ok(())
    }

    fn multiply_long(&mut self) -> Exec {
        let (rm, rs) = (self.operand(2), self.operand(3));
        let product = match self.inst.op {
            Op::Umull | Op::Umlal => rm as u64 * rs as u64,
            _ => (rm as i32 as i64 * rs as i32 as i64) as u64,
        };
        let result = if matches!(self.inst.op, Op::Umlal | Op::Smlal) {
            let acc = ((self.operand(1) as u64) << 32) | self.operand(0) as u64;
            product.wrapping_add(acc)
        } else {
            product
        };
        if self.inst.set_flags {
            self.state.set_flag(flag::N, result >> 63 != 0);
            self.state.set_flag(flag::Z, result == 0);
        }
        if let (Some(lo), Some(hi)) = (self.inst.operands[0].reg(), self.inst.operands[1].reg()) {
            self.state.regs[lo] = result as u32;
            self.state.regs[hi] = (result >> 32) as u32;
        }
        Ok(())
    }

    /// Returns `(access address, written-back base)`.
    fn address(&self, mem: &MemOperand) -> (u32, u32) {
        let base = self.reg(mem.base);
        let offset = match mem.offset {
            MemOffset::Imm(n) => n,
            MemOffset::Reg { rm, shift, amount } => {
                shift_c(self.reg(rm), shift, amount as u32, self.carry()).0
            }
        };
        let offset_address = if mem.add {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        };
        let address = if mem.pre { offset_address } else { base };
        (address, offset_address)
    }

    fn load_store(&mut self) -> Exec {
        let (Some(rt), Operand::Mem(mem)) = (self.inst.operands[0].reg(), self.inst.operands[1])
        else {
            unreachable!("malformed load/store {:?}", self.inst);
        };
        let kind = AccessKind::of(self.inst.op);
        let (address, new_base) = self.address(&mem);

        if self.inst.op.is_load() {
            let value = load(self.bus, kind, address)?;
            if rt == PC && value & 1 != 0 {
                return Err(Fault::Undefined);
            }
            if mem.writeback {
                self.state.regs[mem.base as usize] = new_base;
            }
            self.state.regs[rt] = if rt == PC { value & !3 } else { value };
        } else {
            store(self.bus, kind, address, self.reg(rt as u8))?;
            if mem.writeback {
                self.state.regs[mem.base as usize] = new_base;
            }
        }
        Ok(())
    }

    fn block_transfer(&mut self) -> Exec {
        let (Operand::Block { base, mode, writeback }, Operand::RegList(list)) =
            (self.inst.operands[0], self.inst.operands[1])
        else {
            unreachable!("malformed block transfer {:?}", self.inst);
        };
        let base_value = self.state.regs[base as usize];
        let size = list.count_ones() * 4;
        let (start, new_base) = match mode {
            BlockMode::Ia => (base_value, base_value.wrapping_add(size)),
            BlockMode::Ib => (base_value.wrapping_add(4), base_value.wrapping_add(size)),
            BlockMode::Da => (
                base_value.wrapping_sub(size).wrapping_add(4),
                base_value.wrapping_sub(size),
            ),
            BlockMode::Db => (base_value.wrapping_sub(size), base_value.wrapping_sub(size)),
        };
        let registers = (0..16usize).filter(|r| list & (1 << r) != 0);

        if self.inst.op == Op::Ldm {
            let mut values = [0u32; 16];
            let mut address = start;
            for r in registers.clone() {
                values[r] = self.bus.read_u32(address & !3)?;
                address = address.wrapping_add(4);
            }
            if list & (1 << PC) != 0 && values[PC] & 1 != 0 {
                return Err(Fault::Undefined);
            }
            if writeback {
                self.state.regs[base as usize] = new_base;
            }
            for r in registers {
                self.state.regs[r] = if r == PC { values[r] & !3 } else { values[r] };
            }
        } else {
            let mut address = start;
            for r in registers {
                self.bus.write_u32(address & !3, self.reg(r as u8))?;
                address = address.wrapping_add(4);
            }
            if writeback {
                self.state.regs[base as usize] = new_base;
            }
        }
        Ok(())
    }

    fn branch(&mut self) -> Exec {
        let target = match self.inst.operands[0] {
            Operand::Imm(target) => target,
            Operand::Reg(rm) => {
                let target = self.reg(rm);
                // Thumb state is not supported.
                if target & 1 != 0 {
                    return Err(Fault::Undefined);
                }
                target
            }
            other => unreachable!("bad branch operand {other:?}"),
        };
        if matches!(self.inst.op, Op::Bl | Op::Blx) {
            self.state.regs[LR] = self.inst.next_address();
        }
        self.state.regs[PC] = target & !3;
        Ok(())
    }

    fn status_access(&mut self) -> Exec {
        if self.inst.op == Op::Mrs {
            let cpsr = self.state.cpsr;
            self.set_dest(cpsr);
            return Ok(());
        }

        let fields = self.imm(0);
        let value = self.operand(1);
        let mut mask = 0;
        if fields & 0b1000 != 0 {
            mask |= flag::NZCV | flag::Q;
        }
        if fields & 0b0001 != 0 && self.state.mode() != Mode::User as u32 {
            mask |= flag::MODE_MASK;
        }
        self.state.cpsr = (self.state.cpsr & !mask) | (value & mask);
        Ok(())
    }

    fn extend(&mut self) -> Exec {
        let value = self.operand(1);
        let result = match self.inst.op {
            Op::Sxtb => value as i8 as i32 as u32,
            Op::Sxth => value as i16 as i32 as u32,
            Op::Uxtb => value & 0xff,
            _ => value & 0xffff,
        };
        self.set_dest(result);
        Ok(())
    }

    fn byte_reverse(&mut self) -> Exec {
        let value = self.operand(1);
        let result = match self.inst.op {
            Op::Rev => value.swap_bytes(),
            Op::Rev16 => ((value >> 8) & 0x00ff_00ff) | ((value << 8) & 0xff00_ff00),
            _ => (value as u16).swap_bytes() as i16 as i32 as u32,
        };
        self.set_dest(result);
        Ok(())
    }

    fn saturating(&mut self) -> Exec {
        let rm = self.operand(1) as i32 as i64;
        let rn = self.operand(2) as i32 as i64;
        let (rn, doubled) = match self.inst.op {
            Op::Qdadd | Op::Qdsub => {
                let (value, sat) = saturate(rn * 2);
                (value as i32 as i64, sat)
            }
            _ => (rn, false),
        };
        let (result, sat) = match self.inst.op {
            Op::Qadd | Op::Qdadd => saturate(rm + rn),
            _ => saturate(rm - rn),
        };
        if sat || doubled {
            self.state.cpsr |= flag::Q;
        }
        self.set_dest(result);
        Ok(())
    }

    fn sum_absolute_difference(&mut self) -> Exec {
        let (a, b) = (self.operand(1), self.operand(2));
        let mut sum = (0..4)
            .map(|i| {
                let x = (a >> (i * 8)) & 0xff;
                let y = (b >> (i * 8)) & 0xff;
                x.abs_diff(y)
            })
            .sum::<u32>();
        if self.inst.op == Op::Usada8 {
            sum = sum.wrapping_add(self.operand(3));
        }
        self.set_dest(sum);
        Ok(())
    }
}

const TIMESLICE: i32 = 1 << 20;

/// Standalone engine: fetch, decode and interpret one instruction at a time.
pub struct Machine {
    state: ProcessorState,
    memory: GuestMemory,
    inst_count: u64,
    hotspots: HashMap<u32, u64>,
}

impl Drop for Machine {
    fn drop(&mut self) {
        if log_enabled!(Level::Info) {
            log::info!("Overall instruction count: {}", self.inst_count);

            let mut hot = self.hotspots.iter().collect::<Vec<_>>();
            hot.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

            log::info!("Hotspot profile:");
            for (pc, count) in hot.into_iter().take(16) {
                log::info!("  {pc:08x}: {count}");
            }
        }
    }
}

impl Machine {
    pub fn new(memory: GuestMemory) -> Self {
        let mut state = ProcessorState::new();
        state.set_pc(memory.base());
        Self {
            state,
            memory,
            inst_count: 0,
            hotspots: HashMap::new(),
        }
    }

    /// Loads a raw image at `base` and points the pc at it.
    pub fn from_bin(bin: &[u8], base: u32, memory_size: usize) -> anyhow::Result<Self> {
        if bin.len() > memory_size {
            anyhow::bail!(
                "image of {} bytes does not fit in {memory_size} bytes of memory",
                bin.len()
            );
        }
        let memory = GuestMemory::new(base, memory_size);
        memory.load_image(base, bin)?;
        Ok(Self::new(memory))
    }

    pub fn state(&self) -> &ProcessorState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ProcessorState {
        &mut self.state
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// Runs until a guest exit or until `ticks` instructions have been executed.
    pub fn run_for(&mut self, ticks: i32) -> ExitReason {
        self.state.ticks = ticks;

        loop {
            if self.state.ticks <= 0 {
                return ExitReason::BudgetExhausted;
            }

            let pc = self.state.pc();
            let word = match self.memory.read_u32(pc) {
                Ok(word) => word,
                Err(_) => return ExitReason::PrefetchAbort(pc),
            };
            self.state.ticks -= 1;

            if log_enabled!(Level::Info) {
                self.inst_count += 1;
                *self.hotspots.entry(pc).or_default() += 1;
            }

            match decode(word, pc) {
                Ok(inst) => interpret_one(&inst, &mut self.state, &self.memory),
                Err(_) => self
                    .state
                    .raise(ExitReason::UndefinedInstructionFault { address: pc, word }),
            }

            if let Some(exit) = self.state.take_exit() {
                return exit;
            }
        }
    }

    pub fn run(&mut self) -> ExitReason {
        loop {
            match self.run_for(TIMESLICE) {
                ExitReason::BudgetExhausted => continue,
                exit => return exit,
            }
        }
    }
}

impl crate::Engine for Machine {
    fn state(&self) -> &ProcessorState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProcessorState {
        &mut self.state
    }

    fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    fn run(&mut self) -> anyhow::Result<ExitReason> {
        Ok(Machine::run(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(words: &[u32], setup: impl FnOnce(&mut ProcessorState)) -> (ProcessorState, GuestMemory) {
        let memory = GuestMemory::new(0, 0x1000);
        let mut state = ProcessorState::new();
        setup(&mut state);
        for (i, &word) in words.iter().enumerate() {
            let address = state.pc();
            assert_eq!(address, i as u32 * 4, "control flow left the sequence");
            let inst = decode(word, address).unwrap();
            interpret_one(&inst, &mut state, &memory);
        }
        (state, memory)
    }

    #[test]
    fn register_add_leaves_flags_alone() {
        let (state, _) = exec(&[0xe081_1002], |s| {
            s.regs[1] = 5;
            s.regs[2] = 7;
            s.cpsr |= flag::C;
        });
        assert_eq!(state.regs[1], 12);
        assert_eq!(state.pc(), 4);
        assert_eq!(state.cpsr & flag::NZCV, flag::C);
    }

    #[test]
    fn subtraction_flags() {
        // subs r0, r1, r2
        let (state, _) = exec(&[0xe051_0002], |s| {
            s.regs[1] = 3;
            s.regs[2] = 5;
        });
        assert_eq!(state.regs[0], (-2i32) as u32);
        assert!(state.flag(flag::N));
        assert!(!state.flag(flag::C));
        assert!(!state.flag(flag::Z));

        // cmp r1, #0x80000000 with r1 = 0x7fffffff overflows
        let (state, _) = exec(&[0xe351_0102], |s| s.regs[1] = 0x7fff_ffff);
        assert!(state.flag(flag::V));
        assert!(state.flag(flag::N));
        assert!(!state.flag(flag::C));
    }

    #[test]
    fn logical_ops_take_shifter_carry() {
        // movs r0, r1, lsl #1
        let (state, _) = exec(&[0xe1b0_0081], |s| s.regs[1] = 0x8000_0001);
        assert_eq!(state.regs[0], 2);
        assert!(state.flag(flag::C));
        assert!(!state.flag(flag::N));
    }

    #[test]
    fn shifter_edge_cases() {
        assert_eq!(shift_c(0x8000_0000, ShiftType::Lsr, 32, false), (0, true));
        assert_eq!(shift_c(0x8000_0000, ShiftType::Asr, 32, false), (!0, true));
        assert_eq!(shift_c(1, ShiftType::Lsl, 33, true), (0, false));
        assert_eq!(shift_c(1, ShiftType::Rrx, 1, true), (0x8000_0000, true));
        assert_eq!(shift_c(0x8000_0000, ShiftType::Ror, 32, false), (0x8000_0000, true));
        assert_eq!(shift_c(5, ShiftType::Lsl, 0, true), (5, true));
    }

    #[test]
    fn failed_condition_only_advances_pc() {
        // addeq r1, r1, #1
        let (state, _) = exec(&[0x0281_1001], |_| {});
        assert_eq!(state.regs[1], 0);
        assert_eq!(state.pc(), 4);
    }

    #[test]
    fn unaligned_word_load_rotates() {
        let memory = GuestMemory::new(0, 0x100);
        memory.write_u32(0x40, 0x4433_2211).unwrap();
        assert_eq!(load(&memory, AccessKind::Word, 0x41).unwrap(), 0x1144_3322);
        assert_eq!(load(&memory, AccessKind::SignedHalf, 0x43).unwrap(), 0x0000_4433);
        assert_eq!(load(&memory, AccessKind::SignedByte, 0x43).unwrap(), 0x0000_0044);
        memory.write_u32(0x44, 0x0000_80ff).unwrap();
        assert_eq!(load(&memory, AccessKind::SignedByte, 0x44).unwrap(), 0xffff_ffff);
        assert_eq!(load(&memory, AccessKind::SignedHalf, 0x44).unwrap(), 0xffff_80ff);
    }

    #[test]
    fn load_store_writeback() {
        // str r0, [r1], #4 ; ldr r2, [r1, #-4]!
        let (state, memory) = exec(&[0xe481_0004, 0xe531_2004], |s| {
            s.regs[0] = 0xdead_beef;
            s.regs[1] = 0x100;
        });
        assert_eq!(memory.read_u32(0x100).unwrap(), 0xdead_beef);
        assert_eq!(state.regs[1], 0x100);
        assert_eq!(state.regs[2], 0xdead_beef);
    }

    #[test]
    fn data_abort_rolls_back() {
        // ldr r0, [r1, #4]!
        let (mut state, _) = exec(&[0xe5b1_0004], |s| s.regs[1] = 0x10_0000);
        assert_eq!(state.regs[1], 0x10_0000);
        assert_eq!(state.pc(), 0);
        assert_eq!(state.take_exit(), Some(ExitReason::DataAbort(0x10_0004)));
    }

    #[test]
    fn block_transfer_round_trip() {
        // stmdb sp!, {r0, r1, lr} ; ldmia sp!, {r2, r3, r4}
        let (state, memory) = exec(&[0xe92d_4003, 0xe8bd_001c], |s| {
            s.regs[0] = 1;
            s.regs[1] = 2;
            s.regs[LR] = 3;
            s.regs[13] = 0x200;
        });
        assert_eq!(memory.read_u32(0x1f4).unwrap(), 1);
        assert_eq!(memory.read_u32(0x1fc).unwrap(), 3);
        assert_eq!(&state.regs[2..5], &[1, 2, 3]);
        assert_eq!(state.regs[13], 0x200);
    }

    #[test]
    fn branches_and_exceptions() {
        let memory = GuestMemory::new(0, 0x100);
        let mut state = ProcessorState::new();

        // bl +8 from 0x10
        let inst = decode(0xeb00_0000, 0x10).unwrap();
        interpret_one(&inst, &mut state, &memory);
        assert_eq!(state.pc(), 0x18);
        assert_eq!(state.regs[LR], 0x14);

        // bx r0 with an odd target is not supported
        state.regs[0] = 0x41;
        let inst = decode(0xe12f_ff10, 0x18).unwrap();
        interpret_one(&inst, &mut state, &memory);
        assert_eq!(state.pc(), 0x18);
        assert_eq!(
            state.take_exit(),
            Some(ExitReason::UndefinedInstructionFault {
                address: 0x18,
                word: 0xe12f_ff10
            })
        );

        let inst = decode(0xef00_0042, 0x20).unwrap();
        interpret_one(&inst, &mut state, &memory);
        assert_eq!(state.pc(), 0x24);
        assert_eq!(state.take_exit(), Some(ExitReason::SystemCall(0x42)));

        let inst = decode(0xe120_0173, 0x30).unwrap();
        interpret_one(&inst, &mut state, &memory);
        assert_eq!(state.pc(), 0x30);
        assert_eq!(state.take_exit(), Some(ExitReason::Breakpoint(0x13)));
    }

    #[test]
    fn media_and_saturating_ops() {
        // rev r0, r1 ; rev16 r2, r1 ; revsh r3, r1 ; qadd r4, r5, r6 ; usad8 r7, r1, r5
        let (state, _) = exec(
            &[0xe6bf_0f31, 0xe6bf_2fb1, 0xe6ff_3fb1, 0xe106_4055, 0xe787_f511],
            |s| {
                s.regs[1] = 0x1234_5680;
                s.regs[5] = 0x7fff_fff0;
                s.regs[6] = 0x100;
            },
        );
        assert_eq!(state.regs[0], 0x8056_3412);
        assert_eq!(state.regs[2], 0x3412_8056);
        assert_eq!(state.regs[3], 0xffff_8056);
        assert_eq!(state.regs[4], 0x7fff_ffff);
        assert!(state.flag(flag::Q));
        // |0x80-0xf0| + |0x56-0xff| + |0x34-0xff| + |0x12-0x7f|
        assert_eq!(state.regs[7], 0x70 + 0xa9 + 0xcb + 0x6d);
    }

    #[test]
    fn long_multiply_and_status() {
        // smull r0, r1, r2, r3 ; mrs r4, cpsr ; msr cpsr_f, #0xf0000000
        let (state, _) = exec(&[0xe0c1_0392, 0xe10f_4000, 0xe328_f20f], |s| {
            s.regs[2] = (-3i32) as u32;
            s.regs[3] = 7;
        });
        assert_eq!(state.regs[0], (-21i32) as u32);
        assert_eq!(state.regs[1], 0xffff_ffff);
        assert_eq!(state.regs[4], Mode::User as u32);
        assert_eq!(state.cpsr, flag::NZCV | Mode::User as u32);
    }

    #[test]
    fn machine_stops_on_undefined_and_prefetch() {
        let mut machine = Machine::from_bin(&0xee00_0a10u32.to_le_bytes(), 0x100, 0x10).unwrap();
        assert_eq!(
            machine.run(),
            ExitReason::UndefinedInstructionFault {
                address: 0x100,
                word: 0xee00_0a10
            }
        );
        assert_eq!(machine.state().pc(), 0x100);

        // b to 0x1000, outside memory
        let mut machine = Machine::from_bin(&0xea00_03feu32.to_le_bytes(), 0, 0x10).unwrap();
        assert_eq!(machine.run(), ExitReason::PrefetchAbort(0x1000));
    }
}
