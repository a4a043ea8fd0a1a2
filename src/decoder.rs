//! ARM-state instruction decoder.
//!
//! [`decode`] turns one instruction word into a [`DecodedInstruction`]: a mnemonic-level
//! [`Op`], the [`OpClass`] that selects a code generation strategy, the condition code and
//! up to four operands. Decoding never touches guest memory.

use thiserror::Error;

use crate::state::{LR, PC};

/// The word at `address` matches no supported encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("undefined instruction {word:#010x} at {address:#010x}")]
pub struct UndefinedInstruction {
    pub word: u32,
    pub address: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
}

impl Cond {
    const ALL: [Cond; 15] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Cs,
        Cond::Cc,
        Cond::Mi,
        Cond::Pl,
        Cond::Vs,
        Cond::Vc,
        Cond::Hi,
        Cond::Ls,
        Cond::Ge,
        Cond::Lt,
        Cond::Gt,
        Cond::Le,
        Cond::Al,
    ];

    fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.get(bits as usize).copied()
    }

    pub fn passes(self, cpsr: u32) -> bool {
        use crate::state::flag;

        let n = cpsr & flag::N != 0;
        let z = cpsr & flag::Z != 0;
        let c = cpsr & flag::C != 0;
        let v = cpsr & flag::V != 0;

        match self {
            Cond::Eq => z,
            Cond::Ne => !z,
            Cond::Cs => c,
            Cond::Cc => !c,
            Cond::Mi => n,
            Cond::Pl => !n,
            Cond::Vs => v,
            Cond::Vc => !v,
            Cond::Hi => c && !z,
            Cond::Ls => !c || z,
            Cond::Ge => n == v,
            Cond::Lt => n != v,
            Cond::Gt => !z && n == v,
            Cond::Le => z || n != v,
            Cond::Al => true,
        }
    }

    pub fn suffix(self) -> &'static str {
        [
            "eq", "ne", "cs", "cc", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le", "",
        ][self as usize]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Rsc,
    Tst,
    Teq,
    Cmp,
    Cmn,
    Orr,
    Mov,
    Bic,
    Mvn,
    Mul,
    Mla,
    Umull,
    Umlal,
    Smull,
    Smlal,
    Ldr,
    Str,
    Ldrb,
    Strb,
    Ldrh,
    Strh,
    Ldrsb,
    Ldrsh,
    Ldm,
    Stm,
    B,
    Bl,
    Bx,
    Blx,
    Swi,
    Bkpt,
    Mrs,
    Msr,
    Clz,
    Sxtb,
    Sxth,
    Uxtb,
    Uxth,
    Rev,
    Rev16,
    Revsh,
    Qadd,
    Qsub,
    Qdadd,
    Qdsub,
    Usad8,
    Usada8,
}

const DATA_OPS: [Op; 16] = [
    Op::And,
    Op::Eor,
    Op::Sub,
    Op::Rsb,
    Op::Add,
    Op::Adc,
    Op::Sbc,
    Op::Rsc,
    Op::Tst,
    Op::Teq,
    Op::Cmp,
    Op::Cmn,
    Op::Orr,
    Op::Mov,
    Op::Bic,
    Op::Mvn,
];

impl Op {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::And => "and",
            Op::Eor => "eor",
            Op::Sub => "sub",
            Op::Rsb => "rsb",
            Op::Add => "add",
            Op::Adc => "adc",
            Op::Sbc => "sbc",
            Op::Rsc => "rsc",
            Op::Tst => "tst",
            Op::Teq => "teq",
            Op::Cmp => "cmp",
            Op::Cmn => "cmn",
            Op::Orr => "orr",
            Op::Mov => "mov",
            Op::Bic => "bic",
            Op::Mvn => "mvn",
            Op::Mul => "mul",
            Op::Mla => "mla",
            Op::Umull => "umull",
            Op::Umlal => "umlal",
            Op::Smull => "smull",
            Op::Smlal => "smlal",
            Op::Ldr => "ldr",
            Op::Str => "str",
            Op::Ldrb => "ldrb",
            Op::Strb => "strb",
            Op::Ldrh => "ldrh",
            Op::Strh => "strh",
            Op::Ldrsb => "ldrsb",
            Op::Ldrsh => "ldrsh",
            Op::Ldm => "ldm",
            Op::Stm => "stm",
            Op::B => "b",
            Op::Bl => "bl",
            Op::Bx => "bx",
            Op::Blx => "blx",
            Op::Swi => "swi",
            Op::Bkpt => "bkpt",
            Op::Mrs => "mrs",
            Op::Msr => "msr",
            Op::Clz => "clz",
            Op::Sxtb => "sxtb",
            Op::Sxth => "sxth",
            Op::Uxtb => "uxtb",
            Op::Uxth => "uxth",
            Op::Rev => "rev",
            Op::Rev16 => "rev16",
            Op::Revsh => "revsh",
            Op::Qadd => "qadd",
            Op::Qsub => "qsub",
            Op::Qdadd => "qdadd",
            Op::Qdsub => "qdsub",
            Op::Usad8 => "usad8",
            Op::Usada8 => "usada8",
        }
    }

    pub fn is_load(self) -> bool {
        matches!(
            self,
            Op::Ldr | Op::Ldrb | Op::Ldrh | Op::Ldrsb | Op::Ldrsh | Op::Ldm
        )
    }

    /// Compare-style data processing ops that only update flags.
    pub fn is_compare(self) -> bool {
        matches!(self, Op::Tst | Op::Teq | Op::Cmp | Op::Cmn)
    }
}

/// Operation classes. Code generation strategy is chosen per class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpClass {
    DataProcessing,
    DataProcessingRegShift,
    Multiply,
    MultiplyLong,
    LoadStore,
    LoadStoreExtra,
    BlockTransfer,
    Branch,
    BranchExchange,
    SoftwareInterrupt,
    Breakpoint,
    StatusAccess,
    CountLeadingZeros,
    Extend,
    ByteReverse,
    SaturatingArith,
    SumAbsoluteDifference,
}

impl OpClass {
    pub const COUNT: usize = 17;

    pub const ALL: [OpClass; OpClass::COUNT] = [
        OpClass::DataProcessing,
        OpClass::DataProcessingRegShift,
        OpClass::Multiply,
        OpClass::MultiplyLong,
        OpClass::LoadStore,
        OpClass::LoadStoreExtra,
        OpClass::BlockTransfer,
        OpClass::Branch,
        OpClass::BranchExchange,
        OpClass::SoftwareInterrupt,
        OpClass::Breakpoint,
        OpClass::StatusAccess,
        OpClass::CountLeadingZeros,
        OpClass::Extend,
        OpClass::ByteReverse,
        OpClass::SaturatingArith,
        OpClass::SumAbsoluteDifference,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftType {
    Lsl,
    Lsr,
    Asr,
    Ror,
    /// Rotate right by one through carry.
    Rrx,
}

const SHIFT_TYPES: [ShiftType; 4] = [ShiftType::Lsl, ShiftType::Lsr, ShiftType::Asr, ShiftType::Ror];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftBy {
    /// Normalized amount: `LSR #0` and `ASR #0` are stored as 32, RRX as 1.
    Imm(u8),
    /// Bottom byte of a register.
    Reg(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemOffset {
    Imm(u32),
    Reg { rm: u8, shift: ShiftType, amount: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemOperand {
    pub base: u8,
    pub offset: MemOffset,
    /// Offset is added (`U` bit) rather than subtracted.
    pub add: bool,
    /// Pre-indexed; post-indexed accesses use the unmodified base.
    pub pre: bool,
    pub writeback: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockMode {
    Ia,
    Ib,
    Da,
    Db,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    None,
    Reg(u8),
    Imm(u32),
    /// Data processing immediate; a non-zero rotation makes bit 31 the shifter carry.
    RotatedImm { value: u32, rotate: u8 },
    Shifted { rm: u8, shift: ShiftType, by: ShiftBy },
    Mem(MemOperand),
    Block { base: u8, mode: BlockMode, writeback: bool },
    RegList(u16),
}

impl Operand {
    pub fn reg(&self) -> Option<usize> {
        match *self {
            Operand::Reg(r) => Some(r as usize),
            _ => None,
        }
    }

    fn reads(&self) -> u16 {
        match *self {
            Operand::Reg(r) => bit(r),
            Operand::Shifted { rm, by, .. } => {
                bit(rm)
                    | match by {
                        ShiftBy::Reg(rs) => bit(rs),
                        ShiftBy::Imm(_) => 0,
                    }
            }
            Operand::Mem(m) => {
                bit(m.base)
                    | match m.offset {
                        MemOffset::Reg { rm, .. } => bit(rm),
                        MemOffset::Imm(_) => 0,
                    }
            }
            Operand::Block { base, .. } => bit(base),
            _ => 0,
        }
    }
}

fn bit(r: u8) -> u16 {
    1 << r
}

/// Operand layout per class:
///
/// - data processing: `[Rd | None, Rn | None, operand2]`
/// - multiply: `[Rd, Rm, Rs, Rn | None]`, long: `[RdLo, RdHi, Rm, Rs]`
/// - load/store: `[Rt, Mem]`, block transfer: `[Block, RegList]`
/// - branches: `[Imm(target)]` or `[Reg(Rm)]`, SWI/BKPT: `[Imm]`
/// - MRS: `[Rd]`, MSR: `[Imm(field mask), operand2]`
/// - the remaining unary/binary ops: `[Rd, sources...]`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub address: u32,
    pub word: u32,
    pub op: Op,
    pub class: OpClass,
    pub cond: Cond,
    pub set_flags: bool,
    pub operands: [Operand; 4],
    pub len: u8,
}

impl DecodedInstruction {
    pub fn next_address(&self) -> u32 {
        self.address.wrapping_add(self.len as u32)
    }

    /// Value read for r15 by this instruction.
    pub fn pc_value(&self) -> u32 {
        self.address.wrapping_add(8)
    }

    pub fn branch_target(&self) -> Option<u32> {
        match (self.class, self.operands[0]) {
            (OpClass::Branch, Operand::Imm(target)) => Some(target),
            _ => None,
        }
    }

    fn has_destination(&self) -> bool {
        match self.class {
            OpClass::DataProcessing
            | OpClass::DataProcessingRegShift
            | OpClass::Multiply
            | OpClass::CountLeadingZeros
            | OpClass::Extend
            | OpClass::ByteReverse
            | OpClass::SaturatingArith
            | OpClass::SumAbsoluteDifference => true,
            OpClass::StatusAccess => self.op == Op::Mrs,
            _ => false,
        }
    }

    /// Registers this instruction may write, r15 included.
    pub fn writes(&self) -> u16 {
        let o = &self.operands;
        if self.has_destination() {
            return o[0].reg().map_or(0, |r| 1 << r);
        }
        match self.class {
            OpClass::MultiplyLong => o[0].reads() | o[1].reads(),
            OpClass::LoadStore | OpClass::LoadStoreExtra => {
                let mut mask = 0;
                if self.op.is_load() {
                    mask |= o[0].reads();
                }
                if let Operand::Mem(m) = o[1] {
                    if m.writeback {
                        mask |= bit(m.base);
                    }
                }
                mask
            }
            OpClass::BlockTransfer => {
                let mut mask = 0;
                if let (Operand::Block { base, writeback, .. }, Operand::RegList(list)) = (o[0], o[1])
                {
                    if writeback {
                        mask |= bit(base);
                    }
                    if self.op == Op::Ldm {
                        mask |= list;
                    }
                }
                mask
            }
            OpClass::Branch | OpClass::BranchExchange => {
                let link = matches!(self.op, Op::Bl | Op::Blx);
                (1 << PC) | if link { 1 << LR } else { 0 }
            }
            _ => 0,
        }
    }

    /// Registers this instruction may read.
    pub fn reads(&self) -> u16 {
        let o = &self.operands;
        if self.has_destination() {
            return o[1..].iter().fold(0, |mask, op| mask | op.reads());
        }
        match self.class {
            OpClass::MultiplyLong => {
                let acc = if matches!(self.op, Op::Umlal | Op::Smlal) {
                    o[0].reads() | o[1].reads()
                } else {
                    0
                };
                acc | o[2].reads() | o[3].reads()
            }
            OpClass::LoadStore | OpClass::LoadStoreExtra => {
                let data = if self.op.is_load() { 0 } else { o[0].reads() };
                data | o[1].reads()
            }
            OpClass::BlockTransfer => match (self.op, o[1]) {
                (Op::Stm, Operand::RegList(list)) => o[0].reads() | list,
                _ => o[0].reads(),
            },
            OpClass::BranchExchange => o[0].reads(),
            OpClass::StatusAccess => o[1].reads(),
            _ => 0,
        }
    }

    /// Ends a basic block: writes the pc or raises an exception.
    pub fn is_terminal(&self) -> bool {
        self.writes() & (1 << PC) != 0 || matches!(self.op, Op::Swi | Op::Bkpt)
    }
}

struct Fields {
    op: Op,
    class: OpClass,
    set_flags: bool,
    operands: [Operand; 4],
}

impl Fields {
    fn new(op: Op, class: OpClass, operands: &[Operand]) -> Self {
        let mut ops = [Operand::None; 4];
        ops[..operands.len()].copy_from_slice(operands);
        Self {
            op,
            class,
            set_flags: false,
            operands: ops,
        }
    }

    fn with_flags(mut self, set_flags: bool) -> Self {
        self.set_flags = set_flags;
        self
    }
}

fn reg(word: u32, lsb: u32) -> u8 {
    ((word >> lsb) & 0xf) as u8
}

fn flag(word: u32, bit: u32) -> bool {
    word & (1 << bit) != 0
}

pub fn decode(word: u32, address: u32) -> Result<DecodedInstruction, UndefinedInstruction> {
    let undefined = UndefinedInstruction { word, address };
    let cond = Cond::from_bits(word >> 28).ok_or(undefined)?;

    let fields = match (word >> 25) & 7 {
        0b000 => decode_group0(word, cond),
        0b001 => decode_group1(word),
        0b010 => decode_load_store(word),
        0b011 if flag(word, 4) => decode_media(word),
        0b011 => decode_load_store(word),
        0b100 => decode_block(word),
        0b101 => Some(decode_branch(word, address)),
        0b111 if flag(word, 24) => Some(Fields::new(
            Op::Swi,
            OpClass::SoftwareInterrupt,
            &[Operand::Imm(word & 0x00ff_ffff)],
        )),
        _ => None,
    }
    .ok_or(undefined)?;

    Ok(DecodedInstruction {
        address,
        word,
        op: fields.op,
        class: fields.class,
        cond,
        set_flags: fields.set_flags,
        operands: fields.operands,
        len: 4,
    })
}

fn decode_group0(word: u32, cond: Cond) -> Option<Fields> {
    let rd = reg(word, 12);

    match word & 0x0fff_fff0 {
        0x012f_ff10 => {
            return Some(Fields::new(
                Op::Bx,
                OpClass::BranchExchange,
                &[Operand::Reg(reg(word, 0))],
            ))
        }
        0x012f_ff30 => {
            return Some(Fields::new(
                Op::Blx,
                OpClass::BranchExchange,
                &[Operand::Reg(reg(word, 0))],
            ))
        }
        _ => {}
    }

    if word & 0x0ff0_00f0 == 0x0120_0070 {
        if cond != Cond::Al {
            return None;
        }
        let imm = ((word >> 4) & 0xfff0) | (word & 0xf);
        return Some(Fields::new(
            Op::Bkpt,
            OpClass::Breakpoint,
            &[Operand::Imm(imm)],
        ));
    }

    if word & 0x0fff_0ff0 == 0x016f_0f10 {
        if rd == 15 {
            return None;
        }
        return Some(Fields::new(
            Op::Clz,
            OpClass::CountLeadingZeros,
            &[Operand::Reg(rd), Operand::Reg(reg(word, 0))],
        ));
    }

    if word & 0x0f90_0ff0 == 0x0100_0050 {
        if rd == 15 {
            return None;
        }
        let op = [Op::Qadd, Op::Qsub, Op::Qdadd, Op::Qdsub][((word >> 21) & 3) as usize];
        return Some(Fields::new(
            op,
            OpClass::SaturatingArith,
            &[
                Operand::Reg(rd),
                Operand::Reg(reg(word, 0)),
                Operand::Reg(reg(word, 16)),
            ],
        ));
    }

    if word & 0x0fff_0fff == 0x010f_0000 {
        if rd == 15 {
            return None;
        }
        return Some(Fields::new(Op::Mrs, OpClass::StatusAccess, &[Operand::Reg(rd)]));
    }

    if word & 0x0ff0_fff0 == 0x0120_f000 {
        return Some(Fields::new(
            Op::Msr,
            OpClass::StatusAccess,
            &[Operand::Imm((word >> 16) & 0xf), Operand::Reg(reg(word, 0))],
        ));
    }

    if word & 0x0fc0_00f0 == 0x0000_0090 {
        return decode_multiply(word);
    }

    if word & 0x0f80_00f0 == 0x0080_0090 {
        return decode_multiply_long(word);
    }

    if word & 0x90 == 0x90 {
        return decode_extra_load_store(word);
    }

    decode_data_processing(word)
}

fn decode_group1(word: u32) -> Option<Fields> {
    if word & 0x0ff0_f000 == 0x0320_f000 {
        return Some(Fields::new(
            Op::Msr,
            OpClass::StatusAccess,
            &[Operand::Imm((word >> 16) & 0xf), rotated_imm(word)],
        ));
    }
    decode_data_processing(word)
}

fn rotated_imm(word: u32) -> Operand {
    let rotate = ((word >> 8) & 0xf) * 2;
    Operand::RotatedImm {
        value: (word & 0xff).rotate_right(rotate),
        rotate: rotate as u8,
    }
}

/// Normalizes an immediate shift field into `(type, amount)`.
fn imm_shift(word: u32) -> (ShiftType, u8) {
    let amount = ((word >> 7) & 0x1f) as u8;
    match ((word >> 5) & 3, amount) {
        (1, 0) => (ShiftType::Lsr, 32),
        (2, 0) => (ShiftType::Asr, 32),
        (3, 0) => (ShiftType::Rrx, 1),
        (ty, n) => (SHIFT_TYPES[ty as usize], n),
    }
}

fn decode_data_processing(word: u32) -> Option<Fields> {
    let op = DATA_OPS[((word >> 21) & 0xf) as usize];
    let s = flag(word, 20);
    let rd = reg(word, 12);

    if op.is_compare() && !s {
        return None;
    }
    // Exception return (`MOVS pc, lr` and friends) needs banked SPSRs.
    if s && rd == 15 && !op.is_compare() {
        return None;
    }

    let (op2, class) = if flag(word, 25) {
        (rotated_imm(word), OpClass::DataProcessing)
    } else if flag(word, 4) {
        (
            Operand::Shifted {
                rm: reg(word, 0),
                shift: SHIFT_TYPES[((word >> 5) & 3) as usize],
                by: ShiftBy::Reg(reg(word, 8)),
            },
            OpClass::DataProcessingRegShift,
        )
    } else {
        let rm = reg(word, 0);
        let op2 = match imm_shift(word) {
            (ShiftType::Lsl, 0) => Operand::Reg(rm),
            (shift, amount) => Operand::Shifted {
                rm,
                shift,
                by: ShiftBy::Imm(amount),
            },
        };
        (op2, OpClass::DataProcessing)
    };

    let dst = if op.is_compare() {
        Operand::None
    } else {
        Operand::Reg(rd)
    };
    let src = if matches!(op, Op::Mov | Op::Mvn) {
        Operand::None
    } else {
        Operand::Reg(reg(word, 16))
    };

    Some(Fields::new(op, class, &[dst, src, op2]).with_flags(s))
}

fn decode_multiply(word: u32) -> Option<Fields> {
    let rd = reg(word, 16);
    let rm = reg(word, 0);
    let rs = reg(word, 8);
    if rd == 15 || rm == 15 || rs == 15 {
        return None;
    }
    let fields = if flag(word, 21) {
        let rn = reg(word, 12);
        if rn == 15 {
            return None;
        }
        Fields::new(
            Op::Mla,
            OpClass::Multiply,
            &[
                Operand::Reg(rd),
                Operand::Reg(rm),
                Operand::Reg(rs),
                Operand::Reg(rn),
            ],
        )
    } else {
        Fields::new(
            Op::Mul,
            OpClass::Multiply,
            &[Operand::Reg(rd), Operand::Reg(rm), Operand::Reg(rs)],
        )
    };
    Some(fields.with_flags(flag(word, 20)))
}

fn decode_multiply_long(word: u32) -> Option<Fields> {
    let hi = reg(word, 16);
    let lo = reg(word, 12);
    let rs = reg(word, 8);
    let rm = reg(word, 0);
    if hi == lo || [hi, lo, rs, rm].contains(&15) {
        return None;
    }
    let op = match (flag(word, 22), flag(word, 21)) {
        (false, false) => Op::Umull,
        (false, true) => Op::Umlal,
        (true, false) => Op::Smull,
        (true, true) => Op::Smlal,
    };
    Some(
        Fields::new(
            op,
            OpClass::MultiplyLong,
            &[
                Operand::Reg(lo),
                Operand::Reg(hi),
                Operand::Reg(rm),
                Operand::Reg(rs),
            ],
        )
        .with_flags(flag(word, 20)),
    )
}

fn mem_operand(word: u32, offset: MemOffset) -> Option<MemOperand> {
    let base = reg(word, 16);
    let pre = flag(word, 24);
    let writeback = !pre || flag(word, 21);
    if writeback && base == 15 {
        return None;
    }
    Some(MemOperand {
        base,
        offset,
        add: flag(word, 23),
        pre,
        writeback,
    })
}

fn decode_load_store(word: u32) -> Option<Fields> {
    let op = match (flag(word, 20), flag(word, 22)) {
        (true, false) => Op::Ldr,
        (false, false) => Op::Str,
        (true, true) => Op::Ldrb,
        (false, true) => Op::Strb,
    };
    let offset = if flag(word, 25) {
        let rm = reg(word, 0);
        if rm == 15 {
            return None;
        }
        let (shift, amount) = imm_shift(word);
        MemOffset::Reg { rm, shift, amount }
    } else {
        MemOffset::Imm(word & 0xfff)
    };
    let mem = mem_operand(word, offset)?;
    let rt = reg(word, 12);
    if op == Op::Ldrb && rt == 15 {
        return None;
    }
    Some(Fields::new(
        op,
        OpClass::LoadStore,
        &[Operand::Reg(rt), Operand::Mem(mem)],
    ))
}

fn decode_extra_load_store(word: u32) -> Option<Fields> {
    let op = match ((word >> 5) & 3, flag(word, 20)) {
        (1, false) => Op::Strh,
        (1, true) => Op::Ldrh,
        (2, true) => Op::Ldrsb,
        (3, true) => Op::Ldrsh,
        _ => return None,
    };
    let offset = if flag(word, 22) {
        MemOffset::Imm(((word >> 4) & 0xf0) | (word & 0xf))
    } else {
        let rm = reg(word, 0);
        if rm == 15 {
            return None;
        }
        MemOffset::Reg {
            rm,
            shift: ShiftType::Lsl,
            amount: 0,
        }
    };
    let rt = reg(word, 12);
    if rt == 15 {
        return None;
    }
    let mem = mem_operand(word, offset)?;
    Some(Fields::new(
        op,
        OpClass::LoadStoreExtra,
        &[Operand::Reg(rt), Operand::Mem(mem)],
    ))
}

fn decode_block(word: u32) -> Option<Fields> {
    let list = (word & 0xffff) as u16;
    let base = reg(word, 16);
    // User-bank transfers and exception returns are not modelled.
    if flag(word, 22) || list == 0 || base == 15 {
        return None;
    }
    let mode = match (flag(word, 24), flag(word, 23)) {
        (false, true) => BlockMode::Ia,
        (true, true) => BlockMode::Ib,
        (false, false) => BlockMode::Da,
        (true, false) => BlockMode::Db,
    };
    let op = if flag(word, 20) { Op::Ldm } else { Op::Stm };
    Some(Fields::new(
        op,
        OpClass::BlockTransfer,
        &[
            Operand::Block {
                base,
                mode,
                writeback: flag(word, 21),
            },
            Operand::RegList(list),
        ],
    ))
}

fn decode_branch(word: u32, address: u32) -> Fields {
    let offset = (((word & 0x00ff_ffff) << 8) as i32) >> 6;
    let target = address.wrapping_add(8).wrapping_add(offset as u32);
    let op = if flag(word, 24) { Op::Bl } else { Op::B };
    Fields::new(op, OpClass::Branch, &[Operand::Imm(target)])
}

fn decode_media(word: u32) -> Option<Fields> {
    let rd = reg(word, 12);
    let rm = reg(word, 0);

    let rev = match word & 0x0fff_0ff0 {
        0x06bf_0f30 => Some(Op::Rev),
        0x06bf_0fb0 => Some(Op::Rev16),
        0x06ff_0fb0 => Some(Op::Revsh),
        _ => None,
    };
    if let Some(op) = rev {
        if rd == 15 || rm == 15 {
            return None;
        }
        return Some(Fields::new(
            op,
            OpClass::ByteReverse,
            &[Operand::Reg(rd), Operand::Reg(rm)],
        ));
    }

    if word & 0x0ff0_00f0 == 0x0780_0010 {
        let rd = reg(word, 16);
        let rs = reg(word, 8);
        let rn = reg(word, 12);
        if rd == 15 || rs == 15 || rm == 15 {
            return None;
        }
        let mut operands = vec![Operand::Reg(rd), Operand::Reg(rm), Operand::Reg(rs)];
        let op = if rn == 15 {
            Op::Usad8
        } else {
            operands.push(Operand::Reg(rn));
            Op::Usada8
        };
        return Some(Fields::new(op, OpClass::SumAbsoluteDifference, &operands));
    }

    let op = match word & 0x0fff_03f0 {
        0x06af_0070 => Op::Sxtb,
        0x06bf_0070 => Op::Sxth,
        0x06ef_0070 => Op::Uxtb,
        0x06ff_0070 => Op::Uxth,
        _ => return None,
    };
    if rd == 15 || rm == 15 {
        return None;
    }
    let rotate = (((word >> 10) & 3) * 8) as u8;
    let src = if rotate == 0 {
        Operand::Reg(rm)
    } else {
        Operand::Shifted {
            rm,
            shift: ShiftType::Ror,
            by: ShiftBy::Imm(rotate),
        }
    };
    Some(Fields::new(op, OpClass::Extend, &[Operand::Reg(rd), src]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_register_add() {
        let inst = decode(0xe081_1002, 0x100).unwrap();
        assert_eq!(inst.op, Op::Add);
        assert_eq!(inst.class, OpClass::DataProcessing);
        assert_eq!(inst.cond, Cond::Al);
        assert!(!inst.set_flags);
        assert_eq!(
            inst.operands,
            [
                Operand::Reg(1),
                Operand::Reg(1),
                Operand::Reg(2),
                Operand::None
            ]
        );
        assert_eq!(inst.len, 4);
        assert_eq!(inst.reads(), 0b110);
        assert_eq!(inst.writes(), 0b10);
        assert!(!inst.is_terminal());
    }

    #[test]
    fn decodes_immediate_shifts() {
        // movs r0, r1, lsr #32
        let inst = decode(0xe1b0_0021, 0).unwrap();
        assert!(inst.set_flags);
        assert_eq!(
            inst.operands[2],
            Operand::Shifted {
                rm: 1,
                shift: ShiftType::Lsr,
                by: ShiftBy::Imm(32)
            }
        );

        // mov r0, r1, rrx
        let inst = decode(0xe1a0_0061, 0).unwrap();
        assert_eq!(
            inst.operands[2],
            Operand::Shifted {
                rm: 1,
                shift: ShiftType::Rrx,
                by: ShiftBy::Imm(1)
            }
        );

        // add r0, r1, r2, lsl r3
        let inst = decode(0xe081_0312, 0).unwrap();
        assert_eq!(inst.class, OpClass::DataProcessingRegShift);
        assert_eq!(inst.reads(), 0b1110);
    }

    #[test]
    fn decodes_rotated_immediate() {
        // mov r0, #0xff000000
        let inst = decode(0xe3a0_04ff, 0).unwrap();
        assert_eq!(
            inst.operands[2],
            Operand::RotatedImm {
                value: 0xff00_0000,
                rotate: 8
            }
        );
    }

    #[test]
    fn branch_targets_are_absolute() {
        // b . (offset -2 words)
        let inst = decode(0xeaff_fffe, 0x1000).unwrap();
        assert_eq!(inst.branch_target(), Some(0x1000));
        assert!(inst.is_terminal());

        // blne +0x100
        let inst = decode(0x1b00_0040, 0x2000).unwrap();
        assert_eq!(inst.op, Op::Bl);
        assert_eq!(inst.cond, Cond::Ne);
        assert_eq!(inst.branch_target(), Some(0x2108));
        assert_eq!(inst.writes(), (1 << PC) | (1 << LR));
    }

    #[test]
    fn decodes_memory_forms() {
        // ldr r0, [r1, #4]!
        let inst = decode(0xe5b1_0004, 0).unwrap();
        assert_eq!(inst.op, Op::Ldr);
        assert_eq!(
            inst.operands[1],
            Operand::Mem(MemOperand {
                base: 1,
                offset: MemOffset::Imm(4),
                add: true,
                pre: true,
                writeback: true,
            })
        );
        assert_eq!(inst.writes(), 0b11);

        // strh r2, [r3], #-6
        let inst = decode(0xe043_20b6, 0).unwrap();
        assert_eq!(inst.op, Op::Strh);
        assert_eq!(inst.class, OpClass::LoadStoreExtra);
        assert_eq!(inst.reads(), 0b1100);
        assert_eq!(inst.writes(), 0b1000);

        // pop {r4, pc}
        let inst = decode(0xe8bd_8010, 0).unwrap();
        assert_eq!(inst.op, Op::Ldm);
        assert!(inst.is_terminal());
        assert_eq!(inst.writes(), (1 << PC) | (1 << 13) | (1 << 4));
    }

    #[test]
    fn decodes_misc_and_media() {
        assert_eq!(decode(0xe12f_ff1e, 0).unwrap().op, Op::Bx);
        assert_eq!(decode(0xe16f_0f11, 0).unwrap().op, Op::Clz);
        assert_eq!(decode(0xe6bf_0f31, 0).unwrap().op, Op::Rev);
        assert_eq!(decode(0xe6bf_0fb1, 0).unwrap().op, Op::Rev16);
        assert_eq!(decode(0xe6ff_0fb1, 0).unwrap().op, Op::Revsh);
        assert_eq!(decode(0xe6af_0071, 0).unwrap().op, Op::Sxtb);
        assert_eq!(decode(0xe6ff_0471, 0).unwrap().op, Op::Uxth);
        assert_eq!(decode(0xe782_f311, 0).unwrap().op, Op::Usad8);
        assert_eq!(decode(0xe782_4311, 0).unwrap().op, Op::Usada8);
        assert_eq!(decode(0xe102_0051, 0).unwrap().op, Op::Qadd);
        assert_eq!(decode(0xe10f_0000, 0).unwrap().op, Op::Mrs);
        assert_eq!(decode(0xe128_f001, 0).unwrap().op, Op::Msr);
        assert_eq!(decode(0xe120_0070, 0).unwrap().op, Op::Bkpt);
        assert_eq!(decode(0xef00_0001, 0).unwrap().op, Op::Swi);
        assert_eq!(decode(0xe002_0190, 0).unwrap().op, Op::Mul);
        assert_eq!(decode(0xe0c1_0392, 0).unwrap().op, Op::Smull);
    }

    #[test]
    fn rejects_undefined_encodings() {
        for word in [
            0xf000_0000u32, // unconditional space
            0xee00_0a10,    // coprocessor
            0xe100_0000,    // tst without S
            0xe1b0_f00e,    // movs pc, lr
            0xe14f_0000,    // mrs r0, spsr
            0xe8fd_8000,    // ldm with S bit
            0xe8bd_0000,    // empty register list
            0xe101_0092,    // swp
            0x1120_0070,    // conditional bkpt
        ] {
            assert_eq!(
                decode(word, 0x40),
                Err(UndefinedInstruction { word, address: 0x40 }),
                "{word:#010x}"
            );
        }
    }

    #[test]
    fn condition_evaluation() {
        use crate::state::flag;

        assert!(Cond::Eq.passes(flag::Z));
        assert!(!Cond::Eq.passes(0));
        assert!(Cond::Hi.passes(flag::C));
        assert!(!Cond::Hi.passes(flag::C | flag::Z));
        assert!(Cond::Ge.passes(flag::N | flag::V));
        assert!(Cond::Lt.passes(flag::N));
        assert!(Cond::Gt.passes(0));
        assert!(Cond::Le.passes(flag::Z));
        assert!(Cond::Al.passes(0));
    }
}
