use std::fmt;

use crate::decoder::{
    decode, BlockMode, DecodedInstruction, MemOffset, Op, OpClass, Operand, ShiftBy, ShiftType,
};

/// Splits a raw little-endian image into instruction words.
pub fn words(bin: &[u8]) -> anyhow::Result<Vec<u32>> {
    let chunks = bin.chunks_exact(4);
    if !chunks.remainder().is_empty() {
        anyhow::bail!("invalid binary: {} bytes is not a whole number of words", bin.len());
    }
    Ok(chunks
        .into_iter()
        .map(|w| w.try_into().map(u32::from_le_bytes))
        .collect::<Result<_, _>>()?)
}

/// One listing line per word. Words that do not decode are flagged, not rejected.
pub fn disasm(pc_base: u32, progn: &[u32]) -> Vec<String> {
    progn
        .iter()
        .enumerate()
        .map(|(pc_ofs, &word)| {
            let pc = pc_base.wrapping_add(pc_ofs as u32 * 4);
            match decode(word, pc) {
                Ok(inst) => format!("{pc:#010x}: {word:08x}   {inst}"),
                Err(_) => format!("{pc:#010x}: {word:08x} ! undefined"),
            }
        })
        .collect()
}

struct RegName(u8);

impl fmt::Display for RegName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            13 => f.write_str("sp"),
            14 => f.write_str("lr"),
            15 => f.write_str("pc"),
            r => write!(f, "r{r}"),
        }
    }
}

fn shift_name(shift: ShiftType) -> &'static str {
    match shift {
        ShiftType::Lsl => "lsl",
        ShiftType::Lsr => "lsr",
        ShiftType::Asr => "asr",
        ShiftType::Ror => "ror",
        ShiftType::Rrx => "rrx",
    }
}

fn write_shift(f: &mut fmt::Formatter<'_>, shift: ShiftType, by: ShiftBy) -> fmt::Result {
    match (shift, by) {
        (ShiftType::Rrx, _) => f.write_str(", rrx"),
        (_, ShiftBy::Imm(n)) => write!(f, ", {} #{n}", shift_name(shift)),
        (_, ShiftBy::Reg(rs)) => write!(f, ", {} {}", shift_name(shift), RegName(rs)),
    }
}

fn write_reg_list(f: &mut fmt::Formatter<'_>, list: u16) -> fmt::Result {
    f.write_str("{")?;
    let mut first = true;
    for r in (0..16u8).filter(|r| list & (1 << r) != 0) {
        if !first {
            f.write_str(", ")?;
        }
        first = false;
        write!(f, "{}", RegName(r))?;
    }
    f.write_str("}")
}

impl DecodedInstruction {
    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, index: usize) -> fmt::Result {
        match self.operands[index] {
            Operand::None => Ok(()),
            Operand::Reg(r) => write!(f, "{}", RegName(r)),
            Operand::Imm(n) => match self.class {
                OpClass::Branch => write!(f, "{n:#x}"),
                OpClass::StatusAccess => {
                    f.write_str("cpsr_")?;
                    if n & 0b1000 != 0 {
                        f.write_str("f")?;
                    }
                    if n & 0b0001 != 0 {
                        f.write_str("c")?;
                    }
                    Ok(())
                }
                _ => write!(f, "#{n:#x}"),
            },
            Operand::RotatedImm { value, .. } => write!(f, "#{value:#x}"),
            Operand::Shifted { rm, shift, by } => {
                write!(f, "{}", RegName(rm))?;
                write_shift(f, shift, by)
            }
            Operand::Mem(mem) => {
                let sign = if mem.add { "" } else { "-" };
                let offset = match mem.offset {
                    MemOffset::Imm(0) => String::new(),
                    MemOffset::Imm(n) => format!(", #{sign}{n:#x}"),
                    MemOffset::Reg { rm, shift, amount } => {
                        let mut s = format!(", {sign}{}", RegName(rm));
                        match (shift, amount) {
                            (ShiftType::Lsl, 0) => {}
                            (ShiftType::Rrx, _) => s.push_str(", rrx"),
                            (shift, n) => s.push_str(&format!(", {} #{n}", shift_name(shift))),
                        }
                        s
                    }
                };
                if mem.pre {
                    let wb = if mem.writeback { "!" } else { "" };
                    write!(f, "[{}{offset}]{wb}", RegName(mem.base))
                } else {
                    write!(f, "[{}]{offset}", RegName(mem.base))
                }
            }
            Operand::Block {
                base, writeback, ..
            } => write!(f, "{}{}", RegName(base), if writeback { "!" } else { "" }),
            Operand::RegList(list) => write_reg_list(f, list),
        }
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op.mnemonic())?;
        if let Operand::Block { mode, .. } = self.operands[0] {
            f.write_str(match mode {
                BlockMode::Ia => "ia",
                BlockMode::Ib => "ib",
                BlockMode::Da => "da",
                BlockMode::Db => "db",
            })?;
        }
        f.write_str(self.cond.suffix())?;
        if self.set_flags && !self.op.is_compare() {
            f.write_str("s")?;
        }

        let mut first = true;
        for index in 0..self.operands.len() {
            if self.operands[index] == Operand::None {
                continue;
            }
            f.write_str(if first { " " } else { ", " })?;
            first = false;
            self.fmt_operand(f, index)?;
        }

        if self.op == Op::Mrs {
            f.write_str(", cpsr")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(word: u32, address: u32) -> String {
        decode(word, address).unwrap().to_string()
    }

    #[test]
    fn renders_common_forms() {
        assert_eq!(text(0xe081_1002, 0), "add r1, r1, r2");
        assert_eq!(text(0xe1b0_0021, 0), "movs r0, r1, lsr #32");
        assert_eq!(text(0xe351_0102, 0), "cmp r1, #0x80000000");
        assert_eq!(text(0x1b00_0040, 0x2000), "blne 0x2108");
        assert_eq!(text(0xe5b1_0004, 0), "ldr r0, [r1, #0x4]!");
        assert_eq!(text(0xe043_20b6, 0), "strh r2, [r3], #-0x6");
        assert_eq!(text(0xe8bd_8010, 0), "ldmia sp!, {r4, pc}");
        assert_eq!(text(0xe12f_ff1e, 0), "bx lr");
        assert_eq!(text(0xe10f_4000, 0), "mrs r4, cpsr");
        assert_eq!(text(0xe328_f20f, 0), "msr cpsr_f, #0xf0000000");
        assert_eq!(text(0xef00_0001, 0), "swi #0x1");
    }

    #[test]
    fn listing_marks_undefined_words() {
        let listing = disasm(0x100, &[0xe081_1002, 0xee00_0a10]);
        assert_eq!(listing[0], "0x00000100: e0811002   add r1, r1, r2");
        assert_eq!(listing[1], "0x00000104: ee000a10 ! undefined");
    }

    #[test]
    fn words_are_little_endian() {
        assert_eq!(words(&[0x02, 0x10, 0x81, 0xe0]).unwrap(), vec![0xe081_1002]);
        assert!(words(&[0; 3]).is_err());
    }
}
