//! Guest processor state.
//!
//! The layout is `#[repr(C)]` because generated code addresses the fields directly; see
//! the `*_offset` helpers, which are the only place those offsets are computed.

use memoffset::offset_of;

pub const NUM_REGS: usize = 16;
pub const SP: usize = 13;
pub const LR: usize = 14;
pub const PC: usize = 15;

/// CPSR bits.
pub mod flag {
    pub const N: u32 = 1 << 31;
    pub const Z: u32 = 1 << 30;
    pub const C: u32 = 1 << 29;
    pub const V: u32 = 1 << 28;
    pub const Q: u32 = 1 << 27;
    pub const T: u32 = 1 << 5;
    pub const MODE_MASK: u32 = 0x1f;

    pub const NZCV: u32 = N | Z | C | V;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Mode {
    User = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Supervisor = 0x13,
    Abort = 0x17,
    Undefined = 0x1b,
    System = 0x1f,
}

/// Why the dispatcher handed control back to its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// `SWI` with its 24-bit comment field. The pc already points past the instruction.
    SystemCall(u32),
    UndefinedInstructionFault { address: u32, word: u32 },
    /// `BKPT` with its 16-bit immediate. The pc points at the breakpoint.
    Breakpoint(u16),
    /// A load or store touched an address outside guest memory.
    DataAbort(u32),
    /// Instruction fetch outside guest memory.
    PrefetchAbort(u32),
    /// The tick budget given to `run_for` ran out.
    BudgetExhausted,
}

// Encodings of `ProcessorState::exit`. Generated code writes these directly.
pub(crate) const EXIT_NONE: u32 = 0;
pub(crate) const EXIT_SYSTEM_CALL: u32 = 1;
pub(crate) const EXIT_UNDEFINED: u32 = 2;
pub(crate) const EXIT_BREAKPOINT: u32 = 3;
pub(crate) const EXIT_DATA_ABORT: u32 = 4;
pub(crate) const EXIT_PREFETCH_ABORT: u32 = 5;

#[repr(C)]
#[derive(Clone, Debug)]
pub struct ProcessorState {
    pub regs: [u32; NUM_REGS],
    pub cpsr: u32,
    pub(crate) exit: u32,
    pub(crate) exit_info: u32,
    pub(crate) ticks: i32,
}

/// The architecturally visible part of [`ProcessorState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub regs: [u32; NUM_REGS],
    pub cpsr: u32,
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorState {
    pub fn new() -> Self {
        Self {
            regs: [0; NUM_REGS],
            cpsr: Mode::User as u32,
            exit: EXIT_NONE,
            exit_info: 0,
            ticks: 0,
        }
    }

    pub fn pc(&self) -> u32 {
        self.regs[PC]
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.regs[PC] = pc & !3;
    }

    pub fn flag(&self, mask: u32) -> bool {
        self.cpsr & mask != 0
    }

    pub fn set_flag(&mut self, mask: u32, on: bool) {
        if on {
            self.cpsr |= mask;
        } else {
            self.cpsr &= !mask;
        }
    }

    pub fn mode(&self) -> u32 {
        self.cpsr & flag::MODE_MASK
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            regs: self.regs,
            cpsr: self.cpsr,
        }
    }

    pub(crate) fn raise(&mut self, reason: ExitReason) {
        let (code, info) = match reason {
            ExitReason::SystemCall(n) => (EXIT_SYSTEM_CALL, n),
            ExitReason::UndefinedInstructionFault { word, .. } => (EXIT_UNDEFINED, word),
            ExitReason::Breakpoint(n) => (EXIT_BREAKPOINT, n as u32),
            ExitReason::DataAbort(addr) => (EXIT_DATA_ABORT, addr),
            ExitReason::PrefetchAbort(addr) => (EXIT_PREFETCH_ABORT, addr),
            ExitReason::BudgetExhausted => return,
        };
        self.exit = code;
        self.exit_info = info;
    }

    pub(crate) fn has_exit(&self) -> bool {
        self.exit != EXIT_NONE
    }

    /// Decodes and clears the pending exit.
    pub(crate) fn take_exit(&mut self) -> Option<ExitReason> {
        let info = self.exit_info;
        let reason = match self.exit {
            EXIT_NONE => return None,
            EXIT_SYSTEM_CALL => ExitReason::SystemCall(info),
            EXIT_UNDEFINED => ExitReason::UndefinedInstructionFault {
                address: self.pc(),
                word: info,
            },
            EXIT_BREAKPOINT => ExitReason::Breakpoint(info as u16),
            EXIT_DATA_ABORT => ExitReason::DataAbort(info),
            EXIT_PREFETCH_ABORT => ExitReason::PrefetchAbort(info),
            code => unreachable!("corrupt exit code {code}"),
        };
        self.exit = EXIT_NONE;
        self.exit_info = 0;
        Some(reason)
    }

    pub(crate) fn reg_offset(r: usize) -> i32 {
        (offset_of!(ProcessorState, regs) + r * 4) as i32
    }

    pub(crate) fn cpsr_offset() -> i32 {
        offset_of!(ProcessorState, cpsr) as i32
    }

    pub(crate) fn exit_offset() -> i32 {
        offset_of!(ProcessorState, exit) as i32
    }

    pub(crate) fn exit_info_offset() -> i32 {
        offset_of!(ProcessorState, exit_info) as i32
    }

    pub(crate) fn ticks_offset() -> i32 {
        offset_of!(ProcessorState, ticks) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_round_trips_through_state() {
        let mut state = ProcessorState::new();
        state.set_pc(0x1000);
        state.raise(ExitReason::UndefinedInstructionFault {
            address: 0x1000,
            word: 0xee00_0a10,
        });
        assert!(state.has_exit());
        assert_eq!(
            state.take_exit(),
            Some(ExitReason::UndefinedInstructionFault {
                address: 0x1000,
                word: 0xee00_0a10
            })
        );
        assert_eq!(state.take_exit(), None);
    }

    #[test]
    fn layout_is_stable() {
        assert_eq!(ProcessorState::reg_offset(0), 0);
        assert_eq!(ProcessorState::reg_offset(PC), 60);
        assert_eq!(ProcessorState::cpsr_offset(), 64);
        assert_eq!(ProcessorState::exit_offset(), 68);
        assert_eq!(ProcessorState::exit_info_offset(), 72);
        assert_eq!(ProcessorState::ticks_offset(), 76);
    }

    #[test]
    fn set_pc_drops_low_bits() {
        let mut state = ProcessorState::new();
        state.set_pc(0x1003);
        assert_eq!(state.pc(), 0x1000);
        assert_eq!(state.mode(), Mode::User as u32);
    }
}
