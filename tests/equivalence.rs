use armjit::{
    decoder::decode,
    interpreter,
    jit::{self, Core, JitConfig, StrategyTable, System},
    memory::GuestMemory,
    state::{ExitReason, Mode, ProcessorState, LR, SP},
};
use proptest::prelude::*;

const BASE: u32 = 0x1000;
const MEMORY_SIZE: usize = 0x1_0000;
const BUDGET: i32 = 100_000;
const SWI_EXIT: u32 = 0xef00_0000;

/// A data-processing, multiply, misc or load/store encoding that stays in the block.
fn straight_line() -> impl Strategy<Value = u32> {
    (0u32..15, 0u32..0x0800_0000)
        .prop_map(|(cond, bits)| (cond << 28) | bits)
        .prop_filter("undefined or ends the block", |&word| {
            decode(word, 0).is_ok_and(|inst| !inst.is_terminal())
        })
}

#[derive(Clone, Debug)]
struct Program {
    words: Vec<u32>,
    regs: [u32; 13],
    flags: u32,
    lr: u32,
}

fn program() -> impl Strategy<Value = Program> {
    (
        prop::collection::vec(straight_line(), 1..12),
        prop::array::uniform13(0x8000u32..0xf000),
        0u32..16,
    )
        .prop_map(|(words, regs, flags)| Program {
            words,
            regs,
            flags,
            lr: 0,
        })
}

/// One slot of a multi-block program. Branch targets are word indices into the image.
#[derive(Clone, Debug)]
enum Piece {
    Word(u32),
    Branch { cond: u32, link: bool, target: usize },
    Swi { cond: u32, number: u32 },
    Bkpt(u32),
    Return { cond: u32, exchange: bool },
}

fn piece() -> impl Strategy<Value = Piece> {
    prop_oneof![
        4 => straight_line().prop_map(Piece::Word),
        2 => (0u32..15, any::<bool>(), any::<usize>())
            .prop_map(|(cond, link, target)| Piece::Branch { cond, link, target }),
        1 => (0u32..15, 0u32..4).prop_map(|(cond, number)| Piece::Swi { cond, number }),
        1 => (0u32..0x1_0000).prop_map(Piece::Bkpt),
        1 => (0u32..15, any::<bool>()).prop_map(|(cond, exchange)| Piece::Return { cond, exchange }),
    ]
}

/// Encodes `pieces` at `BASE`. Targets wrap into the image, the trailing `swi #0` included.
fn assemble(pieces: &[Piece]) -> Vec<u32> {
    let slots = pieces.len() + 1;
    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| match *piece {
            Piece::Word(word) => word,
            Piece::Branch { cond, link, target } => {
                let from = BASE + i as u32 * 4 + 8;
                let to = BASE + (target % slots) as u32 * 4;
                let offset = (to.wrapping_sub(from) >> 2) & 0x00ff_ffff;
                (cond << 28) | 0x0a00_0000 | ((link as u32) << 24) | offset
            }
            Piece::Swi { cond, number } => (cond << 28) | 0x0f00_0000 | number,
            Piece::Bkpt(imm) => 0xe120_0070 | ((imm & 0xfff0) << 4) | (imm & 0xf),
            // bx lr
            Piece::Return {
                cond,
                exchange: true,
            } => (cond << 28) | 0x012f_ff1e,
            // mov pc, lr
            Piece::Return {
                cond,
                exchange: false,
            } => (cond << 28) | 0x01a0_f00e,
        })
        .collect()
}

fn branching_program() -> impl Strategy<Value = Program> {
    (
        prop::collection::vec(piece(), 1..24),
        prop::array::uniform13(0x8000u32..0xf000),
        0u32..16,
        any::<usize>(),
    )
        .prop_map(|(pieces, regs, flags, lr)| {
            let lr = BASE + (lr % (pieces.len() + 1)) as u32 * 4;
            Program {
                words: assemble(&pieces),
                regs,
                flags,
                lr,
            }
        })
}

fn initial_state(program: &Program) -> ProcessorState {
    let mut state = ProcessorState::new();
    state.regs[..13].copy_from_slice(&program.regs);
    state.regs[SP] = 0x8000;
    state.regs[LR] = program.lr;
    state.cpsr = (program.flags << 28) | Mode::User as u32;
    state.set_pc(BASE);
    state
}

fn load(program: &Program) -> GuestMemory {
    let memory = GuestMemory::new(0, MEMORY_SIZE);
    let image = program
        .words
        .iter()
        .chain([&SWI_EXIT])
        .flat_map(|w| w.to_le_bytes())
        .collect::<Vec<_>>();
    memory.load_image(BASE, &image).unwrap();
    memory
}

fn dump(memory: &GuestMemory) -> Vec<u32> {
    (0..MEMORY_SIZE as u32)
        .step_by(4)
        .map(|address| memory.read_u32(address).unwrap())
        .collect()
}

fn check(program: &Program, strategy: StrategyTable) -> Result<(), TestCaseError> {
    let mut machine = interpreter::Machine::new(load(program));
    *machine.state_mut() = initial_state(program);
    let expected = machine.run_for(BUDGET);

    let config = JitConfig {
        strategy,
        ..Default::default()
    };
    let system = std::sync::Arc::new(System::new(load(program), config).unwrap());
    let mut core = Core::new(system.clone());
    *core.state_mut() = initial_state(program);
    let actual = core.run_for(BUDGET).unwrap();

    // A store may rewrite the program into a loop; tick accounting differs per engine.
    if expected == ExitReason::BudgetExhausted || actual == ExitReason::BudgetExhausted {
        return Ok(());
    }

    prop_assert_eq!(actual, expected);
    prop_assert_eq!(core.state().snapshot(), machine.state().snapshot());
    prop_assert!(dump(system.memory()) == dump(machine.memory()), "memory differs");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_global_rejects: 1 << 16,
        ..ProptestConfig::default()
    })]

    #[test]
    fn jit_matches_interpreter(program in program()) {
        check(&program, StrategyTable::default())?;
    }

    #[test]
    fn native_everywhere_matches_interpreter(program in program()) {
        check(&program, StrategyTable::all(jit::Strategy::Native))?;
    }

    #[test]
    fn branching_programs_match_interpreter(program in branching_program()) {
        check(&program, StrategyTable::default())?;
        check(&program, StrategyTable::all(jit::Strategy::Native))?;
    }
}
