use std::io::Write;
use std::path::PathBuf;

use armjit::{state::ExitReason, *};

fn parse_num(s: &str) -> anyhow::Result<u32> {
    let n = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16)?,
        None => s.replace('_', "").parse()?,
    };
    Ok(n)
}

/// Runs the guest, handling `swi #0` (exit with r0) and `swi #1` (write the low byte
/// of r0 to stdout).
fn serve(engine: &mut dyn Engine) -> anyhow::Result<i32> {
    let mut out = std::io::stdout().lock();

    loop {
        match engine.run()? {
            ExitReason::SystemCall(0) => {
                out.flush()?;
                return Ok(engine.state().regs[0] as i32);
            }
            ExitReason::SystemCall(1) => {
                out.write_all(&[engine.state().regs[0] as u8])?;
            }
            exit => {
                out.flush()?;
                anyhow::bail!(
                    "guest stopped at pc={:08x}: {exit:?}",
                    engine.state().pc()
                );
            }
        }
    }
}

#[argopt::subcmd]
fn run(
    #[opt(long, default_value = "jit")] engine: String,
    #[opt(long, default_value = "0")] base: String,
    #[opt(long, default_value = "0x1000000")] memory: String,
    #[opt(long, default_value = "64")] max_block_insns: usize,
    #[opt(long)] no_link: bool,
    bin: PathBuf,
) -> anyhow::Result<()> {
    let bin = std::fs::read(bin)?;
    let base = parse_num(&base)?;
    let memory = parse_num(&memory)? as usize;

    let mut machine: Box<dyn Engine> = match engine.as_ref() {
        "interpreter" => Box::new(interpreter::Machine::from_bin(&bin, base, memory)?),
        "jit" => {
            let config = jit::JitConfig {
                max_block_insns,
                link_blocks: !no_link,
                ..Default::default()
            };
            Box::new(jit::Machine::from_bin(&bin, base, memory, config)?)
        }
        _ => anyhow::bail!("unknown engine: {}", engine),
    };

    let code = serve(machine.as_mut())?;
    drop(machine);

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[argopt::subcmd]
fn disasm(#[opt(long, default_value = "0")] base: String, bin: PathBuf) -> anyhow::Result<()> {
    let bin = std::fs::read(bin)?;
    let asm = disasm::disasm(parse_num(&base)?, &disasm::words(&bin)?);

    for instr in asm {
        println!("{}", instr);
    }

    Ok(())
}

#[argopt::cmd_group(commands = [run, disasm])]
fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
}
