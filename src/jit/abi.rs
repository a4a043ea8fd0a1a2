//! Host calling convention tables.
//!
//! Everything the translator knows about the host ABI lives here: which registers carry
//! arguments and results, which survive a call, and the calling convention handed to
//! Cranelift for call-outs. One table is selected at build time as [`HOST`].

use cranelift::prelude::{isa::CallConv, AbiParam, Signature, Type};

use super::JitError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterRole {
    Argument(usize),
    Return,
    CallerSaved,
    CalleeSaved,
}

#[derive(Debug)]
pub struct HostAbi {
    pub name: &'static str,
    pub call_conv: CallConv,
    pub arguments: &'static [&'static str],
    pub ret: &'static str,
    pub caller_saved: &'static [&'static str],
    pub callee_saved: &'static [&'static str],
    /// Bytes the caller reserves above the return address for the callee.
    pub shadow_space: u32,
    pub stack_alignment: u32,
}

pub static SYSV_X64: HostAbi = HostAbi {
    name: "x86-64 System V",
    call_conv: CallConv::SystemV,
    arguments: &["rdi", "rsi", "rdx", "rcx", "r8", "r9"],
    ret: "rax",
    caller_saved: &[
        "rax", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "r10", "r11",
    ],
    callee_saved: &["rbx", "rbp", "r12", "r13", "r14", "r15"],
    shadow_space: 0,
    stack_alignment: 16,
};

pub static WIN64: HostAbi = HostAbi {
    name: "x86-64 Windows",
    call_conv: CallConv::WindowsFastcall,
    arguments: &["rcx", "rdx", "r8", "r9"],
    ret: "rax",
    caller_saved: &["rax", "rcx", "rdx", "r8", "r9", "r10", "r11"],
    callee_saved: &[
        "rbx", "rsi", "rdi", "rbp", "r12", "r13", "r14", "r15",
    ],
    shadow_space: 32,
    stack_alignment: 16,
};

pub static AAPCS64: HostAbi = HostAbi {
    name: "AArch64 AAPCS",
    call_conv: if cfg!(target_os = "macos") {
        CallConv::AppleAarch64
    } else {
        CallConv::SystemV
    },
    arguments: &["x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7"],
    ret: "x0",
    caller_saved: &[
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17",
    ],
    callee_saved: &[
        "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28",
    ],
    shadow_space: 0,
    stack_alignment: 16,
};

#[cfg(all(target_arch = "x86_64", windows))]
pub static HOST: &HostAbi = &WIN64;
#[cfg(all(target_arch = "x86_64", not(windows)))]
pub static HOST: &HostAbi = &SYSV_X64;
#[cfg(target_arch = "aarch64")]
pub static HOST: &HostAbi = &AAPCS64;

impl HostAbi {
    /// The most specific role of `reg`: return beats argument beats caller-saved.
    pub fn role(&self, reg: &str) -> Option<RegisterRole> {
        if self.ret == reg {
            return Some(RegisterRole::Return);
        }
        if let Some(n) = self.arguments.iter().position(|&r| r == reg) {
            return Some(RegisterRole::Argument(n));
        }
        if self.caller_saved.contains(&reg) {
            return Some(RegisterRole::CallerSaved);
        }
        if self.callee_saved.contains(&reg) {
            return Some(RegisterRole::CalleeSaved);
        }
        None
    }

    /// Signature for a call from generated code into a Rust helper. Every argument must
    /// travel in a register.
    pub fn callout_signature(&self, params: &[Type], returns: &[Type]) -> Result<Signature, JitError> {
        if params.len() > self.arguments.len() {
            return Err(JitError::TooManyCalloutArgs {
                needed: params.len(),
                available: self.arguments.len(),
            });
        }
        Ok(Signature {
            params: params.iter().map(|&ty| AbiParam::new(ty)).collect(),
            returns: returns.iter().map(|&ty| AbiParam::new(ty)).collect(),
            call_conv: self.call_conv,
        })
    }

    /// Whether `live` cached guest values can all stay in callee-saved registers across a
    /// call. When they cannot, generated code reloads them from memory afterwards.
    pub fn keeps_live_across_call(&self, live: usize) -> bool {
        live <= self.callee_saved.len()
    }
}
