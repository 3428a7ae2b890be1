//! General purpose register sets and the C calling convention of the
//! architectures we can inject into.
//!
//! The layouts mirror the kernel's `NT_PRSTATUS` regset, so a `Regs` can be
//! handed to `PTRACE_GETREGSET`/`PTRACE_SETREGSET` as is.

use std::mem::size_of;

pub const WORD_SIZE: usize = size_of::<usize>();

/// Stack words a remote call needs in place before the target is resumed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub addr: usize,
    pub words: Vec<usize>,
}

impl CallFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }
}

pub fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::{align_down, CallFrame, WORD_SIZE};

    pub const ARG_REGS: usize = 6;
    pub const RED_ZONE: usize = 128;
    pub const STACK_ALIGN: usize = 16;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Regs {
        pub r15: u64,
        pub r14: u64,
        pub r13: u64,
        pub r12: u64,
        pub rbp: u64,
        pub rbx: u64,
        pub r11: u64,
        pub r10: u64,
        pub r9: u64,
        pub r8: u64,
        pub rax: u64,
        pub rcx: u64,
        pub rdx: u64,
        pub rsi: u64,
        pub rdi: u64,
        pub orig_rax: u64,
        pub rip: u64,
        pub cs: u64,
        pub eflags: u64,
        pub rsp: u64,
        pub ss: u64,
        pub fs_base: u64,
        pub gs_base: u64,
        pub ds: u64,
        pub es: u64,
        pub fs: u64,
        pub gs: u64,
    }

    impl Regs {
        pub fn ip(&self) -> usize {
            self.rip as usize
        }

        pub fn set_ip(&mut self, ip: usize) {
            self.rip = ip as u64;
        }

        pub fn sp(&self) -> usize {
            self.rsp as usize
        }

        pub fn set_sp(&mut self, sp: usize) {
            self.rsp = sp as u64;
        }

        pub fn ret(&self) -> usize {
            self.rax as usize
        }

        pub fn set_ret(&mut self, val: usize) {
            self.rax = val as u64;
        }

        fn arg_mut(&mut self, idx: usize) -> &mut u64 {
            match idx {
                0 => &mut self.rdi,
                1 => &mut self.rsi,
                2 => &mut self.rdx,
                3 => &mut self.rcx,
                4 => &mut self.r8,
                5 => &mut self.r9,
                _ => unreachable!("x86_64 passes only {} arguments in registers", ARG_REGS),
            }
        }

        pub fn arg(&self, idx: usize) -> usize {
            let mut regs = *self;
            *regs.arg_mut(idx) as usize
        }

        /// System V: rdi, rsi, rdx, rcx, r8, r9, then the stack. The return
        /// address sits on top of the stack, which is 16 byte aligned before
        /// it was pushed.
        pub fn prepare_call(&mut self, func: usize, return_addr: usize, args: &[usize]) -> CallFrame {
            let (in_regs, on_stack) = args.split_at(args.len().min(ARG_REGS));
            for (idx, arg) in in_regs.iter().enumerate() {
                *self.arg_mut(idx) = *arg as u64;
            }
            let sp = align_down(
                self.sp() - RED_ZONE - on_stack.len() * WORD_SIZE,
                STACK_ALIGN,
            ) - WORD_SIZE;
            let mut words = Vec::with_capacity(on_stack.len() + 1);
            words.push(return_addr);
            words.extend_from_slice(on_stack);

            self.set_sp(sp);
            self.set_ip(func);
            CallFrame { addr: sp, words }
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::{align_down, CallFrame, WORD_SIZE};

    pub const ARG_REGS: usize = 8;
    pub const STACK_ALIGN: usize = 16;
    const LR: usize = 30;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Regs {
        pub regs: [u64; 31],
        pub sp: u64,
        pub pc: u64,
        pub pstate: u64,
    }

    impl Regs {
        pub fn ip(&self) -> usize {
            self.pc as usize
        }

        pub fn set_ip(&mut self, ip: usize) {
            self.pc = ip as u64;
        }

        pub fn sp(&self) -> usize {
            self.sp as usize
        }

        pub fn set_sp(&mut self, sp: usize) {
            self.sp = sp as u64;
        }

        pub fn ret(&self) -> usize {
            self.regs[0] as usize
        }

        pub fn set_ret(&mut self, val: usize) {
            self.regs[0] = val as u64;
        }

        pub fn arg(&self, idx: usize) -> usize {
            assert!(idx < ARG_REGS);
            self.regs[idx] as usize
        }

        /// AAPCS64: x0-x7, then the stack. The callee returns through x30.
        pub fn prepare_call(&mut self, func: usize, return_addr: usize, args: &[usize]) -> CallFrame {
            let (in_regs, on_stack) = args.split_at(args.len().min(ARG_REGS));
            for (idx, arg) in in_regs.iter().enumerate() {
                self.regs[idx] = *arg as u64;
            }
            let sp = align_down(self.sp() - on_stack.len() * WORD_SIZE, STACK_ALIGN);

            self.regs[LR] = return_addr as u64;
            self.set_sp(sp);
            self.set_ip(func);
            CallFrame {
                addr: sp,
                words: on_stack.to_vec(),
            }
        }
    }
}

#[cfg(target_arch = "arm")]
mod arch {
    use super::{align_down, CallFrame, WORD_SIZE};

    pub const ARG_REGS: usize = 4;
    pub const STACK_ALIGN: usize = 16;
    const SP: usize = 13;
    const LR: usize = 14;
    const PC: usize = 15;
    const CPSR: usize = 16;
    const CPSR_T_MASK: u32 = 1 << 5;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Regs {
        pub uregs: [u32; 18],
    }

    impl Regs {
        pub fn ip(&self) -> usize {
            self.uregs[PC] as usize
        }

        /// An odd address selects Thumb: pc gets the even address and
        /// CPSR.T is set.
        pub fn set_ip(&mut self, ip: usize) {
            if ip & 1 != 0 {
                self.uregs[PC] = (ip & !1) as u32;
                self.uregs[CPSR] |= CPSR_T_MASK;
            } else {
                self.uregs[PC] = ip as u32;
                self.uregs[CPSR] &= !CPSR_T_MASK;
            }
        }

        pub fn sp(&self) -> usize {
            self.uregs[SP] as usize
        }

        pub fn set_sp(&mut self, sp: usize) {
            self.uregs[SP] = sp as u32;
        }

        pub fn ret(&self) -> usize {
            self.uregs[0] as usize
        }

        pub fn set_ret(&mut self, val: usize) {
            self.uregs[0] = val as u32;
        }

        pub fn arg(&self, idx: usize) -> usize {
            assert!(idx < ARG_REGS);
            self.uregs[idx] as usize
        }

        /// AAPCS: r0-r3, then the stack. The callee returns through lr.
        pub fn prepare_call(&mut self, func: usize, return_addr: usize, args: &[usize]) -> CallFrame {
            let (in_regs, on_stack) = args.split_at(args.len().min(ARG_REGS));
            for (idx, arg) in in_regs.iter().enumerate() {
                self.uregs[idx] = *arg as u32;
            }
            let sp = align_down(self.sp() - on_stack.len() * WORD_SIZE, STACK_ALIGN);

            self.uregs[LR] = return_addr as u32;
            self.set_sp(sp);
            self.set_ip(func);
            CallFrame {
                addr: sp,
                words: on_stack.to_vec(),
            }
        }
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
compile_error!("unsupported architecture: only x86_64, aarch64 and arm are implemented");

pub use arch::*;
