use log::{debug, error};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use simple_error::{bail, try_with};

use crate::cpu::{align_down, Regs, STACK_ALIGN};
use crate::result::Result;
use crate::tracer::ptrace::describe_status;
use crate::tracer::Tracee;

/// Copy `s` including its NUL terminator below the stack pointer in `regs`
/// and return its address in the tracee. `regs` is only updated locally; it
/// takes effect with the next `remote_call`.
pub fn push_string<T: Tracee>(tracee: &T, regs: &mut Regs, s: &str) -> Result<usize> {
    let mut data = Vec::with_capacity(s.len() + 1);
    data.extend_from_slice(s.as_bytes());
    data.push(0);

    let addr = align_down(regs.sp() - data.len(), STACK_ALIGN);
    try_with!(
        tracee.write(addr, &data),
        "cannot push string {:?} to the tracee's stack",
        s
    );
    regs.set_sp(addr);
    Ok(addr)
}

/// Call `func` with `args` inside the tracee. The callee returns to
/// `return_addr`, which must be a mapped but non-executable address: the
/// tracee faults there and we get it back with a SIGSEGV stop.
///
/// On return `regs` holds the tracee's registers at that fault.
pub fn remote_call<T: Tracee>(
    tracee: &T,
    regs: &mut Regs,
    func: usize,
    return_addr: usize,
    args: &[usize],
) -> Result<usize> {
    debug!(
        "calling remote function {:#x} with {} args {:x?}",
        func,
        args.len(),
        args
    );
    let frame = regs.prepare_call(func, return_addr, args);
    if !frame.words.is_empty() {
        try_with!(
            tracee.write(frame.addr, &frame.to_bytes()),
            "cannot write call frame"
        );
    }
    try_with!(tracee.setregs(regs), "cannot set call registers");
    tracee.cont(None)?;

    let status = tracee.wait()?;
    match status {
        WaitStatus::Stopped(_, Signal::SIGSEGV) => {}
        other => bail!(
            "remote call to {:#x} did not return: {}",
            func,
            describe_status(&other)
        ),
    }
    *regs = try_with!(tracee.getregs(), "cannot get registers after remote call");
    if regs.ip() != return_addr {
        error!("wrong return addr {:#x}", regs.ip());
        bail!(
            "remote call to {:#x} faulted at {:#x} instead of returning to {:#x}",
            func,
            regs.ip(),
            return_addr
        );
    }
    Ok(regs.ret())
}
