use libc::c_void;
use nix::errno::Errno;
use nix::sys::ptrace::{self, RequestType};
use nix::sys::signal::{self, Signal};
use nix::sys::uio::{process_vm_readv, process_vm_writev, IoVec, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use simple_error::{bail, try_with};
use std::cell::Cell;
use std::mem;

use crate::cpu::Regs;
use crate::result::Result;
use crate::tracer::proc::{self, Mapping};
use crate::tracer::Tracee;

/// elf.h: general purpose registers regset
const NT_PRSTATUS: usize = 1;

pub struct Thread {
    pub tid: Pid,
    /// cleared once we detached, so drop does not detach a second time
    attached: Cell<bool>,
}

/// Get user registers, as with `ptrace(PTRACE_GETREGSET, NT_PRSTATUS, ...)`
fn getregs(pid: Pid) -> nix::Result<Regs> {
    let mut regs = Regs::default();
    let mut iov = libc::iovec {
        iov_base: &mut regs as *mut _ as *mut c_void,
        iov_len: mem::size_of::<Regs>(),
    };
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET as RequestType,
            libc::pid_t::from(pid),
            NT_PRSTATUS as *mut c_void,
            &mut iov as *mut _ as *mut c_void,
        )
    };
    Errno::result(res)?;
    // a short regset means the tracee runs in a different mode (e.g. compat)
    if iov.iov_len != mem::size_of::<Regs>() {
        return Err(Errno::EIO);
    }
    Ok(regs)
}

/// Set user registers, as with `ptrace(PTRACE_SETREGSET, NT_PRSTATUS, ...)`
fn setregs(pid: Pid, regs: &Regs) -> nix::Result<()> {
    let mut iov = libc::iovec {
        iov_base: regs as *const _ as *mut c_void,
        iov_len: mem::size_of::<Regs>(),
    };
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET as RequestType,
            libc::pid_t::from(pid),
            NT_PRSTATUS as *mut c_void,
            &mut iov as *mut _ as *mut c_void,
        )
    };
    Errno::result(res).map(drop)
}

/// Wait status as a short human readable string for log messages.
pub fn describe_status(status: &WaitStatus) -> String {
    match status {
        WaitStatus::Exited(pid, code) => format!("{} exited with status {}", pid, code),
        WaitStatus::Signaled(pid, sig, core) => format!(
            "{} killed by {}{}",
            pid,
            sig,
            if *core { " (core dumped)" } else { "" }
        ),
        WaitStatus::Stopped(pid, sig) => format!("{} stopped by {}", pid, sig),
        WaitStatus::PtraceEvent(pid, sig, event) => {
            format!("{} stopped by {} with ptrace event {}", pid, sig, event)
        }
        WaitStatus::PtraceSyscall(pid) => format!("{} stopped at syscall", pid),
        WaitStatus::Continued(pid) => format!("{} continued", pid),
        WaitStatus::StillAlive => String::from("still alive"),
    }
}

impl Tracee for Thread {
    fn pid(&self) -> Pid {
        self.tid
    }

    fn getregs(&self) -> Result<Regs> {
        Ok(try_with!(
            getregs(self.tid),
            "cannot get registers with ptrace"
        ))
    }

    fn setregs(&self, regs: &Regs) -> Result<()> {
        try_with!(setregs(self.tid, regs), "cannot set registers with ptrace");
        Ok(())
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        let local_iovec = [IoVec::from_mut_slice(buf)];
        let remote_iovec = [RemoteIoVec { base: addr, len }];

        let f = try_with!(
            process_vm_readv(self.tid, &local_iovec, &remote_iovec),
            "cannot read memory at {:#x}",
            addr
        );
        if f != len {
            bail!(
                "process_vm_readv read {} bytes when {} were expected",
                f,
                len
            )
        }
        Ok(())
    }

    fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        let len = data.len();
        let local_iovec = [IoVec::from_slice(data)];
        let remote_iovec = [RemoteIoVec { base: addr, len }];

        let f = try_with!(
            process_vm_writev(self.tid, &local_iovec, &remote_iovec),
            "cannot write memory at {:#x}",
            addr
        );
        if f != len {
            bail!(
                "process_vm_writev written {} bytes when {} were expected",
                f,
                len
            )
        }
        Ok(())
    }

    fn cont(&self, sig: Option<Signal>) -> Result<()> {
        try_with!(
            ptrace::cont(self.tid, sig),
            "cannot continue tracee with ptrace"
        );
        Ok(())
    }

    fn wait(&self) -> Result<WaitStatus> {
        Ok(try_with!(
            waitpid(self.tid, Some(WaitPidFlag::__WALL)),
            "waitpid on {} failed",
            self.tid
        ))
    }

    fn kill(&self, sig: Signal) -> Result<()> {
        try_with!(signal::kill(self.tid, sig), "cannot send {} to {}", sig, self.tid);
        Ok(())
    }

    fn detach(&self, sig: Option<Signal>) -> Result<()> {
        self.attached.set(false);
        try_with!(
            ptrace::detach(self.tid, sig),
            "cannot detach from {}",
            self.tid
        );
        Ok(())
    }

    fn maps(&self) -> Result<Vec<Mapping>> {
        proc::maps(self.tid)
    }
}

/// Seize a process. Unlike `PTRACE_ATTACH` this leaves the tracee running
/// and reports group-stops as `PTRACE_EVENT_STOP`. The tracee is killed if
/// we die while it is attached.
pub fn attach_seize(tid: Pid) -> Result<Thread> {
    try_with!(
        ptrace::seize(tid, ptrace::Options::PTRACE_O_EXITKILL),
        "cannot seize the process {}",
        tid
    );
    Ok(Thread {
        tid,
        attached: Cell::new(true),
    })
}

impl Drop for Thread {
    fn drop(&mut self) {
        if !self.attached.get() {
            return;
        }
        if let Err(e) = ptrace::detach(self.tid, None) {
            log::warn!("Cannot ptrace::detach from {}: {}", self.tid, e);
        }
    }
}
