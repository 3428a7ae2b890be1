use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::cpu::{Regs, WORD_SIZE};
use crate::result::Result;

#[cfg(test)]
pub mod fake;
pub mod proc;
pub mod ptrace;
pub mod remote_call;

use proc::Mapping;

/// A stopped process we are tracing.
///
/// These are the only operations the injector and the zygote controller may
/// perform on the target. None of them is valid while the tracee is running,
/// so every `cont` has to be followed by a `wait` before anything else.
pub trait Tracee {
    fn pid(&self) -> Pid;

    fn getregs(&self) -> Result<Regs>;

    fn setregs(&self, regs: &Regs) -> Result<()>;

    /// Fill `buf` from the tracee's memory at `addr`.
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()>;

    fn write(&self, addr: usize, data: &[u8]) -> Result<()>;

    fn cont(&self, sig: Option<Signal>) -> Result<()>;

    /// Block until the tracee reports its next state change.
    fn wait(&self) -> Result<WaitStatus>;

    fn kill(&self, sig: Signal) -> Result<()>;

    fn detach(&self, sig: Option<Signal>) -> Result<()>;

    fn maps(&self) -> Result<Vec<Mapping>>;

    fn read_word(&self, addr: usize) -> Result<usize> {
        let mut buf = [0u8; WORD_SIZE];
        self.read(addr, &mut buf)?;
        Ok(usize::from_ne_bytes(buf))
    }

    fn write_word(&self, addr: usize, val: usize) -> Result<()> {
        self.write(addr, &val.to_ne_bytes())
    }
}

/// The tracer's own view of the modules it shares with the tracee.
pub trait Host {
    fn maps(&self) -> Result<Vec<Mapping>>;

    /// Address of `symbol` exported by `module` in the tracer's address space.
    fn local_symbol(&self, local: &[Mapping], module: &str, symbol: &str) -> Option<usize>;
}
