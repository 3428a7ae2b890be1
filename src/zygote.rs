//! Drive a freshly forked process through injection.
//!
//! The process is expected to have been started in a stopped state (a
//! pending SIGSTOP). We seize it, let the injector do its work while it is
//! parked in the group-stop and then deliver the SIGCONT it was waiting for
//! ourselves, following the stop notifications ptrace reports on the way.

use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use simple_error::{bail, try_with};

use crate::inject::{inject_on_main, InjectOptions};
use crate::result::Result;
use crate::tracer::ptrace::{attach_seize, describe_status};
use crate::tracer::Tracee;

pub struct TraceOptions {
    pub pid: Pid,
    pub inject: InjectOptions,
}

pub struct ZygoteController<'a, T: Tracee> {
    tracee: &'a T,
}

impl<'a, T: Tracee> ZygoteController<'a, T> {
    /// `tracee` must have been seized, not attached.
    pub fn new(tracee: &'a T) -> ZygoteController<'a, T> {
        ZygoteController { tracee }
    }

    fn handshake<F>(&self, inject: F) -> Result<()>
    where
        F: FnOnce(&T) -> Result<()>,
    {
        let status = self.tracee.wait()?;
        match status {
            WaitStatus::PtraceEvent(_, Signal::SIGSTOP, libc::PTRACE_EVENT_STOP) => {}
            other => bail!("unexpected stop state: {}", describe_status(&other)),
        }
        debug!("{} is in group-stop", self.tracee.pid());

        try_with!(inject(self.tracee), "injection failed");

        try_with!(self.tracee.kill(Signal::SIGCONT), "cannot resume the tracee");
        self.tracee.cont(None)?;
        let status = self.tracee.wait()?;
        match status {
            WaitStatus::PtraceEvent(_, Signal::SIGTRAP, libc::PTRACE_EVENT_STOP) => {}
            other => bail!(
                "unexpected state after SIGCONT: {}",
                describe_status(&other)
            ),
        }

        self.tracee.cont(None)?;
        let status = self.tracee.wait()?;
        match status {
            WaitStatus::Stopped(_, Signal::SIGCONT) => {}
            other => bail!(
                "expected SIGCONT signal-delivery-stop, got: {}",
                describe_status(&other)
            ),
        }
        Ok(())
    }

    /// Run the whole protocol. The tracee is detached exactly once, with the
    /// pending SIGCONT on success and with no signal otherwise.
    pub fn run<F>(self, inject: F) -> Result<()>
    where
        F: FnOnce(&T) -> Result<()>,
    {
        match self.handshake(inject) {
            Ok(()) => {
                try_with!(
                    self.tracee.detach(Some(Signal::SIGCONT)),
                    "cannot release {}",
                    self.tracee.pid()
                );
                Ok(())
            }
            Err(e) => {
                if let Err(detach_err) = self.tracee.detach(None) {
                    warn!("{}", detach_err);
                }
                Err(e)
            }
        }
    }
}

pub fn trace_zygote(opts: &TraceOptions) -> Result<()> {
    info!("tracing {}", opts.pid);
    let thread = attach_seize(opts.pid)?;
    ZygoteController::new(&thread).run(|tracee| inject_on_main(tracee, &opts.inject))?;
    info!("{} resumed with {}", opts.pid, opts.inject.library);
    Ok(())
}
