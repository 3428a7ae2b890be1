//! Load a library into a process that has just been executed, before its
//! own code runs.
//!
//! The tracee is parked in its first stop, still inside the dynamic linker.
//! We replace the program entry in its auxiliary vector with an address that
//! cannot be executed. Once the linker has relocated everything it jumps
//! there and faults, which hands the fully initialized process back to us.
//! From that fault we restore the auxv entry, call `dlopen`, `dlsym("init")`
//! and `init(handle)` inside the tracee and finally point it at its real
//! entry with the registers it faulted with.

use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use simple_error::{bail, require_with, try_with};

use crate::auxv::{AuxvEntry, KernelArgumentBlock, AT_BASE};
use crate::cpu::Regs;
use crate::result::Result;
use crate::symbols::{find_func_addr, find_return_addr, LocalHost};
use crate::tracer::proc::{describe_addr, Mapping};
use crate::tracer::ptrace::describe_status;
use crate::tracer::remote_call::{push_string, remote_call};
use crate::tracer::{Host, Tracee};

/// Module exporting `dlopen`, `dlsym` and `dlerror`.
#[cfg(target_os = "android")]
pub const DEFAULT_LOADER_MODULE: &str = "libdl.so";
#[cfg(not(target_os = "android"))]
pub const DEFAULT_LOADER_MODULE: &str = "libc.so";

pub const DEFAULT_LIBC_MODULE: &str = "libc.so";

/// Function the injected library has to export. It gets the library's own
/// handle as its only argument.
pub const INIT_SYMBOL: &str = "init";

/// dlerror messages longer than this are not read back.
const MAX_DLERROR_LEN: usize = 4096;

const BREAKPOINT_SENTINEL: usize = 0x05ec_1cff_usize.wrapping_neg();

/// Mask for the instruction set selection bit of code addresses (Thumb on
/// arm, always clear elsewhere).
const MODE_BIT: usize = 1;

pub struct InjectOptions {
    pub library: String,
    pub loader_module: String,
    pub libc_module: String,
}

/// Invalid address that replaces the program entry. Its lowest bit matches
/// the entry, so the linker's branch keeps the same instruction set.
pub fn poison_address(entry: usize) -> usize {
    (BREAKPOINT_SENTINEL & !MODE_BIT) | (entry & MODE_BIT)
}

/// The poisoned `AT_ENTRY` slot.
pub struct EntryBreakpoint {
    slot: usize,
    entry: usize,
    poison: usize,
    planted: bool,
}

impl EntryBreakpoint {
    pub fn plant<T: Tracee>(tracee: &T, entry: &AuxvEntry) -> Result<EntryBreakpoint> {
        let poison = poison_address(entry.value);
        if poison == entry.value {
            bail!("program entry {:#x} is the breakpoint address", entry.value);
        }
        try_with!(
            tracee.write_word(entry.addr, poison),
            "cannot replace program entry at {:#x}",
            entry.addr
        );
        debug!(
            "replaced program entry {:#x} with {:#x}",
            entry.value, poison
        );
        Ok(EntryBreakpoint {
            slot: entry.addr,
            entry: entry.value,
            poison,
            planted: true,
        })
    }

    /// Let the dynamic linker finish and return the registers it faulted
    /// with when jumping to the poisoned entry.
    pub fn await_fault<T: Tracee>(&self, tracee: &T) -> Result<Regs> {
        tracee.cont(None)?;
        let status = tracee.wait()?;
        match status {
            WaitStatus::Stopped(_, Signal::SIGSEGV) => {}
            other => bail!("stopped by other reason: {}", describe_status(&other)),
        }
        let regs = tracee.getregs()?;
        if regs.ip() & !MODE_BIT != self.poison & !MODE_BIT {
            bail!("stopped at unknown addr {:#x}", regs.ip());
        }
        debug!("stopped at entry");
        Ok(regs)
    }

    /// Put the real program entry back.
    pub fn heal<T: Tracee>(&mut self, tracee: &T) -> Result<()> {
        if !self.planted {
            return Ok(());
        }
        try_with!(
            tracee.write_word(self.slot, self.entry),
            "cannot restore program entry at {:#x}",
            self.slot
        );
        self.planted = false;
        Ok(())
    }
}

enum Arg<'s> {
    Word(usize),
    Str(&'s str),
}

/// Remote calls into the loader, all starting from the same register state.
struct RemoteLoader<'a, T: Tracee, H: Host> {
    tracee: &'a T,
    host: &'a H,
    opts: &'a InjectOptions,
    local: Vec<Mapping>,
    remote: Vec<Mapping>,
    return_addr: usize,
    base_regs: Regs,
}

impl<'a, T: Tracee, H: Host> RemoteLoader<'a, T, H> {
    fn new(
        tracee: &'a T,
        host: &'a H,
        opts: &'a InjectOptions,
        base_regs: Regs,
    ) -> Result<RemoteLoader<'a, T, H>> {
        // the linker may have mapped further libraries since the first stop
        let remote = try_with!(tracee.maps(), "cannot read maps of {}", tracee.pid());
        let local = try_with!(host.maps(), "cannot read maps of the tracer");
        let return_addr = find_return_addr(&remote, &opts.libc_module)?;
        debug!(
            "{} return addr {:#x}",
            opts.libc_module, return_addr
        );
        Ok(RemoteLoader {
            tracee,
            host,
            opts,
            local,
            remote,
            return_addr,
            base_regs,
        })
    }

    fn resolve(&self, module: &str, symbol: &str) -> Result<usize> {
        Ok(try_with!(
            find_func_addr(self.host, &self.local, &self.remote, module, symbol),
            "cannot find {} in {}",
            symbol,
            module
        ))
    }

    fn call(&self, func: usize, args: &[Arg]) -> Result<usize> {
        let mut regs = self.base_regs;
        let mut words = Vec::with_capacity(args.len());
        for arg in args {
            words.push(match arg {
                Arg::Word(w) => *w,
                Arg::Str(s) => push_string(self.tracee, &mut regs, s)?,
            });
        }
        remote_call(self.tracee, &mut regs, func, self.return_addr, &words)
    }

    fn dlopen(&self, path: &str) -> Result<usize> {
        let dlopen = self.resolve(&self.opts.loader_module, "dlopen")?;
        let handle = self.call(
            dlopen,
            &[Arg::Str(path), Arg::Word(libc::RTLD_NOW as usize)],
        )?;
        debug!("remote handle {:#x}", handle);
        if handle == 0 {
            let reason = self.dlerror().unwrap_or_else(|e| {
                warn!("cannot retrieve dlerror: {}", e);
                String::from("unknown error")
            });
            bail!("dlopen({}) failed: {}", path, reason);
        }
        Ok(handle)
    }

    /// dlerror() -> strlen() -> read
    fn dlerror(&self) -> Result<String> {
        let dlerror = self.resolve(&self.opts.loader_module, "dlerror")?;
        let msg = self.call(dlerror, &[])?;
        debug!("dlerror str {:#x}", msg);
        if msg == 0 {
            bail!("dlerror returned NULL");
        }
        let strlen = self.resolve(&self.opts.libc_module, "strlen")?;
        let len = self.call(strlen, &[Arg::Word(msg)])?;
        debug!("dlerror len {}", len);
        if len == 0 {
            bail!("dlerror returned an empty string");
        }
        if len > MAX_DLERROR_LEN {
            bail!("dlerror string at {:#x} is {} bytes long", msg, len);
        }
        let mut buf = vec![0u8; len];
        try_with!(
            self.tracee.read(msg, &mut buf),
            "cannot read dlerror string at {:#x}",
            msg
        );
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn dlsym(&self, handle: usize, symbol: &str) -> Result<usize> {
        let dlsym = self.resolve(&self.opts.loader_module, "dlsym")?;
        self.call(dlsym, &[Arg::Word(handle), Arg::Str(symbol)])
    }

    fn load(&self) -> Result<()> {
        let handle = self.dlopen(&self.opts.library)?;
        let init = self.dlsym(handle, INIT_SYMBOL)?;
        debug!("injector entry {:#x}", init);
        if init == 0 {
            bail!(
                "injected library {} has no {} entry point",
                self.opts.library,
                INIT_SYMBOL
            );
        }
        // init reports nothing back, only its side effects matter
        self.call(init, &[Arg::Word(handle)])?;
        Ok(())
    }
}

pub struct EntryInjector<'a, T: Tracee, H: Host> {
    tracee: &'a T,
    host: &'a H,
    opts: &'a InjectOptions,
}

impl<'a, T: Tracee, H: Host> EntryInjector<'a, T, H> {
    pub fn new(tracee: &'a T, host: &'a H, opts: &'a InjectOptions) -> EntryInjector<'a, T, H> {
        EntryInjector { tracee, host, opts }
    }

    fn locate_entry(&self, regs: &Regs) -> Result<AuxvEntry> {
        let maps = self.tracee.maps().unwrap_or_default();
        let sp = regs.sp();
        debug!("kernel argument {:#x} {}", sp, describe_addr(&maps, sp));

        let block = try_with!(
            KernelArgumentBlock::parse(sp, |addr| self.tracee.read_word(addr)),
            "could not parse aux vector"
        );
        debug!(
            "argc {}, envc {}, auxv {:#x} {}",
            block.argc,
            block.envp.len(),
            block.auxv_addr,
            describe_addr(&maps, block.auxv_addr)
        );
        if let Some(base) = block.find(AT_BASE) {
            debug!("linker base {:#x} {}", base.value, describe_addr(&maps, base.value));
        }
        let entry = *require_with!(
            block.entry(),
            "could not parse aux vector: no AT_ENTRY before AT_NULL"
        );
        debug!(
            "entry address {:#x} {} (stored at {:#x})",
            entry.value,
            describe_addr(&maps, entry.value),
            entry.addr
        );
        Ok(entry)
    }

    /// Inject into a tracee that sits in its first group-stop.
    pub fn inject(&self) -> Result<()> {
        let regs = try_with!(self.tracee.getregs(), "cannot get registers of the tracee");
        let entry = self.locate_entry(&regs)?;

        let mut breakpoint = EntryBreakpoint::plant(self.tracee, &entry)?;
        let backup = match breakpoint.await_fault(self.tracee) {
            Ok(regs) => regs,
            Err(e) => {
                if let Err(heal_err) = breakpoint.heal(self.tracee) {
                    warn!("{}", heal_err);
                }
                return Err(e);
            }
        };
        // must happen before anything else can fail
        breakpoint.heal(self.tracee)?;

        let mut resume = backup;
        resume.set_ip(entry.value);

        let loaded = RemoteLoader::new(self.tracee, self.host, self.opts, backup)
            .and_then(|loader| loader.load());
        if let Err(e) = loaded {
            // leave the tracee as if we had never stopped it
            if let Err(restore_err) = self.tracee.setregs(&resume) {
                warn!("cannot restore registers: {}", restore_err);
            }
            return Err(e);
        }

        debug!("invoke entry");
        try_with!(self.tracee.setregs(&resume), "cannot restore registers");
        info!(
            "loaded {} into {}",
            self.opts.library,
            self.tracee.pid()
        );
        Ok(())
    }
}

/// Inject into a seized process that is in its first group-stop, resolving
/// symbols through the tracer's own libraries.
pub fn inject_on_main<T: Tracee>(tracee: &T, opts: &InjectOptions) -> Result<()> {
    EntryInjector::new(tracee, &LocalHost, opts).inject()
}
