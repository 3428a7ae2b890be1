//! In-memory stand-in for a traced process.
//!
//! Memory is a sparse byte map, registers are a plain `Regs`. Continuing the
//! fake either replays a scripted wait status or simulates what the real
//! tracee would do next: the dynamic linker jumping through `AT_ENTRY`, or a
//! defined function returning to its caller.

use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use simple_error::{bail, require_with};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

use crate::auxv::{AT_ENTRY, AT_NULL};
use crate::cpu::{Regs, WORD_SIZE};
use crate::result::Result;
use crate::tracer::proc::Mapping;
use crate::tracer::{Host, Tracee};

pub const STACK_TOP: usize = 0x7fff_0000;
const STRINGS_BASE: usize = 0x7fff_8000;
/// where the tracee sits while the dynamic linker is still running
pub const LINKER_IP: usize = 0x5000_1234;

pub const REMOTE_LIBC: usize = 0x7000_0000;
pub const REMOTE_LIBDL: usize = 0x6000_0000;
pub const LOCAL_LIBC: usize = 0x2000_0000;
pub const LOCAL_LIBDL: usize = 0x1000_0000;

pub const DLOPEN_OFFSET: usize = 0x1100;
pub const DLSYM_OFFSET: usize = 0x1200;
pub const DLERROR_OFFSET: usize = 0x1300;
pub const STRLEN_OFFSET: usize = 0x1400;

pub const LIBC_PATH: &str = "/system/lib64/libc.so";
pub const LIBDL_PATH: &str = "/system/lib64/libdl.so";

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Cont(Option<Signal>),
    Kill(Signal),
    Detach(Option<Signal>),
}

type Function = Box<dyn Fn(&FakeTracee, &[usize]) -> usize>;

pub fn mapping(start: usize, end: usize, perms: &str, pathname: &str) -> Mapping {
    let p = perms.as_bytes();
    let mut prot_flags = ProtFlags::empty();
    if p[0] == b'r' {
        prot_flags |= ProtFlags::PROT_READ;
    }
    if p[1] == b'w' {
        prot_flags |= ProtFlags::PROT_WRITE;
    }
    if p[2] == b'x' {
        prot_flags |= ProtFlags::PROT_EXEC;
    }
    Mapping {
        start,
        end,
        prot_flags,
        map_flags: MapFlags::MAP_PRIVATE,
        offset: 0,
        major_dev: 0,
        minor_dev: 0,
        inode: 0,
        pathname: pathname.to_string(),
    }
}

fn module_maps(libc_base: usize, libdl_base: usize) -> Vec<Mapping> {
    let text = |start: usize, end: usize, pathname: &str| Mapping {
        offset: 0x1000,
        ..mapping(start, end, "r-xp", pathname)
    };
    vec![
        mapping(libdl_base, libdl_base + 0x1000, "r--p", LIBDL_PATH),
        text(libdl_base + 0x1000, libdl_base + 0x2000, LIBDL_PATH),
        mapping(libc_base, libc_base + 0x1000, "r--p", LIBC_PATH),
        text(libc_base + 0x1000, libc_base + 0x10000, LIBC_PATH),
    ]
}

pub struct FakeTracee {
    regs: RefCell<Regs>,
    mem: RefCell<HashMap<usize, u8>>,
    maps: RefCell<Vec<Mapping>>,
    functions: RefCell<HashMap<usize, (usize, Function)>>,
    calls: RefCell<Vec<(usize, Vec<usize>)>>,
    writes: RefCell<Vec<(usize, Vec<u8>)>>,
    setregs: RefCell<Vec<Regs>>,
    ops: RefCell<Vec<Op>>,
    failing: RefCell<Vec<(Op, usize)>>,
    events: RefCell<VecDeque<WaitStatus>>,
    pending: RefCell<Option<WaitStatus>>,
    entry_slot: Cell<Option<usize>>,
}

impl FakeTracee {
    pub fn new() -> FakeTracee {
        let mut maps = module_maps(REMOTE_LIBC, REMOTE_LIBDL);
        maps.push(mapping(0x7ffe_0000, 0x8000_0000, "rw-p", "[stack]"));
        FakeTracee {
            regs: RefCell::new(Regs::default()),
            mem: RefCell::new(HashMap::new()),
            maps: RefCell::new(maps),
            functions: RefCell::new(HashMap::new()),
            calls: RefCell::new(vec![]),
            writes: RefCell::new(vec![]),
            setregs: RefCell::new(vec![]),
            ops: RefCell::new(vec![]),
            failing: RefCell::new(vec![]),
            events: RefCell::new(VecDeque::new()),
            pending: RefCell::new(None),
            entry_slot: Cell::new(None),
        }
    }

    /// The address remote calls are expected to return to.
    pub fn return_addr(&self) -> usize {
        REMOTE_LIBC
    }

    pub fn define_function<F>(&self, addr: usize, arity: usize, f: F)
    where
        F: Fn(&FakeTracee, &[usize]) -> usize + 'static,
    {
        self.functions
            .borrow_mut()
            .insert(addr, (arity, Box::new(f)));
    }

    /// Lay out argc, argv, envp and auxv at `STACK_TOP` and park the tracee
    /// inside the dynamic linker. An `(AT_NULL, 0)` terminator is appended to
    /// `auxv`.
    pub fn setup_kernel_args(&self, argv: &[&str], envp: &[&str], auxv: &[(usize, usize)]) {
        let mut strings = STRINGS_BASE;
        let mut store = |s: &str| {
            let addr = strings;
            self.poke(addr, s.as_bytes());
            self.poke(addr + s.len(), &[0]);
            strings += s.len() + 1;
            addr
        };

        let mut words = vec![argv.len()];
        words.extend(argv.iter().map(|s| store(s)));
        words.push(0);
        words.extend(envp.iter().map(|s| store(s)));
        words.push(0);
        for (kind, value) in auxv.iter().chain([(AT_NULL, 0)].iter()) {
            if *kind == AT_ENTRY {
                self.entry_slot
                    .set(Some(STACK_TOP + (words.len() + 1) * WORD_SIZE));
            }
            words.push(*kind);
            words.push(*value);
        }
        for (idx, word) in words.iter().enumerate() {
            self.poke(STACK_TOP + idx * WORD_SIZE, &word.to_ne_bytes());
        }

        let mut regs = self.regs.borrow_mut();
        regs.set_sp(STACK_TOP);
        regs.set_ip(LINKER_IP);
    }

    /// Write memory without recording it as a tracer write.
    pub fn poke(&self, addr: usize, data: &[u8]) {
        let mut mem = self.mem.borrow_mut();
        for (idx, byte) in data.iter().enumerate() {
            mem.insert(addr + idx, *byte);
        }
    }

    pub fn peek_word(&self, addr: usize) -> usize {
        self.read_word(addr).expect("word not mapped in fake")
    }

    pub fn read_cstring(&self, addr: usize) -> String {
        let mem = self.mem.borrow();
        let mut s = vec![];
        let mut pos = addr;
        while let Some(b) = mem.get(&pos) {
            if *b == 0 {
                break;
            }
            s.push(*b);
            pos += 1;
        }
        String::from_utf8_lossy(&s).into_owned()
    }

    pub fn entry_slot(&self) -> Option<usize> {
        self.entry_slot.get()
    }

    pub fn regs(&self) -> Regs {
        *self.regs.borrow()
    }

    pub fn set_regs(&self, regs: Regs) {
        *self.regs.borrow_mut() = regs;
    }

    pub fn push_event(&self, status: WaitStatus) {
        self.events.borrow_mut().push_back(status);
    }

    pub fn calls(&self) -> Vec<(usize, Vec<usize>)> {
        self.calls.borrow().clone()
    }

    pub fn writes(&self) -> Vec<(usize, Vec<u8>)> {
        self.writes.borrow().clone()
    }

    pub fn setregs_history(&self) -> Vec<Regs> {
        self.setregs.borrow().clone()
    }

    /// Make the `nth` (counting from 1) occurrence of `op` fail.
    pub fn fail_on(&self, op: Op, nth: usize) {
        self.failing.borrow_mut().push((op, nth));
    }

    fn record(&self, op: Op) -> Result<()> {
        let mut ops = self.ops.borrow_mut();
        ops.push(op.clone());
        let count = ops.iter().filter(|o| **o == op).count();
        if self.failing.borrow().contains(&(op.clone(), count)) {
            bail!("{:?} failed", op);
        }
        Ok(())
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.borrow().clone()
    }

    pub fn detach_count(&self) -> usize {
        self.ops
            .borrow()
            .iter()
            .filter(|op| matches!(op, Op::Detach(_)))
            .count()
    }

    fn is_executable(&self, addr: usize) -> bool {
        self.maps
            .borrow()
            .iter()
            .any(|m| m.contains(addr) && m.is_executable())
    }

    #[cfg(target_arch = "x86_64")]
    fn return_from_call(&self, regs: &mut Regs) {
        let ret = self.peek_word(regs.sp());
        regs.set_sp(regs.sp() + WORD_SIZE);
        regs.set_ip(ret);
    }

    #[cfg(target_arch = "aarch64")]
    fn return_from_call(&self, regs: &mut Regs) {
        regs.set_ip(regs.regs[30] as usize);
    }

    #[cfg(target_arch = "arm")]
    fn return_from_call(&self, regs: &mut Regs) {
        regs.set_ip(regs.uregs[14] as usize);
    }

    /// What the tracee does until its next stop.
    fn run(&self) -> WaitStatus {
        let pid = self.pid();
        let mut regs = self.regs();

        if regs.ip() == LINKER_IP {
            if let Some(slot) = self.entry_slot.get() {
                // the linker is done and jumps to the program entry
                let target = self.peek_word(slot) & !1;
                regs.set_ip(target);
                self.set_regs(regs);
                if self.is_executable(target) {
                    return WaitStatus::Exited(pid, 0);
                }
                return WaitStatus::Stopped(pid, Signal::SIGSEGV);
            }
        }

        let functions = self.functions.borrow();
        let (arity, f) = match functions.get(&regs.ip()) {
            Some(func) => func,
            None => return WaitStatus::Stopped(pid, Signal::SIGILL),
        };
        let args: Vec<usize> = (0..*arity).map(|idx| regs.arg(idx)).collect();
        self.calls.borrow_mut().push((regs.ip(), args.clone()));
        let ret = f(self, &args);

        regs.set_ret(ret);
        self.return_from_call(&mut regs);
        self.set_regs(regs);
        if self.is_executable(regs.ip()) {
            return WaitStatus::Stopped(pid, Signal::SIGTRAP);
        }
        WaitStatus::Stopped(pid, Signal::SIGSEGV)
    }
}

impl Tracee for FakeTracee {
    fn pid(&self) -> Pid {
        Pid::from_raw(4242)
    }

    fn getregs(&self) -> Result<Regs> {
        Ok(self.regs())
    }

    fn setregs(&self, regs: &Regs) -> Result<()> {
        self.setregs.borrow_mut().push(*regs);
        self.set_regs(*regs);
        Ok(())
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        let mem = self.mem.borrow();
        for (idx, byte) in buf.iter_mut().enumerate() {
            *byte = *require_with!(mem.get(&(addr + idx)), "{:#x} is not mapped", addr + idx);
        }
        Ok(())
    }

    fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        self.writes.borrow_mut().push((addr, data.to_vec()));
        self.poke(addr, data);
        Ok(())
    }

    fn cont(&self, sig: Option<Signal>) -> Result<()> {
        self.record(Op::Cont(sig))?;
        if self.pending.borrow().is_some() {
            bail!("continued twice without waiting");
        }
        let next = self.events.borrow_mut().pop_front();
        let status = match next {
            Some(status) => status,
            None => self.run(),
        };
        *self.pending.borrow_mut() = Some(status);
        Ok(())
    }

    fn wait(&self) -> Result<WaitStatus> {
        if let Some(status) = self.pending.borrow_mut().take() {
            return Ok(status);
        }
        // the first wait after seizing reports whatever was scripted
        let next = self.events.borrow_mut().pop_front();
        Ok(require_with!(next, "waiting on a tracee that was never continued"))
    }

    fn kill(&self, sig: Signal) -> Result<()> {
        self.record(Op::Kill(sig))
    }

    fn detach(&self, sig: Option<Signal>) -> Result<()> {
        self.record(Op::Detach(sig))
    }

    fn maps(&self) -> Result<Vec<Mapping>> {
        Ok(self.maps.borrow().clone())
    }
}

/// Tracer side counterpart of `FakeTracee`: the same libraries, mapped at
/// different addresses.
pub struct FakeHost {
    symbols: HashMap<(String, String), usize>,
}

impl FakeHost {
    pub fn new() -> FakeHost {
        let mut symbols = HashMap::new();
        let mut add = |module: &str, symbol: &str, addr: usize| {
            symbols.insert((module.to_string(), symbol.to_string()), addr);
        };
        add("libdl.so", "dlopen", LOCAL_LIBDL + DLOPEN_OFFSET);
        add("libdl.so", "dlsym", LOCAL_LIBDL + DLSYM_OFFSET);
        add("libdl.so", "dlerror", LOCAL_LIBDL + DLERROR_OFFSET);
        add("libc.so", "strlen", LOCAL_LIBC + STRLEN_OFFSET);
        FakeHost { symbols }
    }

    pub fn without(mut self, module: &str, symbol: &str) -> FakeHost {
        self.symbols
            .remove(&(module.to_string(), symbol.to_string()));
        self
    }
}

impl Host for FakeHost {
    fn maps(&self) -> Result<Vec<Mapping>> {
        Ok(module_maps(LOCAL_LIBC, LOCAL_LIBDL))
    }

    fn local_symbol(&self, _local: &[Mapping], module: &str, symbol: &str) -> Option<usize> {
        self.symbols
            .get(&(module.to_string(), symbol.to_string()))
            .copied()
    }
}
