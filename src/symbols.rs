//! Finding functions in the tracee.
//!
//! The tracee has no symbol table we could query over ptrace. Since the
//! tracer links against the same system libraries, we look a symbol up
//! locally with `dlsym` and rebase its offset onto the tracee's mapping of
//! the same file. Modules the tracer does not have loaded are looked up in
//! the library's `.dynsym` instead.

use log::debug;
use simple_error::{bail, require_with, try_with};
use std::ffi::CString;
use std::fs;
use xmas_elf::program::Type;
use xmas_elf::sections::SectionData;
use xmas_elf::symbol_table::Entry;
use xmas_elf::ElfFile;

use crate::result::Result;
use crate::tracer::proc::{self, Mapping};
use crate::tracer::Host;

/// The tracer process itself.
pub struct LocalHost;

impl Host for LocalHost {
    fn maps(&self) -> Result<Vec<Mapping>> {
        proc::self_maps()
    }

    fn local_symbol(&self, local: &[Mapping], module: &str, symbol: &str) -> Option<usize> {
        let module = local.iter().find(|m| m.is_module(module))?;
        let path = CString::new(module.pathname.as_str()).ok()?;
        let symbol = CString::new(symbol).ok()?;
        // RTLD_NOLOAD: only hand out a reference to the already mapped copy
        let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD) };
        if handle.is_null() {
            return None;
        }
        let addr = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
        unsafe { libc::dlclose(handle) };
        if addr.is_null() {
            None
        } else {
            Some(addr as usize)
        }
    }
}

/// Load address of the module `maps[idx]` belongs to. Walks back over the
/// mappings of the same file until the one at file offset 0, so unrelated
/// mappings of the file elsewhere do not count.
fn load_base(maps: &[Mapping], idx: usize) -> usize {
    let anchor = &maps[idx];
    let mut base = anchor.start;
    if anchor.offset == 0 {
        return base;
    }
    for m in maps[..idx].iter().rev() {
        if m.pathname != anchor.pathname || m.inode != anchor.inode || m.end > base {
            break;
        }
        base = m.start;
        if m.offset == 0 {
            break;
        }
    }
    base
}

/// Load address of the module whose executable segment matches `matches`.
fn module_base<F>(maps: &[Mapping], matches: F) -> Option<usize>
where
    F: Fn(&Mapping) -> bool,
{
    let idx = maps.iter().position(|m| m.is_executable() && matches(m))?;
    Some(load_base(maps, idx))
}

/// An address inside `module` that faults when jumped to: the start of its
/// first non-executable mapping. Remote calls return there.
pub fn find_return_addr(remote: &[Mapping], module: &str) -> Result<usize> {
    let m = require_with!(
        remote
            .iter()
            .find(|m| m.is_module(module) && !m.is_executable()),
        "no non-executable mapping of {} in the tracee",
        module
    );
    Ok(m.start)
}

/// Address of `symbol` from `module` in the tracee.
pub fn find_func_addr<H: Host>(
    host: &H,
    local: &[Mapping],
    remote: &[Mapping],
    module: &str,
    symbol: &str,
) -> Result<usize> {
    let local_addr = match host.local_symbol(local, module, symbol) {
        Some(addr) => addr,
        None => {
            debug!(
                "{}!{} is not available in the tracer, reading the tracee's library",
                module, symbol
            );
            return elf_symbol_addr(remote, module, symbol);
        }
    };
    // the symbol might be provided by another library than the one we asked
    let local_idx = require_with!(
        local.iter().position(|m| m.contains(local_addr)),
        "{} ({:#x}) is not mapped in the tracer",
        symbol,
        local_addr
    );
    let path = &local[local_idx].pathname;
    let local_base = load_base(local, local_idx);
    let remote_base = require_with!(
        module_base(remote, |m| m.pathname == *path),
        "{} is not mapped in the tracee",
        path
    );
    let addr = remote_base + (local_addr - local_base);
    debug!(
        "{}!{}: local {:#x} remote {:#x} ({})",
        module, symbol, local_addr, addr, path
    );
    Ok(addr)
}

fn find_dynsym<'a, E: Entry>(elf: &ElfFile<'a>, entries: &'a [E], symbol: &str) -> Option<u64> {
    entries
        .iter()
        .find(|e| e.shndx() != 0 && e.get_name(elf) == Ok(symbol))
        .map(|e| e.value())
}

/// Offset of `symbol` relative to the start of the library's first mapping.
pub fn elf_symbol_offset(data: &[u8], symbol: &str) -> Result<usize> {
    let elf = ElfFile::new(data)?;
    let section = require_with!(
        elf.find_section_by_name(".dynsym"),
        "library has no .dynsym section"
    );
    let value = match section.get_data(&elf)? {
        SectionData::DynSymbolTable64(entries) => find_dynsym(&elf, entries, symbol),
        SectionData::DynSymbolTable32(entries) => find_dynsym(&elf, entries, symbol),
        _ => bail!("expected .dynsym to be a dynamic symbol table"),
    };
    let value = require_with!(value, "symbol {} is not exported", symbol);

    let first_load = require_with!(
        elf.program_iter()
            .find(|ph| ph.get_type() == Ok(Type::Load)),
        "library has no loadable segment"
    );
    let load_bias = first_load.virtual_addr().wrapping_sub(first_load.offset());
    Ok(value.wrapping_sub(load_bias) as usize)
}

/// Look `symbol` up in the file backing the tracee's mapping of `module`.
pub fn elf_symbol_addr(remote: &[Mapping], module: &str, symbol: &str) -> Result<usize> {
    let idx = require_with!(
        remote
            .iter()
            .position(|m| m.is_executable() && m.is_module(module)),
        "{} is not mapped in the tracee",
        module
    );
    let path = &remote[idx].pathname;
    let data = try_with!(fs::read(path), "cannot read {}", path);
    let offset = try_with!(
        elf_symbol_offset(&data, symbol),
        "cannot find {} in {}",
        symbol,
        path
    );
    Ok(load_base(remote, idx) + offset)
}
