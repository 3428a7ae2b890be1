//! Parser for the argument block the kernel leaves on the initial stack of a
//! freshly executed process:
//!
//! ```text
//! sp -> argc
//!       argv[0] .. argv[argc - 1], NULL
//!       envp[0] .. envp[n - 1], NULL
//!       (a_type, a_val) .. (AT_NULL, _)
//! ```
//!
//! The walk only needs a way to read a word of the target's memory, so it can
//! be run against a live tracee as well as against a plain byte buffer.

use log::warn;
use simple_error::{bail, try_with};

use crate::cpu::WORD_SIZE;
use crate::result::Result;

pub const AT_NULL: usize = 0;
pub const AT_PHDR: usize = 3;
pub const AT_PAGESZ: usize = 6;
pub const AT_BASE: usize = 7;
pub const AT_ENTRY: usize = 9;

/// Upper bound for each of the argv, envp and auxv lists. Real stacks are
/// much smaller; hitting this means we are not looking at an argument block.
const MAX_ENTRIES: usize = 0x10000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuxvEntry {
    pub kind: usize,
    pub value: usize,
    /// address of `value` in the target
    pub addr: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelArgumentBlock {
    pub argc: usize,
    pub argv: Vec<usize>,
    pub envp: Vec<usize>,
    /// address of the first auxv entry in the target
    pub auxv_addr: usize,
    pub auxv: Vec<AuxvEntry>,
}

fn read_pointer_list<F>(read_word: &mut F, pos: &mut usize, name: &str) -> Result<Vec<usize>>
where
    F: FnMut(usize) -> Result<usize>,
{
    let mut list = vec![];
    loop {
        let ptr = try_with!(read_word(*pos), "cannot read {} at {:#x}", name, *pos);
        *pos += WORD_SIZE;
        if ptr == 0 {
            return Ok(list);
        }
        if list.len() == MAX_ENTRIES {
            bail!("{} is not NULL terminated", name);
        }
        list.push(ptr);
    }
}

impl KernelArgumentBlock {
    pub fn parse<F>(sp: usize, mut read_word: F) -> Result<KernelArgumentBlock>
    where
        F: FnMut(usize) -> Result<usize>,
    {
        let argc = try_with!(read_word(sp), "cannot read argc at {:#x}", sp);
        let mut pos = sp + WORD_SIZE;
        let argv = read_pointer_list(&mut read_word, &mut pos, "argv")?;
        if argv.len() != argc {
            warn!("argc is {} but argv has {} entries", argc, argv.len());
        }
        let envp = read_pointer_list(&mut read_word, &mut pos, "envp")?;

        let auxv_addr = pos;
        let mut auxv = vec![];
        loop {
            let kind = try_with!(read_word(pos), "cannot read auxv type at {:#x}", pos);
            if kind == AT_NULL {
                break;
            }
            let addr = pos + WORD_SIZE;
            let value = try_with!(read_word(addr), "cannot read auxv value at {:#x}", addr);
            if auxv.len() == MAX_ENTRIES {
                bail!("auxv is not terminated by AT_NULL");
            }
            auxv.push(AuxvEntry { kind, value, addr });
            pos += 2 * WORD_SIZE;
        }

        Ok(KernelArgumentBlock {
            argc,
            argv,
            envp,
            auxv_addr,
            auxv,
        })
    }

    pub fn find(&self, kind: usize) -> Option<&AuxvEntry> {
        self.auxv.iter().find(|e| e.kind == kind)
    }

    /// The `AT_ENTRY` pair: where the dynamic linker jumps once it is done.
    pub fn entry(&self) -> Option<&AuxvEntry> {
        self.find(AT_ENTRY)
    }
}
