use nix::sys::mman::{MapFlags, ProtFlags};
use nix::unistd::Pid;
use simple_error::{bail, try_with};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::result::Result;

#[derive(Clone, Debug, PartialEq)]
pub struct Mapping {
    pub start: usize,
    pub end: usize,
    pub prot_flags: ProtFlags,
    pub map_flags: MapFlags,
    pub offset: u64,
    pub major_dev: u64,
    pub minor_dev: u64,
    pub inode: u64,
    pub pathname: String,
}

impl Mapping {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn is_executable(&self) -> bool {
        self.prot_flags.contains(ProtFlags::PROT_EXEC)
    }

    pub fn file_name(&self) -> &str {
        self.pathname.rsplit('/').next().unwrap_or("")
    }

    /// `libc.so` matches `/system/lib64/libc.so` as well as
    /// `/usr/lib/libc.so.6`.
    pub fn is_module(&self, name: &str) -> bool {
        let file_name = self.file_name();
        if file_name == name {
            return true;
        }
        file_name
            .strip_prefix(name)
            .map_or(false, |rest| rest.starts_with('.'))
    }
}

pub fn find_mapping(mappings: &[Mapping], addr: usize) -> Option<&Mapping> {
    mappings.iter().find(|m| m.contains(addr))
}

/// Human readable location of `addr` for log messages.
pub fn describe_addr(mappings: &[Mapping], addr: usize) -> String {
    match find_mapping(mappings, addr) {
        Some(m) if m.pathname.is_empty() => format!("[anon {:#x}+{:#x}]", m.start, addr - m.start),
        Some(m) => format!("{}+{:#x}", m.pathname, addr - m.start),
        None => String::from("[unmapped]"),
    }
}

pub fn pid_path(pid: Pid) -> PathBuf {
    PathBuf::from("/proc").join(pid.as_raw().to_string())
}

fn parse_flags(fields: &[u8]) -> Result<(ProtFlags, MapFlags)> {
    if fields.len() != 4 {
        bail!("permission field has {} characters, expected 4", fields.len());
    }
    Ok((
        (if fields[0] == b'r' {
            ProtFlags::PROT_READ
        } else {
            ProtFlags::empty()
        }) | (if fields[1] == b'w' {
            ProtFlags::PROT_WRITE
        } else {
            ProtFlags::empty()
        }) | (if fields[2] == b'x' {
            ProtFlags::PROT_EXEC
        } else {
            ProtFlags::empty()
        }),
        if fields[3] == b'p' {
            MapFlags::MAP_PRIVATE
        } else {
            MapFlags::MAP_SHARED
        },
    ))
}

fn parse_line(line: &str) -> Result<Mapping> {
    let fields = line.splitn(6, ' ').collect::<Vec<_>>();
    if fields.len() < 5 {
        bail!("expected at least 5 fields, got {}", fields.len());
    }
    let range = fields[0].splitn(2, '-').collect::<Vec<_>>();
    if range.len() != 2 {
        bail!("address range is malformed: {}", fields[0]);
    }

    let start = try_with!(
        usize::from_str_radix(range[0], 16),
        "start address is not a number: {}",
        range[0]
    );
    let end = try_with!(
        usize::from_str_radix(range[1], 16),
        "end address is not a number: {}",
        range[1]
    );
    let (prot_flags, map_flags) = parse_flags(fields[1].as_bytes())?;
    let offset = try_with!(
        u64::from_str_radix(fields[2], 16),
        "offset is not a number: {}",
        fields[2]
    );
    let dev = fields[3].splitn(2, ':').collect::<Vec<_>>();
    if dev.len() != 2 {
        bail!("device is malformed: {}", fields[3]);
    }
    let major_dev = try_with!(
        u64::from_str_radix(dev[0], 16),
        "major dev is not a number: {}",
        dev[0]
    );
    let minor_dev = try_with!(
        u64::from_str_radix(dev[1], 16),
        "minor dev is not a number: {}",
        dev[1]
    );
    let inode = try_with!(
        fields[4].trim_end().parse::<u64>(),
        "inode is not a number: {}",
        fields[4]
    );
    // anonymous mappings have no pathname column at all
    let pathname = fields
        .get(5)
        .map(|p| p.trim_start().trim_end_matches('\n').to_string())
        .unwrap_or_default();

    Ok(Mapping {
        start,
        end,
        prot_flags,
        map_flags,
        offset,
        major_dev,
        minor_dev,
        inode,
        pathname,
    })
}

pub fn parse_maps_file(path: &Path) -> Result<Vec<Mapping>> {
    let f = try_with!(File::open(path), "cannot open {}", path.display());
    let buf = BufReader::new(f);
    let mut maps = vec![];
    for line in buf.lines() {
        let line = try_with!(line, "cannot read from {}", path.display());
        if line.is_empty() {
            continue;
        }
        maps.push(try_with!(parse_line(&line), "cannot parse line {}", line));
    }
    Ok(maps)
}

/// Memory map of another process.
pub fn maps(pid: Pid) -> Result<Vec<Mapping>> {
    parse_maps_file(&pid_path(pid).join("maps"))
}

/// Memory map of the tracer itself.
pub fn self_maps() -> Result<Vec<Mapping>> {
    parse_maps_file(Path::new("/proc/self/maps"))
}
