#![deny(clippy::print_stdout, clippy::print_stderr, clippy::unwrap_used)]

pub mod auxv;
pub mod cpu;
pub mod inject;
pub mod result;
pub mod symbols;
pub mod tracer;
pub mod zygote;
