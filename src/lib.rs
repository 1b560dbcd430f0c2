//! # `poff`
//!
//! The `poff` crate provides a unified interface for reading, writing and
//! linking POFF p-code object files, together with the 16-bit p-code stack
//! machine that executes linked images.
//!
//! The toolchain pipeline is: a compiler emits a POFF object ([`write`]),
//! the linker splices objects into an executable ([`link`]), the peephole
//! optimizer rewrites the executable ([`opt`]), and the interpreter runs it
//! ([`vm`]). All stages communicate through the container format defined in
//! [`poff`](crate::poff) and the instruction encoding defined in [`insn`].
//!
//! ## Example
//! ```no_run
//! use poff::read::PoffFile;
//! use poff::vm::{Config, Machine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let data = std::fs::read("hello.pex")?;
//!     let file = PoffFile::parse(&*data)?;
//!     let mut machine = Machine::load(&file, Config::default())?;
//!     let exit_code = machine.run().map_err(|trap| trap.to_string())?;
//!     std::process::exit(exit_code.into());
//! }
//! ```

#![deny(missing_docs)]
#![no_std]

#[cfg(feature = "std")]
#[allow(unused_imports)]
#[macro_use]
extern crate std;

#[allow(unused_imports)]
#[macro_use]
extern crate alloc;

mod endian;
pub use endian::*;

mod pod;
pub use pod::*;

pub mod poff;

pub mod insn;

#[cfg(feature = "read")]
pub mod read;

#[cfg(feature = "write")]
pub mod write;

#[cfg(feature = "link")]
pub mod link;

#[cfg(feature = "opt")]
pub mod opt;

#[cfg(feature = "vm")]
pub mod vm;
