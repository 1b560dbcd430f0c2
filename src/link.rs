//! The linker.
//!
//! [`Linker`] merges relocatable POFF objects into one executable image.
//! Each input's sections are appended to the output while running offsets
//! track the program section, the symbol table and the file name pool;
//! program-section references are adjusted opcode by opcode as the
//! bytecode is copied. After all inputs are merged, external symbols are
//! resolved against uniquely defined ones and the buffered relocations
//! patch the 16-bit operands they address.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;

use crate::insn::{self, op, Insn};
use crate::poff::{file_type, reloc_type, sym_flags, sym_type};
use crate::read::{self, PoffFile, ReadRef};
use crate::write::{self, Object, Symbol};

/// An error that occurred while linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No input carried the `program` file type.
    MissingProgram,
    /// More than one input carried the `program` file type.
    MultipleMainPrograms,
    /// An input was neither a program nor a unit.
    BadInputFileType(u8),
    /// An external symbol has no defined counterpart.
    UndefinedSymbol(String),
    /// More than one input defines the symbol.
    MultiplyDefinedSymbol(String),
    /// A relocation addresses an operand outside the program section, or
    /// has an unknown type.
    BadRelocation(u32),
    /// A relocation references a symbol that does not exist.
    ExtraRelocations(u16),
    /// A container read error.
    Read(read::Error),
    /// A container write error.
    Write(write::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingProgram => f.write_str("no main program among the inputs"),
            Error::MultipleMainPrograms => f.write_str("more than one main program"),
            Error::BadInputFileType(t) => write!(f, "input has file type {}", t),
            Error::UndefinedSymbol(name) => write!(f, "undefined symbol `{}`", name),
            Error::MultiplyDefinedSymbol(name) => {
                write!(f, "multiply defined symbol `{}`", name)
            }
            Error::BadRelocation(offset) => {
                write!(f, "bad relocation at program offset {:#x}", offset)
            }
            Error::ExtraRelocations(symbol) => {
                write!(f, "relocation against missing symbol {}", symbol)
            }
            Error::Read(error) => error.fmt(f),
            Error::Write(error) => error.fmt(f),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<read::Error> for Error {
    fn from(error: read::Error) -> Error {
        Error::Read(error)
    }
}

impl From<write::Error> for Error {
    fn from(error: write::Error) -> Error {
        Error::Write(error)
    }
}

/// The result type used within the link module.
pub type Result<T> = core::result::Result<T, Error>;

/// Incremental linker state.
#[derive(Debug)]
pub struct Linker {
    output: Object,
    pc_offset: u16,
    sym_offset: u16,
    file_name_base: u8,
    symbols: Vec<Symbol>,
    relocations: Vec<write::Relocation>,
    have_program: bool,
}

impl Linker {
    /// Create a linker with an empty executable output.
    pub fn new() -> Linker {
        Linker {
            output: Object::new(file_type::FT_EXEC, b""),
            pc_offset: 0,
            sym_offset: 0,
            file_name_base: 0,
            symbols: Vec::new(),
            relocations: Vec::new(),
            have_program: false,
        }
    }

    /// Merge one input object into the output.
    pub fn add_object<'data, R: ReadRef<'data>>(
        &mut self,
        file: &PoffFile<'data, R>,
    ) -> Result<()> {
        match file.file_type() {
            file_type::FT_PROGRAM => {
                if self.have_program {
                    return Err(Error::MultipleMainPrograms);
                }
                self.have_program = true;
                self.output
                    .set_entry_point(file.entry_point().wrapping_add(self.pc_offset));
                self.output.set_module_name(file.module_name()?);
            }
            file_type::FT_UNIT => {}
            other => return Err(Error::BadInputFileType(other)),
        }

        let ro_offset = self.output.append_rodata(file.rodata()) as u16;
        self.merge_program(file.program(), ro_offset)?;

        for name in file.file_names() {
            self.output.add_file_name(name);
        }
        for line in file.raw_line_numbers() {
            let name = file
                .file_name(line.file)
                .ok_or(read::Error("Invalid line number file ordinal"))?;
            self.output.add_line_number(
                line.line,
                name,
                line.offset + u32::from(self.pc_offset),
            );
        }

        for (_, symbol) in file.symbols() {
            let mut value = symbol.value;
            if symbol.kind == sym_type::SYM_T_PROC && symbol.is_defined() {
                value = value.wrapping_add(self.pc_offset);
            }
            self.symbols.push(Symbol {
                name: symbol.name.to_vec(),
                value,
                size: symbol.size,
                kind: symbol.kind,
                flags: symbol.flags,
                align: symbol.align,
            });
        }
        for relocation in file.relocations() {
            self.relocations.push(write::Relocation {
                kind: relocation.kind,
                symbol: (relocation.symbol.0 as u16).wrapping_add(self.sym_offset),
                offset: relocation.offset + u32::from(self.pc_offset),
            });
        }

        self.pc_offset = self.pc_offset.wrapping_add(file.program().len() as u16);
        self.sym_offset = self.sym_offset.wrapping_add(file.symbol_count() as u16);
        self.file_name_base = self
            .file_name_base
            .saturating_add(file.file_names().count() as u8);
        Ok(())
    }

    /// Copy one input's bytecode, adjusting program-section references by
    /// the program offset and read-only references by the data offset.
    fn merge_program(&mut self, program: &[u8], ro_offset: u16) -> Result<()> {
        let mut offset = 0;
        while offset < program.len() {
            let (mut insn, next) = Insn::decode(program, offset)
                .map_err(|()| read::Error("Truncated program section"))?;
            if !insn::is_defined(insn.op) {
                return Err(Error::Read(read::Error("Undefined opcode in program")));
            }
            if insn::is_branch(insn.op) || insn.op == op::PCAL {
                insn.arg2 = insn.arg2.wrapping_add(self.pc_offset);
            } else if insn.op == op::LAC {
                insn.arg2 = insn.arg2.wrapping_add(ro_offset);
            } else if insn.op == op::LINE {
                insn.arg1 = insn.arg1.saturating_add(self.file_name_base);
            }
            self.output.add_opcode(insn);
            offset = next;
        }
        Ok(())
    }

    /// Resolve symbols, apply the buffered relocations, and return the
    /// executable output.
    pub fn finish(mut self) -> Result<Object> {
        if !self.have_program {
            return Err(Error::MissingProgram);
        }

        // Each name may have at most one defined symbol.
        let mut defined: HashMap<&[u8], usize> = HashMap::new();
        for (index, symbol) in self.symbols.iter().enumerate() {
            if symbol.flags & sym_flags::SYM_F_DEFINED != 0 {
                if defined.insert(&symbol.name, index).is_some() {
                    return Err(Error::MultiplyDefinedSymbol(display_name(&symbol.name)));
                }
            }
        }

        // Every external must resolve to a defined symbol.
        let mut resolved = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            if symbol.flags & sym_flags::SYM_F_DEFINED != 0 {
                resolved.push(symbol.value);
            } else {
                let index = *defined
                    .get(symbol.name.as_slice())
                    .ok_or_else(|| Error::UndefinedSymbol(display_name(&symbol.name)))?;
                resolved.push(self.symbols[index].value);
            }
        }
        drop(defined);

        for relocation in &self.relocations {
            match relocation.kind {
                reloc_type::RL_PCAL | reloc_type::RL_LDST => {}
                _ => return Err(Error::BadRelocation(relocation.offset)),
            }
            let value = *resolved
                .get(relocation.symbol as usize)
                .ok_or(Error::ExtraRelocations(relocation.symbol))?;
            self.output
                .patch_program_u16(relocation.offset, value)
                .map_err(|_| Error::BadRelocation(relocation.offset))?;
        }

        // The executable keeps the defined symbols; relocations are
        // consumed, not emitted.
        let mut symbols = core::mem::take(&mut self.symbols);
        for symbol in symbols.drain(..) {
            if symbol.flags & sym_flags::SYM_F_DEFINED != 0 {
                self.output.add_symbol(symbol);
            }
        }

        Ok(self.output)
    }
}

impl Default for Linker {
    fn default() -> Linker {
        Linker::new()
    }
}

fn display_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

/// Link a list of parsed objects into an executable.
pub fn link<'data, R: ReadRef<'data>>(inputs: &[PoffFile<'data, R>]) -> Result<Object> {
    let mut linker = Linker::new();
    for input in inputs {
        linker.add_object(input)?;
    }
    linker.finish()
}
