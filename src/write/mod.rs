//! Interface for writing POFF files.
//!
//! [`Object`] is the emission interface of the toolchain: the compiler
//! appends opcodes, read-only data, symbols, relocations and line numbers,
//! and the linker builds its executable output through the same type.

use alloc::string::String;
use alloc::vec::Vec;
use core::{fmt, result};

use crate::insn::Insn;
use crate::poff::{
    self, file_type, section_type, FileHeader, LineNumberEntry, RelocationEntry, SectionHeader,
    SymbolEntry,
};
use crate::{LittleEndian as LE, U16, U32};

mod string;
use string::StringTable;

mod util;
pub use util::*;

/// The error type used within the write module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error(pub(crate) String);

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// The result type used within the write module.
pub type Result<T> = result::Result<T, Error>;

/// A symbol to be written to the symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// The symbol name.
    pub name: Vec<u8>,
    /// Code address for procedures, frame offset for data.
    pub value: u16,
    /// Size of the symbol in bytes.
    pub size: u16,
    /// One of the `sym_type` constants.
    pub kind: u8,
    /// The `sym_flags` bits.
    pub flags: u8,
    /// Required alignment for data symbols.
    pub align: u8,
}

/// A relocation to be written to the relocation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// One of the `reloc_type` constants.
    pub kind: u16,
    /// Index of the referenced symbol.
    pub symbol: u16,
    /// Program section offset of the 16-bit operand to patch.
    pub offset: u32,
}

#[derive(Debug, Clone, Copy)]
struct LineNumber {
    line: u16,
    file: u16,
    offset: u32,
}

/// A writable POFF object.
#[derive(Debug)]
pub struct Object {
    file_type: u8,
    entry_point: u16,
    module_name: Vec<u8>,
    program: Vec<u8>,
    rodata: Vec<u8>,
    symbols: Vec<Symbol>,
    relocations: Vec<Relocation>,
    line_numbers: Vec<LineNumber>,
    file_names: StringTable,
}

impl Object {
    /// Create an empty object of the given file kind.
    pub fn new(file_type: u8, module_name: &[u8]) -> Self {
        Object {
            file_type,
            entry_point: 0,
            module_name: module_name.to_vec(),
            program: Vec::new(),
            rodata: Vec::new(),
            symbols: Vec::new(),
            relocations: Vec::new(),
            line_numbers: Vec::new(),
            file_names: StringTable::new(),
        }
    }

    /// Return the file kind.
    #[inline]
    pub fn file_type(&self) -> u8 {
        self.file_type
    }

    /// Set the file kind.
    #[inline]
    pub fn set_file_type(&mut self, file_type: u8) {
        self.file_type = file_type;
    }

    /// Return the program entry point.
    #[inline]
    pub fn entry_point(&self) -> u16 {
        self.entry_point
    }

    /// Set the program entry point.
    #[inline]
    pub fn set_entry_point(&mut self, entry: u16) {
        self.entry_point = entry;
    }

    /// Return the module name.
    #[inline]
    pub fn module_name(&self) -> &[u8] {
        &self.module_name
    }

    /// Set the module name.
    pub fn set_module_name(&mut self, name: &[u8]) {
        self.module_name = name.to_vec();
    }

    /// Return the program section bytes appended so far.
    #[inline]
    pub fn program(&self) -> &[u8] {
        &self.program
    }

    /// Return the offset at which the next opcode will be appended.
    #[inline]
    pub fn program_len(&self) -> u32 {
        self.program.len() as u32
    }

    /// Encode one instruction at the end of the program section.
    ///
    /// Returns the offset of the appended instruction.
    pub fn add_opcode(&mut self, insn: Insn) -> u32 {
        let offset = self.program.len() as u32;
        insn.encode_into(&mut self.program);
        offset
    }

    /// Patch the big-endian 16-bit operand at a program section offset.
    ///
    /// The offset addresses the operand itself, not the opcode byte. This
    /// is how the linker applies relocations.
    pub fn patch_program_u16(&mut self, offset: u32, value: u16) -> Result<()> {
        let bytes = self
            .program
            .get_mut(offset as usize..offset as usize + 2)
            .ok_or_else(|| Error(format!("invalid program patch offset {:#x}", offset)))?;
        bytes.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Return the read-only data appended so far.
    #[inline]
    pub fn rodata(&self) -> &[u8] {
        &self.rodata
    }

    /// Append bytes to the read-only data section.
    ///
    /// Returns the offset of the appended data. The data is padded to
    /// 2-byte alignment so that word constants stay word-aligned in D-space.
    pub fn append_rodata(&mut self, data: &[u8]) -> u32 {
        let offset = self.rodata.len() as u32;
        self.rodata.extend_from_slice(data);
        if self.rodata.len() % 2 != 0 {
            self.rodata.push(0);
        }
        offset
    }

    /// Return the symbols added so far.
    #[inline]
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Add a symbol and return its table index.
    pub fn add_symbol(&mut self, symbol: Symbol) -> u16 {
        let index = self.symbols.len() as u16;
        self.symbols.push(symbol);
        index
    }

    /// Return the relocations added so far.
    #[inline]
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Add a relocation record.
    pub fn add_relocation(&mut self, relocation: Relocation) {
        self.relocations.push(relocation);
    }

    /// Intern a source file name and return its stable pool offset.
    pub fn add_file_name(&mut self, name: &[u8]) -> u32 {
        // The pool section omits the interning table's implicit empty entry.
        self.file_names.add(name).saturating_sub(1)
    }

    /// Return the ordinal of an interned source file name.
    pub fn file_name_ordinal(&self, name: &[u8]) -> Option<u16> {
        self.file_names.ordinal(name).map(|i| i as u16)
    }

    /// Return the interned source file name with the given ordinal.
    pub fn file_name(&self, ordinal: u16) -> Option<&[u8]> {
        self.file_names.get_ordinal(ordinal as usize)
    }

    /// Add a line number record for a program offset.
    ///
    /// The file name is interned into the file name pool.
    pub fn add_line_number(&mut self, line: u16, file_name: &[u8], offset: u32) {
        self.add_file_name(file_name);
        let file = self
            .file_names
            .ordinal(file_name)
            .unwrap_or(0) as u16;
        self.line_numbers.push(LineNumber { line, file, offset });
    }

    fn strtab(&self) -> StringTable {
        let mut strings = StringTable::new();
        strings.add(&self.module_name);
        for name in SECTION_NAMES {
            strings.add(name);
        }
        for symbol in &self.symbols {
            strings.add(&symbol.name);
        }
        strings
    }

    /// Serialize the object into a byte buffer.
    pub fn write_vec(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.emit(&mut buffer)?;
        Ok(buffer)
    }

    /// Serialize the object into a [`WritableBuffer`].
    pub fn emit(&self, buffer: &mut dyn WritableBuffer) -> Result<()> {
        if !file_type::is_valid(self.file_type) {
            return Err(Error(format!("invalid file type {}", self.file_type)));
        }
        if self.program.len() > u16::MAX as usize {
            return Err(Error(format!(
                "program section too large for 16-bit I-space: {} bytes",
                self.program.len()
            )));
        }
        if self.symbols.len() > u16::MAX as usize {
            return Err(Error(String::from("too many symbols")));
        }

        let strings = self.strtab();
        if strings.data().len() > u16::MAX as usize {
            return Err(Error(String::from("string table too large")));
        }

        // Section payloads in emission order.
        let file_names = self.file_names.names_data();
        let sections: Vec<(u8, u16, Vec<u8>)> = vec![
            (section_type::ST_STRTAB, 0, strings.data().to_vec()),
            (section_type::ST_PROG, 0, self.program.clone()),
            (section_type::ST_RODATA, 0, self.rodata.clone()),
            (
                section_type::ST_SYMTAB,
                core::mem::size_of::<SymbolEntry>() as u16,
                self.symbol_records(&strings),
            ),
            (
                section_type::ST_RELOC,
                core::mem::size_of::<RelocationEntry>() as u16,
                self.relocation_records(),
            ),
            (
                section_type::ST_LINENO,
                core::mem::size_of::<LineNumberEntry>() as u16,
                self.line_number_records(),
            ),
            (section_type::ST_FILETAB, 0, file_names.to_vec()),
        ];
        let sections: Vec<_> = sections
            .into_iter()
            .filter(|(sh_type, _, data)| {
                *sh_type == section_type::ST_STRTAB || !data.is_empty()
            })
            .collect();

        // Calculate offsets of everything.
        let mut offset = core::mem::size_of::<FileHeader>();
        let mut data_offsets = Vec::with_capacity(sections.len());
        for (_, _, data) in &sections {
            offset = util::align(offset, 2);
            data_offsets.push(offset);
            offset += data.len();
        }
        offset = util::align(offset, 2);
        let sh_offset = offset;
        offset += sections.len() * core::mem::size_of::<SectionHeader>();

        buffer
            .reserve(offset)
            .map_err(|()| Error(String::from("cannot reserve output buffer")))?;

        // File header.
        let name = self.string_offset(&strings, &self.module_name);
        let header = FileHeader {
            magic: poff::MAGIC,
            version: poff::VERSION,
            fh_type: self.file_type,
            machine: poff::MACHINE_PCODE16,
            arch: 0,
            entry: U16::new(LE, self.entry_point),
            sh_num: U16::new(LE, sections.len() as u16),
            name: U16::new(LE, name),
            pad: U16::new(LE, 0),
            sh_offset: U32::new(LE, sh_offset as u32),
        };
        buffer.write(&header);

        // Section data.
        for (index, (_, _, data)) in sections.iter().enumerate() {
            write_align(buffer, 2);
            debug_assert_eq!(buffer.len(), data_offsets[index]);
            buffer.write_bytes(data);
        }

        // Section headers.
        write_align(buffer, 2);
        debug_assert_eq!(buffer.len(), sh_offset);
        for (index, (sh_type, entsize, data)) in sections.iter().enumerate() {
            let sh_name = self.string_offset(&strings, SECTION_NAMES[*sh_type as usize - 1]);
            let section = SectionHeader {
                sh_type: *sh_type,
                sh_flags: 0,
                sh_name: U16::new(LE, sh_name),
                sh_entsize: U16::new(LE, *entsize),
                pad: U16::new(LE, 0),
                sh_size: U32::new(LE, data.len() as u32),
                sh_offset: U32::new(LE, data_offsets[index] as u32),
            };
            buffer.write(&section);
        }

        Ok(())
    }

    fn symbol_records(&self, strings: &StringTable) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.symbols.len() * 10);
        for symbol in &self.symbols {
            let entry = SymbolEntry {
                st_name: U16::new(LE, self.string_offset(strings, &symbol.name)),
                st_value: U16::new(LE, symbol.value),
                st_size: U16::new(LE, symbol.size),
                st_type: symbol.kind,
                st_flags: symbol.flags,
                st_align: symbol.align,
                pad: 0,
            };
            data.extend_from_slice(crate::pod::bytes_of(&entry));
        }
        data
    }

    fn string_offset(&self, strings: &StringTable, name: &[u8]) -> u16 {
        // All names were interned by `strtab`, so the lookup cannot add.
        strings.offset_of(name).unwrap_or(0) as u16
    }

    fn relocation_records(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.relocations.len() * 8);
        for relocation in &self.relocations {
            let entry = RelocationEntry {
                r_type: U16::new(LE, relocation.kind),
                r_symbol: U16::new(LE, relocation.symbol),
                r_offset: U32::new(LE, relocation.offset),
            };
            data.extend_from_slice(crate::pod::bytes_of(&entry));
        }
        data
    }

    fn line_number_records(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.line_numbers.len() * 8);
        for line in &self.line_numbers {
            let entry = LineNumberEntry {
                l_line: U16::new(LE, line.line),
                l_file: U16::new(LE, line.file),
                l_offset: U32::new(LE, line.offset),
            };
            data.extend_from_slice(crate::pod::bytes_of(&entry));
        }
        data
    }
}

/// Conventional section names, indexed by `ST_*` value minus one.
const SECTION_NAMES: &[&[u8]] = &[
    b".prog",
    b".rodata",
    b".symtab",
    b".strtab",
    b".reloc",
    b".lineno",
    b".filetab",
];
