use alloc::vec::Vec;

use crate::poff::{
    self, file_type, section_type, sym_flags, FileHeader, LineNumberEntry, RelocationEntry,
    SectionHeader, SymbolEntry,
};
use crate::read::{Error, ReadError, ReadRef, Result, StringTable};
use crate::LittleEndian as LE;

/// The index of a symbol in the symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolIndex(pub usize);

/// A parsed symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol<'data> {
    /// The symbol name.
    pub name: &'data [u8],
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

impl<'data> Symbol<'data> {
    /// Return true if the symbol is defined in this object.
    #[inline]
    pub fn is_defined(&self) -> bool {
        self.flags & sym_flags::SYM_F_DEFINED != 0
    }
}

/// A parsed relocation table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// One of the `reloc_type` constants.
    pub kind: u16,
    /// The referenced symbol.
    pub symbol: SymbolIndex,
    /// Program section offset of the 16-bit operand to patch.
    pub offset: u32,
}

/// A parsed line number record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumber {
    /// 1-based source line number.
    pub line: u16,
    /// Ordinal of the source file name in the file name pool.
    pub file: u16,
    /// Program section offset of the first instruction for this line.
    pub offset: u32,
}

/// A parsed POFF file.
///
/// Section data is borrowed from the underlying buffer; the line number
/// table is additionally decoded into a copy sorted by program offset so
/// that [`line_for_offset`](Self::line_for_offset) can binary-search it.
#[derive(Debug)]
pub struct PoffFile<'data, R: ReadRef<'data> = &'data [u8]> {
    data: R,
    header: &'data FileHeader,
    sections: &'data [SectionHeader],
    strings: StringTable<'data>,
    program: &'data [u8],
    rodata: &'data [u8],
    symbols: &'data [SymbolEntry],
    relocations: &'data [RelocationEntry],
    raw_line_numbers: &'data [LineNumberEntry],
    sorted_lines: Vec<LineNumber>,
    file_names: &'data [u8],
}

impl<'data, R: ReadRef<'data>> PoffFile<'data, R> {
    /// Parse the raw POFF file data.
    pub fn parse(data: R) -> Result<Self> {
        let header = data
            .read_at::<FileHeader>(0)
            .read_error("Invalid POFF header size or alignment")?;
        if header.magic != poff::MAGIC {
            return Err(Error("Invalid POFF magic"));
        }
        if header.version != poff::VERSION {
            return Err(Error("Unsupported POFF version"));
        }
        if header.machine != poff::MACHINE_PCODE16 {
            return Err(Error("Unsupported POFF machine"));
        }
        if !file_type::is_valid(header.fh_type) {
            return Err(Error("Invalid POFF file type"));
        }

        let sections = data
            .read_slice_at::<SectionHeader>(
                header.sh_offset.get(LE) as usize,
                header.sh_num.get(LE) as usize,
            )
            .read_error("Invalid POFF section table")?;

        let mut file = PoffFile {
            data,
            header,
            sections,
            strings: StringTable::default(),
            program: &[],
            rodata: &[],
            symbols: &[],
            relocations: &[],
            raw_line_numbers: &[],
            sorted_lines: Vec::new(),
            file_names: &[],
        };

        for section in sections {
            let bytes = file.section_bytes(section)?;
            match section.sh_type {
                section_type::ST_NULL => {}
                section_type::ST_PROG => file.program = bytes,
                section_type::ST_RODATA => file.rodata = bytes,
                section_type::ST_STRTAB => file.strings = StringTable::new(bytes),
                section_type::ST_FILETAB => file.file_names = bytes,
                section_type::ST_SYMTAB => {
                    file.symbols = Self::section_records(section, bytes)?;
                }
                section_type::ST_RELOC => {
                    file.relocations = Self::section_records(section, bytes)?;
                }
                section_type::ST_LINENO => {
                    file.raw_line_numbers = Self::section_records(section, bytes)?;
                }
                _ => return Err(Error("Unknown POFF section type")),
            }
        }

        let mut sorted: Vec<LineNumber> = file
            .raw_line_numbers
            .iter()
            .map(Self::decode_line_number)
            .collect();
        sorted.sort_unstable_by_key(|l| l.offset);
        file.sorted_lines = sorted;

        Ok(file)
    }

    fn section_bytes(&self, section: &SectionHeader) -> Result<&'data [u8]> {
        self.data
            .read_bytes_at(
                section.sh_offset.get(LE) as usize,
                section.sh_size.get(LE) as usize,
            )
            .read_error("Invalid POFF section offset or size")
    }

    fn section_records<T: crate::pod::Pod>(
        section: &SectionHeader,
        bytes: &'data [u8],
    ) -> Result<&'data [T]> {
        let entsize = core::mem::size_of::<T>();
        if section.sh_entsize.get(LE) as usize != entsize {
            return Err(Error("Invalid POFF section entry size"));
        }
        if bytes.len() % entsize != 0 {
            return Err(Error("Invalid POFF section size"));
        }
        crate::pod::slice_from_bytes(bytes, bytes.len() / entsize)
            .map(|(records, _)| records)
            .read_error("Invalid POFF section records")
    }

    fn decode_line_number(entry: &LineNumberEntry) -> LineNumber {
        LineNumber {
            line: entry.l_line.get(LE),
            file: entry.l_file.get(LE),
            offset: entry.l_offset.get(LE),
        }
    }

    /// Return the file kind. One of the `file_type` constants.
    #[inline]
    pub fn file_type(&self) -> u8 {
        self.header.fh_type
    }

    /// Return the program entry point.
    #[inline]
    pub fn entry_point(&self) -> u16 {
        self.header.entry.get(LE)
    }

    /// Return the module name from the file header.
    pub fn module_name(&self) -> Result<&'data [u8]> {
        self.strings.get(self.header.name.get(LE).into())
    }

    /// Return the section headers.
    #[inline]
    pub fn sections(&self) -> &'data [SectionHeader] {
        self.sections
    }

    /// Return the raw data of a section.
    pub fn section_data(&self, section: &SectionHeader) -> Result<&'data [u8]> {
        self.section_bytes(section)
    }

    /// Return the string table.
    #[inline]
    pub fn strings(&self) -> StringTable<'data> {
        self.strings
    }

    /// Return the program section bytes.
    #[inline]
    pub fn program(&self) -> &'data [u8] {
        self.program
    }

    /// Copy the program section into an owned buffer.
    ///
    /// The loader takes ownership of the bytecode this way so that the
    /// machine does not borrow the container.
    pub fn extract_program_data(&self) -> Vec<u8> {
        self.program.to_vec()
    }

    /// Return the read-only data section bytes.
    #[inline]
    pub fn rodata(&self) -> &'data [u8] {
        self.rodata
    }

    /// Return the number of symbol table entries.
    #[inline]
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Return the symbol table entry at the given index.
    pub fn symbol(&self, index: SymbolIndex) -> Result<Symbol<'data>> {
        let entry = self
            .symbols
            .get(index.0)
            .read_error("Invalid POFF symbol index")?;
        Ok(Symbol {
            name: self.strings.get(entry.st_name.get(LE).into())?,
            value: entry.st_value.get(LE),
            size: entry.st_size.get(LE),
            kind: entry.st_type,
            flags: entry.st_flags,
            align: entry.st_align,
        })
    }

    /// Return an iterator over the symbol table.
    pub fn symbols(&self) -> SymbolIterator<'data, '_, R> {
        SymbolIterator {
            file: self,
            index: 0,
        }
    }

    /// Return an iterator over the relocation table.
    pub fn relocations(&self) -> RelocationIterator<'data, '_, R> {
        RelocationIterator {
            file: self,
            index: 0,
        }
    }

    /// Return an iterator over line numbers sorted by program offset.
    pub fn line_numbers(&self) -> impl Iterator<Item = LineNumber> + '_ {
        self.sorted_lines.iter().copied()
    }

    /// Return an iterator over line numbers in table order.
    pub fn raw_line_numbers(&self) -> impl Iterator<Item = LineNumber> + 'data {
        self.raw_line_numbers.iter().map(Self::decode_line_number)
    }

    /// Return the line number record covering a program offset.
    pub fn line_for_offset(&self, offset: u32) -> Option<LineNumber> {
        let index = match self
            .sorted_lines
            .binary_search_by_key(&offset, |l| l.offset)
        {
            Ok(index) => index,
            Err(index) => index.checked_sub(1)?,
        };
        self.sorted_lines.get(index).copied()
    }

    /// Return the source file name with the given ordinal.
    pub fn file_name(&self, ordinal: u16) -> Option<&'data [u8]> {
        self.file_names().nth(ordinal as usize)
    }

    /// Return an iterator over the source file name pool.
    pub fn file_names(&self) -> impl Iterator<Item = &'data [u8]> {
        let pool = self.file_names.strip_suffix(b"\0").unwrap_or(self.file_names);
        let count = if pool.is_empty() { 0 } else { usize::MAX };
        pool.split(|&b| b == 0).take(count)
    }
}

/// An iterator for the symbols in a [`PoffFile`].
#[derive(Debug)]
pub struct SymbolIterator<'data, 'file, R: ReadRef<'data> = &'data [u8]> {
    file: &'file PoffFile<'data, R>,
    index: usize,
}

impl<'data, 'file, R: ReadRef<'data>> Iterator for SymbolIterator<'data, 'file, R> {
    type Item = (SymbolIndex, Symbol<'data>);

    fn next(&mut self) -> Option<Self::Item> {
        let index = SymbolIndex(self.index);
        let symbol = self.file.symbol(index).ok()?;
        self.index += 1;
        Some((index, symbol))
    }
}

/// An iterator for the relocations in a [`PoffFile`].
#[derive(Debug)]
pub struct RelocationIterator<'data, 'file, R: ReadRef<'data> = &'data [u8]> {
    file: &'file PoffFile<'data, R>,
    index: usize,
}

impl<'data, 'file, R: ReadRef<'data>> Iterator for RelocationIterator<'data, 'file, R> {
    type Item = Relocation;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.file.relocations.get(self.index)?;
        self.index += 1;
        Some(Relocation {
            kind: entry.r_type.get(LE),
            symbol: SymbolIndex(entry.r_symbol.get(LE) as usize),
            offset: entry.r_offset.get(LE),
        })
    }
}
