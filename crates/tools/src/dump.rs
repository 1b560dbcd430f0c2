//! Container and bytecode dumping, in the manner of `objdump`.

use std::io::{Result, Write};

use poff::insn::{self, Insn};
use poff::poff::{file_type, section_type};
use poff::read::PoffFile;

fn file_type_name(value: u8) -> &'static str {
    match value {
        file_type::FT_NONE => "none",
        file_type::FT_PROGRAM => "program",
        file_type::FT_UNIT => "unit",
        file_type::FT_EXEC => "executable",
        _ => "unknown",
    }
}

fn section_type_name(value: u8) -> &'static str {
    match value {
        section_type::ST_NULL => "null",
        section_type::ST_PROG => "prog",
        section_type::ST_RODATA => "rodata",
        section_type::ST_SYMTAB => "symtab",
        section_type::ST_STRTAB => "strtab",
        section_type::ST_RELOC => "reloc",
        section_type::ST_LINENO => "lineno",
        section_type::ST_FILETAB => "filetab",
        _ => "unknown",
    }
}

/// Print the file header and section table.
pub fn print_header(w: &mut dyn Write, file: &PoffFile<'_>) -> Result<()> {
    use poff::LittleEndian as LE;

    writeln!(
        w,
        "module {}: {}, entry {:#06x}",
        String::from_utf8_lossy(file.module_name().unwrap_or(b"?")),
        file_type_name(file.file_type()),
        file.entry_point(),
    )?;
    for section in file.sections() {
        writeln!(
            w,
            "  section {:<8} size {:#8x} offset {:#8x}",
            section_type_name(section.sh_type),
            section.sh_size.get(LE),
            section.sh_offset.get(LE),
        )?;
    }
    Ok(())
}

/// Disassemble the program section.
pub fn print_disassembly(w: &mut dyn Write, file: &PoffFile<'_>) -> Result<()> {
    let program = file.program();
    let mut offset = 0;
    while offset < program.len() {
        let Ok((insn, next)) = Insn::decode(program, offset) else {
            writeln!(w, "{:06x}: <truncated>", offset)?;
            break;
        };
        let name = insn::name(insn.op).unwrap_or("<illegal>");
        match (insn::has_arg8(insn.op), insn::has_arg16(insn.op)) {
            (false, false) => writeln!(w, "{:06x}: {}", offset, name)?,
            (true, false) => writeln!(w, "{:06x}: {} {}", offset, name, insn.arg1)?,
            (false, true) => writeln!(w, "{:06x}: {} {:#06x}", offset, name, insn.arg2)?,
            (true, true) => writeln!(
                w,
                "{:06x}: {} {}, {:#06x}",
                offset, name, insn.arg1, insn.arg2
            )?,
        }
        offset = next;
    }
    Ok(())
}

/// Print the symbol table.
pub fn print_symbols(w: &mut dyn Write, file: &PoffFile<'_>) -> Result<()> {
    for (index, symbol) in file.symbols() {
        writeln!(
            w,
            "symbol {:3}: {:#06x} size {:5} type {} flags {:#04x} {}",
            index.0,
            symbol.value,
            symbol.size,
            symbol.kind,
            symbol.flags,
            String::from_utf8_lossy(symbol.name),
        )?;
    }
    Ok(())
}

/// Print the relocation table.
pub fn print_relocations(w: &mut dyn Write, file: &PoffFile<'_>) -> Result<()> {
    for relocation in file.relocations() {
        writeln!(
            w,
            "reloc: type {} symbol {} offset {:#08x}",
            relocation.kind, relocation.symbol.0, relocation.offset,
        )?;
    }
    Ok(())
}

/// Print line numbers and the file name pool.
pub fn print_line_numbers(w: &mut dyn Write, file: &PoffFile<'_>) -> Result<()> {
    for (ordinal, name) in file.file_names().enumerate() {
        writeln!(w, "file {}: {}", ordinal, String::from_utf8_lossy(name))?;
    }
    for line in file.line_numbers() {
        writeln!(
            w,
            "line {:5} file {:3} offset {:#08x}",
            line.line, line.file, line.offset,
        )?;
    }
    Ok(())
}
