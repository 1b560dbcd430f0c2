//! The file table and the file I/O dispatcher.
//!
//! A bounded table of file slots implements Pascal text and binary file
//! semantics. Slots 0 and 1 are permanently bound to the process standard
//! input and output (or their injected replacements) and are always in-use
//! text streams.
//!
//! Text reads go through a per-slot line buffer refilled one line at a
//! time. The stripped newline of the current line stays logically
//! unconsumed until a read moves past it, which is what makes `eof` turn
//! true only after a read attempt beyond the last line, while `eoln`
//! becomes true as soon as a read consumes the last character before the
//! newline.

use alloc::vec::Vec;
use core::fmt;
use std::boxed::Box;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::string::String;

use super::{Machine, Trap};
use crate::insn::sysio_fn;

type Result<T> = core::result::Result<T, Trap>;

/// Capacity of the file table.
pub(crate) const MAX_OPEN_FILES: usize = 16;

/// Open modes, with their numeric values in the bytecode ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    Closed,
    Read,
    Write,
    Append,
}

impl OpenMode {
    fn from_value(value: u16) -> Option<OpenMode> {
        match value {
            1 => Some(OpenMode::Read),
            2 => Some(OpenMode::Write),
            3 => Some(OpenMode::Append),
            _ => None,
        }
    }
}

enum Stream {
    ConsoleIn(Box<dyn BufRead>),
    ConsoleOut(Box<dyn Write>),
    Reader(BufReader<File>),
    Writer(BufWriter<File>),
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stream::ConsoleIn(_) => "ConsoleIn",
            Stream::ConsoleOut(_) => "ConsoleOut",
            Stream::Reader(_) => "Reader",
            Stream::Writer(_) => "Writer",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct FileSlot {
    inuse: bool,
    standard: bool,
    name: Vec<u8>,
    text: bool,
    mode: Option<OpenMode>,
    record_size: u16,
    stream: Option<Stream>,

    // Text read state: the current line with the newline stripped, the
    // cursor into it, and whether the stripped newline is still pending.
    line: Vec<u8>,
    pos: usize,
    line_nl: bool,
    eoln: bool,
    hit_eof: bool,
}

impl FileSlot {
    fn mode(&self) -> OpenMode {
        self.mode.unwrap_or(OpenMode::Closed)
    }

    fn clear_read_state(&mut self) {
        self.line.clear();
        self.pos = 0;
        self.line_nl = false;
        self.eoln = false;
        self.hit_eof = false;
    }

    fn reader(&mut self) -> Result<&mut dyn BufRead> {
        if self.mode() != OpenMode::Read {
            return Err(Trap::NotOpenForRead);
        }
        match self.stream.as_mut() {
            Some(Stream::ConsoleIn(reader)) => Ok(reader),
            Some(Stream::Reader(reader)) => Ok(reader),
            _ => Err(Trap::FileNotOpen),
        }
    }

    fn writer(&mut self) -> Result<&mut dyn Write> {
        match self.mode() {
            OpenMode::Write | OpenMode::Append => {}
            _ => return Err(Trap::NotOpenForWrite),
        }
        match self.stream.as_mut() {
            Some(Stream::ConsoleOut(writer)) => Ok(writer),
            Some(Stream::Writer(writer)) => Ok(writer),
            _ => Err(Trap::FileNotOpen),
        }
    }

    /// Load the next line, implicitly consuming any pending newline.
    ///
    /// Returns false at end of file.
    fn refill(&mut self) -> Result<bool> {
        self.line.clear();
        self.pos = 0;
        self.line_nl = false;
        let reader = self.reader()?;
        let mut raw = Vec::new();
        let n = reader
            .read_until(b'\n', &mut raw)
            .map_err(|_| Trap::ReadFailed)?;
        if n == 0 {
            self.hit_eof = true;
            return Ok(false);
        }
        if raw.last() == Some(&b'\n') {
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            self.line_nl = true;
        }
        self.line = raw;
        Ok(true)
    }

    fn update_eoln(&mut self) {
        self.eoln = self.pos >= self.line.len() && self.line_nl;
    }

    /// Skip blanks, crossing line boundaries. Returns false at end of file.
    fn skip_blanks(&mut self) -> Result<bool> {
        loop {
            while self.pos < self.line.len()
                && matches!(self.line[self.pos], b' ' | b'\t')
            {
                self.pos += 1;
            }
            if self.pos < self.line.len() {
                return Ok(true);
            }
            if !self.refill()? {
                return Ok(false);
            }
        }
    }

    fn read_char(&mut self) -> Result<u8> {
        loop {
            if self.pos < self.line.len() {
                let ch = self.line[self.pos];
                self.pos += 1;
                self.update_eoln();
                return Ok(ch);
            }
            if self.line_nl {
                // Reading the line end itself yields a blank.
                self.line_nl = false;
                self.eoln = false;
                return Ok(b' ');
            }
            if !self.refill()? {
                return Err(Trap::ReadFailed);
            }
        }
    }

    fn read_integer(&mut self) -> Result<i16> {
        if !self.skip_blanks()? {
            return Err(Trap::ReadFailed);
        }
        let negative = match self.line[self.pos] {
            b'-' => {
                self.pos += 1;
                true
            }
            b'+' => {
                self.pos += 1;
                false
            }
            _ => false,
        };
        let mut value: i32 = 0;
        let mut digits = 0;
        while self.pos < self.line.len() && self.line[self.pos].is_ascii_digit() {
            value = value * 10 + i32::from(self.line[self.pos] - b'0');
            // Saturate against the 16-bit range instead of wrapping.
            if value > i32::from(i16::MAX) + 1 {
                value = i32::from(i16::MAX) + 1;
            }
            self.pos += 1;
            digits += 1;
        }
        if digits == 0 {
            return Err(Trap::ReadFailed);
        }
        self.update_eoln();
        let value = if negative { -value } else { value };
        Ok(value.clamp(i16::MIN.into(), i16::MAX.into()) as i16)
    }

    fn read_real(&mut self) -> Result<f64> {
        if !self.skip_blanks()? {
            return Err(Trap::ReadFailed);
        }
        let negative = match self.line[self.pos] {
            b'-' => {
                self.pos += 1;
                true
            }
            b'+' => {
                self.pos += 1;
                false
            }
            _ => false,
        };
        let mut value = 0.0f64;
        let mut digits = 0;
        while self.pos < self.line.len() && self.line[self.pos].is_ascii_digit() {
            value = value * 10.0 + f64::from(self.line[self.pos] - b'0');
            self.pos += 1;
            digits += 1;
        }
        if self.pos < self.line.len() && self.line[self.pos] == b'.' {
            self.pos += 1;
            let mut denominator = 1.0f64;
            while self.pos < self.line.len() && self.line[self.pos].is_ascii_digit() {
                denominator /= 10.0;
                value += f64::from(self.line[self.pos] - b'0') * denominator;
                self.pos += 1;
                digits += 1;
            }
        }
        if digits == 0 {
            return Err(Trap::ReadFailed);
        }
        self.update_eoln();
        Ok(if negative { -value } else { value })
    }

    /// Take the rest of the current line, consuming its line end.
    fn read_line_rest(&mut self) -> Result<Vec<u8>> {
        if self.pos >= self.line.len() && !self.line_nl {
            if !self.refill()? {
                return Err(Trap::ReadFailed);
            }
        }
        let rest = self.line[self.pos.min(self.line.len())..].to_vec();
        self.pos = self.line.len();
        self.eoln = self.line_nl;
        self.line_nl = false;
        Ok(rest)
    }

    /// Bytes buffered but not yet consumed, including a pending newline.
    fn unconsumed(&self) -> u64 {
        (self.line.len() - self.pos.min(self.line.len())) as u64 + u64::from(self.line_nl)
    }

    fn virtual_pos(&mut self) -> Result<u64> {
        let unconsumed = self.unconsumed();
        let raw = match self.stream.as_mut() {
            Some(Stream::Reader(reader)) => {
                reader.stream_position().map_err(|_| Trap::TellFailed)?
            }
            Some(Stream::Writer(writer)) => {
                writer.stream_position().map_err(|_| Trap::TellFailed)?
            }
            _ => return Err(Trap::TellFailed),
        };
        Ok(raw.saturating_sub(unconsumed))
    }

    fn file_size(&self) -> Result<u64> {
        let file = match self.stream.as_ref() {
            Some(Stream::Reader(reader)) => reader.get_ref(),
            Some(Stream::Writer(writer)) => writer.get_ref(),
            _ => return Err(Trap::TellFailed),
        };
        file.metadata().map(|m| m.len()).map_err(|_| Trap::TellFailed)
    }

    /// End-of-file test.
    ///
    /// The underlying stream does not report end-of-file until a read past
    /// the end, so this also compares the virtual position with the
    /// reported size.
    fn eof(&mut self) -> bool {
        if self.unconsumed() != 0 {
            return false;
        }
        if self.hit_eof {
            return true;
        }
        if matches!(self.stream, Some(Stream::Reader(_))) {
            let size = match self.file_size() {
                Ok(size) => size,
                Err(_) => return false,
            };
            return match self.virtual_pos() {
                Ok(pos) => pos >= size,
                Err(_) => false,
            };
        }
        if let Some(Stream::ConsoleIn(reader)) = self.stream.as_mut() {
            return matches!(reader.fill_buf(), Ok(buffer) if buffer.is_empty());
        }
        false
    }

    fn close(&mut self) {
        if let Some(Stream::Writer(writer)) = self.stream.as_mut() {
            let _ = writer.flush();
        }
        self.stream = None;
        self.mode = None;
        self.clear_read_state();
    }
}

/// The bounded table of file slots.
#[derive(Debug)]
pub(crate) struct FileTable {
    slots: Vec<FileSlot>,
}

impl FileTable {
    pub(crate) fn new(
        input: Option<Box<dyn BufRead>>,
        output: Option<Box<dyn Write>>,
    ) -> FileTable {
        let mut slots: Vec<FileSlot> = (0..MAX_OPEN_FILES).map(|_| FileSlot::default()).collect();

        let stdin = &mut slots[0];
        stdin.inuse = true;
        stdin.standard = true;
        stdin.text = true;
        stdin.mode = Some(OpenMode::Read);
        stdin.stream = Some(Stream::ConsoleIn(
            input.unwrap_or_else(|| Box::new(BufReader::new(io::stdin()))),
        ));

        let stdout = &mut slots[1];
        stdout.inuse = true;
        stdout.standard = true;
        stdout.text = true;
        stdout.mode = Some(OpenMode::Write);
        stdout.stream = Some(Stream::ConsoleOut(
            output.unwrap_or_else(|| Box::new(io::stdout())),
        ));

        FileTable { slots }
    }

    fn slot_mut(&mut self, number: u16) -> Result<&mut FileSlot> {
        let slot = self
            .slots
            .get_mut(number as usize)
            .ok_or(Trap::BadFile)?;
        if !slot.inuse {
            return Err(Trap::FileNotInUse);
        }
        Ok(slot)
    }

    fn allocate(&mut self) -> Result<u16> {
        for (number, slot) in self.slots.iter_mut().enumerate() {
            if !slot.inuse {
                *slot = FileSlot::default();
                slot.inuse = true;
                return Ok(number as u16);
            }
        }
        Err(Trap::TooManyFiles)
    }

    fn free(&mut self, number: u16) -> Result<()> {
        let slot = self.slot_mut(number)?;
        if slot.standard {
            return Err(Trap::BadFile);
        }
        slot.close();
        *slot = FileSlot::default();
        Ok(())
    }

    fn assign(&mut self, number: u16, text: bool, name: Vec<u8>) -> Result<()> {
        let slot = self.slot_mut(number)?;
        if slot.stream.is_some() && !slot.standard {
            return Err(Trap::FileAlreadyOpen);
        }
        if slot.standard {
            return Err(Trap::BadFile);
        }
        slot.name = name;
        slot.text = text;
        Ok(())
    }

    fn open(&mut self, number: u16, mode: u16) -> Result<()> {
        let mode = OpenMode::from_value(mode).ok_or(Trap::BadOpenMode)?;
        let slot = self.slot_mut(number)?;
        if slot.standard || slot.stream.is_some() {
            return Err(Trap::FileAlreadyOpen);
        }
        let name = String::from_utf8_lossy(&slot.name).into_owned();
        let stream = match mode {
            OpenMode::Read => Stream::Reader(BufReader::new(
                File::open(&name).map_err(|_| Trap::OpenFailed)?,
            )),
            OpenMode::Write => Stream::Writer(BufWriter::new(
                File::create(&name).map_err(|_| Trap::OpenFailed)?,
            )),
            OpenMode::Append => Stream::Writer(BufWriter::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&name)
                    .map_err(|_| Trap::OpenFailed)?,
            )),
            OpenMode::Closed => return Err(Trap::BadOpenMode),
        };
        slot.stream = Some(stream);
        slot.mode = Some(mode);
        slot.clear_read_state();
        Ok(())
    }

    fn close(&mut self, number: u16) -> Result<()> {
        let slot = self.slot_mut(number)?;
        if slot.standard {
            return Err(Trap::BadFile);
        }
        if slot.stream.is_none() {
            return Err(Trap::FileNotOpen);
        }
        slot.close();
        Ok(())
    }

    /// Flush buffered output, called when the machine stops.
    pub(crate) fn flush(&mut self) {
        for slot in &mut self.slots {
            match slot.stream.as_mut() {
                Some(Stream::ConsoleOut(writer)) => {
                    let _ = writer.flush();
                }
                Some(Stream::Writer(writer)) => {
                    let _ = writer.flush();
                }
                _ => {}
            }
        }
    }

    /// Close every non-standard slot.
    pub(crate) fn release(&mut self) {
        for slot in &mut self.slots {
            if slot.inuse && !slot.standard {
                slot.close();
                *slot = FileSlot::default();
            }
        }
    }
}

fn write_padded(writer: &mut dyn Write, text: &str, width: u16) -> io::Result<()> {
    let field = (width & 0xFF) as usize;
    for _ in text.len()..field {
        writer.write_all(b" ")?;
    }
    writer.write_all(text.as_bytes())
}

impl Machine {
    /// Execute a `sysio` sub-function.
    pub(crate) fn exec_sysio(&mut self, fun: u16) -> Result<()> {
        match fun {
            sysio_fn::ALLOCFILE => {
                let number = self.files.allocate()?;
                self.push(number)
            }
            sysio_fn::FREEFILE => {
                let number = self.pop()?;
                self.files.free(number)
            }
            sysio_fn::ASSIGNFILE => {
                let name_len = self.pop()?;
                let name_addr = self.pop()?;
                let text = self.pop()?;
                let number = self.pop()?;
                let name = self.dspace.bytes(name_addr, name_len)?.to_vec();
                self.files.assign(number, text != 0, name)
            }
            sysio_fn::OPENFILE => {
                let mode = self.pop()?;
                let number = self.pop()?;
                self.files.open(number, mode)
            }
            sysio_fn::CLOSEFILE => {
                let number = self.pop()?;
                self.files.close(number)
            }
            sysio_fn::RECORDSIZE => {
                let size = self.pop()?;
                let number = self.pop()?;
                self.files.slot_mut(number)?.record_size = size;
                Ok(())
            }
            sysio_fn::READBINARY => {
                let size = self.pop()?;
                let dst = self.pop()?;
                let number = self.pop()?;
                let slot = self.files.slot_mut(number)?;
                if slot.text {
                    return Err(Trap::BadFile);
                }
                if slot.mode() != OpenMode::Read {
                    return Err(Trap::NotOpenForRead);
                }
                // A zero size means one record of the configured size.
                let size = if size != 0 { size } else { slot.record_size };
                let buffer = self.dspace.bytes_mut(dst, size)?;
                match slot.stream.as_mut() {
                    Some(Stream::Reader(reader)) => {
                        reader.read_exact(buffer).map_err(|_| Trap::ReadFailed)
                    }
                    _ => Err(Trap::FileNotOpen),
                }
            }
            sysio_fn::WRITEBINARY => {
                let size = self.pop()?;
                let src = self.pop()?;
                let number = self.pop()?;
                let slot = self.files.slot_mut(number)?;
                if slot.text {
                    return Err(Trap::BadFile);
                }
                let size = if size != 0 { size } else { slot.record_size };
                let buffer = self.dspace.bytes(src, size)?;
                slot.writer()?
                    .write_all(buffer)
                    .map_err(|_| Trap::WriteFailed)
            }
            sysio_fn::READINT => {
                let dst = self.pop()?;
                let number = self.pop()?;
                let value = self.files.slot_mut(number)?.read_integer()?;
                self.dspace.put16(dst, value as u16)
            }
            sysio_fn::READCHAR => {
                let dst = self.pop()?;
                let number = self.pop()?;
                let value = self.files.slot_mut(number)?.read_char()?;
                self.dspace.put8(dst, value)
            }
            sysio_fn::READSTRING => {
                let var = self.pop()?;
                let number = self.pop()?;
                let rest = self.files.slot_mut(number)?.read_line_rest()?;
                let buffer = self.dspace.get16(var)?;
                if buffer == 0 || buffer >= self.strsize {
                    return Err(Trap::InternalError);
                }
                let len = rest.len().min(self.stralloc as usize) as u16;
                self.dspace.write_bytes(buffer, &rest[..len as usize])?;
                self.dspace.put16(var.wrapping_add(2), len)
            }
            sysio_fn::READREAL => {
                let dst = self.pop()?;
                let number = self.pop()?;
                let value = self.files.slot_mut(number)?.read_real()?;
                let bits = value.to_bits();
                for i in 0..4u16 {
                    self.dspace
                        .put16(dst.wrapping_add(i * 2), (bits >> (16 * i)) as u16)?;
                }
                Ok(())
            }
            sysio_fn::WRITEINT => {
                let width = self.pop()?;
                let value = self.pop()? as i16;
                let number = self.pop()?;
                self.write_text(number, &format!("{}", value), width)
            }
            sysio_fn::WRITELONGINT => {
                let width = self.pop()?;
                let hi = self.pop()?;
                let lo = self.pop()?;
                let number = self.pop()?;
                let value = ((u32::from(hi) << 16) | u32::from(lo)) as i32;
                self.write_text(number, &format!("{}", value), width)
            }
            sysio_fn::WRITEWORD => {
                let width = self.pop()?;
                let value = self.pop()?;
                let number = self.pop()?;
                self.write_text(number, &format!("{}", value), width)
            }
            sysio_fn::WRITELONGWORD => {
                let width = self.pop()?;
                let hi = self.pop()?;
                let lo = self.pop()?;
                let number = self.pop()?;
                let value = (u32::from(hi) << 16) | u32::from(lo);
                self.write_text(number, &format!("{}", value), width)
            }
            sysio_fn::WRITECHAR => {
                let width = self.pop()?;
                let value = self.pop()?;
                let number = self.pop()?;
                let slot = self.files.slot_mut(number)?;
                let writer = slot.writer()?;
                let field = (width & 0xFF) as usize;
                for _ in 1..field {
                    writer.write_all(b" ").map_err(|_| Trap::WriteFailed)?;
                }
                writer
                    .write_all(&[value as u8])
                    .map_err(|_| Trap::WriteFailed)
            }
            sysio_fn::WRITEREAL => {
                let width = self.pop()?;
                let value = self.pop_f64()?;
                let number = self.pop()?;
                let precision = (width >> 8) as usize;
                let text = if precision > 0 {
                    format!("{:.*}", precision, value)
                } else {
                    format!("{:E}", value)
                };
                self.write_text(number, &text, width)
            }
            sysio_fn::WRITESTRING => {
                let width = self.pop()?;
                let len = self.pop()?;
                let addr = self.pop()?;
                let number = self.pop()?;
                let text = self.dspace.bytes(addr, len)?.to_vec();
                let slot = self.files.slot_mut(number)?;
                let writer = slot.writer()?;
                let field = (width & 0xFF) as usize;
                for _ in text.len()..field {
                    writer.write_all(b" ").map_err(|_| Trap::WriteFailed)?;
                }
                writer.write_all(&text).map_err(|_| Trap::WriteFailed)
            }
            sysio_fn::EOF => {
                let number = self.pop()?;
                let eof = self.files.slot_mut(number)?.eof();
                self.push(eof as u16)
            }
            sysio_fn::EOLN => {
                let number = self.pop()?;
                let eoln = self.files.slot_mut(number)?.eoln;
                self.push(eoln as u16)
            }
            sysio_fn::FILEPOS => {
                let number = self.pop()?;
                let pos = self.files.slot_mut(number)?.virtual_pos()? as u32;
                self.push(pos as u16)?;
                self.push((pos >> 16) as u16)
            }
            sysio_fn::FILESIZE => {
                let number = self.pop()?;
                let size = self.files.slot_mut(number)?.file_size()? as u32;
                self.push(size as u16)?;
                self.push((size >> 16) as u16)
            }
            sysio_fn::SEEK => {
                let hi = self.pop()?;
                let lo = self.pop()?;
                let number = self.pop()?;
                let position = (u64::from(hi) << 16) | u64::from(lo);
                let slot = self.files.slot_mut(number)?;
                match slot.stream.as_mut() {
                    Some(Stream::Reader(reader)) => {
                        reader
                            .seek(SeekFrom::Start(position))
                            .map_err(|_| Trap::SeekFailed)?;
                    }
                    Some(Stream::Writer(writer)) => {
                        writer
                            .seek(SeekFrom::Start(position))
                            .map_err(|_| Trap::SeekFailed)?;
                    }
                    _ => return Err(Trap::SeekFailed),
                }
                slot.clear_read_state();
                Ok(())
            }
            sysio_fn::SEEKEOF => {
                let number = self.pop()?;
                let slot = self.files.slot_mut(number)?;
                let at_eof = !slot.skip_blanks()?;
                self.push(at_eof as u16)
            }
            sysio_fn::SEEKEOLN => {
                let number = self.pop()?;
                let slot = self.files.slot_mut(number)?;
                if slot.pos >= slot.line.len() && !slot.line_nl && !slot.hit_eof {
                    let _ = slot.refill()?;
                }
                while slot.pos < slot.line.len()
                    && matches!(slot.line[slot.pos], b' ' | b'\t')
                {
                    slot.pos += 1;
                }
                let at_eoln = slot.pos >= slot.line.len();
                self.push(at_eoln as u16)
            }
            _ => Err(Trap::BadSysIoFunc),
        }
    }

    fn write_text(&mut self, number: u16, text: &str, width: u16) -> Result<()> {
        let slot = self.files.slot_mut(number)?;
        let writer = slot.writer()?;
        write_padded(writer, text, width).map_err(|_| Trap::WriteFailed)
    }
}
