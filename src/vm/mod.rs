//! The 16-bit p-code virtual machine.
//!
//! [`Machine`] owns the four-region D-space byte buffer, the bytecode
//! image, the heap allocator state and the file table. The dispatcher
//! fetches the opcode at `pc`, reads immediates per the codec's shape
//! rules, and executes until the program exits or a trap aborts it.
//!
//! Register model (all 16-bit byte addresses):
//!
//! - `pc` — program counter into I-space
//! - `sp` — frame stack pointer; the next free byte, so the top word
//!   occupies `sp - 2`
//! - `fp` — current frame base, pointing at the saved static link
//! - `csp` — top of the string stack, growing up from address 0
//! - `hsp` — heap mark, saved and restored by `pushh`/`poph`
//!
//! The region bases `spb` (frame stack), `rop` (read-only data) and `hpb`
//! (heap) are fixed at load time.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::insn::{self, op, Insn};
use crate::poff::file_type;
use crate::read::{Error, PoffFile, ReadRef, Result as ReadResult};

mod dspace;
use dspace::DataSpace;

mod heap;
use heap::Heap;

mod fileio;
use fileio::FileTable;

mod float;
mod sets;
mod strings;

/// The return-address sentinel seeded below the outermost frame. A `ret`
/// that pops it behaves like `end`.
const RETURN_SENTINEL: u16 = 0xFFFF;

/// A runtime trap code.
///
/// The discriminants are the stable numeric codes printed by the runner
/// when a program aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Trap {
    /// The program counter left the program section.
    BadPc = 1,
    /// The opcode byte is not defined by the instruction set.
    IllegalOpcode = 2,
    /// A stack access left the frame stack region.
    BadSp = 3,
    /// A static chain walk ran off the outermost frame.
    NestingLevel = 4,
    /// Integer overflow, including division by zero.
    IntOverflow = 10,
    /// An ordinal value is outside its subrange.
    ValueRange = 11,
    /// An undefined floating point sub-function.
    BadFpOpcode = 12,
    /// An undefined set operation sub-function.
    BadSetOpcode = 13,
    /// An undefined runtime library sub-function.
    BadSysLibCall = 14,
    /// An undefined file I/O sub-function.
    BadSysIoFunc = 15,
    /// A string allocation would overflow the string stack.
    StringStackOverflow = 20,
    /// A heap allocation could not be satisfied.
    NewFailed = 21,
    /// A heap chunk was freed twice.
    DoubleFree = 22,
    /// An inconsistent address or memory state.
    InternalError = 23,
    /// A file number outside the file table.
    BadFile = 30,
    /// The file slot has not been allocated.
    FileNotInUse = 31,
    /// No free file table slot.
    TooManyFiles = 32,
    /// The operation requires an open file.
    FileNotOpen = 33,
    /// The file is already open.
    FileAlreadyOpen = 34,
    /// An unknown open mode.
    BadOpenMode = 35,
    /// The host failed to open the file.
    OpenFailed = 36,
    /// The file is not open for reading.
    NotOpenForRead = 37,
    /// The host read failed.
    ReadFailed = 38,
    /// The file is not open for writing.
    NotOpenForWrite = 39,
    /// The host write failed.
    WriteFailed = 40,
    /// The host seek failed.
    SeekFailed = 41,
    /// The host could not report a file position.
    TellFailed = 42,
    /// The operation is recognized but not implemented.
    NotYet = 50,
}

impl Trap {
    /// The stable numeric code for this trap.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trap::BadPc => "bad program counter",
            Trap::IllegalOpcode => "illegal opcode",
            Trap::BadSp => "stack out of bounds",
            Trap::NestingLevel => "bad static nesting level",
            Trap::IntOverflow => "integer overflow",
            Trap::ValueRange => "value out of range",
            Trap::BadFpOpcode => "bad floating point opcode",
            Trap::BadSetOpcode => "bad set opcode",
            Trap::BadSysLibCall => "bad runtime library call",
            Trap::BadSysIoFunc => "bad file I/O function",
            Trap::StringStackOverflow => "string stack overflow",
            Trap::NewFailed => "heap allocation failed",
            Trap::DoubleFree => "chunk freed twice",
            Trap::InternalError => "internal error",
            Trap::BadFile => "bad file number",
            Trap::FileNotInUse => "file not in use",
            Trap::TooManyFiles => "too many open files",
            Trap::FileNotOpen => "file not open",
            Trap::FileAlreadyOpen => "file already open",
            Trap::BadOpenMode => "bad open mode",
            Trap::OpenFailed => "open failed",
            Trap::NotOpenForRead => "not open for read",
            Trap::ReadFailed => "read failed",
            Trap::NotOpenForWrite => "not open for write",
            Trap::WriteFailed => "write failed",
            Trap::SeekFailed => "seek failed",
            Trap::TellFailed => "tell failed",
            Trap::NotYet => "not implemented",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Trap {}

/// A trap together with the program counter of the faulting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapInfo {
    /// The trap code.
    pub trap: Trap,
    /// The address of the instruction that trapped.
    pub pc: u16,
}

impl fmt::Display for TrapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trap {} at pc {:#06x}", self.trap, self.pc)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TrapInfo {}

/// Result of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Continue,
    Exit(u16),
}

/// Machine construction parameters.
///
/// The sizes configure the D-space regions that are not determined by the
/// executable; the read-only region size always comes from the image.
/// `input` and `output` replace the process standard streams on file
/// numbers 0 and 1, which is how tests capture program output.
pub struct Config {
    /// String stack size in bytes.
    pub strsize: u16,
    /// Frame stack size in bytes.
    pub stksize: u16,
    /// Heap size in bytes.
    pub hpsize: u16,
    /// Allocation size for standard strings.
    pub stralloc: u16,
    /// Replacement for the standard input stream.
    pub input: Option<Box<dyn std::io::BufRead>>,
    /// Replacement for the standard output stream.
    pub output: Option<Box<dyn std::io::Write>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            strsize: 1024,
            stksize: 4096,
            hpsize: 4096,
            stralloc: 80,
            input: None,
            output: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("strsize", &self.strsize)
            .field("stksize", &self.stksize)
            .field("hpsize", &self.hpsize)
            .field("stralloc", &self.stralloc)
            .finish()
    }
}

/// An instance of the p-code machine.
#[derive(Debug)]
pub struct Machine {
    dspace: DataSpace,
    program: Vec<u8>,
    heap: Heap,
    files: FileTable,

    strsize: u16,
    stralloc: u16,
    entry: u16,
    rop: u16,
    spb: u16,
    hpb: u16,
    hpsize: u16,
    stack_limit: u32,

    pc: u16,
    sp: u16,
    fp: u16,
    csp: u16,
    hsp: u16,
}

fn align2(size: u16) -> u16 {
    size.saturating_add(1) & !1
}

impl Machine {
    /// Load an executable image.
    pub fn load<'data, R: ReadRef<'data>>(
        file: &PoffFile<'data, R>,
        config: Config,
    ) -> ReadResult<Machine> {
        if file.file_type() != file_type::FT_EXEC {
            return Err(Error("Not a POFF executable"));
        }
        Machine::new(
            file.extract_program_data(),
            file.rodata(),
            file.entry_point(),
            config,
        )
    }

    /// Create a machine from raw program and read-only data images.
    pub fn new(
        program: Vec<u8>,
        rodata: &[u8],
        entry: u16,
        config: Config,
    ) -> ReadResult<Machine> {
        if program.len() > u16::MAX as usize {
            return Err(Error("Program exceeds the 16-bit I-space"));
        }
        if rodata.len() > u16::MAX as usize {
            return Err(Error("Read-only data exceeds the 16-bit D-space"));
        }
        let strsize = align2(config.strsize);
        let rosize = align2(rodata.len() as u16);
        let stksize = align2(config.stksize);
        let hpsize = align2(config.hpsize);
        if stksize < 8 {
            return Err(Error("Frame stack too small"));
        }

        let total =
            strsize as u32 + rosize as u32 + stksize as u32 + hpsize as u32;
        if total > u16::MAX as u32 + 1 {
            return Err(Error("Data space exceeds the 16-bit address range"));
        }

        let rop = strsize;
        let spb = strsize + rosize;
        let hpb = spb + stksize;

        let mut dspace = DataSpace::new(total);
        dspace
            .write_bytes(rop, rodata)
            .map_err(|_| Error("Read-only data does not fit"))?;
        let heap =
            Heap::init(&mut dspace, hpb, hpsize).map_err(|_| Error("Heap region too small"))?;

        let mut machine = Machine {
            dspace,
            program,
            heap,
            files: FileTable::new(config.input, config.output),
            strsize,
            stralloc: align2(config.stralloc.max(2)),
            entry,
            rop,
            spb,
            hpb,
            hpsize,
            stack_limit: spb as u32 + stksize as u32,
            pc: 0,
            sp: 0,
            fp: 0,
            csp: 0,
            hsp: 0,
        };
        machine
            .reset()
            .map_err(|_| Error("Frame stack too small"))?;
        Ok(machine)
    }

    /// Re-seed the registers and the bottom of the frame stack.
    ///
    /// The outermost frame is seeded with a zero static link, a zero saved
    /// frame pointer and the return sentinel, so that the outermost `ret`
    /// exits the program.
    pub fn reset(&mut self) -> core::result::Result<(), Trap> {
        self.pc = self.entry;
        // Address 0 is reserved so that a zero buffer address always means
        // an uninitialized string variable.
        self.csp = if self.strsize >= 2 { 2 } else { 0 };
        self.fp = self.spb;
        self.hsp = self.hpb.wrapping_add(self.hpsize);
        self.dspace.put16(self.spb, 0)?;
        self.dspace.put16(self.spb + 2, 0)?;
        self.dspace.put16(self.spb + 4, RETURN_SENTINEL)?;
        self.sp = self.spb + 6;
        Ok(())
    }

    /// Close every non-standard file slot.
    pub fn release(&mut self) {
        self.files.release();
    }

    /// The current program counter.
    #[inline]
    pub fn pc(&self) -> u16 {
        self.pc
    }

    /// The current frame stack pointer.
    #[inline]
    pub fn sp(&self) -> u16 {
        self.sp
    }

    /// The current string stack pointer.
    #[inline]
    pub fn csp(&self) -> u16 {
        self.csp
    }

    /// Run until the program exits or traps.
    ///
    /// Returns the program's exit code, or the trap and the program
    /// counter of the faulting instruction.
    pub fn run(&mut self) -> core::result::Result<u16, TrapInfo> {
        loop {
            let pc = self.pc;
            match self.step() {
                Ok(Control::Continue) => {}
                Ok(Control::Exit(code)) => {
                    self.files.flush();
                    return Ok(code);
                }
                Err(trap) => {
                    self.files.flush();
                    return Err(TrapInfo { trap, pc });
                }
            }
        }
    }

    /// Fetch, decode and execute one instruction.
    fn step(&mut self) -> core::result::Result<Control, Trap> {
        let (insn, next) =
            Insn::decode(&self.program, self.pc as usize).map_err(|()| Trap::BadPc)?;
        if !insn::is_defined(insn.op) {
            return Err(Trap::IllegalOpcode);
        }
        self.pc = next as u16;
        match (insn::has_arg8(insn.op), insn::has_arg16(insn.op)) {
            (false, false) => self.exec_bare(insn.op),
            (false, true) => self.exec_imm16(insn.op, insn.arg2),
            (true, false) => self.exec_imm8(insn.op, insn.arg1),
            (true, true) => self.exec_imm8_16(insn.op, insn.arg1, insn.arg2),
        }
    }

    //
    // Stack primitives.
    //

    pub(crate) fn push(&mut self, value: u16) -> core::result::Result<(), Trap> {
        if self.sp as u32 + 2 > self.stack_limit {
            return Err(Trap::BadSp);
        }
        self.dspace.put16(self.sp, value)?;
        self.sp += 2;
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> core::result::Result<u16, Trap> {
        if (self.sp as u32) < self.spb as u32 + 2 {
            return Err(Trap::BadSp);
        }
        self.sp -= 2;
        self.dspace.get16(self.sp)
    }

    #[inline]
    fn push_i16(&mut self, value: i16) -> core::result::Result<(), Trap> {
        self.push(value as u16)
    }

    #[inline]
    fn pop_i16(&mut self) -> core::result::Result<i16, Trap> {
        Ok(self.pop()? as i16)
    }

    #[inline]
    fn push_bool(&mut self, value: bool) -> core::result::Result<(), Trap> {
        self.push(value as u16)
    }

    pub(crate) fn push_f64(&mut self, value: f64) -> core::result::Result<(), Trap> {
        let bits = value.to_bits();
        for i in 0..4 {
            self.push((bits >> (16 * i)) as u16)?;
        }
        Ok(())
    }

    pub(crate) fn pop_f64(&mut self) -> core::result::Result<f64, Trap> {
        let mut bits = 0u64;
        for i in (0..4).rev() {
            bits |= (self.pop()? as u64) << (16 * i);
        }
        Ok(f64::from_bits(bits))
    }

    pub(crate) fn push_set(&mut self, set: [u16; 4]) -> core::result::Result<(), Trap> {
        for word in set {
            self.push(word)?;
        }
        Ok(())
    }

    pub(crate) fn pop_set(&mut self) -> core::result::Result<[u16; 4], Trap> {
        let mut set = [0u16; 4];
        for i in (0..4).rev() {
            set[i] = self.pop()?;
        }
        Ok(set)
    }

    //
    // Addressing.
    //

    /// Follow the static chain for `level` links, without the locals bias.
    fn chain(&self, level: u8) -> core::result::Result<u16, Trap> {
        let mut base = self.fp;
        for _ in 0..level {
            if base == 0 {
                return Err(Trap::NestingLevel);
            }
            base = self.dspace.get16(base)?;
        }
        Ok(base)
    }

    /// The base address for data at the given static nesting level: two
    /// words past the saved link and frame pointer of that frame.
    fn frame_base(&self, level: u8) -> core::result::Result<u16, Trap> {
        Ok(self.chain(level)?.wrapping_add(4))
    }

    fn check_stack_range(&self, addr: u16, len: u16) -> core::result::Result<(), Trap> {
        let start = addr as u32;
        if start < self.spb as u32 || start + len as u32 > self.stack_limit {
            return Err(Trap::BadSp);
        }
        Ok(())
    }

    //
    // Shared load/store bodies for the frame-relative families.
    //

    fn ld_word(&mut self, addr: u16) -> core::result::Result<(), Trap> {
        self.check_stack_range(addr, 2)?;
        let value = self.dspace.get16(addr)?;
        self.push(value)
    }

    fn ld_long(&mut self, addr: u16) -> core::result::Result<(), Trap> {
        self.check_stack_range(addr, 4)?;
        let lo = self.dspace.get16(addr)?;
        let hi = self.dspace.get16(addr.wrapping_add(2))?;
        self.push(lo)?;
        self.push(hi)
    }

    fn ld_byte(&mut self, addr: u16) -> core::result::Result<(), Trap> {
        self.check_stack_range(addr, 1)?;
        let value = self.dspace.get8(addr)?;
        self.push(value.into())
    }

    fn ld_multi(&mut self, addr: u16, count: u16) -> core::result::Result<(), Trap> {
        if count % 2 != 0 {
            return Err(Trap::InternalError);
        }
        self.check_stack_range(addr, count)?;
        let mut offset = 0;
        while offset < count {
            let value = self.dspace.get16(addr.wrapping_add(offset))?;
            self.push(value)?;
            offset += 2;
        }
        Ok(())
    }

    fn st_word(&mut self, addr: u16) -> core::result::Result<(), Trap> {
        self.check_stack_range(addr, 2)?;
        let value = self.pop()?;
        self.dspace.put16(addr, value)
    }

    fn st_long(&mut self, addr: u16) -> core::result::Result<(), Trap> {
        self.check_stack_range(addr, 4)?;
        let hi = self.pop()?;
        let lo = self.pop()?;
        self.dspace.put16(addr, lo)?;
        self.dspace.put16(addr.wrapping_add(2), hi)
    }

    fn st_byte(&mut self, addr: u16) -> core::result::Result<(), Trap> {
        self.check_stack_range(addr, 1)?;
        let value = self.pop()?;
        self.dspace.put8(addr, value as u8)
    }

    fn st_multi(&mut self, addr: u16, count: u16) -> core::result::Result<(), Trap> {
        if count % 2 != 0 {
            return Err(Trap::InternalError);
        }
        self.check_stack_range(addr, count)?;
        let mut offset = count;
        while offset > 0 {
            offset -= 2;
            let value = self.pop()?;
            self.dspace.put16(addr.wrapping_add(offset), value)?;
        }
        Ok(())
    }

    /// Store for the `stim`-shaped ops: the byte count has been popped, the
    /// data words are on top of the stack, and the word below them is
    /// produced by `addr_of`, given that word's value.
    fn st_multi_below(
        &mut self,
        count: u16,
        addr_of: impl FnOnce(&mut Self, u16) -> core::result::Result<u16, Trap>,
    ) -> core::result::Result<(), Trap> {
        if count % 2 != 0 {
            return Err(Trap::InternalError);
        }
        let data = self
            .sp
            .checked_sub(count)
            .ok_or(Trap::BadSp)?;
        if (data as u32) < self.spb as u32 + 2 {
            return Err(Trap::BadSp);
        }
        let below = self.dspace.get16(data - 2)?;
        let addr = addr_of(self, below)?;
        self.dspace.copy(addr, data, count)?;
        self.sp = data - 2;
        Ok(())
    }

    //
    // The four shape handler bodies.
    //

    fn exec_bare(&mut self, opcode: u8) -> core::result::Result<Control, Trap> {
        match opcode {
            op::NOP => {}
            op::NEG => {
                let a = self.pop_i16()?;
                self.push_i16(a.wrapping_neg())?;
            }
            op::ABS => {
                let a = self.pop_i16()?;
                self.push_i16(if a < 0 { a.wrapping_neg() } else { a })?;
            }
            op::INC => {
                let a = self.pop_i16()?;
                self.push_i16(a.wrapping_add(1))?;
            }
            op::DEC => {
                let a = self.pop_i16()?;
                self.push_i16(a.wrapping_sub(1))?;
            }
            op::ADD => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                self.push_i16(a.wrapping_add(b))?;
            }
            op::SUB => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                self.push_i16(a.wrapping_sub(b))?;
            }
            op::MUL => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                self.push_i16(a.wrapping_mul(b))?;
            }
            op::DIV => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                if b == 0 {
                    return Err(Trap::IntOverflow);
                }
                self.push_i16(a.wrapping_div(b))?;
            }
            op::MOD => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                if b == 0 {
                    return Err(Trap::IntOverflow);
                }
                self.push_i16(a.wrapping_rem(b))?;
            }
            op::SLL => {
                let shift = self.pop()?;
                let value = self.pop()?;
                self.push(if shift >= 16 { 0 } else { value << shift })?;
            }
            op::SRL => {
                let shift = self.pop()?;
                let value = self.pop()?;
                self.push(if shift >= 16 { 0 } else { value >> shift })?;
            }
            op::SRA => {
                let shift = self.pop()?;
                let value = self.pop_i16()?;
                self.push_i16(value >> shift.min(15))?;
            }
            op::OR => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a | b)?;
            }
            op::AND => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a & b)?;
            }
            op::XOR => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a ^ b)?;
            }
            op::NOT => {
                let a = self.pop()?;
                self.push(!a)?;
            }
            op::EQUZ => {
                let a = self.pop_i16()?;
                self.push_bool(a == 0)?;
            }
            op::NEQZ => {
                let a = self.pop_i16()?;
                self.push_bool(a != 0)?;
            }
            op::LTZ => {
                let a = self.pop_i16()?;
                self.push_bool(a < 0)?;
            }
            op::GTEZ => {
                let a = self.pop_i16()?;
                self.push_bool(a >= 0)?;
            }
            op::GTZ => {
                let a = self.pop_i16()?;
                self.push_bool(a > 0)?;
            }
            op::LTEZ => {
                let a = self.pop_i16()?;
                self.push_bool(a <= 0)?;
            }
            op::EQU => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                self.push_bool(a == b)?;
            }
            op::NEQ => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                self.push_bool(a != b)?;
            }
            op::LT => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                self.push_bool(a < b)?;
            }
            op::GTE => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                self.push_bool(a >= b)?;
            }
            op::GT => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                self.push_bool(a > b)?;
            }
            op::LTE => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                self.push_bool(a <= b)?;
            }
            op::DUP => {
                let a = self.pop()?;
                self.push(a)?;
                self.push(a)?;
            }
            op::XCHG => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a)?;
                self.push(b)?;
            }
            op::LDI => {
                let addr = self.pop()?;
                let value = self.dspace.get16(addr)?;
                self.push(value)?;
            }
            op::LDIB => {
                let addr = self.pop()?;
                let value = self.dspace.get8(addr)?;
                self.push(value.into())?;
            }
            op::LDIM => {
                let count = self.pop()?;
                let addr = self.pop()?;
                if count % 2 != 0 {
                    return Err(Trap::InternalError);
                }
                let mut offset = 0;
                while offset < count {
                    let value = self.dspace.get16(addr.wrapping_add(offset))?;
                    self.push(value)?;
                    offset += 2;
                }
            }
            op::STI => {
                let value = self.pop()?;
                let addr = self.pop()?;
                self.dspace.put16(addr, value)?;
            }
            op::STIB => {
                let value = self.pop()?;
                let addr = self.pop()?;
                self.dspace.put8(addr, value as u8)?;
            }
            op::STIM => {
                let count = self.pop()?;
                self.st_multi_below(count, |_, below| Ok(below))?;
            }
            op::PUSHS => {
                let csp = self.csp;
                self.push(csp)?;
            }
            op::POPS => {
                let value = self.pop()?;
                if value > self.strsize {
                    return Err(Trap::InternalError);
                }
                self.csp = value;
            }
            op::PUSHH => {
                let hsp = self.hsp;
                self.push(hsp)?;
            }
            op::POPH => {
                self.hsp = self.pop()?;
            }
            op::RET => {
                let ret_pc = self.pop()?;
                let saved_fp = self.pop()?;
                self.pop()?;
                if ret_pc == RETURN_SENTINEL {
                    return Ok(Control::Exit(0));
                }
                self.pc = ret_pc;
                self.fp = saved_fp;
            }
            op::END => {
                let code = self.pop()?;
                return Ok(Control::Exit(code));
            }
            _ => return Err(Trap::IllegalOpcode),
        }
        Ok(Control::Continue)
    }

    fn exec_imm16(&mut self, opcode: u8, imm: u16) -> core::result::Result<Control, Trap> {
        match opcode {
            op::PUSH => self.push(imm)?,
            op::INDS => {
                let sp = self.sp.wrapping_add(imm);
                if (sp as u32) < self.spb as u32 || sp as u32 > self.stack_limit {
                    return Err(Trap::BadSp);
                }
                self.sp = sp;
            }
            op::JMP => self.pc = imm,
            op::JEQUZ => {
                if self.pop_i16()? == 0 {
                    self.pc = imm;
                }
            }
            op::JNEQZ => {
                if self.pop_i16()? != 0 {
                    self.pc = imm;
                }
            }
            op::JLTZ => {
                if self.pop_i16()? < 0 {
                    self.pc = imm;
                }
            }
            op::JGTEZ => {
                if self.pop_i16()? >= 0 {
                    self.pc = imm;
                }
            }
            op::JGTZ => {
                if self.pop_i16()? > 0 {
                    self.pc = imm;
                }
            }
            op::JLTEZ => {
                if self.pop_i16()? <= 0 {
                    self.pc = imm;
                }
            }
            op::JEQU | op::JNEQ | op::JLT | op::JGTE | op::JGT | op::JLTE => {
                let b = self.pop_i16()?;
                let a = self.pop_i16()?;
                let taken = match opcode {
                    op::JEQU => a == b,
                    op::JNEQ => a != b,
                    op::JLT => a < b,
                    op::JGTE => a >= b,
                    op::JGT => a > b,
                    _ => a <= b,
                };
                if taken {
                    self.pc = imm;
                }
            }
            op::LD => self.ld_word(self.spb.wrapping_add(imm))?,
            op::LDH => self.ld_long(self.spb.wrapping_add(imm))?,
            op::LDB => self.ld_byte(self.spb.wrapping_add(imm))?,
            op::LDM => {
                let count = self.pop()?;
                self.ld_multi(self.spb.wrapping_add(imm), count)?;
            }
            op::ST => self.st_word(self.spb.wrapping_add(imm))?,
            op::STH => self.st_long(self.spb.wrapping_add(imm))?,
            op::STB => self.st_byte(self.spb.wrapping_add(imm))?,
            op::STM => {
                let count = self.pop()?;
                self.st_multi(self.spb.wrapping_add(imm), count)?;
            }
            op::LDX => {
                let index = self.pop()?;
                self.ld_word(self.spb.wrapping_add(imm).wrapping_add(index))?;
            }
            op::LDXH => {
                let index = self.pop()?;
                self.ld_long(self.spb.wrapping_add(imm).wrapping_add(index))?;
            }
            op::LDXB => {
                let index = self.pop()?;
                self.ld_byte(self.spb.wrapping_add(imm).wrapping_add(index))?;
            }
            op::LDXM => {
                let count = self.pop()?;
                let index = self.pop()?;
                self.ld_multi(self.spb.wrapping_add(imm).wrapping_add(index), count)?;
            }
            op::STX => {
                let index = self.pop()?;
                self.st_word(self.spb.wrapping_add(imm).wrapping_add(index))?;
            }
            op::STXH => {
                let index = self.pop()?;
                self.st_long(self.spb.wrapping_add(imm).wrapping_add(index))?;
            }
            op::STXB => {
                let index = self.pop()?;
                self.st_byte(self.spb.wrapping_add(imm).wrapping_add(index))?;
            }
            op::STXM => {
                let count = self.pop()?;
                let spb = self.spb;
                self.st_multi_below(count, move |machine, index| {
                    let addr = spb.wrapping_add(imm).wrapping_add(index);
                    machine.check_stack_range(addr, count)?;
                    Ok(addr)
                })?;
            }
            op::LA => {
                let addr = self.spb.wrapping_add(imm);
                self.push(addr)?;
            }
            op::LAX => {
                let index = self.pop()?;
                let addr = self.spb.wrapping_add(imm).wrapping_add(index);
                self.push(addr)?;
            }
            op::LAC => {
                let addr = self.rop.wrapping_add(imm);
                self.push(addr)?;
            }
            op::LIB => self.exec_lib(imm)?,
            op::SYSIO => self.exec_sysio(imm)?,
            _ => return Err(Trap::IllegalOpcode),
        }
        Ok(Control::Continue)
    }

    fn exec_imm8(&mut self, opcode: u8, imm: u8) -> core::result::Result<Control, Trap> {
        match opcode {
            op::PUSHB => self.push(imm.into())?,
            op::FLOAT => self.exec_float(imm)?,
            op::SETOP => self.exec_setop(imm)?,
            _ => return Err(Trap::IllegalOpcode),
        }
        Ok(Control::Continue)
    }

    fn exec_imm8_16(
        &mut self,
        opcode: u8,
        level: u8,
        imm: u16,
    ) -> core::result::Result<Control, Trap> {
        match opcode {
            op::PCAL => {
                let link = self.chain(level)?;
                let fp = self.fp;
                let pc = self.pc;
                self.push(link)?;
                self.push(fp)?;
                self.push(pc)?;
                self.fp = self.sp - 6;
                self.pc = imm;
                return Ok(Control::Continue);
            }
            op::LINE => return Ok(Control::Continue),
            _ => {}
        }

        let base = self.frame_base(level)?;
        match opcode {
            op::LDS => self.ld_word(base.wrapping_add(imm))?,
            op::LDSH => self.ld_long(base.wrapping_add(imm))?,
            op::LDSB => self.ld_byte(base.wrapping_add(imm))?,
            op::LDSM => {
                let count = self.pop()?;
                self.ld_multi(base.wrapping_add(imm), count)?;
            }
            op::STS => self.st_word(base.wrapping_add(imm))?,
            op::STSH => self.st_long(base.wrapping_add(imm))?,
            op::STSB => self.st_byte(base.wrapping_add(imm))?,
            op::STSM => {
                let count = self.pop()?;
                self.st_multi(base.wrapping_add(imm), count)?;
            }
            op::LDSX => {
                let index = self.pop()?;
                self.ld_word(base.wrapping_add(imm).wrapping_add(index))?;
            }
            op::LDSXH => {
                let index = self.pop()?;
                self.ld_long(base.wrapping_add(imm).wrapping_add(index))?;
            }
            op::LDSXB => {
                let index = self.pop()?;
                self.ld_byte(base.wrapping_add(imm).wrapping_add(index))?;
            }
            op::LDSXM => {
                let count = self.pop()?;
                let index = self.pop()?;
                self.ld_multi(base.wrapping_add(imm).wrapping_add(index), count)?;
            }
            op::STSX => {
                let index = self.pop()?;
                self.st_word(base.wrapping_add(imm).wrapping_add(index))?;
            }
            op::STSXH => {
                let index = self.pop()?;
                self.st_long(base.wrapping_add(imm).wrapping_add(index))?;
            }
            op::STSXB => {
                let index = self.pop()?;
                self.st_byte(base.wrapping_add(imm).wrapping_add(index))?;
            }
            op::STSXM => {
                let count = self.pop()?;
                self.st_multi_below(count, move |machine, index| {
                    let addr = base.wrapping_add(imm).wrapping_add(index);
                    machine.check_stack_range(addr, count)?;
                    Ok(addr)
                })?;
            }
            op::LAS => self.push(base.wrapping_add(imm))?,
            op::LASX => {
                let index = self.pop()?;
                self.push(base.wrapping_add(imm).wrapping_add(index))?;
            }
            _ => return Err(Trap::IllegalOpcode),
        }
        Ok(Control::Continue)
    }
}

#[cfg(test)]
mod machine_test;
