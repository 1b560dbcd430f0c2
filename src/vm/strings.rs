//! The string engine and the runtime library dispatcher.
//!
//! Pascal string values live in the string stack region at the bottom of
//! D-space. A string value on the frame stack is two words: the buffer
//! address with the length above it. A string variable holds the same two
//! words in its slot; bounded strings carry their allocation size in a
//! third word.
//!
//! Buffers are reclaimed wholesale when `pops` restores `csp` at block
//! exit, so nothing here ever frees individually. Address 0 is reserved so
//! that a zero buffer address always means an uninitialized variable.

use core::cmp::Ordering;

use super::{Machine, Trap};
use crate::insn::lib_fn;

type Result<T> = core::result::Result<T, Trap>;

impl Machine {
    /// Execute a `lib` sub-function.
    pub(crate) fn exec_lib(&mut self, fun: u16) -> Result<()> {
        match fun {
            lib_fn::GETENV => self.lib_getenv(),
            lib_fn::STRINIT => self.lib_strinit(),
            lib_fn::SSTRINIT => self.lib_sstrinit(),
            lib_fn::STRTMP => self.lib_strtmp(),
            lib_fn::MKSTKC => self.lib_mkstkc(),
            lib_fn::STRCPY => self.lib_strcpy(false),
            lib_fn::SSTRCPY => self.lib_strcpy(true),
            lib_fn::STRCAT => self.lib_strcat(),
            lib_fn::STRCATC => self.lib_strcatc(),
            lib_fn::STRDUP => self.lib_strdup(),
            lib_fn::STRCMP => self.lib_strcmp(),
            lib_fn::SUBSTR => self.lib_substr(),
            lib_fn::STRPOS => self.lib_strpos(),
            lib_fn::STRINS => self.lib_strins(),
            lib_fn::STRDEL => self.lib_strdel(),
            lib_fn::BSTR2STR => self.lib_bstr2str(),
            lib_fn::STR2BSTR => self.lib_str2bstr(),
            lib_fn::NEW => self.lib_new(),
            lib_fn::DISPOSE => self.lib_dispose(),
            // Bounded-string and C-string variants that the runtime has
            // never provided; kept as explicit stubs.
            lib_fn::SSTRDUP
            | lib_fn::SSTRCMP
            | lib_fn::SSTRCMPSTR
            | lib_fn::STRCMPSSTR
            | lib_fn::CSTR2SSTR
            | lib_fn::CSTR2SSTRX
            | lib_fn::SSTRCATC => Err(Trap::NotYet),
            _ => Err(Trap::BadSysLibCall),
        }
    }

    //
    // Stack word access without popping, for the operations that update a
    // string value in place on the caller's stack.
    //

    fn peek(&self, back: u16) -> Result<u16> {
        let addr = self
            .sp
            .checked_sub(2 * (back + 1))
            .ok_or(Trap::BadSp)?;
        if (addr as u32) < self.spb as u32 {
            return Err(Trap::BadSp);
        }
        self.dspace.get16(addr)
    }

    fn poke(&mut self, back: u16, value: u16) -> Result<()> {
        let addr = self
            .sp
            .checked_sub(2 * (back + 1))
            .ok_or(Trap::BadSp)?;
        if (addr as u32) < self.spb as u32 {
            return Err(Trap::BadSp);
        }
        self.dspace.put16(addr, value)
    }

    /// Allocate a buffer on the string stack and advance `csp`.
    fn str_alloc(&mut self, size: u16) -> Result<u16> {
        let rounded = size.saturating_add(1) & !1;
        let new_csp = self.csp as u32 + rounded as u32;
        if new_csp > self.strsize as u32 {
            return Err(Trap::StringStackOverflow);
        }
        let addr = self.csp;
        self.csp = new_csp as u16;
        Ok(addr)
    }

    /// Check that a destination buffer address is a real string buffer.
    fn check_buffer(&self, addr: u16) -> Result<()> {
        if addr == 0 || addr >= self.strsize {
            return Err(Trap::InternalError);
        }
        Ok(())
    }

    fn lib_getenv(&mut self) -> Result<()> {
        let name_len = self.pop()?;
        let name_addr = self.pop()?;
        let name = self.dspace.bytes(name_addr, name_len)?;
        let name = alloc::string::String::from_utf8_lossy(name).into_owned();
        let value = std::env::var(&name).unwrap_or_default();

        let stralloc = self.stralloc;
        let buffer = self.str_alloc(stralloc)?;
        let len = value.len().min(stralloc as usize) as u16;
        self.dspace
            .write_bytes(buffer, &value.as_bytes()[..len as usize])?;
        self.push(buffer)?;
        self.push(len)
    }

    fn lib_strinit(&mut self) -> Result<()> {
        let var = self.pop()?;
        let stralloc = self.stralloc;
        let buffer = self.str_alloc(stralloc)?;
        self.dspace.put16(var, buffer)?;
        self.dspace.put16(var.wrapping_add(2), 0)
    }

    fn lib_sstrinit(&mut self) -> Result<()> {
        let cap = self.pop()?;
        let var = self.pop()?;
        let buffer = self.str_alloc(cap)?;
        self.dspace.put16(var, buffer)?;
        self.dspace.put16(var.wrapping_add(2), 0)?;
        self.dspace.put16(var.wrapping_add(4), cap)
    }

    fn lib_strtmp(&mut self) -> Result<()> {
        let stralloc = self.stralloc;
        let buffer = self.str_alloc(stralloc)?;
        self.push(buffer)?;
        self.push(0)
    }

    fn lib_mkstkc(&mut self) -> Result<()> {
        let ch = self.pop()?;
        let stralloc = self.stralloc;
        let buffer = self.str_alloc(stralloc)?;
        self.dspace.put8(buffer, ch as u8)?;
        self.push(buffer)?;
        self.push(1)
    }

    fn lib_strcpy(&mut self, bounded: bool) -> Result<()> {
        let var = self.pop()?;
        let src_len = self.pop()?;
        let src = self.pop()?;

        let dst = self.dspace.get16(var)?;
        if dst == src {
            // Aliased `s := s + c`: the buffer already holds the result.
            return Ok(());
        }
        self.check_buffer(dst)?;
        let cap = if bounded {
            self.dspace.get16(var.wrapping_add(4))?
        } else {
            self.stralloc
        };
        let len = src_len.min(cap);
        self.dspace.copy(dst, src, len)?;
        self.dspace.put16(var.wrapping_add(2), len)
    }

    fn lib_strcat(&mut self) -> Result<()> {
        let src_len = self.pop()?;
        let src = self.pop()?;
        let dst_len = self.peek(0)?;
        let dst = self.peek(1)?;
        if dst_len as u32 + src_len as u32 > self.stralloc as u32 {
            return Err(Trap::StringStackOverflow);
        }
        self.dspace.copy(dst.wrapping_add(dst_len), src, src_len)?;
        self.poke(0, dst_len + src_len)
    }

    fn lib_strcatc(&mut self) -> Result<()> {
        let ch = self.pop()?;
        let dst_len = self.peek(0)?;
        let dst = self.peek(1)?;
        if dst_len >= self.stralloc {
            return Err(Trap::StringStackOverflow);
        }
        self.dspace.put8(dst.wrapping_add(dst_len), ch as u8)?;
        self.poke(0, dst_len + 1)
    }

    fn lib_strdup(&mut self) -> Result<()> {
        let src_len = self.peek(0)?;
        let src = self.peek(1)?;
        let stralloc = self.stralloc;
        let buffer = self.str_alloc(stralloc)?;
        let len = src_len.min(stralloc);
        self.dspace.copy(buffer, src, len)?;
        self.poke(1, buffer)?;
        self.poke(0, len)
    }

    fn lib_strcmp(&mut self) -> Result<()> {
        let b_len = self.pop()?;
        let b_addr = self.pop()?;
        let a_len = self.pop()?;
        let a_addr = self.pop()?;

        let order = {
            let a = self.dspace.bytes(a_addr, a_len)?;
            let b = self.dspace.bytes(b_addr, b_len)?;
            let common = a_len.min(b_len) as usize;
            match a[..common].cmp(&b[..common]) {
                Ordering::Equal => a_len.cmp(&b_len),
                other => other,
            }
        };
        self.push(match order {
            Ordering::Less => 0xFFFF,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        })
    }

    fn lib_substr(&mut self) -> Result<()> {
        let len = self.pop()?;
        let pos = self.pop()?;
        let src_len = self.pop()?;
        let src = self.pop()?;

        let stralloc = self.stralloc;
        let buffer = self.str_alloc(stralloc)?;
        let count = if pos == 0 || pos > src_len {
            0
        } else {
            let avail = src_len - (pos - 1);
            len.min(avail).min(stralloc)
        };
        if count != 0 {
            self.dspace
                .copy(buffer, src.wrapping_add(pos - 1), count)?;
        }
        self.push(buffer)?;
        self.push(count)
    }

    fn lib_strpos(&mut self) -> Result<()> {
        let sub_len = self.pop()?;
        let sub_addr = self.pop()?;
        let src_len = self.pop()?;
        let src_addr = self.pop()?;

        let position = {
            let src = self.dspace.bytes(src_addr, src_len)?;
            let sub = self.dspace.bytes(sub_addr, sub_len)?;
            if sub.is_empty() || sub.len() > src.len() {
                0
            } else {
                src.windows(sub.len())
                    .position(|window| window == sub)
                    .map(|i| i as u16 + 1)
                    .unwrap_or(0)
            }
        };
        self.push(position)
    }

    fn lib_strins(&mut self) -> Result<()> {
        let pos = self.pop()?;
        let var = self.pop()?;
        let src_len = self.pop()?;
        let src = self.pop()?;

        let dst = self.dspace.get16(var)?;
        self.check_buffer(dst)?;
        let dst_len = self.dspace.get16(var.wrapping_add(2))?;
        let cap = self.stralloc;

        let at = pos.clamp(1, dst_len + 1) - 1;
        // Clip the copy count so the destination never exceeds its capacity.
        let count = src_len.min(cap.saturating_sub(at));
        let kept_tail = (dst_len - at).min(cap.saturating_sub(at + count));
        if kept_tail != 0 {
            self.dspace.copy(
                dst.wrapping_add(at + count),
                dst.wrapping_add(at),
                kept_tail,
            )?;
        }
        if count != 0 {
            self.dspace.copy(dst.wrapping_add(at), src, count)?;
        }
        self.dspace.put16(var.wrapping_add(2), at + count + kept_tail)
    }

    fn lib_strdel(&mut self) -> Result<()> {
        let count = self.pop()?;
        let pos = self.pop()?;
        let var = self.pop()?;

        let dst = self.dspace.get16(var)?;
        self.check_buffer(dst)?;
        let dst_len = self.dspace.get16(var.wrapping_add(2))?;
        if pos == 0 || pos > dst_len {
            return Ok(());
        }
        let at = pos - 1;
        let removed = count.min(dst_len - at);
        let tail = dst_len - at - removed;
        if tail != 0 {
            self.dspace
                .copy(dst.wrapping_add(at), dst.wrapping_add(at + removed), tail)?;
        }
        self.dspace.put16(var.wrapping_add(2), dst_len - removed)
    }

    fn lib_bstr2str(&mut self) -> Result<()> {
        let bound = self.pop()?;
        let array = self.pop()?;

        let len = {
            let bytes = self.dspace.bytes(array, bound)?;
            memchr::memchr(0, bytes).map(|i| i as u16).unwrap_or(bound)
        };
        let stralloc = self.stralloc;
        let buffer = self.str_alloc(stralloc)?;
        let len = len.min(stralloc);
        self.dspace.copy(buffer, array, len)?;
        self.push(buffer)?;
        self.push(len)
    }

    fn lib_str2bstr(&mut self) -> Result<()> {
        let bound = self.pop()?;
        let array = self.pop()?;
        let src_len = self.pop()?;
        let src = self.pop()?;

        let len = src_len.min(bound);
        self.dspace.copy(array, src, len)?;
        if len < bound {
            self.dspace.put8(array.wrapping_add(len), 0)?;
        }
        Ok(())
    }

    fn lib_new(&mut self) -> Result<()> {
        let size = self.pop()?;
        match self.heap.alloc(&mut self.dspace, size) {
            Ok(addr) => self.push(addr),
            Err(Trap::NewFailed) => {
                self.push(0)?;
                Err(Trap::NewFailed)
            }
            Err(trap) => Err(trap),
        }
    }

    fn lib_dispose(&mut self) -> Result<()> {
        let addr = self.pop()?;
        self.heap.free(&mut self.dspace, addr)
    }
}
