//! Interface for reading POFF files.
//!
//! [`PoffFile`] parses a borrowed byte buffer into typed views of the
//! container sections. Iteration over symbols, relocations and line numbers
//! is position-stateful through the returned iterators; restarting an
//! iteration means asking the file for a fresh iterator.

use core::{fmt, result};

mod read_ref;
pub use read_ref::ReadRef;

mod file;
pub use file::*;

/// The error type used within the read module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(pub(crate) &'static str);

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// The result type used within the read module.
pub type Result<T> = result::Result<T, Error>;

pub(crate) trait ReadError<T> {
    fn read_error(self, error: &'static str) -> Result<T>;
}

impl<T> ReadError<T> for result::Result<T, ()> {
    fn read_error(self, error: &'static str) -> Result<T> {
        self.map_err(|()| Error(error))
    }
}

impl<T> ReadError<T> for Option<T> {
    fn read_error(self, error: &'static str) -> Result<T> {
        self.ok_or(Error(error))
    }
}

/// A string table section.
///
/// Entries are NUL-terminated and referenced by byte offset; offset 0 is
/// the empty string.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringTable<'data> {
    data: &'data [u8],
}

impl<'data> StringTable<'data> {
    /// Interpret the given section data as a string table.
    pub fn new(data: &'data [u8]) -> Self {
        StringTable { data }
    }

    /// Return the string at the given offset.
    pub fn get(&self, offset: u32) -> Result<&'data [u8]> {
        let data = self
            .data
            .get(offset as usize..)
            .read_error("Invalid string table offset");
        data.and_then(|data| {
            let end = memchr::memchr(b'\0', data)
                .read_error("Missing string table terminator")?;
            Ok(&data[..end])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_table() {
        let strings = StringTable::new(b"\0main\0swap\0");
        assert_eq!(strings.get(0), Ok(&b""[..]));
        assert_eq!(strings.get(1), Ok(&b"main"[..]));
        assert_eq!(strings.get(6), Ok(&b"swap"[..]));
        assert_eq!(strings.get(3), Ok(&b"in"[..]));
        assert!(strings.get(11).is_err());
        assert!(strings.get(12).is_err());
    }
}
