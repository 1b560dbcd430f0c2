use core::mem;

use crate::pod::{from_bytes, slice_from_bytes, Pod};

/// A trait for reading references to [`Pod`] types from a block of data.
///
/// This is implemented for `&[u8]`, which is the common case for parsing a
/// file that has been read or mapped into memory.
pub trait ReadRef<'data>: 'data + Clone + Copy {
    /// The total size of the block of data.
    fn len(self) -> Result<usize, ()>;

    /// Get a reference to a `u8` slice at the given offset.
    ///
    /// Returns an error if the offset is invalid or the size is too large.
    fn read_bytes_at(self, offset: usize, size: usize) -> Result<&'data [u8], ()>;

    /// Get a reference to a `u8` slice at the given offset, and update the
    /// offset past it.
    fn read_bytes(self, offset: &mut usize, size: usize) -> Result<&'data [u8], ()> {
        let bytes = self.read_bytes_at(*offset, size)?;
        *offset = offset.wrapping_add(size);
        Ok(bytes)
    }

    /// Get a reference to a `Pod` type at the given offset, and update the
    /// offset past it.
    fn read<T: Pod>(self, offset: &mut usize) -> Result<&'data T, ()> {
        let size = mem::size_of::<T>();
        let bytes = self.read_bytes(offset, size)?;
        let (t, _) = from_bytes(bytes)?;
        Ok(t)
    }

    /// Get a reference to a `Pod` type at the given offset.
    fn read_at<T: Pod>(self, mut offset: usize) -> Result<&'data T, ()> {
        self.read(&mut offset)
    }

    /// Get a reference to a slice of a `Pod` type at the given offset.
    fn read_slice_at<T: Pod>(self, offset: usize, count: usize) -> Result<&'data [T], ()> {
        let size = count.checked_mul(mem::size_of::<T>()).ok_or(())?;
        let bytes = self.read_bytes_at(offset, size)?;
        let (t, _) = slice_from_bytes(bytes, count)?;
        Ok(t)
    }
}

impl<'data> ReadRef<'data> for &'data [u8] {
    fn len(self) -> Result<usize, ()> {
        Ok(self.len())
    }

    fn read_bytes_at(self, offset: usize, size: usize) -> Result<&'data [u8], ()> {
        self.get(offset..).ok_or(())?.get(..size).ok_or(())
    }
}
