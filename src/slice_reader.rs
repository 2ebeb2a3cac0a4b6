use super::{Error, ErrorDetails, Result};

/// Simple reader state for extracting data from a [`&[u8]`] slice.
///
/// Unlike the [`std::io::Read`] implementation for [`&[u8]`], this keeps track of the location
/// within the packet for more informative errors via [`Result`].
///
/// # Example
///
/// ```
/// use ts2ass::SliceReader;
/// let some_data = [0x42];
/// let mut reader = SliceReader::new(&some_data);
/// assert_eq!(reader.read_u8()?, 0x42);
/// # Ok::<(), ts2ass::Error>(())
/// ```
#[derive(Debug)]
pub struct SliceReader<'a> {
    slice: &'a [u8],
    location: usize,
}

impl<'a> SliceReader<'a> {
    /// Initializes a reader from any byte slice.
    pub fn new(slice: &'a [u8]) -> Self {
        Self { slice, location: 0 }
    }

    /// Creates a fixed `length` sub-reader at the current position, then advances this reader to
    /// the sub-reader's end position.
    ///
    /// The sub-reader semantic makes reading nested data of known lengths easier with correct
    /// bounds checking of the nested data.
    pub fn new_sub_reader(&mut self, length: usize) -> Result<Self> {
        let location = self.location;
        Ok(Self {
            slice: self.read(length)?,
            location,
        })
    }

    /// Creates an [`Error`] using the contained location.
    pub fn make_error(&self, details: ErrorDetails) -> Error {
        Error {
            location: self.location,
            details,
        }
    }

    /// Number of bytes remaining in the slice reader.
    pub fn remaining_len(&self) -> usize {
        self.slice.len()
    }

    /// Advance reader without extracting any data from the slice.
    pub fn skip(&mut self, length: usize) -> Result<()> {
        if length > self.slice.len() {
            Err(self.make_error(ErrorDetails::PacketOverrun(length)))
        } else {
            self.location += length;
            self.slice = &self.slice[length..];
            Ok(())
        }
    }

    /// Extract a fixed `length` sub-slice from this reader and advance.
    pub fn read(&mut self, length: usize) -> Result<&'a [u8]> {
        if length > self.slice.len() {
            Err(self.make_error(ErrorDetails::PacketOverrun(length)))
        } else {
            self.location += length;
            let (left, right) = self.slice.split_at(length);
            self.slice = right;
            Ok(left)
        }
    }

    /// Extract a sub-slice of all data remaining to be read.
    pub fn read_to_end(&mut self) -> Result<&'a [u8]> {
        self.read(self.slice.len())
    }

    /// Same as [`SliceReader::read`] but also converts the slice to an array reference of length
    /// `N`.
    #[allow(unsafe_code)]
    pub fn read_array_ref<const N: usize>(&mut self) -> Result<&'a [u8; N]> {
        unsafe {
            // Bounds checking performed by read()
            Ok(&*(self.read(N)?.as_ptr() as *const [u8; N]))
        }
    }

    /// Read one byte interpreted as [`u8`].
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array_ref::<1>()?[0])
    }

    /// Read two bytes interpreted as big-endian [`u16`].
    pub fn read_be_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(*self.read_array_ref::<2>()?))
    }

    /// Read three bytes interpreted as big-endian `u24`.
    pub fn read_be_u24(&mut self) -> Result<u32> {
        let bytes = *self.read_array_ref::<3>()?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    /// Read four bytes interpreted as big-endian [`u32`].
    pub fn read_be_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(*self.read_array_ref::<4>()?))
    }

    /// Read five bytes interpreted as big-endian `u40`.
    ///
    /// Caption timestamp words are 36 bits followed by 4 reserved bits; callers shift the
    /// reserved nibble off the returned value.
    pub fn read_be_u40(&mut self) -> Result<u64> {
        let bytes = *self.read_array_ref::<5>()?;
        Ok(u64::from_be_bytes([
            0, 0, 0, bytes[0], bytes[1], bytes[2], bytes[3], bytes[4],
        ]))
    }

    /// Extract a fixed `length` sub-slice from this reader without advancing.
    pub fn peek(&mut self, length: usize) -> Result<&'a [u8]> {
        if length > self.slice.len() {
            Err(self.make_error(ErrorDetails::PacketOverrun(length)))
        } else {
            Ok(&self.slice[0..length])
        }
    }

    /// Same as [`SliceReader::peek`] but also converts the slice to an array reference of length
    /// `N`.
    #[allow(unsafe_code)]
    pub fn peek_array_ref<const N: usize>(&mut self) -> Result<&'a [u8; N]> {
        unsafe {
            // Bounds checking performed by read()
            Ok(&*(self.peek(N)?.as_ptr() as *const [u8; N]))
        }
    }

    /// All data remaining to be read, without advancing.
    pub fn peek_remaining(&self) -> &'a [u8] {
        self.slice
    }
}

/// Convenience macro to read a modular bitfield from a [`SliceReader`]
///
/// Wraps [`SliceReader::read_array_ref`] to read the exact number of bytes required by the
/// bitfield type. Must be expanded in a function that returns [`Result`].
///
/// # Example
///
/// ```
/// use modular_bitfield_msb::prelude::*;
/// use ts2ass::{read_bitfield, SliceReader};
/// #[bitfield]
/// pub(crate) struct MyBitfield {
///     pub a_bit: B1,
///     #[skip]
///     padding: B7,
/// }
///
/// let some_data = [0x80];
/// let mut reader = SliceReader::new(&some_data);
/// let the_bitfield = read_bitfield!(reader, MyBitfield);
/// assert_eq!(the_bitfield.a_bit(), 1);
/// # Ok::<(), ts2ass::Error>(())
/// ```
#[macro_export]
macro_rules! read_bitfield {
    ($reader:expr, $type:ty) => {
        <$type>::from_bytes(*$reader.read_array_ref::<{ std::mem::size_of::<$type>() }>()?)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_reads() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A];
        let mut reader = SliceReader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_be_u16().unwrap(), 0x0203);
        assert_eq!(reader.read_be_u24().unwrap(), 0x040506);
        assert_eq!(reader.read_be_u32().unwrap(), 0x0708090A);
        assert_eq!(reader.remaining_len(), 0);
    }

    #[test]
    fn read_be_u40_covers_timestamp_words() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A];
        let mut reader = SliceReader::new(&data);
        assert_eq!(reader.read_be_u40().unwrap(), 0x123456789A);
    }

    #[test]
    fn overrun_reports_location() {
        let data = [0x00, 0x00];
        let mut reader = SliceReader::new(&data);
        reader.read_u8().unwrap();
        let err = reader.read_be_u16().unwrap_err();
        assert_eq!(err.location, 1);
        assert!(matches!(err.details, ErrorDetails::PacketOverrun(2)));
    }

    #[test]
    fn sub_reader_bounds_nested_data() {
        let data = [0xAA, 0xBB, 0xCC, 0xDD];
        let mut reader = SliceReader::new(&data);
        let mut sub = reader.new_sub_reader(2).unwrap();
        assert_eq!(sub.read_be_u16().unwrap(), 0xAABB);
        assert!(sub.read_u8().is_err());
        assert_eq!(reader.read_be_u16().unwrap(), 0xCCDD);
    }
}
