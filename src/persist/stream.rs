//! Streaming big-endian codec for fixed-width primitives and raw byte runs.
//!
//! Values are written back to back without any tagging, so a reader must consume them with the
//! same widths, in the same order, as they were written. A [Decoder] over an unbounded stream
//! reports an overrun as [PersistError::Underflow]. A decoder opened with [Decoder::record] over a
//! region whose length was already validated reports overruns and leftovers as
//! [PersistError::TypeMismatch] instead: at that point the bytes are all there and it is the
//! reader's idea of the field widths that disagrees with the writer's.

use super::PersistError;

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    #[inline(always)]
    pub fn write_boolean(&mut self, v: bool) -> &mut Self {
        self.buf.push(if v { 1 } else { 0 });
        self
    }

    #[inline(always)]
    pub fn write_byte(&mut self, v: i8) -> &mut Self {
        self.buf.push(v as u8);
        self
    }

    #[inline(always)]
    pub fn write_char(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    #[inline(always)]
    pub fn write_short(&mut self, v: i16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    #[inline(always)]
    pub fn write_int(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    #[inline(always)]
    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    #[inline(always)]
    pub fn write_long(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Floats are stored by their raw bit pattern, so NaN payloads survive.
    #[inline(always)]
    pub fn write_float(&mut self, v: f32) -> &mut Self {
        self.write_int(v.to_bits() as i32)
    }

    #[inline(always)]
    pub fn write_double(&mut self, v: f64) -> &mut Self {
        self.write_long(v.to_bits() as i64)
    }

    #[inline(always)]
    pub fn write_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    bounded: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            bounded: false,
        }
    }

    /// Open a decoder over one complete primitive record.
    pub fn record(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            bounded: true,
        }
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline(always)]
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PersistError> {
        if n > self.remaining() {
            return Err(if self.bounded {
                PersistError::TypeMismatch(format!(
                    "read of {} bytes at offset {} overruns a {}-byte record",
                    n,
                    self.pos,
                    self.buf.len()
                ))
            } else {
                PersistError::Underflow {
                    offset: self.pos,
                    needed: n,
                    remaining: self.remaining(),
                }
            })
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PersistError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_boolean(&mut self) -> Result<bool, PersistError> {
        match self.take_array::<1>()?[0] {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(PersistError::TypeMismatch(format!(
                "byte 0x{:02x} at offset {} is not a boolean",
                b,
                self.pos - 1
            ))),
        }
    }

    pub fn read_byte(&mut self) -> Result<i8, PersistError> {
        Ok(self.take_array::<1>()?[0] as i8)
    }

    pub fn read_char(&mut self) -> Result<u16, PersistError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_short(&mut self) -> Result<i16, PersistError> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn read_int(&mut self) -> Result<i32, PersistError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, PersistError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_long(&mut self) -> Result<i64, PersistError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_float(&mut self) -> Result<f32, PersistError> {
        Ok(f32::from_bits(self.read_int()? as u32))
    }

    pub fn read_double(&mut self) -> Result<f64, PersistError> {
        Ok(f64::from_bits(self.read_long()? as u64))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], PersistError> {
        self.take(n)
    }

    /// Check that the whole record has been consumed.
    pub fn finish(self) -> Result<(), PersistError> {
        match self.remaining() {
            0 => Ok(()),
            n if self.bounded => Err(PersistError::TypeMismatch(format!(
                "{} trailing bytes left in a {}-byte record",
                n,
                self.buf.len()
            ))),
            n => Err(PersistError::MalformedExtent(format!(
                "{} trailing bytes after the last value",
                n
            ))),
        }
    }
}
