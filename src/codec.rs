//! Binary record codec.
//!
//! Records are written member by member in declaration order, little-endian,
//! with no framing between records. Nullable members carry a one-byte
//! presence flag (1 = present) ahead of the value. Links are never written;
//! only their foreign-key member is.

use crate::shape::{Record, ScalarKind, Shape, Slot};
use crate::types::{EntityId, Timestamp};
use std::io::{self, BufRead, Read, Write};

/// A value the codec can write inline.
///
/// Implemented for the primitive types, `String`, `char`, [`Timestamp`] and
/// `Option<S>` of any of those. Enumerations get an implementation through
/// [`scalar_enum!`](crate::scalar_enum).
pub trait Scalar: Send + Sync + 'static {
    const KIND: ScalarKind;
    const NULLABLE: bool = false;

    fn encode(&self, w: &mut dyn Write) -> io::Result<()>;

    fn decode(r: &mut dyn Read) -> io::Result<Self>
    where
        Self: Sized;
}

/// Build an `InvalidData` error.
pub fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Read exactly `N` bytes.
pub fn read_array<const N: usize>(r: &mut dyn Read) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_flag(w: &mut dyn Write, value: bool) -> io::Result<()> {
    w.write_all(&[value as u8])
}

pub fn read_flag(r: &mut dyn Read) -> io::Result<bool> {
    match read_array::<1>(r)?[0] {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(invalid_data(format!("invalid flag byte {other}"))),
    }
}

pub fn write_i32(w: &mut dyn Write, value: i32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

pub fn read_i32(r: &mut dyn Read) -> io::Result<i32> {
    Ok(i32::from_le_bytes(read_array(r)?))
}

pub fn write_i64(w: &mut dyn Write, value: i64) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

pub fn read_i64(r: &mut dyn Read) -> io::Result<i64> {
    Ok(i64::from_le_bytes(read_array(r)?))
}

/// Read the identity counter stream. An empty stream means no counter.
pub(crate) fn read_counter(r: &mut dyn Read) -> io::Result<Option<i64>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    match filled {
        0 => Ok(None),
        8 => Ok(Some(i64::from_le_bytes(buf))),
        n => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("identity counter truncated after {n} bytes"),
        )),
    }
}

macro_rules! le_scalar {
    ($($ty:ty => $kind:ident),* $(,)?) => {$(
        impl Scalar for $ty {
            const KIND: ScalarKind = ScalarKind::$kind;

            fn encode(&self, w: &mut dyn Write) -> io::Result<()> {
                w.write_all(&self.to_le_bytes())
            }

            fn decode(r: &mut dyn Read) -> io::Result<Self> {
                Ok(<$ty>::from_le_bytes(read_array(r)?))
            }
        }
    )*};
}

le_scalar!(
    u8 => U8,
    i8 => I8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
);

impl Scalar for bool {
    const KIND: ScalarKind = ScalarKind::Bool;

    fn encode(&self, w: &mut dyn Write) -> io::Result<()> {
        write_flag(w, *self)
    }

    fn decode(r: &mut dyn Read) -> io::Result<Self> {
        read_flag(r)
    }
}

impl Scalar for char {
    const KIND: ScalarKind = ScalarKind::Char;

    fn encode(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_all(&(*self as u32).to_le_bytes())
    }

    fn decode(r: &mut dyn Read) -> io::Result<Self> {
        let raw = u32::from_le_bytes(read_array(r)?);
        char::from_u32(raw).ok_or_else(|| invalid_data(format!("invalid char {raw:#x}")))
    }
}

impl Scalar for String {
    const KIND: ScalarKind = ScalarKind::Text;

    fn encode(&self, w: &mut dyn Write) -> io::Result<()> {
        let len = u32::try_from(self.len())
            .map_err(|_| invalid_data("string longer than u32::MAX bytes"))?;
        w.write_all(&len.to_le_bytes())?;
        w.write_all(self.as_bytes())
    }

    fn decode(r: &mut dyn Read) -> io::Result<Self> {
        let len = u32::from_le_bytes(read_array(r)?) as u64;
        let mut bytes = Vec::new();
        r.take(len).read_to_end(&mut bytes)?;
        if bytes.len() as u64 != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("string truncated: expected {len} bytes, got {}", bytes.len()),
            ));
        }
        String::from_utf8(bytes).map_err(|e| invalid_data(e.to_string()))
    }
}

impl Scalar for Timestamp {
    const KIND: ScalarKind = ScalarKind::Timestamp;

    fn encode(&self, w: &mut dyn Write) -> io::Result<()> {
        write_i64(w, self.0)
    }

    fn decode(r: &mut dyn Read) -> io::Result<Self> {
        Ok(Timestamp(read_i64(r)?))
    }
}

impl<S: Scalar> Scalar for Option<S> {
    const KIND: ScalarKind = S::KIND;
    const NULLABLE: bool = true;

    fn encode(&self, w: &mut dyn Write) -> io::Result<()> {
        match self {
            Some(value) => {
                write_flag(w, true)?;
                value.encode(w)
            }
            None => write_flag(w, false),
        }
    }

    fn decode(r: &mut dyn Read) -> io::Result<Self> {
        if read_flag(r)? {
            Ok(Some(S::decode(r)?))
        } else {
            Ok(None)
        }
    }
}

/// Implement [`Scalar`] for a fieldless enum, written as its `i32`
/// discriminant. Every variant must be listed.
///
/// ```ignore
/// #[derive(Default)]
/// enum Rank { #[default] Junior, Senior }
/// scalar_enum!(Rank { Junior, Senior });
/// ```
#[macro_export]
macro_rules! scalar_enum {
    ($ty:ident { $($variant:ident),+ $(,)? }) => {
        impl $crate::Scalar for $ty {
            const KIND: $crate::ScalarKind = $crate::ScalarKind::Enum(stringify!($ty));

            fn encode(&self, w: &mut dyn ::std::io::Write) -> ::std::io::Result<()> {
                let raw = match self {
                    $($ty::$variant => $ty::$variant as i32,)+
                };
                $crate::codec::write_i32(w, raw)
            }

            fn decode(r: &mut dyn ::std::io::Read) -> ::std::io::Result<Self> {
                let raw = $crate::codec::read_i32(r)?;
                $(
                    if raw == $ty::$variant as i32 {
                        return Ok($ty::$variant);
                    }
                )+
                Err($crate::codec::invalid_data(format!(
                    "unknown {} discriminant {}",
                    stringify!($ty),
                    raw
                )))
            }
        }
    };
}

/// Reader that tracks how many bytes have been consumed.
pub(crate) struct CountingReader<R> {
    inner: R,
    position: u64,
}

impl<R: BufRead> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn at_end(&mut self) -> io::Result<bool> {
        Ok(self.inner.fill_buf()?.is_empty())
    }
}

impl<R: BufRead> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.position += amt as u64;
        self.inner.consume(amt);
    }
}

fn in_member(e: io::Error, record: &str, member: &str) -> io::Error {
    io::Error::new(e.kind(), format!("{record}.{member}: {e}"))
}

impl<T: Record> Shape<T> {
    /// Write one record.
    pub fn encode(&self, record: &T, w: &mut dyn Write) -> io::Result<()> {
        for member in &self.members {
            let written = match &member.slot {
                Slot::Identity(field) => write_i64(w, (field.get)(record).0),
                Slot::Scalar(slot) => slot.encode(record, w),
                Slot::ForeignKey { get, nullable } => {
                    let value = get(record).get();
                    if *nullable {
                        match value {
                            Some(id) => write_flag(w, true).and_then(|_| write_i64(w, id.0)),
                            None => write_flag(w, false),
                        }
                    } else {
                        write_i64(w, value.map_or(0, |id| id.0))
                    }
                }
                Slot::Embedded(slot) => slot.encode(record, w),
                Slot::SingleLink { .. } | Slot::MultiLink(_) | Slot::Excluded => Ok(()),
            };
            written.map_err(|e| in_member(e, T::NAME, member.name))?;
        }
        Ok(())
    }

    /// Read one record. Links are left detached.
    pub fn decode(&self, r: &mut dyn Read) -> io::Result<T> {
        let mut record = T::default();
        for member in &self.members {
            let read = match &member.slot {
                Slot::Identity(field) => read_i64(r).map(|id| {
                    *(field.get_mut)(&mut record) = EntityId(id);
                }),
                Slot::Scalar(slot) => slot.decode(&mut record, r),
                Slot::ForeignKey { get, nullable } => {
                    let value = if *nullable {
                        match read_flag(r) {
                            Ok(true) => read_i64(r).map(Some),
                            Ok(false) => Ok(None),
                            Err(e) => Err(e),
                        }
                    } else {
                        read_i64(r).map(Some)
                    };
                    value.map(|v| get(&record).set(v.map(EntityId)))
                }
                Slot::Embedded(slot) => slot.decode(&mut record, r),
                Slot::SingleLink { .. } | Slot::MultiLink(_) | Slot::Excluded => Ok(()),
            };
            read.map_err(|e| in_member(e, T::NAME, member.name))?;
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    enum Level {
        #[default]
        Low,
        High = 7,
    }

    crate::scalar_enum!(Level { Low, High });

    fn roundtrip<S: Scalar>(value: &S) -> S {
        let mut buf = Vec::new();
        value.encode(&mut buf).unwrap();
        S::decode(&mut buf.as_slice()).unwrap()
    }

    #[test]
    fn test_scalar_layouts() {
        let mut buf = Vec::new();
        42i32.encode(&mut buf).unwrap();
        assert_eq!(buf, vec![42, 0, 0, 0]);

        let mut buf = Vec::new();
        "hi".to_string().encode(&mut buf).unwrap();
        assert_eq!(buf, vec![2, 0, 0, 0, b'h', b'i']);

        let mut buf = Vec::new();
        Some(1u8).encode(&mut buf).unwrap();
        None::<u8>.encode(&mut buf).unwrap();
        assert_eq!(buf, vec![1, 1, 0]);
    }

    #[test]
    fn test_scalar_values_survive() {
        assert_eq!(roundtrip(&-5i64), -5);
        assert_eq!(roundtrip(&1.5f64), 1.5);
        assert_eq!(roundtrip(&'é'), 'é');
        assert_eq!(roundtrip(&Some("x".to_string())), Some("x".to_string()));
        assert_eq!(roundtrip(&Timestamp(99)), Timestamp(99));
        assert_eq!(roundtrip(&Level::High), Level::High);
    }

    #[test]
    fn test_enum_written_as_discriminant() {
        let mut buf = Vec::new();
        Level::High.encode(&mut buf).unwrap();
        assert_eq!(buf, 7i32.to_le_bytes().to_vec());

        let bad = 3i32.to_le_bytes();
        let err = Level::decode(&mut &bad[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_string_fails() {
        let bytes = [5u8, 0, 0, 0, b'a', b'b'];
        let err = String::decode(&mut &bytes[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_invalid_flag_rejected() {
        let bytes = [2u8, 0];
        assert!(bool::decode(&mut &bytes[..]).is_err());
        assert!(Option::<u8>::decode(&mut &bytes[..]).is_err());
    }

    #[test]
    fn test_counter_stream() {
        let empty: &[u8] = &[];
        assert_eq!(read_counter(&mut &empty[..]).unwrap(), None);
        let bytes = 12i64.to_le_bytes();
        assert_eq!(read_counter(&mut &bytes[..]).unwrap(), Some(12));
        assert!(read_counter(&mut &bytes[..3]).is_err());
    }

    #[test]
    fn test_counting_reader_tracks_position() {
        let bytes = [1u8, 2, 3, 4, 5];
        let mut reader = CountingReader::new(&bytes[..]);
        let _: [u8; 3] = read_array(&mut reader).unwrap();
        assert_eq!(reader.position(), 3);
        assert!(!reader.at_end().unwrap());
        let _: [u8; 2] = read_array(&mut reader).unwrap();
        assert!(reader.at_end().unwrap());
    }
}
