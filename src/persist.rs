//! Binary serialisation contract for manager parameter blocks (`spec.md` §6).
//!
//! Every manager block supports byte-exact binary write/read via [`bincode`]; nested blocks are
//! serialised recursively. A record that does not fully deserialise is a fatal
//! [`Error::PersistenceTruncated`], never a silently-defaulted value.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Writes `value` to `writer` using the crate's canonical binary layout.
pub fn write_binary<T: Serialize, W: Write>(value: &T, writer: W) -> Result<()> {
    bincode::serialize_into(writer, value).map_err(|err| {
        Error::Other(anyhow::anyhow!("failed to serialise manager block: {err}"))
    })
}

/// Wraps a reader, counting the bytes actually pulled through it so a truncated record can report
/// a real consumed-byte count rather than a guess.
struct CountingReader<R> {
    inner: R,
    count: usize,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n;
        Ok(n)
    }
}

/// Reads a value of type `T` from `reader`, mapping a short/incomplete record to
/// [`Error::PersistenceTruncated`] rather than propagating the raw `bincode` error. `size_of::<T>()`
/// is meaningless for `Vec`-bearing records (it is the stack size, not the record length), so the
/// diagnostic instead reports the number of bytes actually consumed before the input ran out.
pub fn read_binary<T: DeserializeOwned, R: Read>(reader: R) -> Result<T> {
    let mut counting = CountingReader { inner: reader, count: 0 };
    let result = bincode::deserialize_from(&mut counting);
    result.map_err(|err| match *err {
        bincode::ErrorKind::Io(io_err)
            if io_err.kind() == std::io::ErrorKind::UnexpectedEof =>
        {
            Error::PersistenceTruncated { got: counting.count }
        }
        other => Error::Other(anyhow::anyhow!("failed to deserialise manager block: {other}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Sample {
        a: f64,
        b: u32,
    }

    #[test]
    fn round_trips() {
        let value = Sample { a: 1.5, b: 7 };
        let mut buf = Vec::new();
        write_binary(&value, &mut buf).unwrap();
        let back: Sample = read_binary(&buf[..]).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn truncated_record_is_fatal() {
        let value = Sample { a: 1.5, b: 7 };
        let mut buf = Vec::new();
        write_binary(&value, &mut buf).unwrap();
        buf.truncate(buf.len() - 2);
        let result: Result<Sample> = read_binary(&buf[..]);
        assert!(matches!(result, Err(Error::PersistenceTruncated { .. })));
    }
}
