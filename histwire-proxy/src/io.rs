//! Bounded line-oriented reading over an arbitrary byte stream.
//!
//! Every protocol the proxy terminates on the local socket is
//! line-delimited at least up front, so one reader serves the
//! classifier, the ingestion loop, the subscriber control loop and
//! the request-head parser. Lines are capped: a peer that never sends
//! a newline can't grow the buffer without bound.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _};

/// Generous enough for an event carrying a filtered environment.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("line exceeds {MAX_LINE_LEN} bytes")]
    TooLong,
}

pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Next newline-terminated line, without the terminator (a
    /// trailing `\r` is stripped as well). `None` on clean EOF; bytes
    /// left over at EOF without a newline are returned as a final line.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>, LineError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);

                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }

                return Ok(Some(line.freeze()));
            }

            if self.buf.len() >= MAX_LINE_LEN {
                return Err(LineError::TooLong);
            }

            let n = self.inner.read_buf(&mut self.buf).await?;

            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }

                return Ok(Some(self.buf.split().freeze()));
            }
        }
    }

    /// Exactly `n` bytes, consuming buffered leftovers first.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes, LineError> {
        while self.buf.len() < n {
            let read = self.inner.read_buf(&mut self.buf).await?;

            if read == 0 {
                return Err(LineError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
        }

        Ok(self.buf.split_to(n).freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn reader_over(bytes: &[u8]) -> LineReader<std::io::Cursor<Vec<u8>>> {
        LineReader::new(std::io::Cursor::new(bytes.to_vec()))
    }

    #[tokio::test]
    async fn splits_lines_and_strips_terminators() {
        let mut reader = reader_over(b"one\ntwo\r\nthree").await;

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some(&b"three"[..]));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_lines_are_yielded_not_skipped() {
        let mut reader = reader_over(b"a\n\nb\n").await;

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some(&b""[..]));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some(&b"b"[..]));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let big = vec![b'x'; MAX_LINE_LEN + 1];
        let mut reader = reader_over(&big).await;

        assert!(matches!(reader.next_line().await, Err(LineError::TooLong)));
    }

    #[tokio::test]
    async fn read_exact_consumes_leftovers_first() {
        let mut reader = reader_over(b"head\nbody-bytes").await;

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some(&b"head"[..]));
        assert_eq!(&reader.read_exact(10).await.unwrap()[..], b"body-bytes");
    }

    #[tokio::test]
    async fn read_exact_reports_truncated_input() {
        let mut reader = reader_over(b"short").await;

        assert!(matches!(reader.read_exact(10).await, Err(LineError::Io(_))));
    }
}
