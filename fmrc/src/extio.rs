//! Extend AsyncRead and AsyncWrite with some convenience methods for binary i/o
//!
use std::io;

use async_trait::async_trait;
use futures::{io as aio, AsyncReadExt, AsyncWriteExt};

use crate::errors::{Error, Result};

/// Longest string or array we are willing to allocate for while decoding. Anything larger is
/// taken to be a corrupt record.
const MAX_LEN: u32 = 1 << 24;

#[async_trait]
pub(crate) trait Serialize: Sized {
    /// Write self to a stream
    async fn write_to(&self, stream: &mut (impl aio::AsyncWrite + Unpin + Send)) -> Result<()>;

    /// Read Self from a stream
    async fn read_from(stream: &mut (impl aio::AsyncRead + Unpin + Send)) -> Result<Self>;
}

/// Big endian binary reads. Every method is provided, so any async reader gets them.
///
#[async_trait]
pub(crate) trait ExtendedAsyncRead: aio::AsyncRead + Unpin + Send {
    /// Read exactly `N` bytes
    async fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buffer = [0; N];
        self.read_exact(&mut buffer).await?;

        Ok(buffer)
    }

    async fn read_byte(&mut self) -> io::Result<u8> {
        let [byte] = self.read_array().await?;

        Ok(byte)
    }

    async fn read_u16(&mut self) -> io::Result<u16> {
        Ok(u16::from_be_bytes(self.read_array().await?))
    }

    async fn read_i32(&mut self) -> io::Result<i32> {
        Ok(i32::from_be_bytes(self.read_array().await?))
    }

    async fn read_u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_be_bytes(self.read_array().await?))
    }

    async fn read_f64(&mut self) -> io::Result<f64> {
        Ok(f64::from_be_bytes(self.read_array().await?))
    }

    /// Read a `u32` length prefix, rejecting lengths too large to be real
    async fn read_len(&mut self, what: &str) -> Result<usize> {
        let len = self.read_u32().await?;
        if len > MAX_LEN {
            return Err(Error::BadCache(format!("{what} length {len} out of range")));
        }

        Ok(len as usize)
    }

    /// Read a length prefixed UTF-8 string
    async fn read_str(&mut self) -> Result<String> {
        let mut buffer = vec![0; self.read_len("string").await?];
        self.read_exact(&mut buffer).await?;

        String::from_utf8(buffer).map_err(|err| Error::BadCache(err.to_string()))
    }

    /// Read a length prefixed sequence of 64 bit floats
    async fn read_f64s(&mut self) -> Result<Vec<f64>> {
        let len = self.read_len("array").await?;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(self.read_f64().await?);
        }

        Ok(values)
    }

    /// Read an optional `u32`, preceded by a presence flag
    async fn read_opt_u32(&mut self) -> io::Result<Option<u32>> {
        match self.read_byte().await? {
            0 => Ok(None),
            _ => Ok(Some(self.read_u32().await?)),
        }
    }
}

impl<R: aio::AsyncRead + Unpin + Send> ExtendedAsyncRead for R {}

/// Big endian binary writes, the counterpart of `ExtendedAsyncRead`.
///
#[async_trait]
pub(crate) trait ExtendedAsyncWrite: aio::AsyncWrite + Unpin + Send {
    async fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_all(&[byte]).await
    }

    async fn write_u16(&mut self, word: u16) -> io::Result<()> {
        self.write_all(&word.to_be_bytes()).await
    }

    async fn write_i32(&mut self, word: i32) -> io::Result<()> {
        self.write_all(&word.to_be_bytes()).await
    }

    async fn write_u32(&mut self, word: u32) -> io::Result<()> {
        self.write_all(&word.to_be_bytes()).await
    }

    async fn write_f64(&mut self, word: f64) -> io::Result<()> {
        self.write_all(&word.to_be_bytes()).await
    }

    async fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.write_u32(s.len() as u32).await?;
        self.write_all(s.as_bytes()).await
    }

    async fn write_f64s(&mut self, values: &[f64]) -> io::Result<()> {
        self.write_u32(values.len() as u32).await?;
        for value in values {
            self.write_f64(*value).await?;
        }

        Ok(())
    }

    async fn write_opt_u32(&mut self, word: Option<u32>) -> io::Result<()> {
        match word {
            None => self.write_byte(0).await,
            Some(word) => {
                self.write_byte(1).await?;
                self.write_u32(word).await
            }
        }
    }
}

impl<W: aio::AsyncWrite + Unpin + Send> ExtendedAsyncWrite for W {}
