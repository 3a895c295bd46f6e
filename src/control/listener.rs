//! Control Channel Listener

use std::fmt;
use std::io;

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::Result;

/// A pre-bound local listener the port-mapping sender connects to
#[derive(Debug)]
pub enum ControlListener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// One accepted control connection carrying a single message
#[derive(Debug)]
pub enum ControlConnection {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl ControlListener {
    pub async fn accept(&self) -> io::Result<ControlConnection> {
        match self {
            #[cfg(unix)]
            ControlListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ControlConnection::Unix(stream))
            }
            ControlListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ControlConnection::Tcp(stream))
            }
        }
    }
}

impl fmt::Display for ControlListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            ControlListener::Unix(listener) => match listener.local_addr().ok().and_then(|a| a.as_pathname().map(|p| p.to_path_buf())) {
                Some(path) => write!(f, "unix:{}", path.display()),
                None => f.write_str("unix:(unnamed)"),
            },
            ControlListener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => write!(f, "tcp:{}", addr),
                Err(_) => f.write_str("tcp:(unknown)"),
            },
        }
    }
}

#[cfg(unix)]
impl From<UnixListener> for ControlListener {
    fn from(listener: UnixListener) -> Self {
        ControlListener::Unix(listener)
    }
}

impl From<TcpListener> for ControlListener {
    fn from(listener: TcpListener) -> Self {
        ControlListener::Tcp(listener)
    }
}

impl ControlConnection {
    /// Read the whole payload until the peer ends its write side
    pub async fn read_message(&mut self, limit: usize) -> Result<Vec<u8>> {
        match self {
            #[cfg(unix)]
            ControlConnection::Unix(stream) => read_limited(stream, limit).await,
            ControlConnection::Tcp(stream) => read_limited(stream, limit).await,
        }
    }
}

/// Read to end-of-stream, refusing payloads larger than `limit` bytes
pub async fn read_limited<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut payload = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut payload)
        .await
        .context("Failed to read control message")?;

    if payload.len() > limit {
        bail!("control message exceeds {} bytes", limit);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_message_across_chunks() {
        let mut mock = Builder::new()
            .read(br#"{"remove": fa"#)
            .read(br#"lse, "ports": {}}"#)
            .build();

        let payload = read_limited(&mut mock, 1024).await.unwrap();
        assert_eq!(payload, br#"{"remove": false, "ports": {}}"#);
    }

    #[tokio::test]
    async fn test_read_message_limit() {
        // One byte past the limit is all that gets read
        let mut mock = Builder::new().read(&[b'x'; 9]).build();
        assert!(read_limited(&mut mock, 8).await.is_err());

        let mut mock = Builder::new().read(&[b'x'; 5]).read(&[b'x'; 4]).build();
        assert!(read_limited(&mut mock, 8).await.is_err());

        let mut mock = Builder::new().read(&[b'x'; 8]).build();
        assert_eq!(read_limited(&mut mock, 8).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let mut mock = Builder::new()
            .read(b"{")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        assert!(read_limited(&mut mock, 1024).await.is_err());
    }
}
