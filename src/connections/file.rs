//! Connection backed by a file on disk. Mostly used to replay recorded
//! device traffic or to log outgoing frames.

use std::io;
use std::path::PathBuf;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{Connection, ConnectionCore, ConnectionState};

/// How a `FileConnection` opens its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

/// Connection that reads from or writes to a file.
pub struct FileConnection {
    core: ConnectionCore,
    path: PathBuf,
    mode: FileMode,
    file: Mutex<Option<File>>,
}

impl FileConnection {
    pub fn new(path: impl Into<PathBuf>, mode: FileMode) -> Self {
        Self {
            core: ConnectionCore::new(),
            path: path.into(),
            mode,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let result = {
            let mut guard = self.file.lock().await;
            match guard.as_mut() {
                Some(file) => file.read(buf).await,
                None => return Ok(0),
            }
        };
        match result {
            Ok(count) => Ok(count),
            Err(error) => {
                self.handle_error(error).await?;
                Ok(0)
            }
        }
    }

    pub async fn write(&self, data: &[u8]) -> io::Result<usize> {
        let result = {
            let mut guard = self.file.lock().await;
            match guard.as_mut() {
                Some(file) => file.write(data).await,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "file connection is not open",
                    ))
                }
            }
        };
        match result {
            Ok(count) => Ok(count),
            Err(error) => {
                self.handle_error(error).await?;
                Ok(0)
            }
        }
    }

    pub async fn flush(&self) -> io::Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

impl Connection for FileConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn open(&self) -> BoxFuture<'_, io::Result<()>> {
        async move {
            match self.core.state() {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                _ => {}
            }
            self.core.set_state(ConnectionState::Connecting);

            let mut options = OpenOptions::new();
            match self.mode {
                FileMode::Read => options.read(true),
                FileMode::Write => options.write(true).create(true).truncate(true),
                FileMode::Append => options.append(true).create(true),
            };

            match options.open(&self.path).await {
                Ok(file) => {
                    *self.file.lock().await = Some(file);
                    self.core.set_state(ConnectionState::Connected);
                    Ok(())
                }
                Err(error) => {
                    self.core.set_state(ConnectionState::Disconnected);
                    Err(error)
                }
            }
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        async move {
            match self.core.state() {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                    return Ok(())
                }
                _ => {}
            }
            self.core.set_state(ConnectionState::Disconnecting);
            if let Some(mut file) = self.file.lock().await.take() {
                let _ = file.flush().await;
            }
            self.core.set_state(ConnectionState::Disconnected);
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_a_temp_file() {
        let path = std::env::temp_dir().join(format!(
            "flockwaved-file-conn-{}.log",
            uuid::Uuid::new_v4()
        ));

        let writer = FileConnection::new(&path, FileMode::Write);
        writer.open().await.unwrap();
        assert_eq!(writer.write(b"hello").await.unwrap(), 5);
        writer.close().await.unwrap();

        let reader = FileConnection::new(&path, FileMode::Read);
        reader.open().await.unwrap();
        let mut buf = [0u8; 16];
        let count = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..count], b"hello");
        reader.close().await.unwrap();

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn failed_open_returns_to_disconnected() {
        let conn = FileConnection::new("/definitely/not/a/real/path", FileMode::Read);
        assert!(conn.open().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
