//! TCP and UDP connections.

use std::io;
use std::net::SocketAddr;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;

use super::{Connection, ConnectionCore, ConnectionState};

/// Client-side TCP stream connection.
pub struct TcpClientConnection {
    core: ConnectionCore,
    address: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpClientConnection {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            core: ConnectionCore::new(),
            address,
            stream: Mutex::new(None),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Reads at most `buf.len()` bytes. Zero bytes means the peer closed
    /// the stream; the connection then transitions to `DISCONNECTED`.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let result = {
            let mut guard = self.stream.lock().await;
            match guard.as_mut() {
                Some(stream) => stream.read(buf).await,
                None => return Ok(0),
            }
        };
        match result {
            Ok(0) => {
                // Peer close.
                self.stream.lock().await.take();
                self.core.set_state(ConnectionState::Disconnected);
                Ok(0)
            }
            Ok(count) => Ok(count),
            Err(error) => {
                self.handle_error(error).await?;
                Ok(0)
            }
        }
    }

    pub async fn write(&self, data: &[u8]) -> io::Result<usize> {
        let result = {
            let mut guard = self.stream.lock().await;
            match guard.as_mut() {
                Some(stream) => stream.write(data).await,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "TCP connection is not open",
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
}

impl Connection for TcpClientConnection {
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
            match TcpStream::connect(self.address).await {
                Ok(stream) => {
                    *self.stream.lock().await = Some(stream);
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
            if let Some(mut stream) = self.stream.lock().await.take() {
                let _ = stream.shutdown().await;
            }
            self.core.set_state(ConnectionState::Disconnected);
            Ok(())
        }
        .boxed()
    }
}

/// UDP socket connection bound to a local address. "Connected" means the
/// socket is bound; datagrams carry their own peer addresses.
pub struct UdpListenerConnection {
    core: ConnectionCore,
    local_address: SocketAddr,
    socket: Mutex<Option<UdpSocket>>,
    broadcast: bool,
}

impl UdpListenerConnection {
    pub fn new(local_address: SocketAddr) -> Self {
        Self {
            core: ConnectionCore::new(),
            local_address,
            socket: Mutex::new(None),
            broadcast: false,
        }
    }

    /// Enables `SO_BROADCAST` on the socket when it is opened.
    pub fn with_broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        // Hold the lock across the await: only one reader makes sense on a
        // datagram socket anyway.
        let guard = self.socket.lock().await;
        match guard.as_ref() {
            Some(socket) => match socket.recv_from(buf).await {
                Ok(received) => Ok(received),
                Err(error) => {
                    drop(guard);
                    self.handle_error(error).await?;
                    Ok((0, self.local_address))
                }
            },
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "UDP connection is not open",
            )),
        }
    }

    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        let guard = self.socket.lock().await;
        match guard.as_ref() {
            Some(socket) => match socket.send_to(data, target).await {
                Ok(count) => Ok(count),
                Err(error) => {
                    drop(guard);
                    self.handle_error(error).await?;
                    Ok(0)
                }
            },
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "UDP connection is not open",
            )),
        }
    }
}

impl Connection for UdpListenerConnection {
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
            let bound = async {
                let socket = UdpSocket::bind(self.local_address).await?;
                if self.broadcast {
                    socket.set_broadcast(true)?;
                }
                Ok::<_, io::Error>(socket)
            }
            .await;

            match bound {
                Ok(socket) => {
                    *self.socket.lock().await = Some(socket);
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
            self.socket.lock().await.take();
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
    async fn udp_round_trip_on_loopback() {
        let alice = UdpListenerConnection::new("127.0.0.1:0".parse().unwrap());
        alice.open().await.unwrap();
        let alice_addr = {
            let guard = alice.socket.lock().await;
            guard.as_ref().unwrap().local_addr().unwrap()
        };

        let bob = UdpListenerConnection::new("127.0.0.1:0".parse().unwrap());
        bob.open().await.unwrap();

        bob.send_to(b"ping", alice_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (count, _) = alice.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..count], b"ping");

        alice.close().await.unwrap();
        bob.close().await.unwrap();
    }

    #[tokio::test]
    async fn tcp_connect_failure_is_clean() {
        // Port 1 on loopback is almost certainly closed.
        let conn = TcpClientConnection::new("127.0.0.1:1".parse().unwrap());
        assert!(conn.open().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn tcp_peer_close_transitions_to_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let conn = TcpClientConnection::new(address);
        let accepted = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        conn.open().await.unwrap();
        let peer = accepted.await.unwrap();
        drop(peer);

        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
