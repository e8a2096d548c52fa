//! Connection that binds to whichever local interface lies in a given
//! IPv4 subnet.
//!
//! Drone radio links are often configured as "the 192.168.4.0/24 network"
//! rather than a concrete local address; this wrapper resolves the subnet
//! to the unique matching interface at open time, constructs the delegate
//! connection on that address and mirrors its state from then on.

use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::info;

use crate::networking::{find_interfaces_in_subnet, Ipv4Subnet};
use crate::signals::SignalBinding;

use super::{Connection, ConnectionCore, ConnectionState};

type DelegateFactory<C> = Box<dyn Fn(Ipv4Addr) -> Arc<C> + Send + Sync>;

/// Connection wrapper resolving a subnet to a concrete local interface.
pub struct SubnetBindingConnection<C: Connection + 'static> {
    core: Arc<ConnectionCore>,
    subnet: Ipv4Subnet,
    factory: DelegateFactory<C>,
    /// Set when broadcasting is intended on the resolved interface; the
    /// loopback interface is rejected in that case.
    needs_broadcast: bool,
    delegate: Mutex<Option<(Arc<C>, SignalBinding)>>,
}

impl<C: Connection + 'static> SubnetBindingConnection<C> {
    pub fn new<F>(subnet: Ipv4Subnet, factory: F) -> Self
    where
        F: Fn(Ipv4Addr) -> Arc<C> + Send + Sync + 'static,
    {
        Self {
            core: Arc::new(ConnectionCore::new()),
            subnet,
            factory: Box::new(factory),
            needs_broadcast: false,
            delegate: Mutex::new(None),
        }
    }

    pub fn with_broadcast(mut self) -> Self {
        self.needs_broadcast = true;
        self
    }

    /// The delegate connection, when the subnet has been resolved.
    pub fn delegate(&self) -> Option<Arc<C>> {
        self.delegate
            .lock()
            .unwrap()
            .as_ref()
            .map(|(delegate, _)| Arc::clone(delegate))
    }

    fn resolve_address(&self) -> io::Result<Ipv4Addr> {
        let matches = find_interfaces_in_subnet(self.subnet)?;
        match matches.as_slice() {
            [] => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no local interface in subnet {}", self.subnet),
            )),
            [(name, address)] => {
                if self.needs_broadcast && address.is_loopback() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "cannot broadcast on the loopback interface",
                    ));
                }
                info!(interface = %name, address = %address, subnet = %self.subnet,
                    "resolved subnet to interface");
                Ok(*address)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!(
                    "multiple local interfaces in subnet {}: {}",
                    self.subnet,
                    matches
                        .iter()
                        .map(|(name, _)| name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )),
        }
    }
}

impl<C: Connection + 'static> Connection for SubnetBindingConnection<C> {
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

            let address = match self.resolve_address() {
                Ok(address) => address,
                Err(error) => {
                    self.core.set_state(ConnectionState::Disconnected);
                    return Err(error);
                }
            };

            let delegate = (self.factory)(address);

            // Mirror the delegate's state into our own core.
            let mirror = Arc::clone(&self.core);
            let binding = delegate
                .events()
                .state_changed
                .connect(move |change| mirror.set_state(change.new));
            *self.delegate.lock().unwrap() = Some((Arc::clone(&delegate), binding));

            match delegate.open().await {
                Ok(()) => Ok(()),
                Err(error) => {
                    self.delegate.lock().unwrap().take();
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

            let delegate = self.delegate.lock().unwrap().take();
            match delegate {
                Some((delegate, binding)) => {
                    drop(binding);
                    self.core.set_state(ConnectionState::Disconnecting);
                    let result = delegate.close().await;
                    self.core.set_state(ConnectionState::Disconnected);
                    result
                }
                None => {
                    self.core.set_state(ConnectionState::Disconnected);
                    Ok(())
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::DummyConnection;

    #[tokio::test]
    async fn resolves_loopback_and_mirrors_delegate_state() {
        let subnet: Ipv4Subnet = "127.0.0.0/8".parse().unwrap();
        let conn = SubnetBindingConnection::new(subnet, |_address| DummyConnection::new());

        match conn.open().await {
            Ok(()) => {
                assert_eq!(conn.state(), ConnectionState::Connected);
                let delegate = conn.delegate().unwrap();
                delegate.drop_link();
                assert_eq!(conn.state(), ConnectionState::Disconnected);
            }
            Err(error) => {
                // Machines without a loopback interface (or with several
                // addresses in 127/8) legitimately fail to resolve.
                assert_eq!(conn.state(), ConnectionState::Disconnected);
                let _ = error;
            }
        }
    }

    #[tokio::test]
    async fn refuses_broadcast_on_loopback() {
        let subnet: Ipv4Subnet = "127.0.0.0/8".parse().unwrap();
        let conn = SubnetBindingConnection::new(subnet, |_address| DummyConnection::new())
            .with_broadcast();
        assert!(conn.open().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
