//! Per-interface SSDP socket owner.
//!
//! One delegate owns one UDP socket bound for one network interface, either
//! joined to the SSDP multicast group (NOTIFY reception) or bound to an
//! ephemeral port (M-SEARCH responses). The receive loop runs on a named
//! background thread; a condition variable signals readiness once the socket
//! is operational so senders can wait for it.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::errors::ControlPointError;
use crate::network::InterfaceAddress;

/// Receive loops poll the stop flag at this interval.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `send` waits for the socket to become ready.
const READY_WAIT: Duration = Duration::from_secs(3);

const RECV_BUFFER_SIZE: usize = 8192;

/// How the socket is bound.
#[derive(Debug, Clone)]
pub enum SsdpSocketRole {
    /// Bind the well-known port and join `group` on the delegate's interface.
    Multicast { group: SocketAddr },
    /// Bind an ephemeral port on the interface address (search responses).
    Unicast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
}

struct StateCell {
    state: Mutex<SocketState>,
    cond: Condvar,
}

impl StateCell {
    fn set(&self, next: SocketState) {
        let mut state = self.state.lock().unwrap();
        *state = next;
        self.cond.notify_all();
    }

    fn get(&self) -> SocketState {
        *self.state.lock().unwrap()
    }

    /// Wait until the socket is ready, up to [`READY_WAIT`].
    fn wait_ready(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let deadline = std::time::Instant::now() + READY_WAIT;
        loop {
            match *state {
                SocketState::Ready => return true,
                SocketState::Stopping | SocketState::Stopped => return false,
                _ => {}
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, timeout) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
            if timeout.timed_out() && *state != SocketState::Ready {
                return false;
            }
        }
    }
}

/// Socket owner: binds, runs the receive loop, forwards raw datagrams to the
/// packet handler installed by [`SsdpServerDelegate::start`].
pub struct SsdpServerDelegate {
    interface: InterfaceAddress,
    role: SsdpSocketRole,
    socket: Arc<UdpSocket>,
    state: Arc<StateCell>,
    handle: Option<JoinHandle<()>>,
    thread_name: String,
}

impl SsdpServerDelegate {
    pub fn new(
        interface: InterfaceAddress,
        role: SsdpSocketRole,
        thread_prefix: &str,
    ) -> Result<Self, ControlPointError> {
        let socket = bind_socket(&interface, &role)?;
        let thread_name = format!("{}-{}", thread_prefix, interface.name);
        Ok(Self {
            interface,
            role,
            socket: Arc::new(socket),
            state: Arc::new(StateCell {
                state: Mutex::new(SocketState::NotStarted),
                cond: Condvar::new(),
            }),
            handle: None,
            thread_name,
        })
    }

    pub fn interface(&self) -> &InterfaceAddress {
        &self.interface
    }

    /// Local port the socket is bound to.
    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Start the receive loop. The handler receives each datagram after the
    /// address-family check, together with its source address.
    pub fn start<F>(&mut self, handler: F) -> Result<(), ControlPointError>
    where
        F: Fn(&[u8], SocketAddr) + Send + 'static,
    {
        if self.state.get() != SocketState::NotStarted {
            return Err(ControlPointError::InvalidState(
                "SSDP socket already started".to_string(),
            ));
        }
        self.state.set(SocketState::Starting);

        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        let interface = self.interface.clone();
        let role = self.role.clone();

        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                if let SsdpSocketRole::Multicast { group } = &role {
                    if let Err(err) = join_group(&socket, &interface, group) {
                        warn!(
                            interface = interface.name.as_str(),
                            error = %err,
                            "Failed to join SSDP multicast group"
                        );
                        state.set(SocketState::Stopped);
                        return;
                    }
                }
                state.set(SocketState::Ready);
                debug!(
                    interface = interface.name.as_str(),
                    address = %interface.address,
                    "SSDP socket ready"
                );

                let mut buf = [0u8; RECV_BUFFER_SIZE];
                loop {
                    if state.get() == SocketState::Stopping {
                        break;
                    }
                    match socket.recv_from(&mut buf) {
                        Ok((n, from)) => {
                            // A socket only ever sees its own family, but the
                            // check is cheap and guards exotic stacks.
                            if from.is_ipv4() != interface.address.is_ipv4() {
                                continue;
                            }
                            handler(&buf[..n], from);
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            if state.get() != SocketState::Stopping {
                                warn!(
                                    interface = interface.name.as_str(),
                                    error = %e,
                                    "SSDP receive failed"
                                );
                            }
                            break;
                        }
                    }
                }
                state.set(SocketState::Stopped);
            })
            .map_err(ControlPointError::network)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Send a datagram once the socket is ready (waits up to 3 seconds).
    pub fn send(&self, data: &[u8], to: SocketAddr) -> Result<(), ControlPointError> {
        if !self.state.wait_ready() {
            return Err(ControlPointError::InvalidState(
                "SSDP socket is not ready".to_string(),
            ));
        }
        self.socket
            .send_to(data, to)
            .map_err(ControlPointError::network)?;
        Ok(())
    }

    /// Stop the receive loop and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        match self.state.get() {
            SocketState::Stopped | SocketState::Stopping => {}
            _ => self.state.set(SocketState::Stopping),
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.state.set(SocketState::Stopped);
    }
}

impl Drop for SsdpServerDelegate {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_socket(
    interface: &InterfaceAddress,
    role: &SsdpSocketRole,
) -> Result<UdpSocket, ControlPointError> {
    let domain = if interface.address.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(ControlPointError::network)?;
    socket
        .set_reuse_address(true)
        .map_err(ControlPointError::network)?;

    let bind_addr: SocketAddr = match role {
        SsdpSocketRole::Multicast { group } => {
            // The well-known port on the wildcard of the matching family.
            let wildcard: IpAddr = if interface.address.is_ipv4() {
                "0.0.0.0".parse().unwrap()
            } else {
                "::".parse().unwrap()
            };
            SocketAddr::new(wildcard, group.port())
        }
        SsdpSocketRole::Unicast => match interface.address {
            // Ephemeral port on the interface itself, so responses carry the
            // interface as their destination.
            IpAddr::V4(v4) => SocketAddr::new(IpAddr::V4(v4), 0),
            IpAddr::V6(_) => SocketAddr::new("::".parse().unwrap(), 0),
        },
    };
    socket
        .bind(&bind_addr.into())
        .map_err(ControlPointError::network)?;

    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(READ_TIMEOUT))
        .map_err(ControlPointError::network)?;
    Ok(socket)
}

fn join_group(
    socket: &UdpSocket,
    interface: &InterfaceAddress,
    group: &SocketAddr,
) -> std::io::Result<()> {
    match (group.ip(), interface.address) {
        (IpAddr::V4(group_v4), IpAddr::V4(if_v4)) => {
            socket.join_multicast_v4(&group_v4, &if_v4)
        }
        (IpAddr::V6(group_v6), IpAddr::V6(_)) => {
            // get_if_addrs does not expose interface indices; join on the
            // default interface.
            socket.join_multicast_v6(&group_v6, 0)
        }
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "multicast group family does not match interface family",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loopback_interface() -> InterfaceAddress {
        InterfaceAddress {
            name: "lo-test".to_string(),
            address: "127.0.0.1".parse().unwrap(),
            prefix_length: 8,
        }
    }

    #[test]
    fn unicast_delegate_receives_datagrams() {
        let mut delegate =
            SsdpServerDelegate::new(loopback_interface(), SsdpSocketRole::Unicast, "test").unwrap();
        let port = delegate.local_port();
        assert_ne!(port, 0);

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        delegate
            .start(move |data, _from| {
                if data == b"ping" {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(b"ping", ("127.0.0.1", port))
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        delegate.stop();
    }

    #[test]
    fn send_waits_for_readiness() {
        let mut delegate =
            SsdpServerDelegate::new(loopback_interface(), SsdpSocketRole::Unicast, "test").unwrap();
        // Not started: send must refuse rather than block forever.
        let err = delegate
            .send(b"x", "127.0.0.1:9".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, ControlPointError::InvalidState(_)));

        delegate.start(|_, _| {}).unwrap();
        let target = UdpSocket::bind("127.0.0.1:0").unwrap();
        delegate
            .send(b"x", target.local_addr().unwrap())
            .unwrap();
        delegate.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut delegate =
            SsdpServerDelegate::new(loopback_interface(), SsdpSocketRole::Unicast, "test").unwrap();
        delegate.start(|_, _| {}).unwrap();
        delegate.stop();
        delegate.stop();
        // Send after stop observes not-ready.
        let err = delegate
            .send(b"x", "127.0.0.1:9".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, ControlPointError::InvalidState(_)));
    }
}
