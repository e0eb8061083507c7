//! The kernel's Bluetooth management control socket.
//!
//! A raw HCI-protocol socket bound to no device on the control channel;
//! each datagram is one MGMT frame.

use crate::sock::{
    self, sock_io,
    sys::{sockaddr_hci, BTPROTO_HCI, HCI_CHANNEL_CONTROL, HCI_DEV_NONE},
    OwnedFd, SysSockAddr,
};
use libc::{AF_BLUETOOTH, SOCK_RAW};
use std::{
    fmt,
    io::Result,
    os::unix::io::{AsRawFd, RawFd},
};
use tokio::io::{unix::AsyncFd, ReadBuf};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddr {
    pub dev_id: u16,
    pub channel: u16,
}

impl SysSockAddr for SocketAddr {
    type SysSockAddr = sockaddr_hci;

    fn into_sys_sock_addr(self) -> Self::SysSockAddr {
        sockaddr_hci {
            hci_family: AF_BLUETOOTH as _,
            hci_dev: self.dev_id,
            hci_channel: self.channel,
        }
    }
}

pub struct MgmtSocket {
    fd: AsyncFd<OwnedFd>,
}

impl fmt::Debug for MgmtSocket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MgmtSocket")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

impl MgmtSocket {
    /// Opens the control channel bound to no device.
    pub fn open() -> Result<MgmtSocket> {
        let fd = sock::socket(AF_BLUETOOTH, SOCK_RAW, BTPROTO_HCI)?;
        sock::bind(
            &fd,
            SocketAddr {
                dev_id: HCI_DEV_NONE,
                channel: HCI_CHANNEL_CONTROL,
            },
        )?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Sends one MGMT frame.
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.send_priv(buf).await
    }

    /// Receives one MGMT frame.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv_priv(buf).await
    }

    sock_io!();
}

impl AsRawFd for MgmtSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
