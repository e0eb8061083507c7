//! Raw HCI socket bound to one adapter.

use crate::sock::{
    self, sock_io,
    sys::{hci_filter, sockaddr_hci, BTPROTO_HCI, HCI_CHANNEL_RAW, HCI_FILTER, SOL_HCI},
    OwnedFd, SysSockAddr,
};
use btdirect_core::hci::HciFilter;
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
}

impl SysSockAddr for SocketAddr {
    type SysSockAddr = sockaddr_hci;

    fn into_sys_sock_addr(self) -> Self::SysSockAddr {
        sockaddr_hci {
            hci_family: AF_BLUETOOTH as _,
            hci_dev: self.dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        }
    }
}

pub struct HciSocket {
    fd: AsyncFd<OwnedFd>,
}

impl fmt::Debug for HciSocket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HciSocket")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

impl HciSocket {
    /// Opens the raw channel of the given adapter.
    pub fn open(dev_id: u16) -> Result<HciSocket> {
        let fd = sock::socket(AF_BLUETOOTH, SOCK_RAW, BTPROTO_HCI)?;
        sock::bind(&fd, SocketAddr { dev_id })?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Installs the kernel event filter.
    pub fn set_filter(&self, filter: &HciFilter) -> Result<()> {
        let raw = hci_filter {
            type_mask: filter.type_mask,
            event_mask: filter.event_mask,
            opcode: filter.opcode,
        };
        sock::setsockopt(self.fd.get_ref(), SOL_HCI, HCI_FILTER, &raw)
    }

    /// Sends one frame, packet type octet included.
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.send_priv(buf).await
    }

    /// Receives one frame.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv_priv(buf).await
    }

    sock_io!();
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
