//! L2CAP sequential-packet sockets.
//!
//! The ATT bearer is a seqpacket socket on the fixed channel id 4: the
//! kernel preserves datagram boundaries, so one read is one ATT PDU.

use crate::sock::{self, bdaddr_type, sock_io, sys::sockaddr_l2, OwnedFd, SysSockAddr};
use btdirect_core::att::ATT_CID;
use btdirect_shared::{Address, AddressType};
use libc::{
    c_int, AF_BLUETOOTH, EAGAIN, EINPROGRESS, SOCK_SEQPACKET, SOL_SOCKET, SO_ERROR,
};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    net::Shutdown,
    os::unix::io::{AsRawFd, RawFd},
};
use tokio::io::{unix::AsyncFd, ReadBuf};

use super::sys::BTPROTO_L2CAP;

/// An L2CAP socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddr {
    pub addr: Address,
    pub addr_type: AddressType,
    /// Protocol service multiplexor; 0 for fixed-channel use.
    pub psm: u16,
    /// Channel id; [ATT_CID] for the ATT fixed channel.
    pub cid: u16,
}

impl SocketAddr {
    pub fn att(addr: Address, addr_type: AddressType) -> Self {
        Self {
            addr,
            addr_type,
            psm: 0,
            cid: ATT_CID,
        }
    }
}

impl SysSockAddr for SocketAddr {
    type SysSockAddr = sockaddr_l2;

    fn into_sys_sock_addr(self) -> Self::SysSockAddr {
        sockaddr_l2 {
            l2_family: AF_BLUETOOTH as _,
            l2_psm: self.psm.to_le(),
            l2_cid: self.cid.to_le(),
            l2_bdaddr: self.addr.into(),
            l2_bdaddr_type: bdaddr_type(self.addr_type).unwrap_or(0),
        }
    }
}

/// A connected L2CAP sequential-packet socket.
pub struct SeqPacket {
    fd: AsyncFd<OwnedFd>,
}

impl fmt::Debug for SeqPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SeqPacket")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

impl SeqPacket {
    /// Opens the ATT fixed channel to `peer`, bound to the local adapter's
    /// address.
    pub async fn connect_att(
        local: Address,
        local_type: AddressType,
        peer: Address,
        peer_type: AddressType,
    ) -> Result<SeqPacket> {
        bdaddr_type(peer_type)?;
        let fd = sock::socket(AF_BLUETOOTH, SOCK_SEQPACKET, BTPROTO_L2CAP)?;
        sock::bind(&fd, SocketAddr::att(local, local_type))?;
        let socket = Self {
            fd: AsyncFd::new(fd)?,
        };
        socket.connect_priv(SocketAddr::att(peer, peer_type)).await?;
        Ok(socket)
    }

    async fn connect_priv(&self, sa: SocketAddr) -> Result<()> {
        match sock::connect(self.fd.get_ref(), sa) {
            Ok(()) => Ok(()),
            Err(err)
                if err.raw_os_error() == Some(EINPROGRESS)
                    || err.raw_os_error() == Some(EAGAIN) =>
            {
                loop {
                    let mut guard = self.fd.writable().await?;
                    match guard.try_io(|inner| {
                        let err: c_int = sock::getsockopt(inner.get_ref(), SOL_SOCKET, SO_ERROR)?;
                        match err {
                            0 => Ok(()),
                            EINPROGRESS | EAGAIN => Err(ErrorKind::WouldBlock.into()),
                            _ => Err(Error::from_raw_os_error(err)),
                        }
                    }) {
                        Ok(result) => break result,
                        Err(_would_block) => continue,
                    }
                }?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Sends one packet; its length must not exceed the channel MTU.
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.send_priv(buf).await
    }

    /// Receives one packet; a short buffer truncates it.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv_priv(buf).await
    }

    /// Shuts down the read, write, or both halves of this connection.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.shutdown_priv(how)
    }

    sock_io!();
}

impl AsRawFd for SeqPacket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
