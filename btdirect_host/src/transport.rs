//! Socket-backed implementations of the core transport traits.

use crate::sock::{hci::HciSocket, l2cap::SeqPacket, mgmt::MgmtSocket};
use async_trait::async_trait;
use btdirect_core::att::ATT_VALUE_MAX;
use btdirect_core::gatt::AttBearer;
use btdirect_core::hci::HciTransport;
use btdirect_core::mgmt::MgmtTransport;
use bytes::{Bytes, BytesMut};
use std::io::{Error, ErrorKind, Result};

// Largest MGMT frame this stack reads: header plus a DeviceFound payload
// with full-size EIR data.
const MGMT_READ_BUF: usize = 1024;
// Packet type + event header + 255 octets of parameters.
const HCI_READ_BUF: usize = 512;
const ATT_READ_BUF: usize = ATT_VALUE_MAX as usize;

fn recv_frame(n: usize, buf: &[u8]) -> Result<BytesMut> {
    if n == 0 {
        return Err(Error::new(ErrorKind::UnexpectedEof, "socket closed by peer"));
    }
    Ok(BytesMut::from(&buf[..n]))
}

#[derive(Debug)]
pub struct MgmtSocketTransport {
    sock: MgmtSocket,
}

impl MgmtSocketTransport {
    pub fn new(sock: MgmtSocket) -> Self {
        Self { sock }
    }
}

#[async_trait]
impl MgmtTransport for MgmtSocketTransport {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.sock.send(&frame).await.map(|_| ())
    }

    async fn recv(&self) -> Result<BytesMut> {
        let mut buf = [0u8; MGMT_READ_BUF];
        let n = self.sock.recv(&mut buf).await?;
        recv_frame(n, &buf)
    }
}

#[derive(Debug)]
pub struct HciSocketTransport {
    sock: HciSocket,
}

impl HciSocketTransport {
    pub fn new(sock: HciSocket) -> Self {
        Self { sock }
    }
}

#[async_trait]
impl HciTransport for HciSocketTransport {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.sock.send(&frame).await.map(|_| ())
    }

    async fn recv(&self) -> Result<BytesMut> {
        let mut buf = [0u8; HCI_READ_BUF];
        let n = self.sock.recv(&mut buf).await?;
        recv_frame(n, &buf)
    }
}

#[derive(Debug)]
pub struct L2capAttBearer {
    sock: SeqPacket,
}

impl L2capAttBearer {
    pub fn new(sock: SeqPacket) -> Self {
        Self { sock }
    }
}

#[async_trait]
impl AttBearer for L2capAttBearer {
    async fn send(&self, pdu: Bytes) -> Result<()> {
        self.sock.send(&pdu).await.map(|_| ())
    }

    async fn recv(&self) -> Result<BytesMut> {
        let mut buf = [0u8; ATT_READ_BUF];
        let n = self.sock.recv(&mut buf).await?;
        recv_frame(n, &buf)
    }
}
