//! Back-pressure client (component C8): a small binary protocol to an
//! out-of-band kernel module tracking per-flow content length and
//! chunked-end so it can shape delivery without parsing HTTP itself.
//!
//! The transport is abstracted behind [`BpTransport`] rather than hard-coded
//! to a socket type — the control channel is deployment-specific (a
//! `UnixDatagram`, a raw `AF_NETLINK` socket, or in this crate's default, a
//! connected UDP socket) — following the same pattern as [`CacheClient`]:
//! the real collaborator lives outside the crate, which only speaks the
//! wire contract and provides a connected-UDP implementation plus an
//! in-memory fake for tests.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use byteorder::{BigEndian, WriteBytesExt};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    AddDel = 0,
    SetLen = 1,
    ChkEnd = 2,
}

/// The 19-byte wire record: `content_len: u64`, `cl_ip_be: u32`,
/// `rm_ip_be: u32`, `cl_port_be: u16`, `op: u8`, all big-endian.
#[derive(Debug, Clone, Copy)]
pub struct BpCommand {
    pub content_len: u64,
    pub client_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub client_port: u16,
    pub op: Op,
}

impl BpCommand {
    fn encode(&self) -> [u8; 19] {
        let mut buf = Vec::with_capacity(19);
        buf.write_u64::<BigEndian>(self.content_len).unwrap();
        buf.write_u32::<BigEndian>(u32::from(self.client_ip)).unwrap();
        buf.write_u32::<BigEndian>(u32::from(self.remote_ip)).unwrap();
        buf.write_u16::<BigEndian>(self.client_port).unwrap();
        buf.push(self.op as u8);
        let mut out = [0u8; 19];
        out.copy_from_slice(&buf);
        out
    }
}

#[async_trait]
pub trait BpTransport: Send + Sync {
    async fn send(&self, record: &[u8; 19]) -> Result<()>;
}

/// Connected-UDP implementation of the control channel.
pub struct UdpBpTransport {
    socket: UdpSocket,
}

impl UdpBpTransport {
    pub async fn connect(local: SocketAddr, control: SocketAddr) -> Result<UdpBpTransport> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(control).await?;
        Ok(UdpBpTransport { socket })
    }
}

#[async_trait]
impl BpTransport for UdpBpTransport {
    async fn send(&self, record: &[u8; 19]) -> Result<()> {
        let n = self.socket.send(record).await?;
        if n != record.len() {
            return Err(Error::new_backpressure("short write to back-pressure control socket"));
        }
        Ok(())
    }
}

/// Per-connection client over a [`BpTransport`]. Failure to send any
/// command escalates to `try_blind_tunnel` at the call site; this
/// type only reports the error, it doesn't decide the fallback.
pub struct BpClient {
    transport: std::sync::Arc<dyn BpTransport>,
    client_addr: SocketAddr,
    remote_addr: SocketAddr,
    length_sent: bool,
}

impl BpClient {
    pub fn new(transport: std::sync::Arc<dyn BpTransport>, client_addr: SocketAddr, remote_addr: SocketAddr) -> BpClient {
        BpClient {
            transport,
            client_addr,
            remote_addr,
            length_sent: false,
        }
    }

    fn endpoints(&self) -> Option<(Ipv4Addr, Ipv4Addr, u16)> {
        match (self.client_addr, self.remote_addr) {
            (SocketAddr::V4(c), SocketAddr::V4(r)) => Some((*c.ip(), *r.ip(), c.port())),
            _ => None,
        }
    }

    pub async fn add_entry(&self) -> Result<()> {
        self.send(0, Op::AddDel).await
    }

    pub async fn del_entry(&self) -> Result<()> {
        self.send(0, Op::AddDel).await
    }

    /// Sent at most once per transaction.
    pub async fn set_content_length(&mut self, len: u64) -> Result<()> {
        if self.length_sent {
            return Ok(());
        }
        self.send(len, Op::SetLen).await?;
        self.length_sent = true;
        Ok(())
    }

    pub async fn mark_chunked_end(&self) -> Result<()> {
        self.send(0, Op::ChkEnd).await
    }

    async fn send(&self, content_len: u64, op: Op) -> Result<()> {
        let (client_ip, remote_ip, client_port) = self
            .endpoints()
            .ok_or_else(|| Error::new_backpressure("back-pressure control requires IPv4 endpoints"))?;
        let cmd = BpCommand {
            content_len,
            client_ip,
            remote_ip,
            client_port,
            op,
        };
        self.transport.send(&cmd.encode()).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<[u8; 19]>>,
    }

    #[async_trait]
    impl BpTransport for RecordingTransport {
        async fn send(&self, record: &[u8; 19]) -> Result<()> {
            self.sent.lock().unwrap().push(*record);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingTransport;
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_content_length_is_sent_only_once() {
        let transport = Arc::new(RecordingTransport::default());
        let mut client = BpClient::new(
            transport.clone(),
            "127.0.0.1:1111".parse().unwrap(),
            "127.0.0.1:2222".parse().unwrap(),
        );
        client.set_content_length(100).await.unwrap();
        client.set_content_length(100).await.unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn encode_is_nineteen_bytes_big_endian() {
        let cmd = BpCommand {
            content_len: 1,
            client_ip: Ipv4Addr::new(127, 0, 0, 1),
            remote_ip: Ipv4Addr::new(10, 0, 0, 1),
            client_port: 80,
            op: Op::SetLen,
        };
        let encoded = cmd.encode();
        assert_eq!(encoded.len(), 19);
        assert_eq!(&encoded[0..8], &1u64.to_be_bytes());
        assert_eq!(encoded[18], Op::SetLen as u8);
    }
}
