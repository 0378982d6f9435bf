//! SOCKS5 UDP relay framing.
//!
//! Every datagram exchanged with the relay carries a header:
//! two reserved zero bytes, a fragment number (always zero here), and an
//! address record naming the remote peer. The payload follows.

use std::io;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::trace;

use super::{Address, SocksError};

/// Largest payload that fits in one IPv4 UDP datagram.
pub const MAX_UDP_PACKET: usize = u16::MAX as usize - 28;

const RESERVED: [u8; 3] = [0, 0, 0];

/// Frame `payload` for delivery to `target` through the relay.
pub fn encode_datagram(
    target: &Address,
    payload: &[u8],
    buf: &mut BytesMut,
) -> Result<(), SocksError> {
    buf.reserve(RESERVED.len() + target.encoded_len() + payload.len());
    buf.put_slice(&RESERVED);
    target.write_to(buf)?;
    buf.put_slice(payload);
    Ok(())
}

/// Split a datagram received from the relay into the peer address and payload.
pub fn decode_datagram(mut packet: Bytes) -> Result<(Address, Bytes), SocksError> {
    if packet.len() < RESERVED.len() {
        return Err(SocksError::BadHeader);
    }

    // Fragment reassembly is not supported.
    if packet[2] != 0 {
        return Err(SocksError::BadHeader);
    }

    packet.advance(RESERVED.len());
    let address = Address::read_from(&mut packet)?;
    Ok((address, packet))
}

/// A UDP socket which exchanges framed datagrams with a SOCKS5 relay.
#[derive(Debug)]
pub struct UdpRelay {
    socket: UdpSocket,
    relay: SocketAddr,
}

impl UdpRelay {
    /// Bind a local socket which talks to the relay at `relay`.
    pub async fn bind<A: ToSocketAddrs>(local: A, relay: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::new(socket, relay))
    }

    /// Use an existing socket.
    pub fn new(socket: UdpSocket, relay: SocketAddr) -> Self {
        Self { socket, relay }
    }

    /// The relay's address.
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
    }

    /// The local socket address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send `payload` to `target` through the relay. Returns the payload length.
    pub async fn send_to(&self, payload: &[u8], target: &Address) -> Result<usize, SocksError> {
        let mut buf = BytesMut::new();
        encode_datagram(target, payload, &mut buf)?;
        self.socket.send_to(&buf, self.relay).await?;
        Ok(payload.len())
    }

    /// Receive one payload, returning its length and the peer that sent it.
    ///
    /// Datagrams which did not come from the relay are discarded. The payload
    /// is truncated if `buf` is too small.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address), SocksError> {
        let mut packet = vec![0u8; MAX_UDP_PACKET];
        loop {
            let (n, from) = self.socket.recv_from(&mut packet).await?;
            if from != self.relay {
                trace!(%from, relay = %self.relay, "dropping datagram from unexpected source");
                continue;
            }

            let (address, payload) = decode_datagram(Bytes::copy_from_slice(&packet[..n]))?;
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            return Ok((len, address));
        }
    }
}
