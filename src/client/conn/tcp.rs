//! Plain TCP connections, configured with socket2.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tracing::{trace, warn};

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
pub(crate) struct TcpConfig {
    /// The timeout for connecting to a single remote address.
    pub(crate) connect_timeout: Option<Duration>,

    /// Idle time before keep-alive probes start.
    pub(crate) keep_alive: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub(crate) nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            keep_alive: Some(Duration::from_secs(90)),
            nodelay: true,
        }
    }
}

/// Resolve `host` and connect to the first address that accepts.
#[tracing::instrument(skip(config), level = "debug")]
pub(crate) async fn connect_host(host: &str, port: u16, config: &TcpConfig) -> io::Result<TcpStream> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();

    let mut last = None;
    for addr in addrs {
        match connect(&addr, config)?.await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                trace!(%addr, %error, "tcp connect attempt failed");
                last = Some(error);
            }
        }
    }

    Err(last.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {host}"),
        )
    }))
}

fn connect(
    addr: &SocketAddr,
    config: &TcpConfig,
) -> io::Result<impl std::future::Future<Output = io::Result<TcpStream>>> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;

    // Tokio requires O_NONBLOCK on sockets it adopts.
    socket.set_nonblocking(true)?;

    if let Some(dur) = config.keep_alive {
        let conf = TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket.set_tcp_keepalive(&conf) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    if let Err(e) = socket.set_linger(Some(Duration::ZERO)) {
        warn!("tcp set_linger error: {}", e);
    }

    let socket = TcpSocket::from_std_stream(socket.into());
    let connect = socket.connect(*addr);
    let timeout = config.connect_timeout;
    let nodelay = config.nodelay;

    Ok(async move {
        let stream = match timeout {
            Some(dur) => match tokio::time::timeout(dur, connect).await {
                Ok(result) => result?,
                Err(e) => return Err(io::Error::new(io::ErrorKind::TimedOut, e)),
            },
            None => connect.await?,
        };

        if let Err(e) = stream.set_nodelay(nodelay) {
            warn!("tcp set_nodelay error: {}", e);
        }
        Ok(stream)
    })
}
