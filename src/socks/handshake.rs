//! SOCKS5 client handshake (RFC 1928, RFC 1929).

use std::fmt;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::{Address, Reply, SocksError, VERSION};

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

const USER_PASS_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Username and password authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    username: String,
    password: String,
}

impl Auth {
    /// Create credentials. Each part must fit in 255 bytes.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Ask the proxy to open a TCP tunnel to `target`.
///
/// On success the stream carries the tunnel, and the proxy's bound address is
/// returned.
pub async fn connect<S>(
    stream: &mut S,
    target: &Address,
    auth: Option<&Auth>,
) -> Result<Address, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(stream, auth).await?;
    command(stream, CMD_CONNECT, target).await
}

/// Ask the proxy for a UDP relay.
///
/// `local` is the address datagrams will be sent from, or `0.0.0.0:0` when
/// unknown. The returned address is the relay to send framed datagrams to.
/// The relay lives as long as `stream` stays open.
pub async fn associate<S>(
    stream: &mut S,
    local: &Address,
    auth: Option<&Auth>,
) -> Result<Address, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(stream, auth).await?;
    command(stream, CMD_UDP_ASSOCIATE, local).await
}

async fn negotiate<S>(stream: &mut S, auth: Option<&Auth>) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = if auth.is_some() {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };

    stream.write_all(&[VERSION, 1, method]).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(SocksError::Version(reply[0]));
    }

    match reply[1] {
        METHOD_NONE_ACCEPTABLE => return Err(SocksError::NoAcceptableAuth),
        selected if selected != method => return Err(SocksError::MethodMismatch(selected)),
        _ => {}
    }

    let Some(auth) = auth else {
        trace!("socks5 negotiated without authentication");
        return Ok(());
    };

    let user = u8::try_from(auth.username.len()).map_err(|_| SocksError::CredentialsTooLong)?;
    let pass = u8::try_from(auth.password.len()).map_err(|_| SocksError::CredentialsTooLong)?;

    let mut buf = BytesMut::with_capacity(3 + auth.username.len() + auth.password.len());
    buf.put_u8(USER_PASS_VERSION);
    buf.put_u8(user);
    buf.put_slice(auth.username.as_bytes());
    buf.put_u8(pass);
    buf.put_slice(auth.password.as_bytes());
    stream.write_all(&buf).await?;

    stream.read_exact(&mut reply).await?;
    if reply[1] != 0 {
        return Err(SocksError::AuthFailed);
    }

    trace!("socks5 authenticated");
    Ok(())
}

async fn command<S>(stream: &mut S, cmd: u8, target: &Address) -> Result<Address, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(3 + target.encoded_len());
    buf.put_slice(&[VERSION, cmd, 0x00]);
    target.write_to(&mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(SocksError::Version(header[0]));
    }
    if header[1] != 0x00 {
        return Err(SocksError::Reply(Reply(header[1])));
    }

    let bound = Address::read(stream).await?;
    trace!(%target, %bound, cmd, "socks5 command accepted");
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::duplex;

    #[tokio::test]
    async fn connect_without_auth() {
        let (mut client, mut server) = duplex(1024);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut header = [0u8; 3];
            server.read_exact(&mut header).await.unwrap();
            assert_eq!(header, [0x05, 0x01, 0x00]);
            let target = Address::read(&mut server).await.unwrap();

            let mut reply = BytesMut::new();
            reply.put_slice(&[0x05, 0x00, 0x00]);
            Address::Ip("127.0.0.1:4000".parse().unwrap())
                .write_to(&mut reply)
                .unwrap();
            server.write_all(&reply).await.unwrap();
            server.write_all(b"tunnel").await.unwrap();
            target
        });

        let target = Address::Domain("example.com".into(), 443);
        let bound = connect(&mut client, &target, None).await.unwrap();
        assert_eq!(bound, Address::Ip("127.0.0.1:4000".parse().unwrap()));

        let mut tunnel = [0u8; 6];
        client.read_exact(&mut tunnel).await.unwrap();
        assert_eq!(&tunnel, b"tunnel");

        assert_eq!(proxy.await.unwrap(), target);
    }

    #[tokio::test]
    async fn connect_with_auth() {
        let (mut client, mut server) = duplex(1024);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x02]);
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = [0u8; 11];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, b"\x01\x04user\x04pass");
            server.write_all(&[0x01, 0x00]).await.unwrap();

            let mut header = [0u8; 3];
            server.read_exact(&mut header).await.unwrap();
            Address::read(&mut server).await.unwrap();
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let auth = Auth::new("user", "pass");
        let target = Address::new("10.1.2.3", 80);
        connect(&mut client, &target, Some(&auth)).await.unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_credentials() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();
            let mut auth = [0u8; 5];
            server.read_exact(&mut auth).await.unwrap();
            server.write_all(&[0x01, 0x01]).await.unwrap();
        });

        let auth = Auth::new("u", "p");
        let err = connect(&mut client, &Address::new("h", 1), Some(&auth))
            .await
            .unwrap_err();
        assert!(matches!(err, SocksError::AuthFailed));
    }

    #[tokio::test]
    async fn no_acceptable_method() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0xff]).await.unwrap();
        });

        let err = connect(&mut client, &Address::new("h", 1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SocksError::NoAcceptableAuth));
    }

    #[tokio::test]
    async fn command_refused() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut header = [0u8; 3];
            server.read_exact(&mut header).await.unwrap();
            Address::read(&mut server).await.unwrap();
            server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = connect(&mut client, &Address::new("h", 1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SocksError::Reply(Reply(0x05))));
        assert_eq!(
            err.to_string(),
            "proxy replied: connection refused (0x05)"
        );
    }

    #[tokio::test]
    async fn associate_returns_relay() {
        let (mut client, mut server) = duplex(1024);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut header = [0u8; 3];
            server.read_exact(&mut header).await.unwrap();
            assert_eq!(header, [0x05, 0x03, 0x00]);
            let local = Address::read(&mut server).await.unwrap();

            let mut reply = BytesMut::new();
            reply.put_slice(&[0x05, 0x00, 0x00]);
            Address::Ip("127.0.0.1:5000".parse().unwrap())
                .write_to(&mut reply)
                .unwrap();
            server.write_all(&reply).await.unwrap();
            local
        });

        let local = Address::Ip("0.0.0.0:0".parse().unwrap());
        let relay = associate(&mut client, &local, None).await.unwrap();
        assert_eq!(relay, Address::Ip("127.0.0.1:5000".parse().unwrap()));
        assert_eq!(proxy.await.unwrap(), local);
    }

    #[test]
    fn auth_debug_redacts_password() {
        let auth = Auth::new("user", "hunter2");
        let debug = format!("{auth:?}");
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
    }
}
