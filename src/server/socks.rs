//! SOCKS5 proxying for connections whose first byte is `0x05`.
//!
//! CONNECT-only, no authentication. The handler receives the connection
//! with the peeked bytes already replayed, performs the handshake, dials
//! the requested destination, and pumps bytes both ways until either side
//! closes.

use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve one SOCKS5 session on an already-accepted connection.
pub async fn handle<S>(mut stream: S, remote_addr: SocketAddr) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: version + advertised auth methods.
    let mut buf = [0u8; 255];
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(io::Error::other(format!("invalid SOCKS version {:#04x}", buf[0])));
    }
    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: version, command, reserved, address type.
    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(io::Error::other("invalid SOCKS version in request"));
    }
    let cmd = buf[1];
    let atyp = buf[3];

    if cmd != CMD_CONNECT {
        reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(io::Error::other(format!("unsupported SOCKS command {cmd}")));
    }

    let destination = read_destination(&mut stream, atyp).await?;
    debug!(remote_addr = %remote_addr, destination, "SOCKS5 CONNECT");

    let mut target =
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&destination)).await {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                reply(&mut stream, REPLY_HOST_UNREACHABLE).await?;
                return Err(e);
            }
            Err(_) => {
                reply(&mut stream, REPLY_HOST_UNREACHABLE).await?;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            }
        };
    reply(&mut stream, REPLY_SUCCESS).await?;

    let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut target).await?;
    info!(remote_addr = %remote_addr, destination, up, down, "SOCKS5 session finished");
    Ok(())
}

async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8) -> io::Result<()> {
    // Bind address in the reply is always 0.0.0.0:0; clients ignore it for CONNECT.
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
}

/// Read the destination address for the given address type and render it as
/// a dialable `host:port` string.
async fn read_destination<S: AsyncRead + Unpin>(stream: &mut S, atyp: u8) -> io::Result<String> {
    match atyp {
        // IPv4
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = read_port(stream).await?;
            Ok(format!("{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port))
        }
        // Domain name
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = read_port(stream).await?;
            Ok(format!("{}:{}", String::from_utf8_lossy(&name), port))
        }
        // IPv6
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = read_port(stream).await?;
            Ok(format!("[{}]:{}", Ipv6Addr::from(ip), port))
        }
        other => Err(io::Error::other(format!("unsupported address type {other}"))),
    }
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_destination_ipv4() {
        let mut input: &[u8] = &[127, 0, 0, 1, 0x1f, 0x90];
        let dest = read_destination(&mut input, 0x01).await.unwrap();
        assert_eq!(dest, "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_read_destination_domain() {
        let mut input: &[u8] = &[11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm', 0x01, 0xbb];
        let dest = read_destination(&mut input, 0x03).await.unwrap();
        assert_eq!(dest, "example.com:443");
    }

    #[tokio::test]
    async fn test_read_destination_ipv6() {
        let mut bytes = vec![0u8; 16];
        bytes[15] = 1;
        bytes.extend_from_slice(&80u16.to_be_bytes());
        let mut input: &[u8] = &bytes;
        let dest = read_destination(&mut input, 0x04).await.unwrap();
        assert_eq!(dest, "[::1]:80");
    }

    #[tokio::test]
    async fn test_unknown_address_type_is_rejected() {
        let mut input: &[u8] = &[0, 0];
        assert!(read_destination(&mut input, 0x09).await.is_err());
    }
}
