//! Per-query SOCKS5 exchange
//!
//! Every DNS query travels over a fresh TCP connection to the local SOCKS5
//! proxy, which CONNECTs to the chosen upstream resolver on port 53. The DNS
//! payload uses the RFC 1035 TCP framing (2-byte big-endian length prefix)
//! in both directions, even when the original client spoke UDP.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Remote DNS port reached through the proxy
const UPSTREAM_DNS_PORT: u16 = 53;

/// Largest response we accept from an upstream
const MAX_RESPONSE_SIZE: usize = 65535;

/// Forward one DNS query to `upstream:53` through the SOCKS5 proxy at
/// `127.0.0.1:<socks_port>` and return the raw response body.
///
/// `timeout` bounds each phase (connect, handshake, exchange) separately.
pub async fn query_via_socks(
    socks_port: u16,
    upstream: Ipv4Addr,
    query: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    let proxy: SocketAddr = (Ipv4Addr::LOCALHOST, socks_port).into();

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(proxy))
        .await
        .map_err(|_| Error::Timeout(format!("connect to SOCKS proxy {}", proxy)))?
        .map_err(|e| Error::Socks(format!("connect to {}: {}", proxy, e)))?;

    tokio::time::timeout(timeout, handshake(&mut stream, upstream))
        .await
        .map_err(|_| Error::Timeout("SOCKS5 handshake".into()))??;

    tokio::time::timeout(timeout, exchange(&mut stream, query))
        .await
        .map_err(|_| Error::Timeout("DNS exchange over SOCKS5".into()))?
}

/// Greeting + CONNECT request
async fn handshake(stream: &mut TcpStream, upstream: Ipv4Addr) -> Result<()> {
    // VER, NMETHODS=1, METHOD=no-auth
    stream
        .write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
        .await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION || reply[1] != METHOD_NO_AUTH {
        return Err(Error::Socks(format!(
            "proxy rejected no-auth method (version {}, method {:#04x})",
            reply[0], reply[1]
        )));
    }

    // CONNECT to the upstream resolver
    let mut request = Vec::with_capacity(10);
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4]);
    request.extend_from_slice(&upstream.octets());
    request.extend_from_slice(&UPSTREAM_DNS_PORT.to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != 0x00 {
        return Err(Error::Socks(format!(
            "CONNECT to {} refused (status {:#04x})",
            upstream, header[1]
        )));
    }

    // Consume the bound address so the stream is positioned at payload
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        other => {
            return Err(Error::Socks(format!(
                "unknown address type {:#04x} in CONNECT reply",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

/// Length-framed write of the query and read of the response
async fn exchange(stream: &mut TcpStream, query: &[u8]) -> Result<Vec<u8>> {
    if query.len() > MAX_RESPONSE_SIZE {
        return Err(Error::Dns("query exceeds 65535 bytes".into()));
    }

    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    if len == 0 {
        return Err(Error::Dns("upstream returned an empty response".into()));
    }

    let mut response = vec![0u8; len];
    stream.read_exact(&mut response).await?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal in-process SOCKS5 server that answers one framed DNS query
    /// with a canned response.
    async fn fake_socks_server(response: Vec<u8>) -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut connect = [0u8; 10];
            stream.read_exact(&mut connect).await.unwrap();
            assert_eq!(connect[0], 0x05);
            assert_eq!(connect[1], 0x01);
            assert_eq!(connect[3], 0x01);
            assert_eq!(u16::from_be_bytes([connect[8], connect[9]]), 53);
            // Reply: success, bound to 0.0.0.0:0
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = usize::from(u16::from_be_bytes(len_buf));
            let mut query = vec![0u8; len];
            stream.read_exact(&mut query).await.unwrap();

            let mut framed = Vec::new();
            framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
            framed.extend_from_slice(&response);
            stream.write_all(&framed).await.unwrap();
        });

        port
    }

    #[tokio::test]
    async fn test_query_roundtrip() {
        let canned = vec![0xAB; 32];
        let port = fake_socks_server(canned.clone()).await;

        let response = query_via_socks(
            port,
            Ipv4Addr::new(1, 1, 1, 1),
            &[0u8; 16],
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(response, canned);
    }

    #[tokio::test]
    async fn test_unreachable_proxy() {
        // Port 1 is essentially never listening
        let err = query_via_socks(
            1,
            Ipv4Addr::new(1, 1, 1, 1),
            &[0u8; 16],
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Socks(_) | Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_proxy_rejecting_method() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            // 0xFF: no acceptable methods
            stream.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let err = query_via_socks(
            port,
            Ipv4Addr::new(1, 1, 1, 1),
            &[0u8; 16],
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Socks(_)));
    }
}
