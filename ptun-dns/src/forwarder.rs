//! DNS forwarder
//!
//! Listens for DNS queries on loopback (UDP and TCP simultaneously) and
//! forwards each one over the local SOCKS5 proxy to a configured upstream
//! resolver, caching responses by TTL. When port 53 is unavailable the UDP
//! listener falls back to 5353 and TCP is skipped; clients pointed at
//! 127.0.0.1:53 will then fail, which is logged and tolerated.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, Mutex};

use crate::cache::{patch_transaction_id, CacheKey, DnsCache, MAX_ENTRIES};
use crate::error::{Error, Result};
use crate::socks::query_via_socks;

/// Maximum DNS message size accepted over UDP
const MAX_UDP_MESSAGE_SIZE: usize = 4096;

/// Minimum length of a well-formed DNS message (header)
const MIN_QUERY_SIZE: usize = 12;

/// Timeout applied to each SOCKS5 attempt
const SOCKS_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts per upstream before failing over to the next one
const ATTEMPTS_PER_UPSTREAM: u32 = 3;

/// Backoff after the n-th failed attempt
const RETRY_BACKOFF_MS: [u64; 3] = [100, 200, 400];

/// Every this many consecutive failures, escalate the counter to a warning
const FAILURE_LOG_INTERVAL: u64 = 10;

/// Forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Local SOCKS5 proxy port the tunnel client listens on
    pub socks_port: u16,
    /// Upstream resolvers, queried in order with failover
    pub upstreams: Vec<Ipv4Addr>,
    /// Preferred listen port
    pub listen_port: u16,
    /// UDP fallback port used when the preferred port is taken
    pub fallback_port: u16,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            socks_port: 1080,
            upstreams: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
            listen_port: 53,
            fallback_port: 5353,
        }
    }
}

/// In-process DNS forwarder
#[derive(Debug)]
pub struct DnsForwarder {
    udp: Arc<UdpSocket>,
    tcp: Option<TcpListener>,
    resolver: Arc<Resolver>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl DnsForwarder {
    /// Bind the listening sockets
    ///
    /// Fails only when neither the preferred nor the fallback UDP port can
    /// be bound; a missing TCP listener is tolerated.
    pub async fn bind(config: ForwarderConfig, shutdown_rx: broadcast::Receiver<()>) -> Result<Self> {
        if config.upstreams.is_empty() {
            return Err(Error::Config("no upstream DNS servers configured".into()));
        }

        let preferred: SocketAddr = (Ipv4Addr::LOCALHOST, config.listen_port).into();
        let udp = match UdpSocket::bind(preferred).await {
            Ok(socket) => socket,
            Err(e) => {
                let fallback: SocketAddr = (Ipv4Addr::LOCALHOST, config.fallback_port).into();
                log::warn!(
                    "DNS forwarder cannot bind UDP {} ({}), falling back to {}",
                    preferred,
                    e,
                    fallback
                );
                UdpSocket::bind(fallback).await.map_err(|e| {
                    Error::Config(format!("cannot bind DNS forwarder on {}: {}", fallback, e))
                })?
            }
        };

        let tcp = match TcpListener::bind(preferred).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                log::warn!(
                    "DNS forwarder cannot bind TCP {} ({}), TCP queries disabled",
                    preferred,
                    e
                );
                None
            }
        };

        log::info!(
            "DNS forwarder listening on UDP {}{}",
            udp.local_addr()?,
            if tcp.is_some() { " and TCP" } else { "" }
        );

        Ok(Self {
            udp: Arc::new(udp),
            tcp,
            resolver: Arc::new(Resolver {
                socks_port: config.socks_port,
                upstreams: config.upstreams,
                cache: Mutex::new(DnsCache::new(MAX_ENTRIES)),
                consecutive_failures: AtomicU64::new(0),
            }),
            shutdown_rx,
        })
    }

    /// Port the UDP listener actually bound to
    pub fn udp_port(&self) -> u16 {
        self.udp.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Port the TCP listener bound to, when one exists
    pub fn tcp_port(&self) -> Option<u16> {
        self.tcp
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    /// Shared resolver handle, used to read cache statistics
    pub fn resolver(&self) -> Arc<Resolver> {
        self.resolver.clone()
    }

    /// Serve queries until the shutdown signal fires
    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    log::info!("DNS forwarder shutting down");
                    break;
                }

                result = self.udp.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            let query = buf[..len].to_vec();
                            let socket = self.udp.clone();
                            let resolver = self.resolver.clone();
                            tokio::spawn(async move {
                                if let Some(response) = resolver.resolve(&query).await {
                                    if let Err(e) = socket.send_to(&response, src).await {
                                        log::debug!("UDP response to {} failed: {}", src, e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            log::error!("DNS forwarder UDP recv error: {}", e);
                        }
                    }
                }

                result = accept_or_pending(self.tcp.as_ref()) => {
                    match result {
                        Ok((stream, src)) => {
                            let resolver = self.resolver.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_tcp_client(stream, resolver).await {
                                    log::debug!("TCP DNS client {} failed: {}", src, e);
                                }
                            });
                        }
                        Err(e) => {
                            log::error!("DNS forwarder TCP accept error: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Accept on the TCP listener, or pend forever when TCP is disabled
async fn accept_or_pending(
    tcp: Option<&TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match tcp {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Serve length-framed queries on one TCP connection until EOF
async fn serve_tcp_client(mut stream: TcpStream, resolver: Arc<Resolver>) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = usize::from(u16::from_be_bytes(len_buf));
        if len == 0 {
            return Ok(());
        }

        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        let Some(response) = resolver.resolve(&query).await else {
            // Nothing to answer with; drop the connection so the client retries
            return Ok(());
        };

        let mut framed = Vec::with_capacity(response.len() + 2);
        framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
        framed.extend_from_slice(&response);
        stream.write_all(&framed).await?;
    }
}

/// Shared query resolution: cache, SOCKS5 exchange, upstream failover
#[derive(Debug)]
pub struct Resolver {
    socks_port: u16,
    upstreams: Vec<Ipv4Addr>,
    cache: Mutex<DnsCache>,
    consecutive_failures: AtomicU64,
}

impl Resolver {
    /// Resolve one raw query; `None` means no answer (the client times out)
    pub async fn resolve(&self, query: &[u8]) -> Option<Vec<u8>> {
        if query.len() < MIN_QUERY_SIZE {
            log::debug!("Dropping {}-byte DNS query (too short)", query.len());
            return None;
        }

        let txid = u16::from_be_bytes([query[0], query[1]]);
        let key = cache_key_of(query);

        if let Some(ref key) = key {
            let mut cache = self.cache.lock().await;
            if let Some(mut body) = cache.get(key) {
                patch_transaction_id(&mut body, txid);
                return Some(body);
            }
        }

        let response = self.forward(query).await?;

        if let Some(key) = key {
            self.cache.lock().await.insert(key, &response);
        }
        Some(response)
    }

    /// Try every upstream in order, with bounded retries per upstream
    async fn forward(&self, query: &[u8]) -> Option<Vec<u8>> {
        for upstream in &self.upstreams {
            for attempt in 0..ATTEMPTS_PER_UPSTREAM {
                match query_via_socks(self.socks_port, *upstream, query, SOCKS_TIMEOUT).await {
                    Ok(response) if response.len() >= MIN_QUERY_SIZE => {
                        self.consecutive_failures.store(0, Ordering::Relaxed);
                        return Some(response);
                    }
                    Ok(response) => {
                        // Malformed body: give up on this upstream entirely
                        log::debug!(
                            "Upstream {} returned a {}-byte response, trying next",
                            upstream,
                            response.len()
                        );
                        self.record_failure();
                        break;
                    }
                    Err(e) => {
                        log::debug!(
                            "Query via {} failed (attempt {}): {}",
                            upstream,
                            attempt + 1,
                            e
                        );
                        self.record_failure();
                        tokio::time::sleep(Duration::from_millis(
                            RETRY_BACKOFF_MS[attempt as usize % RETRY_BACKOFF_MS.len()],
                        ))
                        .await;
                    }
                }
            }
        }
        None
    }

    fn record_failure(&self) {
        let n = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if n % FAILURE_LOG_INTERVAL == 0 {
            log::warn!("DNS forwarding has failed {} consecutive times", n);
        }
    }

    /// Cache statistics snapshot
    pub async fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.lock().await.stats()
    }

    /// Current consecutive-failure count
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// Derive the cache key from a raw query, when it parses
fn cache_key_of(query: &[u8]) -> Option<CacheKey> {
    let message = hickory_proto::op::Message::from_vec(query).ok()?;
    message.queries().first().map(CacheKey::from_query)
}
