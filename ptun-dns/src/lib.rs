//! ptun-dns - loopback DNS forwarder over SOCKS5
//!
//! Answers recursive DNS queries on 127.0.0.1 (UDP and TCP) by relaying each
//! one through the local SOCKS5 proxy exposed by the ICMP tunnel client, so
//! resolution travels inside the tunnel instead of leaking to the physical
//! network. Responses are cached with TTL-derived expiry.
//!
//! # Example
//!
//! ```no_run
//! use ptun_dns::{DnsForwarder, ForwarderConfig};
//! use tokio::sync::broadcast;
//!
//! # async fn example() -> ptun_dns::Result<()> {
//! let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//! let forwarder = DnsForwarder::bind(ForwarderConfig::default(), shutdown_rx).await?;
//! tokio::spawn(forwarder.run());
//! // ... later:
//! let _ = shutdown_tx.send(());
//! # Ok(())
//! # }
//! ```

mod cache;
pub mod error;
mod forwarder;
mod socks;

pub use cache::{patch_transaction_id, CacheKey, CacheStats, DnsCache, MAX_ENTRIES};
pub use error::{Error, Result};
pub use forwarder::{DnsForwarder, ForwarderConfig, Resolver};
pub use socks::query_via_socks;
