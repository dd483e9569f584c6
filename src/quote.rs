// ===============================
// src/quote.rs
// ===============================
//
// Client for the external quote source.
// Protocol: connect, send "<stock>,<user>\n", read one reply line
// "<price>,<stock>,<user>,<timestamp>,<key>\n", close.
//
// Prices are cached per stock for a fixed TTL. A cache hit answers without
// touching the network and without emitting a QuoteServer audit event; a
// fresh fetch emits exactly one.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::audit::AuditSink;
use crate::domain::{AuditEvent, PriceQuote, QuoteReply};
use crate::error::ServerError;
use crate::metrics::QUOTE_LOOKUPS;

#[async_trait]
pub trait QuoteSource: Send + Sync + 'static {
    /// Current price of `stock`, best effort. Callers must fail their
    /// command on error rather than guess a price.
    async fn query(&self, user: &str, stock: &str, transaction_num: u64)
        -> Result<PriceQuote, ServerError>;
}

pub struct CachedQuoteClient {
    server_name: String,
    addr: String,
    connect_timeout: Duration,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, (Decimal, Instant)>>,
    audit: AuditSink,
}

impl CachedQuoteClient {
    pub fn new(
        server_name: String,
        addr: String,
        connect_timeout: Duration,
        cache_ttl: Duration,
        audit: AuditSink,
    ) -> Self {
        Self {
            server_name,
            addr,
            connect_timeout,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
            audit,
        }
    }

    fn cached(&self, stock: &str) -> Option<Decimal> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(stock) {
            Some((price, fetched_at)) if fetched_at.elapsed() < self.cache_ttl => Some(*price),
            Some(_) => {
                cache.remove(stock);
                None
            }
            None => None,
        }
    }

    async fn fetch(&self, user: &str, stock: &str) -> Result<QuoteReply, ServerError> {
        // Reply must arrive promptly too, or a silent quote source would
        // pin this connection task indefinitely.
        const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

        let external = |e: String| ServerError::ExternalUnavailable(e);

        let mut conn = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| external(format!("connect to {} timed out", self.addr)))?
            .map_err(|e| external(format!("connect to {} failed: {e}", self.addr)))?;

        conn.write_all(format!("{stock},{user}\n").as_bytes())
            .await
            .map_err(|e| external(format!("quote request failed: {e}")))?;

        let mut line = String::new();
        timeout(REPLY_TIMEOUT, BufReader::new(conn).read_line(&mut line))
            .await
            .map_err(|_| external("quote reply timed out".to_string()))?
            .map_err(|e| external(format!("quote reply read failed: {e}")))?;

        parse_reply(line.trim()).ok_or_else(|| external(format!("malformed quote reply '{}'", line.trim())))
    }
}

fn parse_reply(line: &str) -> Option<QuoteReply> {
    let mut parts = line.split(',');
    let price = Decimal::from_str(parts.next()?.trim()).ok()?;
    let stock = parts.next()?.trim().to_string();
    let user = parts.next()?.trim().to_string();
    let timestamp = parts.next()?.trim().parse().ok()?;
    let key = parts.next()?.trim().to_string();
    if parts.next().is_some() {
        return None;
    }
    Some(QuoteReply {
        price,
        stock,
        user,
        timestamp,
        key,
    })
}

#[async_trait]
impl QuoteSource for CachedQuoteClient {
    async fn query(
        &self,
        user: &str,
        stock: &str,
        transaction_num: u64,
    ) -> Result<PriceQuote, ServerError> {
        if let Some(price) = self.cached(stock) {
            QUOTE_LOOKUPS.with_label_values(&["hit"]).inc();
            return Ok(PriceQuote {
                price,
                from_cache: true,
            });
        }

        let reply = match self.fetch(user, stock).await {
            Ok(r) => r,
            Err(e) => {
                QUOTE_LOOKUPS.with_label_values(&["error"]).inc();
                return Err(e);
            }
        };
        QUOTE_LOOKUPS.with_label_values(&["miss"]).inc();
        debug!(stock = %reply.stock, price = %reply.price, "quote fetched");

        self.cache
            .lock()
            .unwrap()
            .insert(reply.stock.clone(), (reply.price, Instant::now()));

        self.audit.record(AuditEvent::QuoteServer {
            server: self.server_name.clone(),
            transaction_num,
            price: reply.price,
            stock: reply.stock,
            username: reply.user,
            quote_server_time: reply.timestamp,
            crypto_key: reply.key,
        });

        Ok(PriceQuote {
            price: reply.price,
            from_cache: false,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Scriptable stand-in for the external quote source.
    pub struct MockQuoteSource {
        price: Mutex<Decimal>,
        pub queries: AtomicU64,
    }

    impl MockQuoteSource {
        pub fn at(price: Decimal) -> Self {
            Self {
                price: Mutex::new(price),
                queries: AtomicU64::new(0),
            }
        }

        pub fn set_price(&self, price: Decimal) {
            *self.price.lock().unwrap() = price;
        }
    }

    #[async_trait]
    impl QuoteSource for MockQuoteSource {
        async fn query(
            &self,
            _user: &str,
            _stock: &str,
            _transaction_num: u64,
        ) -> Result<PriceQuote, ServerError> {
            self.queries.fetch_add(1, Ordering::Relaxed);
            Ok(PriceQuote {
                price: *self.price.lock().unwrap(),
                from_cache: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn sink() -> (AuditSink, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (AuditSink::new(tx), rx)
    }

    #[test]
    fn reply_parsing() {
        let r = parse_reply("9.99,XYZ,alice,1712345678,K3Y").unwrap();
        assert_eq!(r.price, Decimal::new(999, 2));
        assert_eq!(r.stock, "XYZ");
        assert_eq!(r.user, "alice");
        assert_eq!(r.timestamp, 1712345678);
        assert_eq!(r.key, "K3Y");

        assert!(parse_reply("garbage").is_none());
        assert!(parse_reply("1.0,XYZ,alice,notatime,K").is_none());
        assert!(parse_reply("1.0,XYZ,alice,1,K,extra").is_none());
    }

    /// Mock quote source speaking the wire protocol, counting connections.
    async fn spawn_quote_server(price: &'static str) -> (String, std::sync::Arc<std::sync::atomic::AtomicU64>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let hits_srv = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                hits_srv.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let mut buf = [0u8; 128];
                let n = conn.read(&mut buf).await.unwrap_or(0);
                let req = String::from_utf8_lossy(&buf[..n]);
                let mut parts = req.trim().split(',');
                let stock = parts.next().unwrap_or("?").to_string();
                let user = parts.next().unwrap_or("?").to_string();
                let reply = format!("{price},{stock},{user},1712345678,K3Y\n");
                let _ = conn.write_all(reply.as_bytes()).await;
            }
        });
        (addr, hits)
    }

    #[tokio::test]
    async fn cache_hit_skips_network_and_audit() {
        let (audit, mut rx) = sink();
        let (addr, hits) = spawn_quote_server("9.99").await;
        let client = CachedQuoteClient::new(
            "testserve".into(),
            addr,
            Duration::from_millis(500),
            Duration::from_secs(60),
            audit,
        );

        let first = client.query("alice", "XYZ", 1).await.unwrap();
        assert!(!first.from_cache);
        let second = client.query("alice", "XYZ", 2).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.price, Decimal::new(999, 2));

        // one external round trip, one QuoteServer event
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            AuditEvent::QuoteServer { transaction_num: 1, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_cache_refetches() {
        let (audit, _rx) = sink();
        let (addr, hits) = spawn_quote_server("5.00").await;
        let client = CachedQuoteClient::new(
            "testserve".into(),
            addr,
            Duration::from_millis(500),
            Duration::from_millis(0),
            audit,
        );

        client.query("bob", "ABC", 1).await.unwrap();
        let again = client.query("bob", "ABC", 2).await.unwrap();
        assert!(!again.from_cache);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_source_is_external_unavailable() {
        let (audit, _rx) = sink();
        let client = CachedQuoteClient::new(
            "testserve".into(),
            // reserved port, nothing listens
            "127.0.0.1:1".into(),
            Duration::from_millis(50),
            Duration::from_secs(60),
            audit,
        );
        let err = client.query("alice", "XYZ", 1).await.unwrap_err();
        assert!(matches!(err, ServerError::ExternalUnavailable(_)));
    }
}
