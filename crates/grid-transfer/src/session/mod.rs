//! GridFTP session pooling.
//!
//! Establishing a control connection is expensive (TLS handshake plus
//! delegation), so idle sessions are cached per host and handed back out on
//! the next acquire. The pool is context-scoped: callers own a pool, and
//! sessions never migrate between pools.

pub mod transport;

use crate::config::GridFtpConfig;
use crate::error::Result;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use tracing::debug;
use transport::{FtpTransport, TransportFactory};
use uuid::Uuid;

/// Connection options resolved from configuration when the pool is built.
/// Sessions created later all carry this same snapshot, so a config change
/// never alters a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub nb_streams: u32,
    pub tcp_buffer_size: u64,
    pub ipv6: bool,
    pub dcau: bool,
    pub delayed_passive: bool,
    pub gridftp_v2: bool,
}

impl From<&GridFtpConfig> for SessionOptions {
    fn from(config: &GridFtpConfig) -> Self {
        SessionOptions {
            nb_streams: config.nb_streams,
            tcp_buffer_size: config.tcp_buffer_size,
            ipv6: config.ipv6,
            dcau: config.dcau,
            delayed_passive: config.delayed_passive,
            gridftp_v2: config.gridftp_v2,
        }
    }
}

/// One pooled control connection.
pub struct Session {
    pub id: Uuid,
    pub host: String,
    pub options: SessionOptions,
    transport: Arc<dyn FtpTransport>,
}

impl Session {
    pub fn transport(&self) -> Arc<dyn FtpTransport> {
        Arc::clone(&self.transport)
    }
}

struct IdleSessions {
    by_host: HashMap<String, Vec<Session>>,
    count: usize,
}

/// Host-keyed session cache with a capacity bound.
///
/// When an insert would exceed the capacity the whole cache is purged first,
/// then the session is inserted.
pub struct SessionPool {
    factory: Arc<dyn TransportFactory>,
    config: GridFtpConfig,
    options: SessionOptions,
    idle: Mutex<IdleSessions>,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn TransportFactory>, config: GridFtpConfig) -> Arc<Self> {
        let options = SessionOptions::from(&config);
        Arc::new(SessionPool {
            factory,
            config,
            options,
            idle: Mutex::new(IdleSessions {
                by_host: HashMap::new(),
                count: 0,
            }),
        })
    }

    /// Hand out a session for `host`, recycling an idle one when available.
    /// The connect to a new host runs outside the pool lock.
    pub async fn acquire(self: &Arc<Self>, host: &str) -> Result<PooledSession> {
        if self.config.session_reuse {
            let recycled = {
                let mut idle = self.idle.lock().unwrap();
                let session = idle.by_host.get_mut(host).and_then(|v| v.pop());
                if session.is_some() {
                    idle.count -= 1;
                }
                session
            };
            if let Some(session) = recycled {
                debug!("recycled session {} for {}", session.id, host);
                return Ok(PooledSession {
                    pool: Arc::clone(self),
                    session: Some(session),
                    dirty: false,
                });
            }
        }

        let transport = self.factory.connect(host, &self.options).await?;
        let session = Session {
            id: Uuid::new_v4(),
            host: host.to_string(),
            options: self.options.clone(),
            transport,
        };
        debug!("created session {} for {}", session.id, host);
        Ok(PooledSession {
            pool: Arc::clone(self),
            session: Some(session),
            dirty: false,
        })
    }

    /// Number of idle sessions currently cached.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().count
    }

    /// Drop every cached session.
    pub fn clear(&self) {
        let mut idle = self.idle.lock().unwrap();
        debug!("clearing session cache ({} sessions)", idle.count);
        idle.by_host.clear();
        idle.count = 0;
    }

    fn release(&self, session: Session, dirty: bool) {
        session.transport.reset();
        if !self.config.session_reuse || dirty {
            debug!("discarding session {} for {}", session.id, session.host);
            return;
        }
        let mut idle = self.idle.lock().unwrap();
        if idle.count >= self.config.max_cached_sessions {
            debug!("session cache full ({}), purging", idle.count);
            idle.by_host.clear();
            idle.count = 0;
        }
        debug!("returning session {} to the pool", session.id);
        idle.by_host
            .entry(session.host.clone())
            .or_default()
            .push(session);
        idle.count += 1;
    }
}

/// RAII guard over an acquired session. Dropping it returns the session to
/// the pool unless reuse was disabled for it.
pub struct PooledSession {
    pool: Arc<SessionPool>,
    session: Option<Session>,
    dirty: bool,
}

impl PooledSession {
    /// Mark the session as not reusable; it is destroyed on release instead
    /// of going back to the pool. Used after transport-level failures that
    /// leave the control channel in an unknown state.
    pub fn disable_reuse(&mut self) {
        self.dirty = true;
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session.as_ref().map(|s| s.id))
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().unwrap()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, self.dirty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::transport::tests::MockTransport;
    use super::*;
    use crate::error::TransferError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct MockFactory {
        pub(crate) connects: AtomicUsize,
    }

    impl MockFactory {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(MockFactory {
                connects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn connect(
            &self,
            host: &str,
            _options: &SessionOptions,
        ) -> Result<Arc<dyn FtpTransport>> {
            if host == "unreachable" {
                return Err(TransferError::connection(host, "connection refused"));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockTransport::new()))
        }
    }

    fn pool_with(config: GridFtpConfig) -> (Arc<SessionPool>, Arc<MockFactory>) {
        let factory = MockFactory::new();
        let pool = SessionPool::new(factory.clone(), config);
        (pool, factory)
    }

    #[tokio::test]
    async fn test_release_then_acquire_recycles() {
        let (pool, factory) = pool_with(GridFtpConfig::default());
        let first = pool.acquire("se.example.org").await.unwrap();
        let id = first.id;
        drop(first);
        let second = pool.acquire("se.example.org").await.unwrap();
        assert_eq!(second.id, id);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disable_reuse_destroys_session() {
        let (pool, factory) = pool_with(GridFtpConfig::default());
        let mut first = pool.acquire("se.example.org").await.unwrap();
        let id = first.id;
        first.disable_reuse();
        drop(first);
        assert_eq!(pool.idle_count(), 0);
        let second = pool.acquire("se.example.org").await.unwrap();
        assert_ne!(second.id, id);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reuse_disabled_by_config() {
        let mut config = GridFtpConfig::default();
        config.session_reuse = false;
        let (pool, factory) = pool_with(config);
        drop(pool.acquire("se.example.org").await.unwrap());
        assert_eq!(pool.idle_count(), 0);
        drop(pool.acquire("se.example.org").await.unwrap());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sessions_keyed_by_host() {
        let (pool, factory) = pool_with(GridFtpConfig::default());
        drop(pool.acquire("a.example.org").await.unwrap());
        // A cached session for another host is never handed out.
        drop(pool.acquire("b.example.org").await.unwrap());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_purge_all_at_capacity() {
        let mut config = GridFtpConfig::default();
        config.max_cached_sessions = 2;
        let (pool, _factory) = pool_with(config);

        let s1 = pool.acquire("a.example.org").await.unwrap();
        let s2 = pool.acquire("b.example.org").await.unwrap();
        let s3 = pool.acquire("c.example.org").await.unwrap();
        drop(s1);
        drop(s2);
        assert_eq!(pool.idle_count(), 2);
        // Inserting past capacity empties the whole cache first.
        drop(s3);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let (pool, _factory) = pool_with(GridFtpConfig::default());
        let err = pool.acquire("unreachable").await.unwrap_err();
        assert!(matches!(err, TransferError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_options_snapshot() {
        let mut config = GridFtpConfig::default();
        config.ipv6 = true;
        config.nb_streams = 8;
        let (pool, _factory) = pool_with(config);
        let session = pool.acquire("se.example.org").await.unwrap();
        assert!(session.options.ipv6);
        assert_eq!(session.options.nb_streams, 8);
    }
}
