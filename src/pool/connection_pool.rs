use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::core::config::PoolConfig;
use crate::core::errors::{CoreError, Result};
use crate::core::events::{CoreEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Http,
    Database,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Active,
}

/// Point-in-time view of one pooled connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PooledConnection {
    pub kind: ConnectionKind,
    /// Host authority for HTTP, slot id for database
    pub key: String,
    pub state: ConnectionState,
    pub last_used_at: DateTime<Utc>,
    pub requests_served: u64,
    pub average_response_time_ms: f64,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Keep-alive HTTP client shared by every request to one host
#[derive(Debug)]
pub struct HttpAgent {
    host: String,
    client: reqwest::Client,
    created_at: DateTime<Utc>,
    requests_served: AtomicU64,
    total_response_ms: AtomicU64,
    in_flight: AtomicUsize,
    last_used_ms: AtomicI64,
}

impl HttpAgent {
    fn build(host: String, config: &PoolConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(config.http_keep_alive)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .tcp_keepalive(config.http_keep_alive)
            .timeout(config.http_request_timeout)
            .build()?;
        Ok(Self {
            host,
            client,
            created_at: Utc::now(),
            requests_served: AtomicU64::new(0),
            total_response_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            last_used_ms: AtomicI64::new(now_millis()),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    pub fn average_response_time_ms(&self) -> f64 {
        let served = self.requests_served();
        if served == 0 {
            0.0
        } else {
            self.total_response_ms.load(Ordering::Relaxed) as f64 / served as f64
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.in_flight.load(Ordering::Relaxed) > 0 {
            ConnectionState::Active
        } else {
            ConnectionState::Idle
        }
    }

    fn record(&self, response_time_ms: u64) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        self.total_response_ms
            .fetch_add(response_time_ms, Ordering::Relaxed);
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.last_used_ms.store(now_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> PooledConnection {
        PooledConnection {
            kind: ConnectionKind::Http,
            key: self.host.clone(),
            state: self.state(),
            last_used_at: millis_to_datetime(self.last_used_ms.load(Ordering::Relaxed)),
            requests_served: self.requests_served(),
            average_response_time_ms: self.average_response_time_ms(),
        }
    }
}

/// Handle for an exclusive database slot.
///
/// Give it back with `release_db_connection`, or use `with_db_connection`,
/// which also frees the slot if the surrounding future is cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConnection {
    pub id: Uuid,
    pub acquired_at: DateTime<Utc>,
}

struct DbSlot {
    // Dropping the permit frees the slot.
    _permit: OwnedSemaphorePermit,
    acquired_at: DateTime<Utc>,
}

/// Frees a slot still held when its holder goes away without releasing
struct DbLease<'a> {
    pool: &'a ConnectionPool,
    conn: DbConnection,
    started: Instant,
}

impl Drop for DbLease<'_> {
    fn drop(&mut self) {
        if self.pool.active_db.remove(&self.conn.id).is_some() {
            warn!(connection_id = %self.conn.id, "Database connection reclaimed from abandoned holder");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpPoolMetrics {
    pub agents: usize,
    pub active_agents: usize,
    pub total_requests: u64,
    pub average_response_time_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPoolMetrics {
    pub max_connections: usize,
    pub active: usize,
    pub idle: usize,
    pub total_acquired: u64,
    pub queries_executed: u64,
    pub average_query_time_ms: f64,
    pub acquire_timeouts: u64,
    pub double_releases: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub http: HttpPoolMetrics,
    pub database: DbPoolMetrics,
}

/// Sole owner of network and database handles.
///
/// HTTP agents are shared per host; database connections are exclusive
/// slots bounded by a semaphore sized at construction.
pub struct ConnectionPool {
    config: PoolConfig,
    agents: DashMap<String, Arc<HttpAgent>>,
    db_slots: Arc<Semaphore>,
    active_db: DashMap<Uuid, DbSlot>,
    last_db_used_ms: AtomicI64,
    total_acquired: AtomicU64,
    queries_executed: AtomicU64,
    total_query_ms: AtomicU64,
    acquire_timeouts: AtomicU64,
    double_releases: AtomicU64,
    closed: AtomicBool,
    events: Option<Arc<EventBus>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        info!(
            max_db_connections = config.max_db_connections,
            "Connection pool created"
        );
        Ok(Self {
            db_slots: Arc::new(Semaphore::new(config.max_db_connections)),
            config,
            agents: DashMap::new(),
            active_db: DashMap::new(),
            last_db_used_ms: AtomicI64::new(now_millis()),
            total_acquired: AtomicU64::new(0),
            queries_executed: AtomicU64::new(0),
            total_query_ms: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
            double_releases: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            events: None,
        })
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Agent for the URL's host, created on first use and reused afterwards
    pub fn get_http_agent(&self, url: &str) -> Result<Arc<HttpAgent>> {
        self.ensure_open()?;
        let key = host_key(url)?;
        if let Some(agent) = self.agents.get(&key) {
            return Ok(agent.clone());
        }
        let agent = self
            .agents
            .entry(key.clone())
            .or_try_insert_with(|| HttpAgent::build(key.clone(), &self.config).map(Arc::new))?
            .clone();
        debug!(host = %key, "Created HTTP agent");
        Ok(agent)
    }

    /// Agent for the URL's host, marked active until `release_http_connection`
    pub fn begin_http_request(&self, url: &str) -> Result<Arc<HttpAgent>> {
        let agent = self.get_http_agent(url)?;
        agent.in_flight.fetch_add(1, Ordering::AcqRel);
        agent.last_used_ms.store(now_millis(), Ordering::Relaxed);
        Ok(agent)
    }

    /// Record one finished request against the host's agent
    pub fn release_http_connection(&self, url: &str, response_time_ms: u64) -> Result<()> {
        let key = host_key(url)?;
        let agent = self
            .agents
            .get(&key)
            .ok_or_else(|| CoreError::ConnectionNotActive {
                connection_id: key.clone(),
            })?;
        agent.record(response_time_ms);
        Ok(())
    }

    /// Wait for a free database slot, up to `connection_timeout`
    pub async fn acquire_db_connection(&self) -> Result<DbConnection> {
        self.ensure_open()?;
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.config.connection_timeout,
            self.db_slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(CoreError::PoolClosed),
            Err(_) => {
                self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(
                    waited_ms,
                    max = self.config.max_db_connections,
                    "Database pool exhausted"
                );
                if let Some(bus) = &self.events {
                    bus.emit(CoreEvent::PoolExhausted {
                        resource: "database".to_string(),
                        waited_ms,
                    });
                }
                return Err(CoreError::AcquireTimeout {
                    resource: "database".to_string(),
                    timeout_ms: self.config.connection_timeout.as_millis() as u64,
                });
            }
        };

        let conn = DbConnection {
            id: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };
        self.active_db.insert(
            conn.id,
            DbSlot {
                _permit: permit,
                acquired_at: conn.acquired_at,
            },
        );
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = %conn.id, "Database connection acquired");
        Ok(conn)
    }

    /// Return a slot. A second release of the same handle is rejected and counted.
    pub fn release_db_connection(&self, conn: &DbConnection, query_time_ms: u64) -> Result<()> {
        match self.active_db.remove(&conn.id) {
            Some(_) => {
                self.queries_executed.fetch_add(1, Ordering::Relaxed);
                self.total_query_ms
                    .fetch_add(query_time_ms, Ordering::Relaxed);
                self.last_db_used_ms.store(now_millis(), Ordering::Relaxed);
                debug!(connection_id = %conn.id, query_time_ms, "Database connection released");
                Ok(())
            }
            None => {
                self.double_releases.fetch_add(1, Ordering::Relaxed);
                warn!(connection_id = %conn.id, "Release of inactive database connection");
                Err(CoreError::ConnectionNotActive {
                    connection_id: conn.id.to_string(),
                })
            }
        }
    }

    /// Run `f` with a database slot, releasing it whether `f` succeeds, fails
    /// or is dropped before finishing
    pub async fn with_db_connection<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(DbConnection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = DbLease {
            pool: self,
            conn: self.acquire_db_connection().await?,
            started: Instant::now(),
        };
        let result = f(lease.conn.clone()).await;
        let elapsed_ms = lease.started.elapsed().as_millis() as u64;
        if let Err(e) = self.release_db_connection(&lease.conn, elapsed_ms) {
            warn!(connection_id = %lease.conn.id, error = %e, "Database connection release failed");
        }
        result
    }

    /// Drop HTTP agents with no outstanding request that sat unused past `idle_timeout`
    pub fn cleanup_idle(&self) -> usize {
        let cutoff = now_millis() - self.config.idle_timeout.as_millis() as i64;
        let before = self.agents.len();
        self.agents.retain(|_, agent| {
            agent.state() == ConnectionState::Active
                || agent.last_used_ms.load(Ordering::Relaxed) > cutoff
        });
        let removed = before - self.agents.len();
        if removed > 0 {
            debug!(removed, "Dropped idle HTTP agents");
        }
        removed
    }

    /// Per-connection view, HTTP agents first then active database slots
    pub fn connections(&self) -> Vec<PooledConnection> {
        let mut http: Vec<PooledConnection> =
            self.agents.iter().map(|a| a.value().snapshot()).collect();
        http.sort_by(|a, b| a.key.cmp(&b.key));
        let mut db: Vec<PooledConnection> = self
            .active_db
            .iter()
            .map(|slot| PooledConnection {
                kind: ConnectionKind::Database,
                key: slot.key().to_string(),
                state: ConnectionState::Active,
                last_used_at: slot.value().acquired_at,
                requests_served: 0,
                average_response_time_ms: 0.0,
            })
            .collect();
        db.sort_by(|a, b| a.key.cmp(&b.key));
        http.extend(db);
        http
    }

    pub fn get_metrics(&self) -> PoolMetrics {
        let (mut total_requests, mut total_ms, mut active_agents) = (0u64, 0u64, 0usize);
        for agent in self.agents.iter() {
            total_requests += agent.requests_served();
            total_ms += agent.total_response_ms.load(Ordering::Relaxed);
            if agent.state() == ConnectionState::Active {
                active_agents += 1;
            }
        }
        let queries = self.queries_executed.load(Ordering::Relaxed);
        let active = self.active_db.len();

        PoolMetrics {
            http: HttpPoolMetrics {
                agents: self.agents.len(),
                active_agents,
                total_requests,
                average_response_time_ms: average(total_ms, total_requests),
            },
            database: DbPoolMetrics {
                max_connections: self.config.max_db_connections,
                active,
                idle: self.config.max_db_connections.saturating_sub(active),
                total_acquired: self.total_acquired.load(Ordering::Relaxed),
                queries_executed: queries,
                average_query_time_ms: average(
                    self.total_query_ms.load(Ordering::Relaxed),
                    queries,
                ),
                acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
                double_releases: self.double_releases.load(Ordering::Relaxed),
            },
        }
    }

    /// Refuse further acquisitions and drop every pooled handle
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.db_slots.close();
        self.agents.clear();
        self.active_db.clear();
        info!("Connection pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(CoreError::PoolClosed)
        } else {
            Ok(())
        }
    }
}

fn average(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

/// `host[:port]` identifying which agent serves a URL
fn host_key(raw: &str) -> Result<String> {
    let parsed =
        Url::parse(raw).map_err(|e| CoreError::validation_field(e.to_string(), "url"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| CoreError::validation_field(format!("URL has no host: {}", raw), "url"))?;
    Ok(match parsed.port_or_known_default() {
        Some(port) => format!("{}:{}", host.to_ascii_lowercase(), port),
        None => host.to_ascii_lowercase(),
    })
}
