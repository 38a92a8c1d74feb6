//! Prometheus-compatible metrics endpoint
//!
//! Exposes sync server metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

const LATENCY_SAMPLES: usize = 1000;

/// Metrics registry for the sync server
#[derive(Debug)]
pub struct Metrics {
    // Event log
    pub events_appended: AtomicU64,
    pub append_failures: AtomicU64,
    pub deliveries: AtomicU64,
    pub entities_active: AtomicU64,
    pub subscribers_active: AtomicU64,

    // Submissions
    pub submissions_accepted: AtomicU64,
    pub submissions_rejected: AtomicU64,

    // Append latency (microseconds)
    pub append_time_us: AtomicU64,
    pub append_time_p95_us: AtomicU64,
    pub append_time_p99_us: AtomicU64,
    pub append_time_max_us: AtomicU64,

    // Network stats
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    // Battle
    pub cas_commits: AtomicU64,
    pub cas_retries: AtomicU64,
    pub winners_set: AtomicU64,
    pub pickups_claimed: AtomicU64,
    pub powerups_granted: AtomicU64,
    pub powerups_used: AtomicU64,

    start_time: Instant,

    append_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_appended: AtomicU64::new(0),
            append_failures: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            entities_active: AtomicU64::new(0),
            subscribers_active: AtomicU64::new(0),
            submissions_accepted: AtomicU64::new(0),
            submissions_rejected: AtomicU64::new(0),
            append_time_us: AtomicU64::new(0),
            append_time_p95_us: AtomicU64::new(0),
            append_time_p99_us: AtomicU64::new(0),
            append_time_max_us: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            cas_commits: AtomicU64::new(0),
            cas_retries: AtomicU64::new(0),
            winners_set: AtomicU64::new(0),
            pickups_claimed: AtomicU64::new(0),
            powerups_granted: AtomicU64::new(0),
            powerups_used: AtomicU64::new(0),
            start_time: Instant::now(),
            append_history: RwLock::new(VecDeque::with_capacity(LATENCY_SAMPLES)),
        }
    }

    /// Record one append's latency and update percentiles
    pub fn record_append_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.append_time_us.store(us, Ordering::Relaxed);

        let mut history = self.append_history.write();
        history.push_back(us);
        while history.len() > LATENCY_SAMPLES {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.append_time_p95_us
                .store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.append_time_p99_us
                .store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.append_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Record a frame sent to a client
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a frame received from a client
    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a CAS transaction outcome
    pub fn record_cas(&self, committed: bool, retries: u32) {
        if committed {
            self.cas_commits.fetch_add(1, Ordering::Relaxed);
        }
        self.cas_retries.fetch_add(retries as u64, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Event log
        metric!("crossword_sync_events_appended_total", "Events appended to the log", "counter",
            self.events_appended.load(Ordering::Relaxed));
        metric!("crossword_sync_append_failures_total", "Appends that failed", "counter",
            self.append_failures.load(Ordering::Relaxed));
        metric!("crossword_sync_deliveries_total", "Events fanned out to subscribers", "counter",
            self.deliveries.load(Ordering::Relaxed));
        metric!("crossword_sync_entities_active", "Entities with at least one subscriber", "gauge",
            self.entities_active.load(Ordering::Relaxed));
        metric!("crossword_sync_subscribers_active", "Active entity subscriptions", "gauge",
            self.subscribers_active.load(Ordering::Relaxed));
        metric!("crossword_sync_submissions_accepted_total", "Submissions acknowledged", "counter",
            self.submissions_accepted.load(Ordering::Relaxed));
        metric!("crossword_sync_submissions_rejected_total", "Submissions rejected", "counter",
            self.submissions_rejected.load(Ordering::Relaxed));

        // Latency
        metric!("crossword_sync_append_time_microseconds", "Latest append time", "gauge",
            self.append_time_us.load(Ordering::Relaxed));
        metric!("crossword_sync_append_time_p95_microseconds", "95th percentile append time", "gauge",
            self.append_time_p95_us.load(Ordering::Relaxed));
        metric!("crossword_sync_append_time_p99_microseconds", "99th percentile append time", "gauge",
            self.append_time_p99_us.load(Ordering::Relaxed));
        metric!("crossword_sync_append_time_max_microseconds", "Maximum append time", "gauge",
            self.append_time_max_us.load(Ordering::Relaxed));

        // Network
        metric!("crossword_sync_connections_active", "Active TCP connections", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("crossword_sync_connections_rejected_total", "Connections refused at capacity", "counter",
            self.connections_rejected.load(Ordering::Relaxed));
        metric!("crossword_sync_messages_sent_total", "Total messages sent", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("crossword_sync_messages_received_total", "Total messages received", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("crossword_sync_bytes_sent_total", "Total bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("crossword_sync_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));

        // Battle
        metric!("crossword_sync_cas_commits_total", "Committed CAS transactions", "counter",
            self.cas_commits.load(Ordering::Relaxed));
        metric!("crossword_sync_cas_retries_total", "CAS conflicts retried", "counter",
            self.cas_retries.load(Ordering::Relaxed));
        metric!("crossword_sync_battle_winners_total", "Battles with a recorded winner", "counter",
            self.winners_set.load(Ordering::Relaxed));
        metric!("crossword_sync_pickups_claimed_total", "Pickups claimed", "counter",
            self.pickups_claimed.load(Ordering::Relaxed));
        metric!("crossword_sync_powerups_granted_total", "Power-ups granted", "counter",
            self.powerups_granted.load(Ordering::Relaxed));
        metric!("crossword_sync_powerups_used_total", "Power-ups redeemed", "counter",
            self.powerups_used.load(Ordering::Relaxed));

        metric!("crossword_sync_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        serde_json::json!({
            "log": {
                "events_appended": load(&self.events_appended),
                "append_failures": load(&self.append_failures),
                "deliveries": load(&self.deliveries),
                "entities": load(&self.entities_active),
                "subscribers": load(&self.subscribers_active),
                "submissions_accepted": load(&self.submissions_accepted),
                "submissions_rejected": load(&self.submissions_rejected),
            },
            "performance": {
                "append_time_us": load(&self.append_time_us),
                "append_time_p95_us": load(&self.append_time_p95_us),
                "append_time_p99_us": load(&self.append_time_p99_us),
                "append_time_max_us": load(&self.append_time_max_us),
            },
            "network": {
                "connections": load(&self.connections_active),
                "connections_rejected": load(&self.connections_rejected),
                "messages_sent": load(&self.messages_sent),
                "messages_received": load(&self.messages_received),
                "bytes_sent": load(&self.bytes_sent),
                "bytes_received": load(&self.bytes_received),
            },
            "battle": {
                "cas_commits": load(&self.cas_commits),
                "cas_retries": load(&self.cas_retries),
                "winners": load(&self.winners_set),
                "pickups_claimed": load(&self.pickups_claimed),
                "powerups_granted": load(&self.powerups_granted),
                "powerups_used": load(&self.powerups_used),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// Route one raw HTTP request to a response
fn route(metrics: &Metrics, request: &str) -> String {
    if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
        http_response("200 OK", "application/json", &metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        http_response(
            "200 OK",
            "text/plain; version=0.0.4",
            &metrics.to_prometheus(),
        )
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        http_response("200 OK", "text/plain", "OK")
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
