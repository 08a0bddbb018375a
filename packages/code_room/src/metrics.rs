//! Server metrics for observability
//!
//! Counters are bumped from the connection tasks and session actors and read
//! by the `/metrics` and `/health` handlers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Session metrics
    /// Rooms with a live session actor
    pub active_sessions: AtomicU64,
    pub total_sessions_created: AtomicU64,
    pub sessions_disposed: AtomicU64,
    /// Joins refused with `room_full`
    pub joins_rejected: AtomicU64,

    // Edit metrics
    pub edits_accepted: AtomicU64,
    /// Edits refused for any reason (stale base, bad range, too large)
    pub edits_rejected: AtomicU64,

    // Run metrics
    pub runs_started: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_timed_out: AtomicU64,
    pub runs_errored: AtomicU64,

    // Transport metrics
    /// Participants evicted because their outbound queue filled up
    pub slow_consumers_dropped: AtomicU64,
    /// Client frames that could not be decoded
    pub invalid_frames: AtomicU64,

    /// Milliseconds after start of the latest run error, plus one (0 = never)
    last_run_error_ms: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Session tracking
    pub fn session_created(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_disposed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.sessions_disposed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn join_rejected(&self) {
        self.joins_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // Edit tracking
    pub fn edit_accepted(&self) {
        self.edits_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn edit_rejected(&self) {
        self.edits_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // Run tracking
    pub fn run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_timed_out(&self) {
        self.runs_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_errored(&self) {
        self.runs_errored.fetch_add(1, Ordering::Relaxed);
        self.last_run_error_ms
            .store(self.uptime_ms().saturating_add(1), Ordering::Relaxed);
    }

    /// Whether a run errored less than `window` ago
    pub fn run_errored_within(&self, window: Duration) -> bool {
        match self.last_run_error_ms.load(Ordering::Relaxed) {
            0 => false,
            stamp => {
                let age_ms = self.uptime_ms().saturating_sub(stamp - 1);
                u128::from(age_ms) < window.as_millis()
            }
        }
    }

    // Transport tracking
    pub fn slow_consumers(&self, count: usize) {
        if count > 0 {
            self.slow_consumers_dropped
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn invalid_frame(&self) {
        self.invalid_frames.fetch_add(1, Ordering::Relaxed);
    }

    fn uptime_ms(&self) -> u64 {
        self.start_time
            .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                active: self.active_sessions.load(Ordering::Relaxed),
                total_created: self.total_sessions_created.load(Ordering::Relaxed),
                disposed: self.sessions_disposed.load(Ordering::Relaxed),
                joins_rejected: self.joins_rejected.load(Ordering::Relaxed),
            },
            edits: EditMetrics {
                accepted: self.edits_accepted.load(Ordering::Relaxed),
                rejected: self.edits_rejected.load(Ordering::Relaxed),
            },
            runs: RunMetrics {
                started: self.runs_started.load(Ordering::Relaxed),
                completed: self.runs_completed.load(Ordering::Relaxed),
                timed_out: self.runs_timed_out.load(Ordering::Relaxed),
                errored: self.runs_errored.load(Ordering::Relaxed),
            },
            transport: TransportMetrics {
                slow_consumers_dropped: self.slow_consumers_dropped.load(Ordering::Relaxed),
                invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub sessions: SessionMetrics,
    pub edits: EditMetrics,
    pub runs: RunMetrics,
    pub transport: TransportMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active: u64,
    pub total_created: u64,
    pub disposed: u64,
    pub joins_rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMetrics {
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub started: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub errored: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportMetrics {
    pub slow_consumers_dropped: u64,
    pub invalid_frames: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: u64,
    pub connections: u64,
    pub uptime_secs: u64,
}
