//! Protocol counters
//!
//! Atomic counters for handshake outcomes, secure traffic and security events.
//! Each AP driver owns one [`Metrics`]; there is no global instance.

use crate::error::ProtocolError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Which handshake a counter update belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    KeyExchange,
    Attestation,
    Boot,
}

#[derive(Debug, Default)]
struct StepCounters {
    attempts: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
}

impl StepCounters {
    fn snapshot(&self) -> StepSnapshot {
        StepSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct Metrics {
    kex: StepCounters,
    attest: StepCounters,
    boot: StepCounters,
    /// Secure records sent
    pub secure_sent: AtomicU64,
    /// Secure records accepted
    pub secure_received: AtomicU64,
    /// Frames that failed the CRC
    pub checksum_errors: AtomicU64,
    /// Signature, HMAC, replay and commitment failures
    pub security_events: AtomicU64,
    /// Transport failures and timeouts
    pub bus_errors: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            kex: StepCounters::default(),
            attest: StepCounters::default(),
            boot: StepCounters::default(),
            secure_sent: AtomicU64::new(0),
            secure_received: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            security_events: AtomicU64::new(0),
            bus_errors: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn step(&self, step: Step) -> &StepCounters {
        match step {
            Step::KeyExchange => &self.kex,
            Step::Attestation => &self.attest,
            Step::Boot => &self.boot,
        }
    }

    pub fn attempt(&self, step: Step) {
        self.step(step).attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success(&self, step: Step) {
        self.step(step).success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self, step: Step) {
        self.step(step).failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Classify an error into the relevant counters
    pub fn record_error(&self, err: &ProtocolError) {
        if matches!(err, ProtocolError::Checksum { .. }) {
            self.checksum_errors.fetch_add(1, Ordering::Relaxed);
        }
        if err.is_security_event() {
            self.security_events.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(err, ProtocolError::Bus(_) | ProtocolError::BusTimeout) {
            self.bus_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One request/response pair crossed the bus
    pub fn exchanged(&self, sent: usize, received: usize) {
        self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(received as u64, Ordering::Relaxed);
    }

    pub fn secure_message_sent(&self) {
        self.secure_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn secure_message_received(&self) {
        self.secure_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            kex: self.kex.snapshot(),
            attest: self.attest.snapshot(),
            boot: self.boot.snapshot(),
            secure_sent: self.secure_sent.load(Ordering::Relaxed),
            secure_received: self.secure_received.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            security_events: self.security_events.load(Ordering::Relaxed),
            bus_errors: self.bus_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            kex_success = s.kex.success,
            kex_failed = s.kex.failed,
            attest_success = s.attest.success,
            attest_failed = s.attest.failed,
            boot_success = s.boot.success,
            boot_failed = s.boot.failed,
            secure_sent = s.secure_sent,
            secure_received = s.secure_received,
            checksum_errors = s.checksum_errors,
            security_events = s.security_events,
            bus_errors = s.bus_errors,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            uptime_seconds = s.uptime_seconds,
            "Protocol metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepSnapshot {
    pub attempts: u64,
    pub success: u64,
    pub failed: u64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub kex: StepSnapshot,
    pub attest: StepSnapshot,
    pub boot: StepSnapshot,
    pub secure_sent: u64,
    pub secure_received: u64,
    pub checksum_errors: u64,
    pub security_events: u64,
    pub bus_errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime_seconds: u64,
}

/// Logs how long an operation took when dropped
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}
