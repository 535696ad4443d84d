//! Tracer and metrics hooks (§6): plain synchronous capability objects the
//! executor calls at fixed points. Implementations are out of scope (see
//! Non-goals) — only the contract and a no-op default live here, mirroring
//! a `NoHandler` default adapter.

use std::time::Duration;

use crate::classify::Categories;
use crate::hostkey::HostKey;
use crate::ids::RequestId;

/// Connection reuse vs. fresh-dial, reported once per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    Reused,
    New,
}

/// Synchronous hook into request lifecycle events. Calls happen inline on
/// the executor's task, so implementations must not block.
pub trait Tracer: Send + Sync {
    fn on_attempt_start(&self, _id: RequestId, _host: &HostKey, _attempt: u32) {}
    fn on_connection_acquired(&self, _id: RequestId, _host: &HostKey, _origin: ConnectionOrigin) {}
    fn on_attempt_failure(&self, _id: RequestId, _host: &HostKey, _categories: Categories) {}
    fn on_retry_scheduled(&self, _id: RequestId, _host: &HostKey, _attempt: u32, _delay: Duration) {}
    fn on_circuit_open(&self, _id: RequestId, _host: &HostKey) {}
    fn on_request_complete(&self, _id: RequestId, _host: &HostKey, _status: Option<u16>, _elapsed: Duration) {}
}

/// Synchronous counters/gauges hook, separate from `Tracer` so a caller can
/// wire one without the other.
pub trait MetricsSink: Send + Sync {
    fn record_attempt(&self, _host: &HostKey) {}
    fn record_retry(&self, _host: &HostKey) {}
    fn record_circuit_open(&self, _host: &HostKey) {}
    fn record_pool_exhausted(&self, _host: &HostKey) {}
    fn record_latency(&self, _host: &HostKey, _elapsed: Duration) {}
}

/// Default no-op tracer, matching the `NoHandler` pattern for an
/// unconfigured hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Default no-op metrics sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {}
