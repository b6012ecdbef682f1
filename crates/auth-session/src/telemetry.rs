//! Counters emitted by the session layer
//!
//! - `guard_decisions_total` (counter): label `decision`
//! - `session_refreshes_total` (counter): label `result`
//! - `callback_outcomes_total` (counter): label `outcome`
//!
//! Without an installed recorder these are no-ops.

pub(crate) fn record_guard_decision(decision: &'static str) {
    metrics::counter!("guard_decisions_total", "decision" => decision).increment(1);
}

pub(crate) fn record_refresh(result: &'static str) {
    metrics::counter!("session_refreshes_total", "result" => result).increment(1);
}

pub(crate) fn record_callback(outcome: &'static str) {
    metrics::counter!("callback_outcomes_total", "outcome" => outcome).increment(1);
}
