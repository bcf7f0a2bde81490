//! Exponential backoff with full jitter, shared by the agent's reconnect
//! loop (spec.md §4.5) and the controller's task retry policy (spec.md
//! §4.10). Both use the same shape — `min(base * factor^(attempt-1), cap)`,
//! then a uniform random delay in `[0, that)` — only the constants differ.

use std::time::Duration;

use rand::Rng;

/// `attempt` is 1-based (the first retry is attempt 1).
pub fn full_jitter(attempt: u32, base: Duration, cap: Duration) -> Duration {
	let exponent = attempt.saturating_sub(1).min(32);
	let scaled = base.as_secs_f64() * 2f64.powi(exponent as i32);
	let capped = scaled.min(cap.as_secs_f64()).max(0.0);
	let jittered = rand::thread_rng().gen_range(0.0..=capped.max(f64::MIN_POSITIVE));
	Duration::from_secs_f64(jittered)
}


// vim: ts=4
