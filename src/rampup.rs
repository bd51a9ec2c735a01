//! Ramp-up strategies: grow the attacker pool and the issued rate from
//! near-zero to the configured target over the warm-up window.
//!
//! Both strategies share the one-second slice routine: issue GO tokens at a
//! reduced rate for one wall-clock second, measure what the pool actually
//! achieved, and hand the slice metrics back to the caller. The linear
//! strategy grows the pool on a fixed schedule; exp2 grows it geometrically,
//! but only while throughput lags behind the slice target.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::attack::Phase;
use crate::config::RampupStrategy;
use crate::limiter::Limiter;
use crate::metrics::Metrics;
use crate::runner::Runner;

pub(crate) async fn execute(strategy: RampupStrategy, r: &mut Runner) {
    match strategy {
        RampupStrategy::Linear => linear(r).await,
        RampupStrategy::Exp2 => exp2(r).await,
    }
}

/// Pool size the linear strategy wants at the start of ramp second `second`.
/// Grows proportionally, never shrinks below what an earlier second built,
/// and tops out at the configured maximum.
pub(crate) fn linear_pool_size(second: u64, max_attackers: usize, ramp_up_sec: u64) -> usize {
    ((second as usize).saturating_mul(max_attackers) / ramp_up_sec.max(1) as usize)
        .min(max_attackers)
}

/// Pool size the exp2 strategy wants after a slice that achieved
/// `achieved_rate` against `target_rate`. Growth is geometric exactly while
/// throughput lags: the factor is capped at 2.0 and the result at the
/// configured maximum.
pub(crate) fn exp2_pool_size(
    current: usize,
    target_rate: u64,
    achieved_rate: f64,
    max_attackers: usize,
) -> usize {
    if achieved_rate >= target_rate as f64 {
        return current.min(max_attackers);
    }
    let factor = if achieved_rate <= 0.0 {
        2.0
    } else {
        (target_rate as f64 / achieved_rate).min(2.0)
    };
    ((current as f64 * factor).ceil() as usize).min(max_attackers)
}

/// Grow the pool linearly with the elapsed ramp seconds.
async fn linear(r: &mut Runner) {
    r.spawn_attacker().await;
    let ramp_up_sec = r.config().ramp_up_sec;
    let max_attackers = r.config().max_attackers;
    for second in 1..=ramp_up_sec {
        let wanted = linear_pool_size(second, max_attackers, ramp_up_sec);
        spawn_to_size(r, wanted).await;
        take_during_ramp_second(r, second as u32).await;
    }
}

/// Start with one worker and grow the pool only when the measured rate of
/// the previous slice fell short of its target.
async fn exp2(r: &mut Runner) {
    r.spawn_attacker().await;
    let ramp_up_sec = r.config().ramp_up_sec;
    let max_attackers = r.config().max_attackers;
    for second in 1..=ramp_up_sec {
        let (target_rate, slice) = take_during_ramp_second(r, second as u32).await;
        let wanted = exp2_pool_size(r.pool_size(), target_rate, slice.rate, max_attackers);
        spawn_to_size(r, wanted).await;
    }
}

/// Spawn clones until the pool holds `count` workers. A failed setup skips
/// that spawn, so the pool simply does not grow that tick.
async fn spawn_to_size(r: &mut Runner, count: usize) {
    let target = count.min(r.config().max_attackers);
    let missing = target.saturating_sub(r.pool_size());
    for _ in 0..missing {
        r.spawn_attacker().await;
    }
}

/// Put the pool to work for one wall-clock second at this second's reduced
/// rate, then harvest the slice-local metrics from the collector.
async fn take_during_ramp_second(r: &mut Runner, second: u32) -> (u64, Metrics) {
    // Ramp-up can only proceed when at least one attacker waits for tokens.
    if r.pool_size() == 0 {
        warn!(handle = %r.name(), "no attackers available to start rampup or full attack");
        return (0, Metrics::new());
    }

    let config = r.config();
    let rps = (u64::from(second) * config.rps / config.ramp_up_sec).max(1);
    let verbose = config.verbose;

    let mut limiter = Limiter::new(rps);
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        limiter.take().await;
        if r.send_token(Phase::Ramp(second)).await.is_err() {
            break;
        }
    }
    // Compensate for the first take of the fresh limiter, which returns
    // immediately and would otherwise inflate this second's rate by one.
    limiter.take().await;

    let mut slice = r.harvest_slice(second).await;
    slice.update_latencies();

    if verbose {
        info!(
            handle = %r.name(),
            rate = slice.rate,
            target = rps,
            mean = ?slice.latencies.mean,
            requests = slice.requests,
            attackers = r.pool_size(),
            success = slice.success_ratio(),
            "rampup second finished"
        );
    }
    (rps, slice)
}
