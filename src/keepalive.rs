//! Keep-alive sender and peer liveness monitor.
//!
//! The sender emits a NOP at a cadence sampled uniformly from
//! `[keep_alive_interval, keep_alive_interval_max]`, skipping the NOP when
//! other frames went out since the last tick. The monitor declares the peer
//! dead once nothing arrived for longer than the peer's slowest cadence plus
//! `keep_alive_timeout`.

use crate::{config::Config, error::SmuxError, frame::Frame, session::SessionInner};
use rand::{thread_rng, Rng};
use std::{sync::Arc, time::Duration};

/// Samples the delay until the next keep-alive tick.
pub(crate) fn sample_interval(config: &Config) -> Duration {
    let min = config.keep_alive_interval;
    let max = config.keep_alive_interval_max;
    if max <= min {
        return min;
    }
    thread_rng().gen_range(min..=max)
}

/// How long the peer may stay silent before the session is torn down.
pub(crate) fn silence_threshold(config: &Config) -> Duration {
    config.keep_alive_interval_max + config.keep_alive_timeout
}

pub(crate) async fn keepalive_loop(inner: Arc<SessionInner>) {
    let config = inner.config();
    let die = inner.die_token();

    loop {
        let delay = sample_interval(&config);
        tokio::select! {
            _ = die.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if inner.take_data_sent() {
            continue;
        }
        if inner.send_control(Frame::nop(config.version)).is_err() {
            break;
        }
        tracing::trace!(?delay, "keep-alive sent");
    }

    tracing::debug!("keepalive_loop exited");
}

pub(crate) async fn liveness_loop(inner: Arc<SessionInner>) {
    let config = inner.config();
    let die = inner.die_token();
    let threshold = silence_threshold(&config);

    let mut ticker = tokio::time::interval(config.keep_alive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = die.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // A reader stalled on local consumers is not hearing the peer.
        if inner.is_reader_paused() {
            inner.refresh_activity();
            continue;
        }

        let idle = inner.idle_for();
        if idle > threshold {
            tracing::warn!(?idle, ?threshold, "peer silent, closing session");
            inner.die(SmuxError::KeepAliveTimeout);
            break;
        }
    }

    tracing::debug!("liveness_loop exited");
}
