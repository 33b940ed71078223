// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Pacemaker for view timeout and progression.
//!
//! This module implements the pacemaker component that manages view timeouts
//! and ensures the consensus system makes progress even when some validators
//! are slow or unresponsive.
//!
//! The pacemaker never arms timers itself. It reports the duration of the
//! view it entered and the caller schedules the matching local timer.

use serde::{Deserialize, Serialize};
use std::{fmt::Display, time::Duration};

use crate::types::View;

/// Configuration for the pacemaker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PacemakerConfig {
    /// Duration of a view entered right after a QC
    pub base_timeout_ms: u64,
    /// Multiplier for exponential backoff
    pub exponent_base: f64,
    /// Maximum exponent for exponential backoff (capped at 31)
    pub max_exponent: usize,
    /// Interval between re-broadcasts of a timeout vote
    pub timeout_retry_ms: u64,
}

impl Default for PacemakerConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: 1000,
            exponent_base: 2.0,
            max_exponent: 6,
            timeout_retry_ms: 1000,
        }
    }
}

impl PacemakerConfig {
    /// Create a new pacemaker configuration.
    pub fn new(
        base_timeout_ms: u64,
        exponent_base: f64,
        max_exponent: usize,
        timeout_retry_ms: u64,
    ) -> Self {
        Self {
            base_timeout_ms,
            exponent_base,
            max_exponent,
            timeout_retry_ms,
        }
    }

    /// Get the base duration as a Duration.
    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    pub fn timeout_retry(&self) -> Duration {
        Duration::from_millis(self.timeout_retry_ms)
    }
}

/// Reason for starting a new view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NewViewReason {
    /// A quorum certificate for the previous view (or later) was seen
    QuorumCertificate,
    /// A timeout certificate for the previous view (or later) was seen
    TimeoutCertificate,
}

impl Display for NewViewReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NewViewReason::QuorumCertificate => write!(f, "QCReady"),
            NewViewReason::TimeoutCertificate => write!(f, "TCReady"),
        }
    }
}

/// Event produced when a new view starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewViewEvent {
    /// The new view number
    pub view: View,
    /// Reason for starting this view
    pub reason: NewViewReason,
    /// Timeout duration for this view
    pub timeout_duration: Duration,
}

impl NewViewEvent {
    pub fn new(view: View, reason: NewViewReason, timeout_duration: Duration) -> Self {
        Self {
            view,
            reason,
            timeout_duration,
        }
    }
}

/// Where the pacemaker stands in its current view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacemakerState {
    Active { view: View, timeout: Duration },
    TimedOut { view: View, attempts: u32 },
}

/// Strategy for calculating view durations.
///
/// This trait allows different strategies for determining how long each
/// view should last, typically increasing the duration when progress is
/// stalled.
pub trait ViewIntervalStrategy: Send + Sync {
    /// Get the duration for a view.
    ///
    /// `views_since_qc` is the number of views since the last view that
    /// formed a QC (0 means the view immediately after a QC).
    fn get_view_duration(&self, views_since_qc: usize) -> Duration;
}

/// Exponential backoff interval strategy.
///
/// Formula: base * exponent_base^min(views_since_qc, max_exponent)
#[derive(Clone, Debug)]
pub struct ExponentialIntervalStrategy {
    base_ms: u64,
    exponent_base: f64,
    max_exponent: usize,
}

impl ExponentialIntervalStrategy {
    pub fn new(base: Duration, exponent_base: f64, max_exponent: usize) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            exponent_base: exponent_base.max(1.0),
            max_exponent: max_exponent.min(31),
        }
    }

    /// A strategy without backoff.
    pub fn fixed(duration: Duration) -> Self {
        Self::new(duration, 1.0, 0)
    }
}

impl ViewIntervalStrategy for ExponentialIntervalStrategy {
    fn get_view_duration(&self, views_since_qc: usize) -> Duration {
        let pow = (views_since_qc as u32).min(self.max_exponent as u32);
        let multiplier = self.exponent_base.powf(f64::from(pow));
        let duration_ms = ((self.base_ms as f64) * multiplier).ceil() as u64;
        Duration::from_millis(duration_ms)
    }
}

/// Pacemaker for managing view timeouts and progression.
///
/// The pacemaker:
/// 1. Tracks the current view
/// 2. Advances to `v + 1` on a QC or TC for view `v >= current`
/// 3. Marks the view timed out when its local timer fires
/// 4. Backs off view durations while no QC forms
pub struct Pacemaker<S>
where
    S: ViewIntervalStrategy,
{
    interval_strategy: S,

    /// Highest view certified by a QC
    highest_qc_view: View,

    state: PacemakerState,

    config: PacemakerConfig,
}

impl<S> Pacemaker<S>
where
    S: ViewIntervalStrategy,
{
    /// Create a pacemaker in view 0. The first certificates processed move
    /// it into the first real view.
    pub fn new(interval_strategy: S, config: PacemakerConfig) -> Self {
        let timeout = interval_strategy.get_view_duration(0);
        Self {
            interval_strategy,
            highest_qc_view: 0,
            state: PacemakerState::Active { view: 0, timeout },
            config,
        }
    }

    pub fn current_view(&self) -> View {
        match self.state {
            PacemakerState::Active { view, .. } | PacemakerState::TimedOut { view, .. } => view,
        }
    }

    pub fn state(&self) -> PacemakerState {
        self.state
    }

    pub fn highest_qc_view(&self) -> View {
        self.highest_qc_view
    }

    pub fn config(&self) -> &PacemakerConfig {
        &self.config
    }

    /// Advance on the given certificate views.
    ///
    /// # Returns
    ///
    /// The new view, or `None` if neither certificate is for the current
    /// view or later.
    pub fn process_certificates(
        &mut self,
        qc_view: View,
        tc_view: Option<View>,
    ) -> Option<NewViewEvent> {
        self.highest_qc_view = self.highest_qc_view.max(qc_view);

        let (certified_view, reason) = match tc_view {
            Some(tc_view) if tc_view > qc_view => (tc_view, NewViewReason::TimeoutCertificate),
            _ => (qc_view, NewViewReason::QuorumCertificate),
        };

        let new_view = certified_view + 1;
        if new_view <= self.current_view() {
            return None;
        }

        let views_since_qc = new_view.saturating_sub(self.highest_qc_view + 1) as usize;
        let timeout = self.interval_strategy.get_view_duration(views_since_qc);
        self.state = PacemakerState::Active {
            view: new_view,
            timeout,
        };

        log::info!(
            "Entering view {}: reason={}, timeout={:?}",
            new_view,
            reason,
            timeout
        );
        Some(NewViewEvent::new(new_view, reason, timeout))
    }

    /// Handle the local timer of `view` firing.
    ///
    /// # Returns
    ///
    /// The number of times the view has timed out (1 on the first firing),
    /// or `None` for a timer of a view already left.
    pub fn process_local_timeout(&mut self, view: View) -> Option<u32> {
        if view != self.current_view() || view == 0 {
            return None;
        }

        let attempts = match self.state {
            PacemakerState::Active { .. } => 1,
            PacemakerState::TimedOut { attempts, .. } => attempts + 1,
        };
        self.state = PacemakerState::TimedOut { view, attempts };

        if attempts == 1 {
            log::info!("Local timeout in view {}", view);
        } else {
            log::debug!("Local timeout in view {} (attempt {})", view, attempts);
        }
        Some(attempts)
    }

    /// Timeout duration of the current view.
    pub fn current_view_timeout(&self) -> Duration {
        let views_since_qc = self
            .current_view()
            .saturating_sub(self.highest_qc_view + 1) as usize;
        self.interval_strategy.get_view_duration(views_since_qc)
    }

    /// Get the interval strategy (useful for testing).
    #[cfg(test)]
    pub fn interval_strategy(&self) -> &S {
        &self.interval_strategy
    }
}

/// Builder for creating a pacemaker.
pub struct PacemakerBuilder {
    config: PacemakerConfig,
}

impl Default for PacemakerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacemakerBuilder {
    pub fn new() -> Self {
        Self {
            config: PacemakerConfig::default(),
        }
    }

    pub fn from_config(config: PacemakerConfig) -> Self {
        Self { config }
    }

    /// Set the base timeout.
    pub fn base_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.base_timeout_ms = timeout_ms;
        self
    }

    /// Set the exponent base.
    pub fn exponent_base(mut self, base: f64) -> Self {
        self.config.exponent_base = base;
        self
    }

    /// Set the max exponent.
    pub fn max_exponent(mut self, max: usize) -> Self {
        self.config.max_exponent = max;
        self
    }

    /// Set the timeout re-broadcast interval.
    pub fn timeout_retry_ms(mut self, retry_ms: u64) -> Self {
        self.config.timeout_retry_ms = retry_ms;
        self
    }

    /// Build the pacemaker with an exponential interval strategy.
    pub fn build_exponential(self) -> Pacemaker<ExponentialIntervalStrategy> {
        let strategy = ExponentialIntervalStrategy::new(
            self.config.base_timeout(),
            self.config.exponent_base,
            self.config.max_exponent,
        );

        Pacemaker::new(strategy, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_pacemaker() -> Pacemaker<ExponentialIntervalStrategy> {
        PacemakerBuilder::new()
            .base_timeout_ms(100)
            .exponent_base(2.0)
            .max_exponent(3)
            .build_exponential()
    }

    #[test]
    fn test_pacemaker_creation() {
        let pacemaker = create_test_pacemaker();

        assert_eq!(pacemaker.current_view(), 0);
        assert_eq!(pacemaker.highest_qc_view(), 0);
    }

    #[test]
    fn test_genesis_qc_enters_view_one() {
        let mut pacemaker = create_test_pacemaker();

        let event = pacemaker.process_certificates(0, None).unwrap();
        assert_eq!(event.view, 1);
        assert_eq!(event.reason, NewViewReason::QuorumCertificate);
        assert_eq!(event.timeout_duration, Duration::from_millis(100));
    }

    #[test]
    fn test_old_certificates_ignored() {
        let mut pacemaker = create_test_pacemaker();

        pacemaker.process_certificates(4, None).unwrap();
        assert_eq!(pacemaker.current_view(), 5);
        assert!(pacemaker.process_certificates(3, None).is_none());
        assert!(pacemaker.process_certificates(2, Some(3)).is_none());
        assert_eq!(pacemaker.current_view(), 5);
    }

    #[test]
    fn test_skip_ahead_on_higher_qc() {
        let mut pacemaker = create_test_pacemaker();

        pacemaker.process_certificates(0, None).unwrap();
        let event = pacemaker.process_certificates(7, None).unwrap();
        assert_eq!(event.view, 8);
        assert_eq!(event.timeout_duration, Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_after_timeouts() {
        let mut pacemaker = create_test_pacemaker();
        pacemaker.process_certificates(1, None).unwrap();

        let event = pacemaker.process_certificates(1, Some(2)).unwrap();
        assert_eq!(event.view, 3);
        assert_eq!(event.reason, NewViewReason::TimeoutCertificate);
        assert_eq!(event.timeout_duration, Duration::from_millis(200));

        let event = pacemaker.process_certificates(1, Some(3)).unwrap();
        assert_eq!(event.timeout_duration, Duration::from_millis(400));

        // capped at base * 2^3
        pacemaker.process_certificates(1, Some(10)).unwrap();
        assert_eq!(pacemaker.current_view_timeout(), Duration::from_millis(800));

        // a QC resets the backoff
        let event = pacemaker.process_certificates(11, None).unwrap();
        assert_eq!(event.timeout_duration, Duration::from_millis(100));
    }

    #[test]
    fn test_local_timeout() {
        let mut pacemaker = create_test_pacemaker();
        pacemaker.process_certificates(0, None).unwrap();

        assert_eq!(pacemaker.process_local_timeout(1), Some(1));
        assert_eq!(
            pacemaker.state(),
            PacemakerState::TimedOut {
                view: 1,
                attempts: 1
            }
        );
        assert_eq!(pacemaker.process_local_timeout(1), Some(2));
    }

    #[test]
    fn test_stale_local_timeout_ignored() {
        let mut pacemaker = create_test_pacemaker();
        pacemaker.process_certificates(0, None).unwrap();
        pacemaker.process_certificates(1, None).unwrap();

        assert_eq!(pacemaker.process_local_timeout(1), None);
        assert!(matches!(pacemaker.state(), PacemakerState::Active { view: 2, .. }));
    }

    #[test]
    fn test_exponential_interval() {
        let strategy = ExponentialIntervalStrategy::new(Duration::from_millis(100), 1.5, 4);
        assert_eq!(strategy.get_view_duration(0), Duration::from_millis(100));
        assert_eq!(strategy.get_view_duration(1), Duration::from_millis(150));
        assert_eq!(strategy.get_view_duration(2), Duration::from_millis(225));
        assert_eq!(
            strategy.get_view_duration(100),
            strategy.get_view_duration(4)
        );
    }

    #[test]
    fn test_exponential_interval_fixed() {
        let strategy = ExponentialIntervalStrategy::fixed(Duration::from_millis(50));
        assert_eq!(strategy.get_view_duration(10), Duration::from_millis(50));
    }

    #[test]
    fn test_new_view_reason_display() {
        assert_eq!(NewViewReason::QuorumCertificate.to_string(), "QCReady");
        assert_eq!(NewViewReason::TimeoutCertificate.to_string(), "TCReady");
    }

    #[test]
    fn test_config_from_json() {
        let config: PacemakerConfig = serde_json::from_str(
            r#"{"base_timeout_ms":250,"exponent_base":1.5,"max_exponent":4,"timeout_retry_ms":500}"#,
        )
        .unwrap();
        assert_eq!(config.base_timeout(), Duration::from_millis(250));
        assert_eq!(config.timeout_retry(), Duration::from_millis(500));

        let pacemaker = PacemakerBuilder::from_config(config).build_exponential();
        assert_eq!(
            pacemaker.interval_strategy().get_view_duration(1),
            Duration::from_millis(375)
        );
    }
}
