//! Loudness-based voice activity monitor for barge-in
//!
//! Consumes the per-chunk RMS level produced by the capture pipeline and
//! decides when the user has started talking over the agent. A run of
//! `required_consecutive` levels above `threshold` requests an interruption,
//! but only while the agent is speaking and at most once per `cooldown`.
//!
//! # Example
//!
//! ```
//! use std::time::{Duration, Instant};
//! use voxlink_vad::{MonitorConfig, MonitorVerdict, VoiceActivityMonitor};
//!
//! let mut monitor = VoiceActivityMonitor::new(MonitorConfig::default())?;
//! let now = Instant::now();
//!
//! monitor.observe_at(0.03, true, now);
//! monitor.observe_at(0.03, true, now + Duration::from_millis(32));
//! let verdict = monitor.observe_at(0.03, true, now + Duration::from_millis(64));
//! assert_eq!(verdict, MonitorVerdict::Interrupt);
//! # Ok::<(), voxlink_vad::VadError>(())
//! ```

mod error;

pub use error::{Result, VadError};

use std::time::{Duration, Instant};
use tracing::debug;

/// Monitor configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// RMS level a chunk must exceed to count as speech (default: 0.02)
    pub threshold: f32,

    /// Consecutive loud chunks needed to request an interruption (default: 3)
    pub required_consecutive: u32,

    /// Minimum time between two interruptions (default: 1000ms)
    pub cooldown: Duration,

    /// When false no level is evaluated and nothing is ever requested
    pub enabled: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            required_consecutive: 3,
            cooldown: Duration::from_millis(1000),
            enabled: true,
        }
    }
}

impl MonitorConfig {
    /// Set level threshold
    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set number of consecutive loud chunks
    pub fn required_consecutive(mut self, count: u32) -> Self {
        self.required_consecutive = count;
        self
    }

    /// Set cooldown between interruptions
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(VadError::config("Threshold must be between 0.0 and 1.0"));
        }

        if self.required_consecutive == 0 {
            return Err(VadError::config("required_consecutive must be at least 1"));
        }

        Ok(())
    }
}

/// Outcome of observing one level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorVerdict {
    /// Monitoring is switched off
    Disabled,
    /// Level at or below threshold; the run was reset
    Below,
    /// Loud run in progress with this many chunks so far
    Rising(u32),
    /// The caller should interrupt the agent now
    Interrupt,
    /// Run completed but the agent is not speaking
    AgentSilent,
    /// Run completed inside the cooldown window
    CoolingDown,
}

impl MonitorVerdict {
    pub fn should_interrupt(self) -> bool {
        self == MonitorVerdict::Interrupt
    }
}

/// Threshold and cooldown policy over the loudness stream
#[derive(Debug)]
pub struct VoiceActivityMonitor {
    config: MonitorConfig,
    consecutive_high: u32,
    last_interrupt: Option<Instant>,
    interrupts: u64,
}

impl VoiceActivityMonitor {
    /// Create a monitor with the given configuration
    pub fn new(config: MonitorConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            consecutive_high: 0,
            last_interrupt: None,
            interrupts: 0,
        })
    }

    /// Observe a level now
    pub fn observe(&mut self, level: f32, agent_speaking: bool) -> MonitorVerdict {
        self.observe_at(level, agent_speaking, Instant::now())
    }

    /// Observe a level at a given instant.
    ///
    /// `agent_speaking` should reflect the live state of the conversation:
    /// receive status `receiving`, or the playback engine reporting output.
    pub fn observe_at(&mut self, level: f32, agent_speaking: bool, now: Instant) -> MonitorVerdict {
        if !self.config.enabled {
            return MonitorVerdict::Disabled;
        }

        if level <= self.config.threshold || level.is_nan() {
            self.consecutive_high = 0;
            return MonitorVerdict::Below;
        }

        self.consecutive_high += 1;
        if self.consecutive_high < self.config.required_consecutive {
            return MonitorVerdict::Rising(self.consecutive_high);
        }

        // A completed run always restarts counting
        self.consecutive_high = 0;

        if let Some(last) = self.last_interrupt {
            if now.saturating_duration_since(last) < self.config.cooldown {
                return MonitorVerdict::CoolingDown;
            }
        }

        if !agent_speaking {
            return MonitorVerdict::AgentSilent;
        }

        self.last_interrupt = Some(now);
        self.interrupts += 1;
        debug!("Voice activity interrupt #{} at level {:.4}", self.interrupts, level);
        MonitorVerdict::Interrupt
    }

    /// Enable or disable monitoring. Either way the current run is dropped.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        self.consecutive_high = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Forget the current run and the cooldown
    pub fn reset(&mut self) {
        self.consecutive_high = 0;
        self.last_interrupt = None;
    }

    pub fn consecutive_high(&self) -> u32 {
        self.consecutive_high
    }

    /// Interruptions requested so far
    pub fn interrupts(&self) -> u64 {
        self.interrupts
    }

    /// Get configuration
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}

impl Default for VoiceActivityMonitor {
    fn default() -> Self {
        Self {
            config: MonitorConfig::default(),
            consecutive_high: 0,
            last_interrupt: None,
            interrupts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: Duration = Duration::from_millis(32);

    fn burst(monitor: &mut VoiceActivityMonitor, start: Instant, speaking: bool) -> usize {
        (0..3)
            .map(|i| monitor.observe_at(0.03, speaking, start + CHUNK * i))
            .filter(|v| v.should_interrupt())
            .count()
    }

    #[test]
    fn test_config_validation() {
        assert!(MonitorConfig::default().validate().is_ok());
        assert!(MonitorConfig::default().threshold(1.5).validate().is_err());
        assert!(MonitorConfig::default()
            .required_consecutive(0)
            .validate()
            .is_err());
        assert!(VoiceActivityMonitor::new(MonitorConfig::default().threshold(-0.1)).is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = MonitorConfig::default()
            .threshold(0.05)
            .required_consecutive(5)
            .cooldown(Duration::from_millis(250))
            .enabled(false);

        assert_eq!(config.threshold, 0.05);
        assert_eq!(config.required_consecutive, 5);
        assert_eq!(config.cooldown, Duration::from_millis(250));
        assert!(!config.enabled);
    }

    #[test]
    fn test_burst_and_cooldown() {
        let mut monitor = VoiceActivityMonitor::default();
        let t0 = Instant::now();

        assert_eq!(burst(&mut monitor, t0, true), 1);

        // Same burst 500ms later is inside the cooldown
        assert_eq!(burst(&mut monitor, t0 + Duration::from_millis(500), true), 0);

        // After the cooldown one more
        assert_eq!(burst(&mut monitor, t0 + Duration::from_millis(1200), true), 1);
        assert_eq!(monitor.interrupts(), 2);
    }

    #[test]
    fn test_rising_run_reports_count() {
        let mut monitor = VoiceActivityMonitor::default();
        let t0 = Instant::now();
        assert_eq!(monitor.observe_at(0.5, true, t0), MonitorVerdict::Rising(1));
        assert_eq!(monitor.observe_at(0.5, true, t0), MonitorVerdict::Rising(2));
        assert_eq!(monitor.observe_at(0.5, true, t0), MonitorVerdict::Interrupt);
        assert_eq!(monitor.consecutive_high(), 0);
    }

    #[test]
    fn test_quiet_chunk_breaks_run() {
        let mut monitor = VoiceActivityMonitor::default();
        let t0 = Instant::now();
        monitor.observe_at(0.03, true, t0);
        monitor.observe_at(0.03, true, t0);
        assert_eq!(monitor.observe_at(0.02, true, t0), MonitorVerdict::Below);
        assert_eq!(monitor.observe_at(0.03, true, t0), MonitorVerdict::Rising(1));
    }

    #[test]
    fn test_never_interrupts_silent_agent() {
        let mut monitor = VoiceActivityMonitor::default();
        let t0 = Instant::now();
        assert_eq!(burst(&mut monitor, t0, false), 0);
        assert_eq!(monitor.consecutive_high(), 0);

        // No cooldown was consumed, so speaking agent is interrupted right away
        assert_eq!(burst(&mut monitor, t0 + CHUNK * 3, true), 1);
    }

    #[test]
    fn test_disabled_monitor_ignores_levels() {
        let mut monitor = VoiceActivityMonitor::new(MonitorConfig::default().enabled(false)).unwrap();
        let t0 = Instant::now();
        for _ in 0..10 {
            assert_eq!(monitor.observe_at(0.9, true, t0), MonitorVerdict::Disabled);
        }
        assert_eq!(monitor.interrupts(), 0);
    }

    #[test]
    fn test_toggling_drops_run() {
        let mut monitor = VoiceActivityMonitor::default();
        let t0 = Instant::now();
        monitor.observe_at(0.03, true, t0);
        monitor.observe_at(0.03, true, t0);
        monitor.set_enabled(false);
        monitor.set_enabled(true);
        assert_eq!(monitor.observe_at(0.03, true, t0), MonitorVerdict::Rising(1));
    }

    #[test]
    fn test_reset_clears_cooldown() {
        let mut monitor = VoiceActivityMonitor::default();
        let t0 = Instant::now();
        assert_eq!(burst(&mut monitor, t0, true), 1);
        monitor.reset();
        assert_eq!(burst(&mut monitor, t0 + CHUNK * 3, true), 1);
    }
}
