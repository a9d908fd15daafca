use std::env;
use std::time::Duration;

/// Tick driver interval used when `STUDY_TICK_MS` is unset.
pub const DEFAULT_TICK_MS: u64 = 250;

/// Runtime knobs of the sync coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// How often the spawned driver ticks a running timer. `None` leaves
    /// ticking to the caller.
    pub tick_interval: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval: Some(Duration::from_millis(DEFAULT_TICK_MS)),
        }
    }
}

impl SyncConfig {
    /// No tick driver; timers only advance on explicit `tick()` calls.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            tick_interval: None,
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::from_tick_ms(env::var("STUDY_TICK_MS").ok().as_deref())
    }

    fn from_tick_ms(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Self::default();
        };
        match raw.parse::<u64>() {
            Ok(0) => Self::manual(),
            Ok(ms) => Self {
                tick_interval: Some(Duration::from_millis(ms)),
            },
            Err(_) => {
                log::warn!("ignoring invalid STUDY_TICK_MS={raw:?}, using {DEFAULT_TICK_MS}ms");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_interval_parsing() {
        assert_eq!(SyncConfig::from_tick_ms(None), SyncConfig::default());
        assert_eq!(SyncConfig::from_tick_ms(Some("0")), SyncConfig::manual());
        assert_eq!(
            SyncConfig::from_tick_ms(Some(" 100 ")).tick_interval,
            Some(Duration::from_millis(100))
        );
        assert_eq!(SyncConfig::from_tick_ms(Some("fast")), SyncConfig::default());
    }
}
