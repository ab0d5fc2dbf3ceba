/// Date source for `TODAY()`.
use chrono::NaiveDate;

/// Supplies the current date to formula evaluation.
///
/// Engines share one provider across the evaluation thread pool.
pub trait ClockProvider: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Timezone the system clock reads "today" in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeZoneSpec {
    /// The host's local timezone.
    #[default]
    Local,
    Utc,
}

/// Wall-clock date in the configured timezone.
#[cfg(feature = "system-clock")]
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock {
    pub timezone: TimeZoneSpec,
}

#[cfg(feature = "system-clock")]
impl SystemClock {
    pub fn new(timezone: TimeZoneSpec) -> Self {
        Self { timezone }
    }
}

#[cfg(feature = "system-clock")]
impl ClockProvider for SystemClock {
    fn today(&self) -> NaiveDate {
        match self.timezone {
            TimeZoneSpec::Local => chrono::Local::now().date_naive(),
            TimeZoneSpec::Utc => chrono::Utc::now().date_naive(),
        }
    }
}

/// Always returns the same date. Used for deterministic recomputation and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedClock(pub NaiveDate);

impl ClockProvider for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// The clock an engine uses when none is supplied.
///
/// Without the `system-clock` feature there is no ambient time source, so
/// the fallback is a fixed Unix epoch date.
pub fn default_clock() -> std::sync::Arc<dyn ClockProvider> {
    #[cfg(feature = "system-clock")]
    {
        std::sync::Arc::new(SystemClock::default())
    }
    #[cfg(not(feature = "system-clock"))]
    {
        std::sync::Arc::new(FixedClock(NaiveDate::default()))
    }
}
