use chrono::{NaiveDate, NaiveDateTime};

/// Peak notifications are held back until local noon.
pub const PEAK_NOTIFY_AFTER_SECS: u32 = 12 * 3_600;

/// Per-day accumulators owned by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyState {
    cumulated_energy_wh: f64,
    peak_power_w: f64,
    peak_time: Option<NaiveDateTime>,
    peak_notified: bool,
    last_seen_day: Option<NaiveDate>,
}

impl Default for DailyState {
    fn default() -> Self {
        Self {
            cumulated_energy_wh: 0.0,
            // below any real reading so the first sample of the first day registers
            peak_power_w: -1.0,
            peak_time: None,
            peak_notified: false,
            last_seen_day: None,
        }
    }
}

impl DailyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `today` and resets the accumulator and peak when the day changed.
    ///
    /// The first call only records the day. The notified flag is left alone;
    /// the next strictly higher reading clears it.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        let changed = matches!(self.last_seen_day, Some(day) if day != today);
        if changed {
            self.cumulated_energy_wh = 0.0;
            self.peak_power_w = 0.0;
            self.peak_time = None;
        }
        self.last_seen_day = Some(today);
        changed
    }

    /// Returns true when `power_w` is a new daily maximum.
    pub fn observe_power(&mut self, power_w: f64, at: NaiveDateTime) -> bool {
        if power_w > self.peak_power_w {
            self.peak_power_w = power_w;
            self.peak_time = Some(at);
            self.peak_notified = false;
            return true;
        }
        false
    }

    /// Decides whether the current peak should be announced and marks it as sent.
    pub fn take_peak_notification(&mut self, seconds_since_midnight: u32, new_peak: bool) -> bool {
        if seconds_since_midnight > PEAK_NOTIFY_AFTER_SECS && (!self.peak_notified || new_peak) {
            self.peak_notified = true;
            return true;
        }
        false
    }

    pub fn accumulate(&mut self, energy_wh: f64) -> f64 {
        self.cumulated_energy_wh += energy_wh;
        self.cumulated_energy_wh
    }

    pub fn cumulated_energy_wh(&self) -> f64 {
        self.cumulated_energy_wh
    }

    pub fn peak(&self) -> Option<(f64, NaiveDateTime)> {
        self.peak_time.map(|at| (self.peak_power_w, at))
    }

    pub fn peak_notified(&self) -> bool {
        self.peak_notified
    }

    pub fn last_seen_day(&self) -> Option<NaiveDate> {
        self.last_seen_day
    }
}
