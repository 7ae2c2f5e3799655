//! The poll loop: night suppression, backoff and cancellation.
//!
//! Each tick goes IDLE -> POLLING -> SUCCESS | FAILED -> IDLE. Only one device
//! call is ever in flight and every reading is fully published before the
//! next tick is scheduled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};

use crate::config::Settings;
use crate::error::SchedulerError;
use crate::sources::inverter::Inverter;
use crate::sun_window::{daylight_window, DaylightWindow, LocalZone, Position};
use crate::targets::metric_publisher::MetricPublisher;

const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// How often the output limit and on/off state are read back.
pub const SETTINGS_INTERVAL: Duration = Duration::from_secs(600);

/// Shared cancellation flag, raised from a signal handler or another thread.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// The raw flag, for `signal_hook::flag::register`.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for `duration` or until `stop` is raised. Returns false when stopped.
    fn sleep(&self, duration: Duration, stop: &StopSignal) -> bool;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration, stop: &StopSignal) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if stop.is_stopped() {
                return false;
            }
            let slice = remaining.min(SLEEP_SLICE);
            thread::sleep(slice);
            remaining -= slice;
        }
        !stop.is_stopped()
    }
}

/// Delay after `failures` consecutive failed polls:
/// `base * 2^min(failures, max_exponent)`, never more than `base * cap_factor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_exponent: u32,
    pub cap_factor: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_exponent: 6,
            cap_factor: 10,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, base: Duration, failures: u32) -> Duration {
        if failures == 0 {
            return base;
        }
        let exponent = failures.min(self.max_exponent).min(31);
        base.saturating_mul(1 << exponent)
            .min(base.saturating_mul(self.cap_factor))
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub update_interval: Duration,
    pub request_timeout: Duration,
    pub stop_at_night: bool,
    pub position: Position,
    pub zone: LocalZone,
    pub backoff: BackoffPolicy,
    pub settings_interval: Duration,
}

impl From<&Settings> for SchedulerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            update_interval: settings.update_interval,
            request_timeout: settings.request_timeout,
            stop_at_night: settings.stop_at_night,
            position: settings.position,
            zone: settings.zone,
            backoff: BackoffPolicy::default(),
            settings_interval: SETTINGS_INTERVAL,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScheduleState {
    pub last_poll_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub next_settings_poll_at: Option<DateTime<Utc>>,
    daylight: Option<(NaiveDate, DaylightWindow)>,
}

impl ScheduleState {
    pub fn daylight(&self) -> Option<&DaylightWindow> {
        self.daylight.as_ref().map(|(_, window)| window)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Outside daylight, the inverter was left alone.
    Night { wake_up_at: DateTime<Utc> },
    Published { failed_publications: usize },
    Failed,
}

fn after(instant: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| instant.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct PollScheduler<C: Clock = SystemClock> {
    config: SchedulerConfig,
    inverter: Box<dyn Inverter>,
    publishers: Vec<Box<dyn MetricPublisher>>,
    clock: C,
    stop: StopSignal,
    state: ScheduleState,
}

impl<C: Clock> PollScheduler<C> {
    pub fn new(
        config: SchedulerConfig,
        inverter: Box<dyn Inverter>,
        publishers: Vec<Box<dyn MetricPublisher>>,
        clock: C,
        stop: StopSignal,
    ) -> Self {
        Self {
            config,
            inverter,
            publishers,
            clock,
            stop,
            state: ScheduleState::default(),
        }
    }

    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    /// Daylight window of `date`, computed once per local calendar day.
    fn daylight_for(&mut self, date: NaiveDate) -> Result<DaylightWindow, SchedulerError> {
        if let Some((cached, window)) = self.state.daylight {
            if cached == date {
                return Ok(window);
            }
        }
        let window = daylight_window(date, &self.config.position, &self.config.zone);
        if !window.is_well_formed() {
            return Err(SchedulerError::InvalidDaylightWindow {
                date,
                sunrise: window.sunrise,
                sunset: window.sunset,
            });
        }
        debug!(
            "Daylight on {date}: {} - {}",
            self.config.zone.format(window.sunrise),
            self.config.zone.format(window.sunset)
        );
        self.state.daylight = Some((date, window));
        Ok(window)
    }

    fn next_sunrise(&self, now: DateTime<Utc>, today: &DaylightWindow) -> DateTime<Utc> {
        if now <= today.sunrise {
            return today.sunrise;
        }
        let date = self.config.zone.local_date(now);
        let tomorrow = date.succ_opt().unwrap_or(date);
        daylight_window(tomorrow, &self.config.position, &self.config.zone).sunrise
    }

    /// Reads the power settings when they are due. Returns the failed publications.
    fn refresh_power_settings(&mut self, now: DateTime<Utc>) -> usize {
        if self
            .state
            .next_settings_poll_at
            .is_some_and(|due| now < due)
        {
            return 0;
        }
        self.state.next_settings_poll_at = Some(after(now, self.config.settings_interval));

        match self.inverter.power_settings(self.config.request_timeout) {
            Ok(settings) => {
                debug!(
                    "Max power {} W, power {}",
                    settings.max_power_w,
                    if settings.power_on { "on" } else { "off" }
                );
                self.publishers
                    .iter_mut()
                    .map(|publisher| publisher.publish_power_settings(&settings).len())
                    .sum()
            }
            Err(e) => {
                warn!("Could not read power settings: {e}");
                0
            }
        }
    }

    /// Runs one poll cycle and schedules the next one.
    pub fn tick(&mut self) -> Result<TickOutcome, SchedulerError> {
        let now = self.clock.now();
        let interval = self.config.update_interval;

        if self.config.stop_at_night {
            let window = self.daylight_for(self.config.zone.local_date(now))?;
            if !window.contains(now) {
                let wake_up_at = self.next_sunrise(now, &window).max(after(now, interval));
                self.state.next_poll_at = Some(wake_up_at);
                info!(
                    "Night, next update at {}",
                    self.config.zone.format(wake_up_at)
                );
                return Ok(TickOutcome::Night { wake_up_at });
            }
        }

        self.state.last_poll_at = Some(now);
        let outcome = match self.inverter.fetch_status(self.config.request_timeout) {
            Ok(reading) => {
                if self.state.consecutive_failures > 0 {
                    info!(
                        "Inverter answered again after {} failed polls",
                        self.state.consecutive_failures
                    );
                }
                self.state.consecutive_failures = 0;
                let failed_publications = self
                    .publishers
                    .iter_mut()
                    .map(|publisher| publisher.publish(&reading).len())
                    .sum::<usize>()
                    + self.refresh_power_settings(now);
                if failed_publications > 0 {
                    warn!("{failed_publications} messages could not be published");
                }
                TickOutcome::Published {
                    failed_publications,
                }
            }
            Err(e) => {
                self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
                if self.state.consecutive_failures == 1 {
                    warn!("Could not read inverter: {e}");
                } else {
                    debug!(
                        "Could not read inverter ({} in a row): {e}",
                        self.state.consecutive_failures
                    );
                }
                TickOutcome::Failed
            }
        };

        let delay = self
            .config
            .backoff
            .delay(interval, self.state.consecutive_failures);
        let next_poll_at = after(now, delay);
        self.state.next_poll_at = Some(next_poll_at);
        debug!("Next update at {}", self.config.zone.format(next_poll_at));
        Ok(outcome)
    }

    /// Polls until the stop signal is raised.
    pub fn run(&mut self) -> Result<(), SchedulerError> {
        info!(
            "Polling every {:.2}s{}",
            self.config.update_interval.as_secs_f64(),
            if self.config.stop_at_night {
                ", pausing at night"
            } else {
                ""
            }
        );
        while !self.stop.is_stopped() {
            self.tick()?;

            // compensate for the time spent polling and publishing
            let delay = self
                .state
                .next_poll_at
                .and_then(|next| (next - self.clock.now()).to_std().ok())
                .unwrap_or(Duration::ZERO);
            if !self.clock.sleep(delay, &self.stop) {
                break;
            }
        }
        info!("Polling stopped");
        Ok(())
    }
}
