//! Oscillation detection and the control loop.
//!
//! Some hybrid inverters get stuck pushing power back and forth between the
//! battery and the grid when there is little photovoltaic production and no
//! backup load. The loop watches the power flow registers and, while that
//! happens, limits the inverter output until the condition clears or the
//! fix times out.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use saj_tool_framework::{RegisterIo, SajError};

use crate::config::FixOscSettings;

/// First power flow register.
pub const POWER_REGISTER: u16 = 0x40a5;

/// Number of power flow registers read per poll.
pub const POWER_REGISTER_COUNT: u16 = 8;

/// Inverter output limit register.
pub const OUTPUT_LIMIT_REGISTER: u16 = 0x3249;

/// Power flow data could not be interpreted.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("power flow data is {0} bytes, expected 16")]
pub struct ReadingsError(pub usize);

/// One snapshot of the power flow registers, in watts or VA.
///
/// Battery power is positive while the battery discharges, grid power is
/// positive while power is drawn from the grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerReadings {
    pub pv: i16,
    pub battery: i16,
    pub grid: i16,
    pub grid_apparent: i16,
    pub inverter: i16,
    pub inverter_apparent: i16,
    pub backup: u16,
    pub backup_apparent: u16,
}

impl PowerReadings {
    /// Decode the eight registers starting at [`POWER_REGISTER`].
    pub fn parse(data: &[u8]) -> Result<Self, ReadingsError> {
        if data.len() < usize::from(POWER_REGISTER_COUNT) * 2 {
            return Err(ReadingsError(data.len()));
        }

        let word = |i: usize| u16::from_be_bytes([data[i * 2], data[i * 2 + 1]]);

        Ok(Self {
            pv: word(0) as i16,
            battery: word(1) as i16,
            grid: word(2) as i16,
            grid_apparent: word(3) as i16,
            inverter: word(4) as i16,
            inverter_apparent: word(5) as i16,
            backup: word(6),
            backup_apparent: word(7),
        })
    }
}

/// Whether battery and grid are trading power with each other.
pub fn is_fix_required(readings: &PowerReadings, settings: &FixOscSettings) -> bool {
    if readings.pv > settings.pv_threshold_watts {
        return false;
    }
    if readings.backup > settings.backup_threshold_watts {
        return false;
    }

    let limit = settings.oscillation_threshold_watts;
    (readings.battery > limit && readings.grid > limit)
        || (readings.battery < -limit && readings.grid < -limit)
}

/// Whether an active fix can be lifted.
pub fn can_exit_fix(readings: &PowerReadings, settings: &FixOscSettings) -> bool {
    readings.pv > settings.pv_threshold_watts || readings.backup > settings.backup_threshold_watts
}

/// Delay until the next poll.
pub fn poll_delay(readings: &PowerReadings, settings: &FixOscSettings) -> Duration {
    if 10 < readings.pv && readings.pv < 150 {
        settings.short_poll_delay()
    } else {
        settings.poll_delay()
    }
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    FixActive { since: Instant },
}

/// The oscillation fix controller.
#[derive(Debug)]
pub struct FixOsc {
    settings: FixOscSettings,
    mode: Mode,
    fix_timeout: Duration,
    last_fix_end: Option<Instant>,
}

impl FixOsc {
    pub fn new(settings: FixOscSettings) -> Self {
        let fix_timeout = settings.fix_timeout();
        Self {
            settings,
            mode: Mode::Normal,
            fix_timeout,
            last_fix_end: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Length of the current (or most recent) fix.
    pub fn fix_timeout(&self) -> Duration {
        self.fix_timeout
    }

    /// React to fresh readings and return the delay until the next poll.
    pub async fn on_readings<R>(
        &mut self,
        io: &R,
        readings: &PowerReadings,
        now: Instant,
    ) -> Duration
    where
        R: RegisterIo + ?Sized,
    {
        debug!(
            pv = readings.pv,
            battery = readings.battery,
            grid = readings.grid,
            inverter = readings.inverter,
            backup = readings.backup,
            "Power flow"
        );

        match self.mode {
            Mode::Normal if is_fix_required(readings, &self.settings) => {
                info!(
                    pv = readings.pv,
                    battery = readings.battery,
                    grid = readings.grid,
                    backup = readings.backup,
                    "Oscillation detected"
                );
                self.enter_fix(io, now).await;
            }
            Mode::FixActive { .. } if can_exit_fix(readings, &self.settings) => {
                info!(
                    pv = readings.pv,
                    battery = readings.battery,
                    grid = readings.grid,
                    backup = readings.backup,
                    "Oscillation condition cleared"
                );
                self.exit_fix(io, now).await;
            }
            _ => {}
        }

        poll_delay(readings, &self.settings)
    }

    /// End an active fix that has lasted longer than its timeout.
    pub async fn check_timeout<R>(&mut self, io: &R, now: Instant)
    where
        R: RegisterIo + ?Sized,
    {
        if let Mode::FixActive { since } = self.mode {
            if now.duration_since(since) > self.fix_timeout {
                info!(timeout = ?self.fix_timeout, "Oscillation fix timed out");
                self.exit_fix(io, now).await;
            }
        }
    }

    async fn enter_fix<R>(&mut self, io: &R, now: Instant)
    where
        R: RegisterIo + ?Sized,
    {
        let recent = self
            .last_fix_end
            .is_some_and(|end| now.duration_since(end) < self.settings.relax());

        self.fix_timeout = if recent {
            (self.fix_timeout * 2).min(self.settings.max_fix_timeout())
        } else {
            self.settings.fix_timeout()
        };

        info!(timeout = ?self.fix_timeout, "Limiting inverter output");

        match io
            .write(OUTPUT_LIMIT_REGISTER, self.settings.power_limited)
            .await
        {
            Ok(_) => self.mode = Mode::FixActive { since: now },
            Err(e) => error!(error = %e, "Could not write output limit to start the fix"),
        }
    }

    async fn exit_fix<R>(&mut self, io: &R, now: Instant)
    where
        R: RegisterIo + ?Sized,
    {
        match io
            .write(OUTPUT_LIMIT_REGISTER, self.settings.power_nominal)
            .await
        {
            Ok(_) => {
                self.mode = Mode::Normal;
                self.last_fix_end = Some(now);
                info!("Inverter output restored");
            }
            Err(e) => error!(error = %e, "Could not write output limit to end the fix"),
        }
    }

    /// Poll and react until the session goes away.
    pub async fn run<R>(&mut self, io: &R) -> anyhow::Result<()>
    where
        R: RegisterIo + ?Sized,
    {
        info!(
            register = format_args!("{:#06x}", POWER_REGISTER),
            "Oscillation fix running"
        );

        let mut ticker = tokio::time::interval(self.settings.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_query: Option<Instant> = None;
        let mut delay = self.settings.poll_delay();

        loop {
            ticker.tick().await;

            let now = Instant::now();
            let due = last_query.is_none_or(|at| now.duration_since(at) > delay);

            if due {
                debug!(mode = ?self.mode, "Polling power flow");
                match io.query(POWER_REGISTER, POWER_REGISTER_COUNT).await {
                    Ok(data) => {
                        last_query = Some(now);
                        delay = match PowerReadings::parse(&data) {
                            Ok(readings) => self.on_readings(io, &readings, now).await,
                            Err(e) => {
                                warn!(error = %e, "Power flow data could not be interpreted");
                                self.settings.poll_delay()
                            }
                        };
                    }
                    Err(SajError::NotConnected) => {
                        return Err(SajError::NotConnected.into());
                    }
                    Err(e) => error!(error = %e, "Power flow query failed"),
                }
            }

            self.check_timeout(io, Instant::now()).await;
        }
    }
}
