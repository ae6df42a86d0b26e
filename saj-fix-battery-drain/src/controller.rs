//! Battery-drain detection and the control loop.
//!
//! At night, with the battery at its low watermark, the inverter keeps
//! trickling battery power into the grid. The controller blocks reverse
//! flow while power is being exported with no photovoltaic production, and
//! parks the inverter in passive mode once the battery is nearly empty
//! until the sun comes back.

use std::time::Duration;

use tracing::{error, info, warn};

use saj_tool_framework::{RegisterIo, SajError};

use crate::config::BatteryDrainSettings;

/// Total photovoltaic power, signed watts.
pub const PV_POWER_REGISTER: u16 = 0x40a5;

/// Smart meter load, signed watts (negative while exporting).
pub const METER_POWER_REGISTER: u16 = 0x40a1;

/// Battery current, signed hundredths of an ampere.
pub const BATTERY_CURRENT_REGISTER: u16 = 0x406a;

/// Reverse flow (export) prevention flag.
pub const REVERSE_FLOW_REGISTER: u16 = 0x3635;

/// Application mode.
pub const APP_MODE_REGISTER: u16 = 0x3247;

const REVERSE_FLOW_PREVENT: u16 = 0x1;
const REVERSE_FLOW_ALLOW: u16 = 0x0;

/// Inverter application mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    SelfUse,
    Passive,
    /// Any other mode; left alone.
    Other(u16),
}

impl AppMode {
    pub fn from_register(value: u16) -> Self {
        match value {
            0x0 => AppMode::SelfUse,
            0x3 => AppMode::Passive,
            other => AppMode::Other(other),
        }
    }

    pub fn register_value(self) -> u16 {
        match self {
            AppMode::SelfUse => 0x0,
            AppMode::Passive => 0x3,
            AppMode::Other(value) => value,
        }
    }
}

impl std::fmt::Display for AppMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppMode::SelfUse => write!(f, "self-use"),
            AppMode::Passive => write!(f, "passive"),
            AppMode::Other(value) => write!(f, "mode {}", value),
        }
    }
}

/// One cycle's worth of measurements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readings {
    pub pv_watts: i16,
    pub meter_watts: i16,
    /// Battery current in hundredths of an ampere.
    pub battery_centiamps: i16,
}

impl Readings {
    pub fn battery_amps(&self) -> f64 {
        f64::from(self.battery_centiamps) * 0.01
    }

    /// Read pv, meter and battery current, one register each.
    pub async fn read<R>(io: &R) -> Result<Self, SajError>
    where
        R: RegisterIo + ?Sized,
    {
        Ok(Self {
            pv_watts: io.read_i16(PV_POWER_REGISTER).await?,
            meter_watts: io.read_i16(METER_POWER_REGISTER).await?,
            battery_centiamps: io.read_i16(BATTERY_CURRENT_REGISTER).await?,
        })
    }

    /// Battery is barely charging: between -1.00 A and -0.01 A.
    fn battery_at_low_watermark(&self) -> bool {
        (-100..=-1).contains(&self.battery_centiamps)
    }
}

/// The battery-drain controller.
#[derive(Debug)]
pub struct BatteryDrainFix {
    settings: BatteryDrainSettings,
    reverse_flow_prevented: bool,
    app_mode: AppMode,
}

impl BatteryDrainFix {
    pub fn new(
        settings: BatteryDrainSettings,
        reverse_flow_prevented: bool,
        app_mode: AppMode,
    ) -> Self {
        Self {
            settings,
            reverse_flow_prevented,
            app_mode,
        }
    }

    /// Read the current reverse flow flag and application mode.
    pub async fn discover<R>(io: &R, settings: BatteryDrainSettings) -> Result<Self, SajError>
    where
        R: RegisterIo + ?Sized,
    {
        let reverse_flow = io.read_u16(REVERSE_FLOW_REGISTER).await?;
        let app_mode = io.read_u16(APP_MODE_REGISTER).await?;
        Ok(Self::new(
            settings,
            reverse_flow == REVERSE_FLOW_PREVENT,
            AppMode::from_register(app_mode),
        ))
    }

    /// [`discover`](Self::discover), retrying until the inverter answers.
    pub async fn initialize<R>(io: &R, settings: BatteryDrainSettings) -> Result<Self, SajError>
    where
        R: RegisterIo + ?Sized,
    {
        loop {
            match Self::discover(io, settings.clone()).await {
                Ok(fix) => {
                    info!(
                        fix = if fix.reverse_flow_prevented { "on" } else { "off" },
                        app_mode = %fix.app_mode,
                        "Battery drain fix set up"
                    );
                    return Ok(fix);
                }
                Err(SajError::NotConnected) => return Err(SajError::NotConnected),
                Err(e) => {
                    warn!(
                        error = %e,
                        retry = ?settings.init_retry(),
                        "Could not read initial state"
                    );
                    tokio::time::sleep(settings.init_retry()).await;
                }
            }
        }
    }

    pub fn app_mode(&self) -> AppMode {
        self.app_mode
    }

    pub fn reverse_flow_prevented(&self) -> bool {
        self.reverse_flow_prevented
    }

    async fn set_reverse_flow<R>(&mut self, io: &R, prevent: bool) -> Result<(), SajError>
    where
        R: RegisterIo + ?Sized,
    {
        let flag = if prevent {
            REVERSE_FLOW_PREVENT
        } else {
            REVERSE_FLOW_ALLOW
        };
        io.write(REVERSE_FLOW_REGISTER, flag).await?;
        self.reverse_flow_prevented = prevent;
        Ok(())
    }

    async fn set_app_mode<R>(&mut self, io: &R, mode: AppMode) -> Result<(), SajError>
    where
        R: RegisterIo + ?Sized,
    {
        io.write(APP_MODE_REGISTER, mode.register_value()).await?;
        self.app_mode = mode;
        Ok(())
    }

    /// Apply one cycle's decision.
    ///
    /// Returns the new cycle length when something changed.
    pub async fn cycle<R>(
        &mut self,
        io: &R,
        readings: &Readings,
    ) -> Result<Option<Duration>, SajError>
    where
        R: RegisterIo + ?Sized,
    {
        match self.app_mode {
            AppMode::SelfUse => self.cycle_self_use(io, readings).await,
            AppMode::Passive => self.cycle_passive(io, readings).await,
            AppMode::Other(_) => Ok(None),
        }
    }

    async fn cycle_self_use<R>(
        &mut self,
        io: &R,
        readings: &Readings,
    ) -> Result<Option<Duration>, SajError>
    where
        R: RegisterIo + ?Sized,
    {
        if readings.battery_at_low_watermark()
            && readings.pv_watts == 0
            && readings.meter_watts > 0
        {
            info!(
                battery_current = format_args!("{:.2}", readings.battery_amps()),
                pv = readings.pv_watts,
                meter = readings.meter_watts,
                "Moving into passive mode"
            );
            self.set_app_mode(io, AppMode::Passive).await?;
            self.set_reverse_flow(io, false).await?;
            return Ok(Some(self.settings.fix_cycle()));
        }

        if !self.reverse_flow_prevented {
            if readings.pv_watts == 0 && readings.meter_watts < self.settings.threshold_watts {
                info!(
                    battery_current = format_args!("{:.2}", readings.battery_amps()),
                    pv = readings.pv_watts,
                    meter = readings.meter_watts,
                    "Preventing reverse flow"
                );
                self.set_reverse_flow(io, true).await?;
                return Ok(Some(self.settings.fix_cycle()));
            }
        } else if readings.meter_watts >= 0 {
            info!(
                battery_current = format_args!("{:.2}", readings.battery_amps()),
                pv = readings.pv_watts,
                meter = readings.meter_watts,
                "Allowing reverse flow again"
            );
            self.set_reverse_flow(io, false).await?;
            return Ok(Some(self.settings.normal_cycle()));
        }

        Ok(None)
    }

    async fn cycle_passive<R>(
        &mut self,
        io: &R,
        readings: &Readings,
    ) -> Result<Option<Duration>, SajError>
    where
        R: RegisterIo + ?Sized,
    {
        if readings.pv_watts > 0 {
            info!(
                battery_current = format_args!("{:.2}", readings.battery_amps()),
                pv = readings.pv_watts,
                meter = readings.meter_watts,
                "Moving into self-use mode"
            );
            self.set_app_mode(io, AppMode::SelfUse).await?;
            self.set_reverse_flow(io, false).await?;
            return Ok(Some(self.settings.normal_cycle()));
        }

        Ok(None)
    }

    /// Read and react every cycle until the session goes away.
    pub async fn run<R>(&mut self, io: &R) -> anyhow::Result<()>
    where
        R: RegisterIo + ?Sized,
    {
        let mut duration = self.settings.normal_cycle();

        loop {
            let outcome = match Readings::read(io).await {
                Ok(readings) => self.cycle(io, &readings).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(Some(next)) => duration = next,
                Ok(None) => {}
                Err(SajError::NotConnected) => return Err(SajError::NotConnected.into()),
                Err(e) => {
                    if e.is_timeout() {
                        warn!(error = %e, "Inverter did not answer in time");
                    } else {
                        error!(error = %e, "Cycle failed");
                    }
                    duration = self.settings.normal_cycle();
                }
            }

            tokio::time::sleep(duration).await;
        }
    }
}
