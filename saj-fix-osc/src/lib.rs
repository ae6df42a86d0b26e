//! Oscillation fix for SAJ hybrid inverters.
//!
//! Polls the power flow registers and limits the inverter output
//! (register `0x3249`) while battery and grid trade power with each other.
//!
//! # Power flow registers
//!
//! ```text
//! 0x40a5  pv              i16  W
//! 0x40a6  battery         i16  W  (positive while discharging)
//! 0x40a7  grid            i16  W  (positive while importing)
//! 0x40a8  grid apparent   i16  VA
//! 0x40a9  inverter        i16  W
//! 0x40aa  inverter app.   i16  VA
//! 0x40ab  backup          u16  W
//! 0x40ac  backup apparent u16  VA
//! ```

pub mod config;
pub mod controller;
