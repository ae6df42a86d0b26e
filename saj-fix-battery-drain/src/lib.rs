//! Battery-drain fix for SAJ hybrid inverters.
//!
//! Blocks reverse flow (register `0x3635`) while the battery is exporting
//! at night, and switches the application mode (register `0x3247`) to
//! passive once the battery reaches its low watermark, back to self-use as
//! soon as there is photovoltaic power again.

pub mod config;
pub mod controller;
