//! Background monitor estimating how much of the day was spent actively working.
//! Platform signals (idle counter, foreground window, pointer position) are polled independently,
//! fused into an Active/Idle/Inactive state and recorded into a 10 minute timeline per day.
//!

pub mod cli;
pub mod daemon;
pub mod signal_api;
pub mod utils;
