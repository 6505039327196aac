//! Configuration module
//!
//! ボード固有のパラメータ（クロック・PWM・CAN・Hallタイマー）と、
//! 制御コアの定数の再エクスポートをまとめます。

pub mod params;

pub use params::*;

// 制御周期や極対数は制御コアと共通
pub use motor_core::config::{CONTROL_PERIOD_MS, DEFAULT_POLE_PAIRS, TELEMETRY_PERIOD_MS};
