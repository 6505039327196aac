//! Hallセンサー付きBLDCモーター速度制御コア
//!
//! 割り込み駆動の転流エンジン、PID速度制御、共有状態（Vault）、通信ウォッチドッグを
//! ハードウェア非依存で実装します。ハードウェアへの出力は [`actuator`] のトレイト経由です。

#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod actuator;
pub mod commutation;
pub mod config;
pub mod pid;
pub mod protocol;
pub mod sim;
pub mod speed_control;
pub mod vault;
pub mod watchdog;

pub use actuator::{DutyOutput, HallSensors, PhaseDriver, PhaseOutputs};
pub use commutation::{
    CommutationConfig, CommutationEngine, Direction, DirectionCell, EdgeClock, EdgeOutcome,
};
pub use pid::PidController;
pub use protocol::{Command, HeartbeatEvent, HeartbeatMonitor, ProtocolError, Telemetry};
pub use speed_control::{ControlEvent, ControlOutput, SpeedController};
pub use vault::{FaultFlags, MotorState, MotorStatus, MotorVault};
pub use watchdog::{Watchdog, WatchdogCommand, WatchdogLink};

/// モーター制御コアのエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// 非常停止がラッチ中のため目標値を受け付けない（`init` が必要）
    EStopLatched,
    /// 転流テーブルに存在しないステップコード
    InvalidStep(u8),
    /// 不正なHall値（0 / 7）
    InvalidHall(u8),
}
