//! タスクモジュール
//!
//! 各タスクの実装を分離して管理します。

pub mod can;
pub mod motor_control;
pub mod watchdog;

// タスク関数を再エクスポート
pub use can::can_task;
pub use motor_control::motor_control_task;
pub use watchdog::watchdog_task;
