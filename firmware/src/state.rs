//! グローバル共有状態
//!
//! Hall割り込み・制御タスク・CANタスク・ウォッチドッグタスクで共有する静的変数。
//! Vault のロックが唯一のロックで、エッジ時刻と回転方向はアトミックで受け渡す。

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use motor_core::{DirectionCell, EdgeClock, MotorVault, WatchdogLink};

/// モーター状態（唯一の状態ストア）
pub static VAULT: MotorVault = MotorVault::new();

/// 最後に受理した Hall エッジの時刻 [DWT cycle]
pub static EDGE_CLOCK: EdgeClock = EdgeClock::new();

/// 転流方向
pub static DIRECTION: DirectionCell = DirectionCell::new();

/// コマンド層 → ウォッチドッグタスク
pub static WATCHDOG_LINK: WatchdogLink = WatchdogLink::new();

/// ウォッチドッグ期限切れの通知（CANタスクがハートビート連番をリセットする）
pub static LINK_LOST: Signal<CriticalSectionRawMutex, ()> = Signal::new();
