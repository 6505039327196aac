//! 通信ウォッチドッグタスク
//!
//! コマンド層からの init / kick / stop と期限タイマーを select で待ちます。

use embassy_futures::select::{select, Either};
use embassy_time::{Instant, Timer};
use motor_core::Watchdog;

use crate::state::{LINK_LOST, VAULT, WATCHDOG_LINK};

#[embassy_executor::task]
pub async fn watchdog_task() {
    info!("Watchdog task started");

    let mut watchdog = Watchdog::with_default_timeout();

    loop {
        let command = match watchdog.deadline() {
            Some(deadline) => match select(WATCHDOG_LINK.wait(), Timer::at(deadline)).await {
                Either::First(command) => Some(command),
                Either::Second(()) => None,
            },
            // 停止中・期限切れ中は期限が無いのでコマンドだけ待つ
            None => Some(WATCHDOG_LINK.wait().await),
        };

        // 期限を過ぎてから届いたキックで延命しないよう、先に期限を確認する
        let now = Instant::now();
        if watchdog.poll(now, &VAULT) {
            LINK_LOST.signal(());
        }

        if let Some(command) = command {
            trace!("Watchdog command: {:?}", command);
            watchdog.apply(command, now);
        }
    }
}
