//! モーター制御タスク
//!
//! 100Hz の速度制御ループを実行します。転流は Hall 割り込みが行い、
//! このタスクはデューティと通電の開始・停止だけを決めます。

use cortex_m::peripheral::DWT;
use embassy_time::{Duration, Ticker};
use motor_core::{ControlEvent, DutyOutput, SpeedController};

use crate::bridge::BridgeDuty;
use crate::config::{CONTROL_PERIOD_MS, SYSCLK_HZ};
use crate::hall_tim;
use crate::state::{EDGE_CLOCK, VAULT};

/// ログ出力間隔 [制御周期]（1秒）
const LOG_INTERVAL_TICKS: u32 = 100;

/// モーター制御タスク（100Hz PID 速度制御ループ）
#[embassy_executor::task]
pub async fn motor_control_task(mut duty: BridgeDuty) {
    info!(
        "Motor control task started ({} ms period, max duty {})",
        CONTROL_PERIOD_MS,
        duty.max_duty()
    );

    let mut controller = SpeedController::new(&VAULT, &EDGE_CLOCK, SYSCLK_HZ);
    let mut ticker = Ticker::every(Duration::from_millis(CONTROL_PERIOD_MS));

    // 位置合わせに失敗したまま運転中なら毎周期やり直す
    let mut align_pending = false;
    let mut log_counter: u32 = 0;

    loop {
        ticker.next().await;

        let output = controller.tick(DWT::cycle_count(), &mut duty);

        match output.event {
            Some(ControlEvent::Started) => {
                info!("Motor started: target={} rpm", VAULT.target_speed());
                align_pending = true;
            }
            Some(ControlEvent::Stopped) => {
                info!("Motor stopped");
                hall_tim::release();
                align_pending = false;
            }
            Some(ControlEvent::StallLatched) => {
                hall_tim::release();
                align_pending = false;
            }
            None => {}
        }

        if align_pending {
            match hall_tim::align() {
                Ok(step) => {
                    debug!("Bridge energized at step {}", step);
                    align_pending = false;
                }
                Err(e) => {
                    if log_counter % LOG_INTERVAL_TICKS == 0 {
                        warn!("Rotor alignment failed: {:?}", e);
                    }
                }
            }
        }

        log_counter = log_counter.wrapping_add(1);
        if log_counter % LOG_INTERVAL_TICKS == 0 && hall_tim::is_energized() {
            info!(
                "Speed: target={} filtered={} rpm, duty={} ({}%)",
                VAULT.target_speed(),
                controller.filtered_speed(),
                output.duty,
                output.percent
            );
        }
    }
}
