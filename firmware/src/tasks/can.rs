//! CAN通信タスク
//!
//! コマンド・ハートビート・非常停止の受信とテレメトリ送信を行います。

use embassy_futures::select::select;
use embassy_stm32::can;
use embassy_time::{Duration, Ticker};
use embedded_can::{Id, StandardId};
use motor_core::protocol::{apply_command, can_ids, close_link};
use motor_core::{Command, HeartbeatMonitor, Telemetry};

use crate::config::TELEMETRY_PERIOD_MS;
use crate::state::{DIRECTION, LINK_LOST, VAULT, WATCHDOG_LINK};

/// CAN通信タスク - コマンド処理とテレメトリ送信
#[embassy_executor::task]
pub async fn can_task(can: can::Can<'static>) {
    let (mut tx, mut rx, _properties) = can.split();

    info!("CAN motor control task started");

    let mut heartbeat = HeartbeatMonitor::new();
    let mut telemetry_ticker = Ticker::every(Duration::from_millis(TELEMETRY_PERIOD_MS));

    loop {
        // CANフレーム受信とテレメトリ送信を並行処理
        select(
            async {
                let envelope = match rx.read().await {
                    Ok(envelope) => envelope,
                    Err(_e) => {
                        trace!("CAN RX error: {:?}", _e);
                        return;
                    }
                };
                let frame = envelope.frame;
                let data = frame.data();

                // IDを数値として取得
                let id_raw = match frame.header().id() {
                    Id::Standard(std_id) => std_id.as_raw() as u32,
                    Id::Extended(ext_id) => ext_id.as_raw(),
                };

                match id_raw {
                    can_ids::EMERGENCY_STOP => {
                        warn!("Emergency stop received!");
                        VAULT.trigger_estop();
                    }
                    can_ids::COMMAND => match Command::parse(data) {
                        Ok(command) => {
                            if command == Command::Init {
                                heartbeat.reset();
                            }
                            if let Err(e) = apply_command(command, &VAULT, &WATCHDOG_LINK, &DIRECTION) {
                                warn!("Command {:?} rejected: {:?}", command, e);
                            }
                        }
                        Err(e) => warn!("Malformed command: {:?}", e),
                    },
                    can_ids::HEARTBEAT => match data.first() {
                        Some(&counter) => {
                            // 期限切れ後の最初のハートビートは連番チェックしない
                            if LINK_LOST.try_take().is_some() {
                                heartbeat.reset();
                            }
                            heartbeat.on_heartbeat(counter, &VAULT, &WATCHDOG_LINK);
                        }
                        None => warn!("Empty heartbeat frame"),
                    },
                    can_ids::WATCHDOG_STOP => {
                        close_link(&VAULT, &WATCHDOG_LINK, &mut heartbeat);
                    }
                    _ => {
                        debug!("Unknown CAN ID: 0x{:03X}", id_raw);
                    }
                }
            },
            async {
                // テレメトリ送信（100ms周期）
                telemetry_ticker.next().await;

                let data = Telemetry::from_vault(&VAULT).encode();
                if let Some(std_id) = StandardId::new(can_ids::TELEMETRY as u16) {
                    let id = Id::Standard(std_id);
                    if let Ok(frame) = can::frame::Frame::new_data(id, &data) {
                        let _ = tx.write(&frame).await;
                    }
                }
            },
        )
        .await;
    }
}
