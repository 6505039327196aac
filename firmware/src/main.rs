#![no_std]
#![no_main]

// ログマクロを後続モジュールから使うため最初に宣言する
mod fmt;

mod bridge;
mod config;
mod hall_tim;
mod hardware;
mod state;
mod tasks;

#[cfg(not(feature = "defmt"))]
use panic_halt as _;
#[cfg(feature = "defmt")]
use {defmt_rtt as _, panic_probe as _};

use embassy_executor::Spawner;
use embassy_stm32::can;
use embassy_time::{Duration, Timer};

use bridge::BridgeDuty;
use hardware::{InitError, Irqs};
use state::VAULT;
use tasks::{can_task, motor_control_task, watchdog_task};

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    // ハードウェア初期化
    let config = hardware::create_clock_config();
    let p = embassy_stm32::init(config);

    info!("═══════════════════════════════════════════════════");
    info!("  Hall-sensored BLDC Speed Controller");
    info!("  STM32G431VB @ 170MHz, six-step + PID");
    info!("═══════════════════════════════════════════════════");

    // 制御コアは電源投入時に停止状態
    VAULT.init();

    // ブリッジとセンサーを先に確定させ、失敗したら制御タスクは起動しない
    if let Err(e) = hardware::init_cycle_counter() {
        park(e).await;
    }
    let pwm = match hardware::init_bridge_pwm(p.TIM1, p.PE9, p.PE8, p.PE11, p.PE10, p.PE13, p.PE12) {
        Ok(pwm) => pwm,
        Err(e) => park(e).await,
    };
    if let Err(e) = hardware::init_hall_sensor(config::DEFAULT_POLE_PAIRS) {
        park(e).await;
    }

    // CAN初期化
    let mut can_configurator = can::CanConfigurator::new(p.FDCAN1, p.PA11, p.PA12, Irqs);
    can_configurator.properties().set_extended_filter(
        can::filter::ExtendedFilterSlot::_0,
        can::filter::ExtendedFilter::accept_all_into_fifo1(),
    );
    can_configurator.properties().set_standard_filter(
        can::filter::StandardFilterSlot::_0,
        can::filter::StandardFilter::accept_all_into_fifo0(),
    );
    can_configurator.set_bitrate(config::can::DEFAULT_BITRATE);
    let can = can_configurator.start(can::OperatingMode::NormalOperationMode);

    info!("Starting six-step motor control...");

    spawner.spawn(unwrap!(watchdog_task()));
    spawner.spawn(unwrap!(motor_control_task(BridgeDuty::new(pwm))));
    spawner.spawn(unwrap!(can_task(can)));

    // 状態ログ
    loop {
        Timer::after(Duration::from_millis(config::STATUS_LOG_PERIOD_MS)).await;
        let stats = VAULT.snapshot();
        debug!(
            "Status: {:?} flags={:?} speed={} filtered={} pos={} deg",
            stats.state,
            stats.flags,
            stats.current_speed,
            stats.filtered_speed,
            stats.current_position
        );
    }
}

/// 初期化失敗: ブリッジを触らずに停止し、定期的にエラーを出し続ける
async fn park(error: InitError) -> ! {
    error!("Hardware initialization failed: {:?}", error);
    loop {
        Timer::after(Duration::from_secs(5)).await;
        error!("Halted after init failure: {:?}", error);
    }
}
