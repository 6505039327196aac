//! ハードウェア初期化モジュール
//!
//! ペリフェラルの初期化ロジックを集約します。失敗は [`InitError`] で返し、
//! `main` は制御タスクを起動せずに停止します。

use cortex_m::peripheral::DWT;
use embassy_stm32::{
    bind_interrupts, can,
    gpio::OutputType,
    peripherals,
    timer::{
        complementary_pwm::{ComplementaryPwm, ComplementaryPwmPin},
        low_level::CountingMode,
        simple_pwm::PwmPin,
        Channel,
    },
    Config, Peri,
};
use motor_core::commutation::is_valid_hall_state;
use motor_core::{CommutationConfig, CommutationEngine};

use crate::bridge::{BridgePhases, GpioHall};
use crate::config;
use crate::hall_tim::{self, HallContext};
use crate::state::{DIRECTION, EDGE_CLOCK, VAULT};

// CANの割り込みをバインド
bind_interrupts!(pub struct Irqs {
    FDCAN1_IT0 => can::IT0InterruptHandler<peripherals::FDCAN1>;
    FDCAN1_IT1 => can::IT1InterruptHandler<peripherals::FDCAN1>;
});

/// 初期化エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError {
    /// Cortex-M コアペリフェラルが既に取得されている
    CorePeripheralsTaken,
    /// DWT サイクルカウンタが進まない
    CycleCounterStalled,
    /// PWM の周期が取れない（クロック設定不整合）
    PwmPeriod,
    /// 起動時の Hall 値が不正（未接続・配線ミス）
    HallSensor(u8),
}

/// RCCクロック設定を初期化
///
/// HSI → PLL（÷4 × 85 ÷ 2）で170MHz生成
pub fn create_clock_config() -> Config {
    let mut config = Config::default();
    {
        use embassy_stm32::rcc::mux::{ClockMux, Fdcansel};
        use embassy_stm32::rcc::{Pll, PllMul, PllPreDiv, PllQDiv, PllRDiv, PllSource, Sysclk};

        config.rcc.hsi = true;
        config.rcc.pll = Some(Pll {
            source: PllSource::HSI,
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL85,
            divp: None,
            divq: Some(PllQDiv::DIV2), // FDCANクロック用
            divr: Some(PllRDiv::DIV2),
        });
        config.rcc.sys = Sysclk::PLL1_R;

        let mut clock_mux = ClockMux::default();
        clock_mux.fdcansel = Fdcansel::PLL1_Q;
        config.rcc.mux = clock_mux;
    }
    config
}

/// DWTサイクルカウンタを有効化（Hallエッジのタイムスタンプ源）
pub fn init_cycle_counter() -> Result<(), InitError> {
    let mut cp = cortex_m::Peripherals::take().ok_or(InitError::CorePeripheralsTaken)?;
    cp.DCB.enable_trace();
    cp.DWT.enable_cycle_counter();

    let start = DWT::cycle_count();
    cortex_m::asm::delay(64);
    if DWT::cycle_count() == start {
        return Err(InitError::CycleCounterStalled);
    }
    info!("DWT cycle counter running ({} Hz)", config::SYSCLK_HZ);
    Ok(())
}

/// TIM1 3相相補PWM（出力は全OFF、デューティ0で返す）
///
/// U: PE9/PE8, V: PE11/PE10, W: PE13/PE12
#[allow(clippy::too_many_arguments)]
pub fn init_bridge_pwm(
    tim1: Peri<'static, peripherals::TIM1>,
    u_high: Peri<'static, peripherals::PE9>,
    u_low: Peri<'static, peripherals::PE8>,
    v_high: Peri<'static, peripherals::PE11>,
    v_low: Peri<'static, peripherals::PE10>,
    w_high: Peri<'static, peripherals::PE13>,
    w_low: Peri<'static, peripherals::PE12>,
) -> Result<ComplementaryPwm<'static, peripherals::TIM1>, InitError> {
    let mut pwm = ComplementaryPwm::new(
        tim1,
        Some(PwmPin::new(u_high, OutputType::PushPull)),
        Some(ComplementaryPwmPin::new(u_low, OutputType::PushPull)),
        Some(PwmPin::new(v_high, OutputType::PushPull)),
        Some(ComplementaryPwmPin::new(v_low, OutputType::PushPull)),
        Some(PwmPin::new(w_high, OutputType::PushPull)),
        Some(ComplementaryPwmPin::new(w_low, OutputType::PushPull)),
        None,
        None,
        config::pwm::DEFAULT_FREQUENCY,
        CountingMode::EdgeAlignedUp,
    );

    for ch in [Channel::Ch1, Channel::Ch2, Channel::Ch3] {
        pwm.disable(ch);
        pwm.set_duty(ch, 0);
    }
    pwm.set_dead_time(config::pwm::DEFAULT_DEAD_TIME);

    let max_duty = pwm.get_max_duty();
    if max_duty == 0 {
        return Err(InitError::PwmPeriod);
    }
    info!(
        "TIM1 PWM: {} Hz, max duty {}, dead time {}",
        config::pwm::DEFAULT_FREQUENCY.0,
        max_duty,
        config::pwm::DEFAULT_DEAD_TIME
    );
    Ok(pwm)
}

/// TIM4 Hallセンサーインターフェース初期化
///
/// 転流エンジンを割り込みコンテキストに登録してから TIM4 割り込みを有効にする。
pub fn init_hall_sensor(pole_pairs: u8) -> Result<(), InitError> {
    info!("Initializing TIM4 Hall Sensor Interface (XOR mode)...");

    let engine = CommutationEngine::new(
        CommutationConfig::new(config::SYSCLK_HZ, pole_pairs),
        &VAULT,
        &EDGE_CLOCK,
        &DIRECTION,
    );
    hall_tim::install(HallContext {
        engine,
        phases: BridgePhases::new(),
        hall: GpioHall,
    });
    unsafe {
        hall_tim::init_hall_timer();
    }

    // GPIOB のクロックが入った後で配線を確認する
    let state = GpioHall.probe();
    if !is_valid_hall_state(state) {
        cortex_m::peripheral::NVIC::mask(embassy_stm32::pac::Interrupt::TIM4);
        return Err(InitError::HallSensor(state));
    }

    info!("TIM4 Hall Sensor Interface initialized");
    Ok(())
}
