//! 3相ブリッジとHall入力のハードウェア実装
//!
//! - [`BridgeDuty`]: TIM1 の3チャネルに同じデューティを設定（速度制御タスクが所有）
//! - [`BridgePhases`]: TIM1 の CCMR/CCER を直接操作して6スイッチを切り替える（Hall割り込みが所有）
//! - [`GpioHall`]: GPIOB の IDR から Hall 値を読む
//!
//! 通電相のハイサイドは PWM モード1 で CHx のみ有効、ローサイドは出力基準を
//! 強制 Inactive にして CHx/CHxN を両方有効にする（CHxN が常時 ON、デッドタイム付き）。
//! 非通電相は CHx/CHxN とも無効。

use embassy_stm32::{
    pac,
    peripherals,
    timer::{complementary_pwm::ComplementaryPwm, Channel},
};
use motor_core::actuator::{DutyOutput, HallSensors, Phase, PhaseDriver, PhaseOutputs};
use motor_core::Error;

use crate::config::hall;

/// 相 → TIM1 チャネル番号（0 = CH1）
const fn channel_index(phase: Phase) -> usize {
    match phase {
        Phase::U => 0,
        Phase::V => 1,
        Phase::W => 2,
    }
}

/// TIM1 デューティ出力
///
/// ComplementaryPwm は CCR の更新にだけ使い、出力の有効/無効は [`BridgePhases`] が持つ。
pub struct BridgeDuty {
    pwm: ComplementaryPwm<'static, peripherals::TIM1>,
    max_duty: u16,
}

impl BridgeDuty {
    pub fn new(pwm: ComplementaryPwm<'static, peripherals::TIM1>) -> Self {
        let max_duty = pwm.get_max_duty();
        Self { pwm, max_duty }
    }
}

impl DutyOutput for BridgeDuty {
    fn max_duty(&self) -> u16 {
        self.max_duty
    }

    fn set_duty(&mut self, duty: u16) {
        let duty = duty.min(self.max_duty);
        self.pwm.set_duty(Channel::Ch1, duty);
        self.pwm.set_duty(Channel::Ch2, duty);
        self.pwm.set_duty(Channel::Ch3, duty);
    }
}

/// TIM1 スイッチ出力
///
/// `energize` されるまでは転流ステップを検証するだけで出力は変えない
/// （停止中に惰性回転のエッジで再通電しないため）。
pub struct BridgePhases {
    energized: bool,
}

impl BridgePhases {
    pub const fn new() -> Self {
        Self { energized: false }
    }

    /// 次の転流から出力を有効にする
    pub fn energize(&mut self) {
        self.energized = true;
    }

    pub fn is_energized(&self) -> bool {
        self.energized
    }

    fn all_off() {
        pac::TIM1.ccer().modify(|w| {
            for phase in Phase::ALL {
                let ch = channel_index(phase);
                w.set_cce(ch, false);
                w.set_ccne(ch, false);
            }
        });
    }

    fn apply(outputs: PhaseOutputs) {
        let tim1 = pac::TIM1;

        // break-before-make
        Self::all_off();

        for phase in Phase::ALL {
            let ch = channel_index(phase);
            let mode = if outputs.high_side(phase) {
                pac::timer::vals::Ocm::PWM_MODE1
            } else {
                pac::timer::vals::Ocm::FORCE_INACTIVE
            };
            tim1.ccmr_output(ch / 2).modify(|w| w.set_ocm(ch % 2, mode));
        }

        tim1.ccer().modify(|w| {
            for phase in Phase::ALL {
                let ch = channel_index(phase);
                let high = outputs.high_side(phase);
                let low = outputs.low_side(phase);
                w.set_cce(ch, high || low);
                w.set_ccne(ch, low);
            }
        });
    }
}

impl Default for BridgePhases {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseDriver for BridgePhases {
    fn set_commutation(&mut self, step: u8) -> Result<(), Error> {
        if step == 0 {
            return Ok(());
        }
        let outputs = PhaseOutputs::for_step(step).ok_or(Error::InvalidStep(step))?;
        if self.energized {
            Self::apply(outputs);
        }
        Ok(())
    }

    fn disable_all(&mut self) {
        self.energized = false;
        Self::all_off();
    }
}

/// GPIOB の Hall 入力
pub struct GpioHall;

impl GpioHall {
    /// 現在の Hall 値を1回読んでログに出す（起動時の配線確認用）
    pub fn probe(&mut self) -> u8 {
        let state = self.read_state();
        info!("Hall state at boot: {} (U={} V={} W={})", state, state >> 2 & 1, state >> 1 & 1, state & 1);
        state
    }
}

impl HallSensors for GpioHall {
    fn read_state(&mut self) -> u8 {
        let idr = pac::GPIOB.idr().read();
        let u = idr.idr(hall::PIN_U) as u8;
        let v = idr.idr(hall::PIN_V) as u8;
        let w = idr.idr(hall::PIN_W) as u8;
        (u << 2) | (v << 1) | w
    }
}
