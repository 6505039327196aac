//! TIM4ベースのHallセンサーインターフェース
//!
//! STM32のハードウェアHall Sensor Interface Mode（XORモード）で3つのHall入力の
//! エッジを1本の割り込み（CC1）にまとめ、割り込みハンドラで転流エンジンを回します。
//!
//! ## ハードウェア構成
//! - TIM4_CH1 (PB6): Hall U
//! - TIM4_CH2 (PB7): Hall V
//! - TIM4_CH3 (PB8): Hall W
//!
//! ## 動作原理（参照: HAL_TIMEx_HallSensor_Init）
//! 1. 3つのHall入力がXORされてTI1に接続される（CR2.TI1S=1）
//! 2. TI1のエッジ検出がトリガーとして選択される（SMCR.TS=TI1F_ED）
//! 3. いずれかの入力が変化するとCC1キャプチャ割り込みが発生する
//! 4. 割り込みでDWTサイクルカウンタを読み、エッジ時刻として転流エンジンに渡す
//!
//! 速度計測の時間軸は TIM4 のカウンタではなく DWT（170MHz, 約25秒で一周）。
//! 制御タスクも同じ時間軸で [`motor_core::EdgeClock`] を読む。

use core::cell::RefCell;

use cortex_m::peripheral::DWT;
use embassy_stm32::pac;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use motor_core::{CommutationEngine, EdgeOutcome, Error, PhaseDriver};

use crate::bridge::{BridgePhases, GpioHall};
use crate::config::hall;

/// 始動時の位置合わせエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AlignError {
    /// 転流コンテキストが未登録（Hall初期化前）
    NotInstalled,
    /// 転流エンジンが拒否した（不正なHall値など）
    Engine(Error),
}

impl From<Error> for AlignError {
    fn from(e: Error) -> Self {
        AlignError::Engine(e)
    }
}

/// 割り込みハンドラが専有する転流コンテキスト
pub struct HallContext {
    pub engine: CommutationEngine<'static>,
    pub phases: BridgePhases,
    pub hall: GpioHall,
}

static HALL_CONTEXT: Mutex<CriticalSectionRawMutex, RefCell<Option<HallContext>>> =
    Mutex::new(RefCell::new(None));

/// 転流コンテキストを登録（割り込み有効化の前に呼ぶ）
pub fn install(context: HallContext) {
    HALL_CONTEXT.lock(|cell| {
        cell.replace(Some(context));
    });
}

/// 静止状態からの始動: 計測状態を捨て、通電を許可して現在のHall値に対応する相へ通電する
pub fn align() -> Result<u8, AlignError> {
    HALL_CONTEXT.lock(|cell| {
        let mut cell = cell.borrow_mut();
        let ctx = cell.as_mut().ok_or(AlignError::NotInstalled)?;
        ctx.engine.reset();
        ctx.phases.energize();
        Ok(ctx.engine.align(&mut ctx.hall, &mut ctx.phases)?)
    })
}

/// 全スイッチOFF（以後のエッジでは速度計測だけ行う）
pub fn release() {
    HALL_CONTEXT.lock(|cell| {
        if let Some(ctx) = cell.borrow_mut().as_mut() {
            ctx.phases.disable_all();
        }
    });
}

/// ブリッジが通電中か
pub fn is_energized() -> bool {
    HALL_CONTEXT.lock(|cell| cell.borrow().as_ref().is_some_and(|ctx| ctx.phases.is_energized()))
}

/// TIM4 Hall Sensor Interface の初期化
///
/// # Safety
/// PACを使用した直接的なレジスタ操作と NVIC のアンマスクを含む。
/// [`install`] の後に1回だけ呼ぶこと。
pub unsafe fn init_hall_timer() {
    let rcc = pac::RCC;
    let tim4 = pac::TIM4;
    let gpiob = pac::GPIOB;

    // 1. クロック有効化
    rcc.ahb2enr().modify(|w| w.set_gpioben(true));
    rcc.apb1enr1().modify(|w| w.set_tim4en(true));

    // 2. GPIO設定（PB6/PB7/PB8 を AF2 = TIM4_CH1..3）
    // 外部プルアップ前提なので内部プルは無し
    for pin in [hall::PIN_U, hall::PIN_V, hall::PIN_W] {
        gpiob
            .moder()
            .modify(|w| w.set_moder(pin, pac::gpio::vals::Moder::ALTERNATE));
        gpiob.afr(pin / 8).modify(|w| w.set_afr(pin % 8, 2));
        gpiob
            .pupdr()
            .modify(|w| w.set_pupdr(pin, pac::gpio::vals::Pupdr::FLOATING));
        gpiob
            .ospeedr()
            .modify(|w| w.set_ospeedr(pin, pac::gpio::vals::Ospeedr::VERY_HIGH_SPEED));
    }

    // 3. TIM4設定（停止してからフルスピード、最大周期）
    tim4.cr1().modify(|w| w.set_cen(false));
    tim4.psc().write_value(0);
    tim4.arr().write_value(pac::timer::regs::ArrCore(0xFFFF));

    // 4. Hall Sensor Interface Mode
    tim4.cr2().modify(|w| {
        w.set_ti1s(pac::timer::vals::Ti1s::XOR);
    });
    tim4.smcr().modify(|w| {
        w.set_ts(pac::timer::vals::Ts::TI1F_ED);
        w.set_sms(pac::timer::vals::Sms::RESET_MODE);
    });

    // 5. CH1 を TRC でキャプチャ、8サイクルのデジタルフィルタ
    tim4.ccmr_input(0).modify(|w| {
        w.set_ccs(0, pac::timer::vals::CcmrInputCcs::TRC);
        w.set_icf(0, pac::timer::vals::FilterValue::FCK_INT_N8);
    });

    // 6. キャプチャ有効（TI1F_ED なので両エッジで発生する）
    tim4.ccer().modify(|w| {
        w.set_cce(0, true);
        w.set_ccp(0, false);
    });

    // 7. CC1 割り込みのみ（停止検出は制御タスクがエッジタイムアウトで行う）
    tim4.dier().modify(|w| {
        w.set_ccie(0, true);
        w.set_uie(false);
    });

    // 8. NVIC
    unsafe {
        let mut cp = cortex_m::Peripherals::steal();
        cp.NVIC.set_priority(pac::Interrupt::TIM4, hall::IRQ_PRIORITY);
        cortex_m::peripheral::NVIC::unmask(pac::Interrupt::TIM4);
    }

    // 9. カウンタをリセットしてタイマー開始
    tim4.cnt().write_value(pac::timer::regs::CntCore(0));
    tim4.sr().write(|w| w.0 = 0);
    tim4.egr().write(|w| w.set_ug(true));
    tim4.cr1().modify(|w| {
        w.set_cen(true);
        w.set_urs(pac::timer::vals::Urs::COUNTER_ONLY);
    });
}

/// TIM4割り込みハンドラー（Capture/Compare 1）
///
/// # Safety
/// 割り込みコンテキストで実行される。ブロックしない。
#[inline(always)]
pub unsafe fn tim4_irq_handler() {
    let tim4 = pac::TIM4;
    let sr = tim4.sr().read();

    if sr.uif() {
        tim4.sr().modify(|w| w.set_uif(false));
    }

    if sr.ccif(0) {
        tim4.sr().modify(|w| w.set_ccif(0, false));

        // できるだけ早くタイムスタンプを取る
        let now = DWT::cycle_count();

        HALL_CONTEXT.lock(|cell| {
            if let Some(ctx) = cell.borrow_mut().as_mut() {
                if let EdgeOutcome::Commutated { step, rpm: Some(rpm) } =
                    ctx.engine.on_edge(now, &mut ctx.hall, &mut ctx.phases)
                {
                    trace!("Hall edge: step={} rpm={}", step, rpm);
                }
            }
        });
    }
}

/// TIM4割り込みのRust側エントリーポイント
/// ベクタテーブルの TIM4 エントリ（弱シンボル）をこの関数で上書きする
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn TIM4() {
    tim4_irq_handler();
}
