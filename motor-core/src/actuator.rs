//! アクチュエータ抽象化
//!
//! 転流エンジンと速度制御ループがハードウェアへ出力するためのトレイト群。
//! ファームウェアは TIM1 / GPIO で、ホストテストは [`crate::sim`] で実装します。

use crate::commutation::phase_pair;
use crate::Error;

/// モーターの相
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    U,
    V,
    W,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::U, Phase::V, Phase::W];

    const fn high_bit(self) -> u8 {
        match self {
            Phase::U => PhaseOutputs::U_HIGH,
            Phase::V => PhaseOutputs::V_HIGH,
            Phase::W => PhaseOutputs::W_HIGH,
        }
    }

    const fn low_bit(self) -> u8 {
        match self {
            Phase::U => PhaseOutputs::U_LOW,
            Phase::V => PhaseOutputs::V_LOW,
            Phase::W => PhaseOutputs::W_LOW,
        }
    }
}

/// 通電する相の組（ハイサイドPWM + ローサイドON）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhasePair {
    pub high: Phase,
    pub low: Phase,
}

impl PhasePair {
    pub const fn new(high: Phase, low: Phase) -> Self {
        Self { high, low }
    }
}

/// 6スイッチの出力状態
///
/// ビットが立っているスイッチだけがONになる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhaseOutputs(u8);

impl PhaseOutputs {
    pub const U_HIGH: u8 = 0x01;
    pub const U_LOW: u8 = 0x02;
    pub const V_HIGH: u8 = 0x04;
    pub const V_LOW: u8 = 0x08;
    pub const W_HIGH: u8 = 0x10;
    pub const W_LOW: u8 = 0x20;

    /// 全スイッチOFF
    pub const fn off() -> Self {
        Self(0)
    }

    pub const fn from_pair(pair: PhasePair) -> Self {
        Self(pair.high.high_bit() | pair.low.low_bit())
    }

    /// 転流ステップコードに対応する出力（テーブルに無いコードは None）
    pub fn for_step(step: u8) -> Option<Self> {
        phase_pair(step).map(Self::from_pair)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_off(self) -> bool {
        self.0 == 0
    }

    pub const fn high_side(self, phase: Phase) -> bool {
        self.0 & phase.high_bit() != 0
    }

    pub const fn low_side(self, phase: Phase) -> bool {
        self.0 & phase.low_bit() != 0
    }

    /// 同一レグの上下アームが同時にONになっていないか
    pub fn is_shoot_through_free(self) -> bool {
        Phase::ALL
            .iter()
            .all(|&p| !(self.high_side(p) && self.low_side(p)))
    }

    /// ONになっているハイサイドの相
    pub fn high_phase(self) -> Option<Phase> {
        Phase::ALL.into_iter().find(|&p| self.high_side(p))
    }

    /// ONになっているローサイドの相
    pub fn low_phase(self) -> Option<Phase> {
        Phase::ALL.into_iter().find(|&p| self.low_side(p))
    }
}

/// PWMデューティ出力
pub trait DutyOutput {
    /// デューティの最大値（タイマーのARR相当）
    fn max_duty(&self) -> u16;

    /// デューティを設定（`max_duty` を超える値は実装側で飽和させる）
    fn set_duty(&mut self, duty: u16);
}

/// 3相ブリッジのスイッチ出力
pub trait PhaseDriver {
    /// 転流ステップコード（正転 1..=6 / 逆転 9..=14）に従って出力を切り替える
    ///
    /// ステップ0は何もせず成功を返す。テーブルに無いコードは出力を変更せず
    /// [`Error::InvalidStep`] を返す。
    fn set_commutation(&mut self, step: u8) -> Result<(), Error>;

    /// 全スイッチOFF
    fn disable_all(&mut self);
}

/// Hallセンサー入力
pub trait HallSensors {
    /// 3ビットのHall値 `(A << 2) | (B << 1) | C` を読む
    fn read_state(&mut self) -> u8;
}

/// PID出力 [%] をデューティ値に変換（0〜100% に飽和、端数切り捨て）
pub fn percent_to_duty(percent: f32, max_duty: u16) -> u16 {
    let percent = if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    };
    (percent * max_duty as f32 / 100.0) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_step_drives_one_high_and_one_low() {
        for step in (1..=6).chain(9..=14) {
            let out = PhaseOutputs::for_step(step).unwrap();
            let high = out.high_phase().unwrap();
            let low = out.low_phase().unwrap();
            assert_ne!(high, low, "step {}", step);
            assert_eq!(out.bits().count_ones(), 2, "step {}", step);
            assert!(out.is_shoot_through_free(), "step {}", step);
        }
    }

    #[test]
    fn test_unmapped_steps() {
        for step in [0u8, 7, 8, 15, 16, 255] {
            assert_eq!(PhaseOutputs::for_step(step), None, "step {}", step);
        }
    }

    #[test]
    fn test_shoot_through_detection() {
        let bad = PhaseOutputs(PhaseOutputs::U_HIGH | PhaseOutputs::U_LOW);
        assert!(!bad.is_shoot_through_free());
        assert!(PhaseOutputs::off().is_shoot_through_free());
    }

    #[test]
    fn test_percent_to_duty() {
        assert_eq!(percent_to_duty(0.0, 3200), 0);
        assert_eq!(percent_to_duty(50.0, 3200), 1600);
        assert_eq!(percent_to_duty(96.0, 3200), 3072);
        assert_eq!(percent_to_duty(150.0, 3200), 3200);
        assert_eq!(percent_to_duty(-5.0, 3200), 0);
        assert_eq!(percent_to_duty(f32::NAN, 3200), 0);
    }
}
