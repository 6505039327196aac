//! ハードウェア無しで制御ループを閉じるためのシミュレーション
//!
//! 物理モデル:
//!   TIM1 ARR = 3200 相当のデューティに対し、`PULSE_ZERO` 以下ではトルクが出ず、
//!   それ以上では `(duty - PULSE_ZERO) * RPM_PER_TICK` を定常速度とする線形モデル。
//!   96% (3072) で 5760 RPM。ロータ慣性は一次遅れ（時定数 `ROTOR_TIME_CONSTANT_S`）で近似する。
//!
//! Hall値は正転順 1 -> 5 -> 4 -> 6 -> 2 -> 3 で進み、逆転ステップ (>8) が
//! 指令されていれば逆順に進む。

use crate::actuator::{DutyOutput, HallSensors, PhaseDriver, PhaseOutputs};
use crate::commutation::{steps_per_mech_rev, CommutationEngine, EdgeOutcome, CCW_STEP_OFFSET};
use crate::Error;
use embassy_sync::blocking_mutex::raw::RawMutex;

/// シミュレーション上のPWM最大値
pub const SIM_MAX_DUTY: u16 = 3200;

/// これ以下のデューティではトルクが出ない
pub const PULSE_ZERO: u16 = 192;

/// `PULSE_ZERO` を超えた1カウントあたりの定常速度 [RPM]
pub const RPM_PER_TICK: f32 = 2.0;

/// ロータの一次遅れ時定数 [s]
pub const ROTOR_TIME_CONSTANT_S: f32 = 0.2;

/// 正転時のHall値の並び
pub const HALL_SEQUENCE_CW: [u8; 6] = [1, 5, 4, 6, 2, 3];

/// ブリッジのシミュレーション（デューティとスイッチ状態を記録）
#[derive(Debug, Clone)]
pub struct SimBridge {
    max_duty: u16,
    duty: u16,
    outputs: PhaseOutputs,
    last_step: Option<u8>,
    commutations: u32,
}

impl SimBridge {
    pub fn new(max_duty: u16) -> Self {
        Self {
            max_duty,
            duty: 0,
            outputs: PhaseOutputs::off(),
            last_step: None,
            commutations: 0,
        }
    }

    pub fn duty(&self) -> u16 {
        self.duty
    }

    pub fn outputs(&self) -> PhaseOutputs {
        self.outputs
    }

    pub fn last_step(&self) -> Option<u8> {
        self.last_step
    }

    pub fn commutations(&self) -> u32 {
        self.commutations
    }

    /// 最後に指令された転流ステップが逆転か
    pub fn is_reverse(&self) -> bool {
        self.last_step.is_some_and(|s| s > CCW_STEP_OFFSET)
    }
}

impl DutyOutput for SimBridge {
    fn max_duty(&self) -> u16 {
        self.max_duty
    }

    fn set_duty(&mut self, duty: u16) {
        self.duty = duty.min(self.max_duty);
    }
}

impl PhaseDriver for SimBridge {
    fn set_commutation(&mut self, step: u8) -> Result<(), Error> {
        if step == 0 {
            return Ok(());
        }
        let next = PhaseOutputs::for_step(step).ok_or(Error::InvalidStep(step))?;

        // break-before-make
        self.outputs = PhaseOutputs::off();
        self.outputs = next;
        if self.last_step != Some(step) {
            trace!("[SIM] step={}", step);
        }
        self.last_step = Some(step);
        self.commutations = self.commutations.wrapping_add(1);
        Ok(())
    }

    fn disable_all(&mut self) {
        self.outputs = PhaseOutputs::off();
    }
}

/// Hallセンサーのシミュレーション
#[derive(Debug, Clone, Default)]
pub struct SimHall {
    index: usize,
    /// 次の読み出しで返す値を上書きする（故障注入用）
    forced: Option<u8>,
}

impl SimHall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> u8 {
        HALL_SEQUENCE_CW[self.index]
    }

    pub fn advance(&mut self, reverse: bool) {
        self.index = if reverse {
            (self.index + HALL_SEQUENCE_CW.len() - 1) % HALL_SEQUENCE_CW.len()
        } else {
            (self.index + 1) % HALL_SEQUENCE_CW.len()
        };
    }

    /// 次の読み出しを不正値などに置き換える
    pub fn force_next(&mut self, state: u8) {
        self.forced = Some(state);
    }
}

impl HallSensors for SimHall {
    fn read_state(&mut self) -> u8 {
        self.forced.take().unwrap_or(self.state())
    }
}

/// モーター全体のシミュレーション
#[derive(Debug, Clone)]
pub struct SimMotor {
    pub bridge: SimBridge,
    pub hall: SimHall,
    /// 現在の回転速度の大きさ [RPM]
    rpm: f32,
    /// 現在セクタ内の進み（0.0..1.0）
    sector_phase: f32,
    pole_pairs: u8,
    /// ロータ拘束（ストール試験用）
    jammed: bool,
}

impl SimMotor {
    pub fn new(pole_pairs: u8) -> Self {
        Self {
            bridge: SimBridge::new(SIM_MAX_DUTY),
            hall: SimHall::new(),
            rpm: 0.0,
            sector_phase: 0.0,
            pole_pairs,
            jammed: false,
        }
    }

    pub fn rpm(&self) -> f32 {
        self.rpm
    }

    pub fn set_jammed(&mut self, jammed: bool) {
        self.jammed = jammed;
        if jammed {
            self.rpm = 0.0;
        }
    }

    /// 現在のデューティでの定常速度 [RPM]
    pub fn steady_state_rpm(&self) -> f32 {
        if self.jammed || self.bridge.outputs().is_off() {
            return 0.0;
        }
        let duty = self.bridge.duty();
        if duty <= PULSE_ZERO {
            0.0
        } else {
            (duty - PULSE_ZERO) as f32 * RPM_PER_TICK
        }
    }

    /// `period_ticks` だけ時間を進め、その間に発生したHallエッジを転流エンジンに渡す
    ///
    /// 戻り値は処理されたエッジ数。
    pub fn run_period<M: RawMutex>(
        &mut self,
        engine: &mut CommutationEngine<'_, M>,
        start: u32,
        period_ticks: u32,
    ) -> u32 {
        let ticks_per_second = engine.config().ticks_per_second as f32;
        let dt = period_ticks as f32 / ticks_per_second;

        let target = self.steady_state_rpm();
        let k = (dt / ROTOR_TIME_CONSTANT_S).min(1.0);
        self.rpm += (target - self.rpm) * k;
        if self.jammed {
            self.rpm = 0.0;
        }

        let sectors_per_tick =
            self.rpm * steps_per_mech_rev(self.pole_pairs) as f32 / 60.0 / ticks_per_second;
        if sectors_per_tick <= 0.0 {
            return 0;
        }

        let mut edges = 0;
        let mut t = 0.0f32;
        loop {
            let to_edge = (1.0 - self.sector_phase) / sectors_per_tick;
            if t + to_edge > period_ticks as f32 {
                self.sector_phase += (period_ticks as f32 - t) * sectors_per_tick;
                break;
            }
            t += to_edge;
            self.sector_phase = 0.0;
            self.hall.advance(self.bridge.is_reverse());

            let now = start.wrapping_add(t as u32);
            if let EdgeOutcome::InvalidHall(state) = engine.on_edge(now, &mut self.hall, &mut self.bridge) {
                debug!("[SIM] injected hall state {}", state);
            }
            edges += 1;
        }
        edges
    }
}
