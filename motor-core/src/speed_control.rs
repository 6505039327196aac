//! 速度制御ループ（100Hz）
//!
//! Vault の目標値と転流エンジンが書いた実測値から PID でデューティを決めます。
//! Hallエッジが途絶えたら実測値を0にし、目標が運転状態でなくなったら
//! PID の内部状態とストールラッチをリセットします。

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};

use crate::actuator::{percent_to_duty, DutyOutput};
use crate::commutation::EdgeClock;
use crate::config::{CONTROL_PERIOD_MS, HALL_EDGE_TIMEOUT_MS, SPEED_FILTER_ALPHA};
use crate::pid::{filter_rpm, PidController};
use crate::vault::{FaultFlags, MotorState, MotorVault};

/// 制御状態の遷移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlEvent {
    /// 運転開始（静止状態からの始動にはロータ位置合わせが必要）
    Started,
    /// 運転終了（ブリッジを全OFFにしてよい）
    Stopped,
    /// ストールをラッチした
    StallLatched,
}

/// 1周期分の制御結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlOutput {
    /// 出力したデューティ
    pub duty: u16,
    /// PID出力 [%]
    pub percent: f32,
    pub event: Option<ControlEvent>,
}

impl ControlOutput {
    const fn idle(event: Option<ControlEvent>) -> Self {
        Self {
            duty: 0,
            percent: 0.0,
            event,
        }
    }
}

/// 速度制御ループ
pub struct SpeedController<'a, M: RawMutex = CriticalSectionRawMutex> {
    pid: PidController,
    vault: &'a MotorVault<M>,
    clock: &'a EdgeClock,
    /// エッジタイムアウト [tick]
    edge_timeout_ticks: u32,
    /// 制御周期 [s]
    dt: f32,
    /// フィルタ後速度 [RPM]
    filtered: f32,
    /// 前周期で運転していたか
    running: bool,
}

impl<'a, M: RawMutex> SpeedController<'a, M> {
    /// `ticks_per_second` は [`EdgeClock`] に書かれるタイムスタンプの周波数
    pub fn new(vault: &'a MotorVault<M>, clock: &'a EdgeClock, ticks_per_second: u32) -> Self {
        let edge_timeout_ticks =
            (ticks_per_second as u64 * HALL_EDGE_TIMEOUT_MS as u64 / 1000).min(u32::MAX as u64) as u32;
        Self {
            pid: PidController::with_defaults(),
            vault,
            clock,
            edge_timeout_ticks,
            dt: CONTROL_PERIOD_MS as f32 / 1000.0,
            filtered: 0.0,
            running: false,
        }
    }

    /// 1制御周期分の処理
    ///
    /// `now` は [`EdgeClock`] と同じ時間軸のタイムスタンプ。
    pub fn tick<D: DutyOutput>(&mut self, now: u32, output: &mut D) -> ControlOutput {
        let stats = self.vault.snapshot();

        // 判定と0書き込みは Vault のロック内で行い、直前に届いたエッジの RPM を消さない
        let raw = self.vault.expire_speed(|| self.edge_timed_out(now));

        self.filtered = filter_rpm(raw as f32, self.filtered, SPEED_FILTER_ALPHA);
        self.vault
            .publish_filtered_speed(libm::roundf(self.filtered) as i32);

        if stats.target_state != MotorState::RunningSpeed {
            output.set_duty(0);
            self.pid.reset();
            self.filtered = 0.0;

            let event = if self.running {
                self.running = false;
                self.vault.set_flag(FaultFlags::STALL, false);
                info!("Speed control stopped: state={}", stats.target_state);
                Some(ControlEvent::Stopped)
            } else {
                None
            };
            return ControlOutput::idle(event);
        }

        if self.pid.is_stalled() {
            output.set_duty(0);
            return ControlOutput::idle(None);
        }

        let event = if self.running {
            None
        } else {
            self.running = true;
            info!("Speed control started: target={} rpm", stats.target_speed);
            Some(ControlEvent::Started)
        };

        // 回転方向は転流側で決まるので、PID は速度の大きさで回す
        let target = libm::fabsf(stats.target_speed as f32);
        let measured = libm::fabsf(self.filtered);
        let percent = self.pid.compute(target, measured, self.dt);

        if self.pid.is_stalled() {
            error!(
                "Motor stalled: target={} rpm, measured={} rpm",
                stats.target_speed,
                raw
            );
            self.vault.set_flag(FaultFlags::STALL, true);
            output.set_duty(0);
            return ControlOutput::idle(Some(ControlEvent::StallLatched));
        }

        let duty = percent_to_duty(percent, output.max_duty());
        output.set_duty(duty);
        ControlOutput {
            duty,
            percent,
            event,
        }
    }

    /// 最終エッジからタイムアウト時間が過ぎたか（エッジが一度も無ければ true）
    fn edge_timed_out(&self, now: u32) -> bool {
        match self.clock.elapsed_since_edge(now) {
            None => true,
            // now を読んだ後にエッジが来た場合は経過時間が負（ラップして巨大値）になる
            Some(elapsed) => elapsed > self.edge_timeout_ticks && elapsed < u32::MAX / 2,
        }
    }

    /// ストールラッチを解除（次の周期で始動からやり直す）
    pub fn clear_stall(&mut self) {
        self.pid.reset();
        self.running = false;
        self.vault.set_flag(FaultFlags::STALL, false);
    }

    pub fn is_stalled(&self) -> bool {
        self.pid.is_stalled()
    }

    pub fn filtered_speed(&self) -> f32 {
        self.filtered
    }

    pub fn pid(&self) -> &PidController {
        &self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::PhaseDriver;
    use crate::commutation::{CommutationConfig, CommutationEngine, DirectionCell};
    use crate::sim::{SimBridge, SimMotor, SIM_MAX_DUTY};

    const TICKS_PER_SECOND: u32 = 1_000_000;
    const PERIOD_TICKS: u32 = 10_000;

    #[test]
    fn test_idle_outputs_zero_duty() {
        let (vault, clock) = (<MotorVault>::new(), EdgeClock::new());
        let mut ctrl = SpeedController::new(&vault, &clock, TICKS_PER_SECOND);
        let mut bridge = SimBridge::new(SIM_MAX_DUTY);
        bridge.set_duty(1000);

        let out = ctrl.tick(0, &mut bridge);

        assert_eq!(out, ControlOutput::idle(None));
        assert_eq!(bridge.duty(), 0);
    }

    #[test]
    fn test_filter_follows_fresh_edges() {
        let (vault, clock) = (<MotorVault>::new(), EdgeClock::new());
        let mut ctrl = SpeedController::new(&vault, &clock, TICKS_PER_SECOND);
        let mut bridge = SimBridge::new(SIM_MAX_DUTY);

        vault.set_speed(1000);
        clock.publish(5_000);
        ctrl.tick(10_000, &mut bridge);

        assert_eq!(vault.speed(), 1000);
        assert_eq!(vault.filtered_speed(), 300);
    }

    #[test]
    fn test_edge_timeout_zeroes_speed() {
        let (vault, clock) = (<MotorVault>::new(), EdgeClock::new());
        let mut ctrl = SpeedController::new(&vault, &clock, TICKS_PER_SECOND);
        let mut bridge = SimBridge::new(SIM_MAX_DUTY);

        vault.set_speed(1200);
        clock.publish(0);
        // 100ms ちょうどはまだタイムアウトではない
        ctrl.tick(100_000, &mut bridge);
        assert_eq!(vault.speed(), 1200);

        ctrl.tick(100_001, &mut bridge);
        assert_eq!(vault.speed(), 0);
        assert_eq!(vault.state(), MotorState::Stopped);
    }

    #[test]
    fn test_no_edge_ever_counts_as_timeout() {
        let (vault, clock) = (<MotorVault>::new(), EdgeClock::new());
        let mut ctrl = SpeedController::new(&vault, &clock, TICKS_PER_SECOND);
        let mut bridge = SimBridge::new(SIM_MAX_DUTY);

        vault.set_speed(800);
        ctrl.tick(0, &mut bridge);
        assert_eq!(vault.speed(), 0);
    }

    #[test]
    fn test_edge_newer_than_now_is_not_timeout() {
        let (vault, clock) = (<MotorVault>::new(), EdgeClock::new());
        let mut ctrl = SpeedController::new(&vault, &clock, TICKS_PER_SECOND);
        let mut bridge = SimBridge::new(SIM_MAX_DUTY);

        vault.set_speed(800);
        clock.publish(1_000_010);
        ctrl.tick(1_000_000, &mut bridge);
        assert_eq!(vault.speed(), 800);
    }

    #[test]
    fn test_start_event_and_duty() {
        let (vault, clock) = (<MotorVault>::new(), EdgeClock::new());
        let mut ctrl = SpeedController::new(&vault, &clock, TICKS_PER_SECOND);
        let mut bridge = SimBridge::new(SIM_MAX_DUTY);

        vault.set_target_speed(3000).unwrap();
        let first = ctrl.tick(0, &mut bridge);
        assert_eq!(first.event, Some(ControlEvent::Started));
        assert_eq!(first.duty, 3072);
        assert_eq!(bridge.duty(), 3072);

        let second = ctrl.tick(PERIOD_TICKS, &mut bridge);
        assert_eq!(second.event, None);
    }

    #[test]
    fn test_stall_latches_and_clears_on_stop() {
        let (vault, clock) = (<MotorVault>::new(), EdgeClock::new());
        let mut ctrl = SpeedController::new(&vault, &clock, TICKS_PER_SECOND);
        let mut bridge = SimBridge::new(SIM_MAX_DUTY);

        vault.set_target_speed(3000).unwrap();
        let mut now = 0u32;
        for i in 1..200 {
            let out = ctrl.tick(now, &mut bridge);
            assert!(out.duty > 0, "tick {}", i);
            now += PERIOD_TICKS;
        }

        let out = ctrl.tick(now, &mut bridge);
        assert_eq!(out.event, Some(ControlEvent::StallLatched));
        assert_eq!(bridge.duty(), 0);
        assert!(ctrl.is_stalled());
        assert!(vault.flags().contains(FaultFlags::STALL));

        // 目標が運転状態のままならラッチ保持
        for _ in 0..50 {
            now += PERIOD_TICKS;
            assert_eq!(ctrl.tick(now, &mut bridge), ControlOutput::idle(None));
        }
        assert!(ctrl.is_stalled());

        vault.set_target_speed(0).unwrap();
        let out = ctrl.tick(now + PERIOD_TICKS, &mut bridge);
        assert_eq!(out.event, Some(ControlEvent::Stopped));
        assert!(!ctrl.is_stalled());
        assert!(!vault.flags().contains(FaultFlags::STALL));
        assert_eq!(ctrl.pid().get_integral(), 0.0);
        assert_eq!(ctrl.pid().get_prev_error(), 0.0);
        assert_eq!(ctrl.pid().get_stall_timer(), 0.0);
        assert_eq!(ctrl.filtered_speed(), 0.0);
    }

    #[test]
    fn test_leaving_run_state_resets_pid_and_filter() {
        let (vault, clock) = (<MotorVault>::new(), EdgeClock::new());
        let mut ctrl = SpeedController::new(&vault, &clock, TICKS_PER_SECOND);
        let mut bridge = SimBridge::new(SIM_MAX_DUTY);

        vault.set_target_speed(3000).unwrap();
        let mut now = 0u32;
        for _ in 0..20 {
            clock.publish(now);
            vault.set_speed(1000);
            ctrl.tick(now, &mut bridge);
            now += PERIOD_TICKS;
        }
        assert!(ctrl.pid().get_integral() > 0.0);
        assert!(ctrl.pid().get_prev_error() > 0.0);
        assert!(ctrl.filtered_speed() > 900.0);

        vault.set_target_speed(0).unwrap();
        clock.publish(now);
        let out = ctrl.tick(now, &mut bridge);

        assert_eq!(out.event, Some(ControlEvent::Stopped));
        assert_eq!(bridge.duty(), 0);
        assert_eq!(ctrl.pid().get_integral(), 0.0);
        assert_eq!(ctrl.pid().get_prev_error(), 0.0);
        assert_eq!(ctrl.pid().get_stall_timer(), 0.0);
        assert_eq!(ctrl.pid().get_output(), 0.0);
        assert_eq!(ctrl.filtered_speed(), 0.0);
    }

    #[test]
    fn test_clear_stall_restarts() {
        let (vault, clock) = (<MotorVault>::new(), EdgeClock::new());
        let mut ctrl = SpeedController::new(&vault, &clock, TICKS_PER_SECOND);
        let mut bridge = SimBridge::new(SIM_MAX_DUTY);

        vault.set_target_speed(3000).unwrap();
        for i in 0..200 {
            ctrl.tick(i * PERIOD_TICKS, &mut bridge);
        }
        assert!(ctrl.is_stalled());

        ctrl.clear_stall();
        assert!(!vault.flags().contains(FaultFlags::STALL));
        let out = ctrl.tick(200 * PERIOD_TICKS, &mut bridge);
        assert_eq!(out.event, Some(ControlEvent::Started));
        assert!(out.duty > 0);
    }

    #[test]
    fn test_estop_stops_output() {
        let (vault, clock) = (<MotorVault>::new(), EdgeClock::new());
        let mut ctrl = SpeedController::new(&vault, &clock, TICKS_PER_SECOND);
        let mut bridge = SimBridge::new(SIM_MAX_DUTY);

        vault.set_target_speed(2000).unwrap();
        ctrl.tick(0, &mut bridge);
        assert!(bridge.duty() > 0);

        vault.trigger_estop();
        let out = ctrl.tick(PERIOD_TICKS, &mut bridge);
        assert_eq!(out.event, Some(ControlEvent::Stopped));
        assert_eq!(bridge.duty(), 0);
        assert_eq!(vault.state(), MotorState::EStop);
    }

    fn run_closed_loop(jammed: bool, periods: u32) -> (MotorVault, SimMotor) {
        let vault: MotorVault = MotorVault::new();
        let clock = EdgeClock::new();
        let dir = DirectionCell::new();
        let mut motor = SimMotor::new(8);
        motor.set_jammed(jammed);

        {
            let mut engine = CommutationEngine::new(
                CommutationConfig::new(TICKS_PER_SECOND, 8),
                &vault,
                &clock,
                &dir,
            );
            let mut ctrl = SpeedController::new(&vault, &clock, TICKS_PER_SECOND);
            vault.set_target_speed(3000).unwrap();

            let mut now = 0u32;
            for _ in 0..periods {
                motor.run_period(&mut engine, now, PERIOD_TICKS);
                now = now.wrapping_add(PERIOD_TICKS);

                let out = ctrl.tick(now, &mut motor.bridge);
                match out.event {
                    Some(ControlEvent::Started) => {
                        engine.reset();
                        engine.align(&mut motor.hall, &mut motor.bridge).unwrap();
                    }
                    Some(ControlEvent::Stopped) | Some(ControlEvent::StallLatched) => {
                        motor.bridge.disable_all();
                    }
                    None => {}
                }
            }
        }
        (vault, motor)
    }

    #[test]
    fn test_closed_loop_reaches_target() {
        let (vault, motor) = run_closed_loop(false, 600);

        let filtered = vault.filtered_speed();
        assert!((2200..=3600).contains(&filtered), "filtered {}", filtered);
        assert!(motor.rpm() > 2000.0);
        assert!(!vault.flags().contains(FaultFlags::STALL));
        assert_eq!(vault.state(), MotorState::RunningSpeed);
    }

    #[test]
    fn test_closed_loop_jammed_rotor_stalls() {
        let (vault, motor) = run_closed_loop(true, 250);

        assert!(vault.flags().contains(FaultFlags::STALL));
        assert_eq!(motor.bridge.duty(), 0);
        assert!(motor.bridge.outputs().is_off());
        assert_eq!(vault.speed(), 0);
    }
}
