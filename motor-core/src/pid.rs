// PID speed controller with anti-windup and stall detection

use crate::config::pid::{
    DEFAULT_KD, DEFAULT_KI, DEFAULT_KP, DEFAULT_OUT_MAX, DEFAULT_OUT_MIN,
    DEFAULT_STALL_TIMEOUT_S, STALL_DEMAND_RATIO, STALL_SPEED_RPM, STALL_TIMER_EPSILON,
};

/// 速度PIDコントローラ
///
/// 出力は PWM デューティ [%]。積分値は誤差×時間のまま保持し、ゲインは計算時に掛ける。
/// そのため anti-windup のクランプ範囲は `[out_min / ki, out_max / ki]` になる。
#[derive(Debug, Clone)]
pub struct PidController {
    /// Proportional gain
    kp: f32,
    /// Integral gain
    ki: f32,
    /// Derivative gain
    kd: f32,
    /// Minimum output limit [%]
    out_min: f32,
    /// Maximum output limit [%]
    out_max: f32,
    /// 直前の誤差 [RPM]
    prev_error: f32,
    /// 誤差の積分値 [RPM·s]
    integral_sum: f32,
    /// 高出力・低速度が継続している時間 [s]
    stall_timer: f32,
    /// ストール判定時間 [s]
    stall_timeout: f32,
    /// ストールラッチ（`reset` まで出力0）
    is_stalled: bool,
    /// Last calculated output
    last_output: f32,
}

impl PidController {
    /// Create a new PID controller
    ///
    /// # Arguments
    /// * `kp`, `ki`, `kd` - Gains
    /// * `out_min` / `out_max` - Output limits [%]
    /// * `stall_timeout` - Stall detection time [s]
    pub fn new(kp: f32, ki: f32, kd: f32, out_min: f32, out_max: f32, stall_timeout: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            out_min,
            out_max,
            prev_error: 0.0,
            integral_sum: 0.0,
            stall_timer: 0.0,
            stall_timeout,
            is_stalled: false,
            last_output: 0.0,
        }
    }

    /// `config::pid` の既定値で作成
    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_KP,
            DEFAULT_KI,
            DEFAULT_KD,
            DEFAULT_OUT_MIN,
            DEFAULT_OUT_MAX,
            DEFAULT_STALL_TIMEOUT_S,
        )
    }

    /// Update the PID controller
    ///
    /// # Arguments
    /// * `target` - Target speed [RPM]
    /// * `measured` - Filtered measured speed [RPM]
    /// * `dt` - Time step (seconds)
    ///
    /// # Returns
    /// Duty [%] limited to out_min..out_max, or 0.0 while the stall latch is set
    pub fn compute(&mut self, target: f32, measured: f32, dt: f32) -> f32 {
        if self.is_stalled {
            self.last_output = 0.0;
            return 0.0;
        }

        let error = target - measured;

        let p_term = self.kp * error;

        // Anti-windup: clamp in integral units before applying ki
        self.integral_sum += error * dt;
        if self.ki != 0.0 {
            let lo = self.out_min / self.ki;
            let hi = self.out_max / self.ki;
            self.integral_sum = self.integral_sum.clamp(lo.min(hi), lo.max(hi));
        }
        let i_term = self.ki * self.integral_sum;

        let d_term = if dt > 0.0 {
            self.kd * (error - self.prev_error) / dt
        } else {
            0.0
        };
        self.prev_error = error;

        let raw = p_term + i_term + d_term;

        // Stall detection uses the unclamped output
        if raw >= STALL_DEMAND_RATIO * self.out_max && libm::fabsf(measured) < STALL_SPEED_RPM {
            self.stall_timer += dt;
            if self.stall_timer + STALL_TIMER_EPSILON >= self.stall_timeout {
                self.is_stalled = true;
                self.integral_sum = 0.0;
                self.last_output = 0.0;
                return 0.0;
            }
        } else {
            self.stall_timer = 0.0;
        }

        self.last_output = raw.max(self.out_min).min(self.out_max);
        self.last_output
    }

    /// Reset the transient state (integral, derivative history, stall timer and latch)
    pub fn reset(&mut self) {
        self.prev_error = 0.0;
        self.integral_sum = 0.0;
        self.stall_timer = 0.0;
        self.is_stalled = false;
        self.last_output = 0.0;
    }

    pub fn is_stalled(&self) -> bool {
        self.is_stalled
    }

    pub fn get_output(&self) -> f32 {
        self.last_output
    }

    pub fn get_integral(&self) -> f32 {
        self.integral_sum
    }

    pub fn get_stall_timer(&self) -> f32 {
        self.stall_timer
    }

    pub fn get_prev_error(&self) -> f32 {
        self.prev_error
    }
}

impl Default for PidController {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// 指数移動平均フィルタ
///
/// `alpha * raw + (1 - alpha) * prev`
pub fn filter_rpm(raw: f32, prev: f32, alpha: f32) -> f32 {
    alpha * raw + (1.0 - alpha) * prev
}
