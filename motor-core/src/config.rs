//! モーター制御パラメータ
//!
//! 実行時設定の永続化は行わないため、すべてコンパイル時定数として定義します。

/// 目標速度の下限 [RPM]
pub const RPM_MIN: i32 = -6000;

/// 目標速度の上限 [RPM]
pub const RPM_MAX: i32 = 6000;

/// モーターの極対数（16極 / 2 = 8）
pub const DEFAULT_POLE_PAIRS: u8 = 8;

/// 速度制御周期 [ms]（100Hz）
pub const CONTROL_PERIOD_MS: u64 = 10;

/// EMA速度フィルタ係数（大きいほど応答が速い）
pub const SPEED_FILTER_ALPHA: f32 = 0.3;

/// Hallエッジのデバウンス時間 [μs]（これより短いエッジ間隔はノイズとして破棄）
pub const HALL_DEBOUNCE_US: u32 = 50;

/// Hallエッジタイムアウト [ms]（この間エッジが無ければ停止とみなす）
pub const HALL_EDGE_TIMEOUT_MS: u32 = 100;

/// 連続した不正Hall値がこの回数に達したらHALL_INVALIDフラグを立てる
pub const HALL_INVALID_FAULT_COUNT: u8 = 3;

/// 通信ウォッチドッグのタイムアウト [ms]
pub const WATCHDOG_TIMEOUT_MS: u64 = 2000;

/// テレメトリ送信周期 [ms]（10Hz）
pub const TELEMETRY_PERIOD_MS: u64 = 100;

/// 速度PIDパラメータ
pub mod pid {
    /// 比例ゲイン
    pub const DEFAULT_KP: f32 = 0.05;

    /// 積分ゲイン
    pub const DEFAULT_KI: f32 = 0.01;

    /// 微分ゲイン
    pub const DEFAULT_KD: f32 = 0.005;

    /// 出力下限 [% duty]（これ未満ではトルクが出ない）
    pub const DEFAULT_OUT_MIN: f32 = 6.0;

    /// 出力上限 [% duty]
    pub const DEFAULT_OUT_MAX: f32 = 96.0;

    /// ストール判定時間 [s]
    pub const DEFAULT_STALL_TIMEOUT_S: f32 = 2.0;

    /// ストール判定に使う出力比（out_max に対する割合）
    pub const STALL_DEMAND_RATIO: f32 = 0.9;

    /// ストール判定で「停止」とみなす速度 [RPM]
    pub const STALL_SPEED_RPM: f32 = 10.0;

    /// ストールタイマー比較の許容誤差 [s]（f32 の積算誤差吸収用）
    pub const STALL_TIMER_EPSILON: f32 = 1.0e-4;
}
