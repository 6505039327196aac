//! Hallセンサー転流エンジン
//!
//! Hallエッジ割り込みから呼ばれ、デバウンス・Hall値検証・6ステップ転流・
//! RPM計測・機械角の追跡を行います。割り込みコンテキストで動くため、
//! ブロックする処理は持たず、Vault のロックは短いフィールド代入だけです。
//!
//! 最終エッジ時刻は [`EdgeClock`] のアトミック変数で制御タスクへ渡します。
//! 割り込み側が制御タスクのロック解放を待つことはありません。

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};

use crate::actuator::{HallSensors, Phase, PhaseDriver, PhasePair};
use crate::config::{HALL_DEBOUNCE_US, HALL_EDGE_TIMEOUT_MS, HALL_INVALID_FAULT_COUNT};
use crate::vault::{FaultFlags, MotorVault};
use crate::Error;

/// 逆転時にステップコードへ加算するオフセット
pub const CCW_STEP_OFFSET: u8 = 8;

/// 電気角1周あたりのHallステップ数
pub const STEPS_PER_ELECTRICAL_REV: u32 = 6;

/// Hall値 → セクタ番号（正転順 1 -> 5 -> 4 -> 6 -> 2 -> 3）
const HALL_SECTOR_TABLE: [u8; 8] = [
    255, // 0b000: 不正
    0,   // 0b001
    4,   // 0b010
    5,   // 0b011
    2,   // 0b100
    1,   // 0b101
    3,   // 0b110
    255, // 0b111: 不正
];

/// 回転方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    #[default]
    Cw,
    Ccw,
}

impl Direction {
    pub const fn step_offset(self) -> u8 {
        match self {
            Direction::Cw => 0,
            Direction::Ccw => CCW_STEP_OFFSET,
        }
    }

    pub const fn is_reverse(self) -> bool {
        matches!(self, Direction::Ccw)
    }
}

/// 転流テーブル
///
/// ステップコード 1..=6 は正転、9..=14 は逆転（Hall値 + 8）。
/// それ以外（0, 7, 8, 15 以上）は None。
pub const fn phase_pair(step: u8) -> Option<PhasePair> {
    use Phase::{U, V, W};
    let pair = match step {
        // 正転
        1 => PhasePair::new(W, V),
        5 => PhasePair::new(U, V),
        4 => PhasePair::new(U, W),
        6 => PhasePair::new(V, W),
        2 => PhasePair::new(V, U),
        3 => PhasePair::new(W, U),
        // 逆転
        9 => PhasePair::new(U, V),
        13 => PhasePair::new(W, V),
        12 => PhasePair::new(W, U),
        14 => PhasePair::new(V, U),
        10 => PhasePair::new(V, W),
        11 => PhasePair::new(U, W),
        _ => return None,
    };
    Some(pair)
}

/// Hall値が有効か（1..=6）
pub fn is_valid_hall_state(state: u8) -> bool {
    (1..=6).contains(&state)
}

/// 機械角1周あたりのHallステップ数（極対数 × 6）
pub const fn steps_per_mech_rev(pole_pairs: u8) -> u32 {
    pole_pairs as u32 * STEPS_PER_ELECTRICAL_REV
}

/// エッジ間隔 [tick] から機械角速度 [RPM] を計算
///
/// `rpm = ticks_per_second * 60 / (elapsed * pole_pairs * 6)`
/// 中間値は u64 で計算するため、170MHz のサイクルカウンタでも桁あふれしない。
pub fn rpm_from_interval(elapsed_ticks: u32, ticks_per_second: u32, pole_pairs: u8) -> i32 {
    if elapsed_ticks == 0 || pole_pairs == 0 {
        return 0;
    }
    let numerator = ticks_per_second as u64 * 60;
    let denominator = elapsed_ticks as u64 * steps_per_mech_rev(pole_pairs) as u64;
    (numerator / denominator).min(i32::MAX as u64) as i32
}

/// 最終Hallエッジ時刻（割り込み → 制御タスク）
///
/// tick は 32bit でラップするため、経過時間は `wrapping_sub` で求める。
pub struct EdgeClock {
    last_edge: AtomicU32,
    seen: AtomicBool,
}

impl EdgeClock {
    pub const fn new() -> Self {
        Self {
            last_edge: AtomicU32::new(0),
            seen: AtomicBool::new(false),
        }
    }

    pub fn publish(&self, now: u32) {
        self.last_edge.store(now, Ordering::Release);
        self.seen.store(true, Ordering::Release);
    }

    /// 最終エッジ時刻（起動後まだエッジが無ければ None）
    pub fn last_edge(&self) -> Option<u32> {
        if self.seen.load(Ordering::Acquire) {
            Some(self.last_edge.load(Ordering::Acquire))
        } else {
            None
        }
    }

    pub fn elapsed_since_edge(&self, now: u32) -> Option<u32> {
        self.last_edge().map(|t| now.wrapping_sub(t))
    }

    pub fn reset(&self) {
        self.seen.store(false, Ordering::Release);
        self.last_edge.store(0, Ordering::Release);
    }
}

impl Default for EdgeClock {
    fn default() -> Self {
        Self::new()
    }
}

/// 回転方向の共有セル（CANタスク → 割り込み）
pub struct DirectionCell(AtomicBool);

impl DirectionCell {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn set(&self, direction: Direction) {
        self.0.store(direction.is_reverse(), Ordering::Relaxed);
    }

    pub fn get(&self) -> Direction {
        if self.0.load(Ordering::Relaxed) {
            Direction::Ccw
        } else {
            Direction::Cw
        }
    }
}

impl Default for DirectionCell {
    fn default() -> Self {
        Self::new()
    }
}

/// 転流エンジンの設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommutationConfig {
    /// タイムスタンプの周波数 [Hz]
    pub ticks_per_second: u32,
    /// 極対数
    pub pole_pairs: u8,
    /// デバウンス時間 [tick]
    pub debounce_ticks: u32,
    /// これより長いエッジ間隔からは RPM を出さない [tick]
    pub edge_timeout_ticks: u32,
}

impl CommutationConfig {
    pub fn new(ticks_per_second: u32, pole_pairs: u8) -> Self {
        Self {
            ticks_per_second,
            pole_pairs,
            debounce_ticks: us_to_ticks(HALL_DEBOUNCE_US, ticks_per_second),
            edge_timeout_ticks: us_to_ticks(HALL_EDGE_TIMEOUT_MS * 1000, ticks_per_second),
        }
    }

    /// タイムアウト判定などに使う ms → tick 変換
    pub fn ms_to_ticks(&self, ms: u32) -> u32 {
        us_to_ticks(ms.saturating_mul(1000), self.ticks_per_second)
    }
}

fn us_to_ticks(us: u32, ticks_per_second: u32) -> u32 {
    (us as u64 * ticks_per_second as u64 / 1_000_000).min(u32::MAX as u64) as u32
}

/// エッジ処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EdgeOutcome {
    /// デバウンス時間内のため破棄
    Debounced,
    /// 不正なHall値（出力は変更しない）
    InvalidHall(u8),
    /// 転流した。`rpm` は起動後（[`CommutationEngine::reset`] 後）最初のエッジと、
    /// エッジタイムアウトより長い間隔の後では None
    Commutated { step: u8, rpm: Option<i32> },
}

/// 転流エンジン
///
/// 1つのHallエッジ割り込みハンドラが専有する。共有状態は Vault・
/// [`EdgeClock`]・[`DirectionCell`] への参照だけ。
pub struct CommutationEngine<'a, M: RawMutex = CriticalSectionRawMutex> {
    config: CommutationConfig,
    vault: &'a MotorVault<M>,
    clock: &'a EdgeClock,
    direction: &'a DirectionCell,
    /// 最後に受理したエッジの時刻
    last_edge: Option<u32>,
    /// 直前の有効Hall値のセクタ番号
    last_sector: Option<u8>,
    /// 機械角 [Hallステップ]（0..steps_per_rev）
    position_steps: u32,
    steps_per_rev: u32,
    /// 連続した不正Hall値の回数
    invalid_count: u8,
}

impl<'a, M: RawMutex> CommutationEngine<'a, M> {
    pub fn new(
        config: CommutationConfig,
        vault: &'a MotorVault<M>,
        clock: &'a EdgeClock,
        direction: &'a DirectionCell,
    ) -> Self {
        Self {
            config,
            vault,
            clock,
            direction,
            last_edge: None,
            last_sector: None,
            position_steps: 0,
            steps_per_rev: steps_per_mech_rev(config.pole_pairs).max(1),
            invalid_count: 0,
        }
    }

    pub fn config(&self) -> &CommutationConfig {
        &self.config
    }

    /// Hallエッジ1回分の処理
    ///
    /// `now` はエッジのタイムスタンプ [tick]。
    pub fn on_edge<H, P>(&mut self, now: u32, hall: &mut H, phases: &mut P) -> EdgeOutcome
    where
        H: HallSensors,
        P: PhaseDriver,
    {
        let elapsed = self.last_edge.map(|prev| now.wrapping_sub(prev));

        if let Some(elapsed) = elapsed {
            if elapsed < self.config.debounce_ticks {
                return EdgeOutcome::Debounced;
            }
        }

        self.last_edge = Some(now);
        self.clock.publish(now);

        let state = hall.read_state() & 0x07;
        if !is_valid_hall_state(state) {
            self.on_invalid_hall(state);
            return EdgeOutcome::InvalidHall(state);
        }
        if self.invalid_count >= HALL_INVALID_FAULT_COUNT {
            info!("Hall state recovered: {}", state);
            self.vault.set_flag(FaultFlags::HALL_INVALID, false);
        }
        self.invalid_count = 0;

        let direction = self.direction.get();
        let step = state + direction.step_offset();
        if let Err(e) = phases.set_commutation(step) {
            error!("Commutation rejected: step={} {:?}", step, e);
        }

        self.track_position(state);

        // 停止中の長い間隔はサイクルカウンタのラップで短く見えることがあるので使わない
        let rpm = elapsed.filter(|&e| e <= self.config.edge_timeout_ticks).map(|elapsed| {
            let rpm = rpm_from_interval(elapsed, self.config.ticks_per_second, self.config.pole_pairs);
            if direction.is_reverse() {
                -rpm
            } else {
                rpm
            }
        });
        if let Some(rpm) = rpm {
            self.vault.set_speed(rpm);
        }

        EdgeOutcome::Commutated { step, rpm }
    }

    fn on_invalid_hall(&mut self, state: u8) {
        self.invalid_count = self.invalid_count.saturating_add(1);

        // 毎エッジ出すとログが溢れるので初回と64回ごと
        if self.invalid_count == 1 || self.invalid_count % 64 == 0 {
            warn!(
                "Invalid hall state: {} (count={})",
                state, self.invalid_count
            );
        }

        if self.invalid_count == HALL_INVALID_FAULT_COUNT {
            error!("Hall sensor fault: {} consecutive invalid states", self.invalid_count);
            self.vault.set_flag(FaultFlags::HALL_INVALID, true);
        }
    }

    /// 静止状態から回し始めるとき、現在のHall値に対応する相へ通電する
    ///
    /// エッジ時刻は更新しないので RPM 計測には影響しない。
    pub fn align<H, P>(&mut self, hall: &mut H, phases: &mut P) -> Result<u8, Error>
    where
        H: HallSensors,
        P: PhaseDriver,
    {
        let state = hall.read_state() & 0x07;
        if !is_valid_hall_state(state) {
            warn!("Cannot align rotor: invalid hall state {}", state);
            return Err(Error::InvalidHall(state));
        }

        let step = state + self.direction.get().step_offset();
        phases.set_commutation(step)?;
        self.last_sector = Some(HALL_SECTOR_TABLE[state as usize]);
        debug!("Rotor aligned: hall={} step={}", state, step);
        Ok(step)
    }

    /// セクタ遷移から機械角を更新し Vault に公開
    ///
    /// 隣接セクタへの遷移だけを数える。2セクタ以上飛んだ場合は方向が
    /// 決まらないため位置を更新しない。
    fn track_position(&mut self, state: u8) {
        let sector = HALL_SECTOR_TABLE[state as usize];
        if let Some(prev) = self.last_sector {
            match (sector + 6 - prev) % 6 {
                0 => {}
                1 => self.position_steps = (self.position_steps + 1) % self.steps_per_rev,
                5 => {
                    self.position_steps =
                        (self.position_steps + self.steps_per_rev - 1) % self.steps_per_rev
                }
                skipped => debug!("Hall sector skipped: {} -> {} ({})", prev, sector, skipped),
            }
        }
        self.last_sector = Some(sector);

        let degrees = (self.position_steps * 360 / self.steps_per_rev) as i32;
        self.vault.set_position(degrees);
    }

    /// 機械角 [Hallステップ]
    pub fn position_steps(&self) -> u32 {
        self.position_steps
    }

    /// 計測状態をクリア（次のエッジは起動直後と同じ扱い）
    ///
    /// 静止状態から始動する前に呼ぶ。停止中にタイムスタンプが一周していると
    /// 前回の `last_edge` との差は意味を持たない。
    pub fn reset(&mut self) {
        self.last_edge = None;
        self.last_sector = None;
        self.invalid_count = 0;
        self.clock.reset();
    }
}
