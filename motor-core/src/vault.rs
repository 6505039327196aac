//! モーター状態Vault
//!
//! 現在値・目標値・ステータスの唯一の保存場所です。フィールドは非公開で、
//! すべての読み書きはクリティカルセクション内のアクセサを通して行います。
//! ロック中はフィールド代入のみ（I/Oなし）なので、割り込みからも呼び出せます。

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::blocking_mutex::Mutex;

use crate::config::{RPM_MAX, RPM_MIN};
use crate::Error;

/// ステータスバイトの状態コード部（下位ニブル）
const STATE_MASK: u8 = 0x0F;
/// ステータスバイトのフラグ部（上位ニブル）
const FLAG_MASK: u8 = 0xF0;

/// モーター状態コード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MotorState {
    /// 停止
    Stopped = 0x00,
    /// 速度制御で運転中
    RunningSpeed = 0x01,
    /// 位置指令あり
    RunningPosition = 0x02,
    /// 非常停止（`init` まで解除されない）
    EStop = 0x03,
}

impl MotorState {
    /// ステータスバイト用の状態コード
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// 状態コードから変換（上位ニブルは無視）
    pub fn from_code(code: u8) -> Option<Self> {
        match code & STATE_MASK {
            0x00 => Some(Self::Stopped),
            0x01 => Some(Self::RunningSpeed),
            0x02 => Some(Self::RunningPosition),
            0x03 => Some(Self::EStop),
            _ => None,
        }
    }
}

/// 故障フラグ（ステータスバイト上位ニブル）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultFlags(u8);

impl FaultFlags {
    /// ハートビートの連番が飛んだ
    pub const SYNC_BAD: Self = Self(0x10);
    /// 過熱警告
    pub const OVERHEAT: Self = Self(0x20);
    /// 不正なHall値（0/7）が連続した
    pub const HALL_INVALID: Self = Self(0x40);
    /// ストール故障がラッチされている
    pub const STALL: Self = Self(0x80);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// 生のビット列から変換（状態コード部は捨てる）
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & FLAG_MASK)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0 & FLAG_MASK;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !(other.0 & FLAG_MASK);
    }

    pub fn set(&mut self, other: Self, active: bool) {
        if active {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for FaultFlags {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "FaultFlags({=u8:#x})", self.0)
    }
}

/// 状態コードとフラグの組（ステータスバイトへの変換点）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MotorStatus {
    pub state: MotorState,
    pub flags: FaultFlags,
}

impl MotorStatus {
    /// テレメトリ用ステータスバイトにパック
    pub const fn to_byte(self) -> u8 {
        (self.flags.bits() & FLAG_MASK) | (self.state.code() & STATE_MASK)
    }

    /// ステータスバイトから復元
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(Self {
            state: MotorState::from_code(byte)?,
            flags: FaultFlags::from_bits_truncate(byte),
        })
    }
}

/// Vaultの中身（一度のロックで取得したスナップショットとしても使う）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MotorStats {
    pub state: MotorState,
    pub flags: FaultFlags,
    pub target_state: MotorState,
    /// 現在速度 [RPM]（転流エンジンが書き込む瞬時値）
    pub current_speed: i32,
    /// 目標速度 [RPM]
    pub target_speed: i32,
    /// 現在位置 [deg]、0..360
    pub current_position: i32,
    /// 目標位置 [deg]、0..360
    pub target_position: i32,
    /// 速度制御ループのフィルタ後速度 [RPM]
    pub filtered_speed: i32,
}

impl MotorStats {
    pub const fn new() -> Self {
        Self {
            state: MotorState::Stopped,
            flags: FaultFlags::empty(),
            target_state: MotorState::Stopped,
            current_speed: 0,
            target_speed: 0,
            current_position: 0,
            target_position: 0,
            filtered_speed: 0,
        }
    }

    pub const fn status(&self) -> MotorStatus {
        MotorStatus {
            state: self.state,
            flags: self.flags,
        }
    }

    /// 実測速度を書き、EStop 以外なら状態コードを追従させる
    fn apply_speed(&mut self, rpm: i32) {
        self.current_speed = rpm;
        if self.state != MotorState::EStop {
            self.state = if rpm != 0 {
                MotorState::RunningSpeed
            } else {
                MotorState::Stopped
            };
        }
    }
}

impl Default for MotorStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 角度を [0, 360) に正規化
pub fn normalize_degrees(degrees: i32) -> i32 {
    degrees.rem_euclid(360)
}

/// モーター状態Vault
///
/// `M` はロックの実装。デフォルトの `CriticalSectionRawMutex` は割り込み禁止区間で
/// 排他するため、待ち合わせが発生しない。
pub struct MotorVault<M: RawMutex = CriticalSectionRawMutex> {
    stats: Mutex<M, RefCell<MotorStats>>,
}

impl<M: RawMutex> MotorVault<M> {
    /// 停止状態で初期化されたVaultを作成（`static` に置ける）
    pub const fn new() -> Self {
        Self {
            stats: Mutex::new(RefCell::new(MotorStats::new())),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MotorStats) -> R) -> R {
        self.stats.lock(|cell| f(&mut *cell.borrow_mut()))
    }

    /// 全フィールドをゼロ・停止状態に戻す（非常停止ラッチも解除）
    pub fn init(&self) {
        self.with(|s| *s = MotorStats::new());
    }

    // --- 実測値（転流エンジン・制御ループが書き込む） ---

    /// 現在速度を設定
    ///
    /// 状態コードは速度に応じて RunningSpeed / Stopped になる。
    /// 非常停止中は状態コードを変更しない。
    pub fn set_speed(&self, rpm: i32) {
        self.with(|s| s.apply_speed(rpm));
    }

    /// `expired()` が true なら実測速度を0にし、現在の実測速度を返す
    ///
    /// 判定はロック内で行うので、エッジ割り込みの書き込みと入れ違いにならない。
    pub fn expire_speed(&self, expired: impl FnOnce() -> bool) -> i32 {
        self.with(|s| {
            if expired() {
                s.apply_speed(0);
            }
            s.current_speed
        })
    }

    /// 現在位置を設定 [deg]
    pub fn set_position(&self, degrees: i32) {
        self.with(|s| s.current_position = normalize_degrees(degrees));
    }

    /// フィルタ後速度を公開
    pub fn publish_filtered_speed(&self, rpm: i32) {
        self.with(|s| s.filtered_speed = rpm);
    }

    /// 故障フラグのセット/クリア（状態コードには触れない）
    pub fn set_flag(&self, flag: FaultFlags, active: bool) {
        self.with(|s| s.flags.set(flag, active));
    }

    // --- 目標値（コマンド層が書き込む） ---

    /// 目標速度を設定
    ///
    /// [RPM_MIN, RPM_MAX] にクランプし、0以外なら RunningSpeed、0なら Stopped を目標状態にする。
    pub fn set_target_speed(&self, rpm: i32) -> Result<(), Error> {
        self.with(|s| {
            if s.state == MotorState::EStop {
                return Err(Error::EStopLatched);
            }
            let rpm = rpm.clamp(RPM_MIN, RPM_MAX);
            s.target_speed = rpm;
            s.target_state = if rpm != 0 {
                MotorState::RunningSpeed
            } else {
                MotorState::Stopped
            };
            Ok(())
        })
    }

    /// 目標位置を設定 [deg]
    pub fn set_target_position(&self, degrees: i32) -> Result<(), Error> {
        self.with(|s| {
            if s.state == MotorState::EStop {
                return Err(Error::EStopLatched);
            }
            s.target_position = normalize_degrees(degrees);
            s.target_state = MotorState::RunningPosition;
            Ok(())
        })
    }

    /// 非常停止
    ///
    /// 現在状態・目標状態を EStop にし、目標速度を0にする。
    /// クリティカルセクションのみで完結するのでタイマー満了ハンドラからも呼べる。
    pub fn trigger_estop(&self) {
        self.with(|s| {
            s.state = MotorState::EStop;
            s.target_state = MotorState::EStop;
            s.target_speed = 0;
        });
    }

    // --- ゲッター ---

    /// 全フィールドを一度のロックで取得
    pub fn snapshot(&self) -> MotorStats {
        self.with(|s| *s)
    }

    pub fn status(&self) -> MotorStatus {
        self.with(|s| s.status())
    }

    /// テレメトリ用ステータスバイト（状態コード | フラグ）
    pub fn full_status(&self) -> u8 {
        self.status().to_byte()
    }

    pub fn state(&self) -> MotorState {
        self.with(|s| s.state)
    }

    pub fn flags(&self) -> FaultFlags {
        self.with(|s| s.flags)
    }

    pub fn is_sync_bad(&self) -> bool {
        self.flags().contains(FaultFlags::SYNC_BAD)
    }

    pub fn is_overheated(&self) -> bool {
        self.flags().contains(FaultFlags::OVERHEAT)
    }

    pub fn speed(&self) -> i32 {
        self.with(|s| s.current_speed)
    }

    pub fn filtered_speed(&self) -> i32 {
        self.with(|s| s.filtered_speed)
    }

    pub fn position(&self) -> i32 {
        self.with(|s| s.current_position)
    }

    pub fn target_state(&self) -> MotorState {
        self.with(|s| s.target_state)
    }

    pub fn target_speed(&self) -> i32 {
        self.with(|s| s.target_speed)
    }

    pub fn target_position(&self) -> i32 {
        self.with(|s| s.target_position)
    }
}

impl<M: RawMutex> Default for MotorVault<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let vault: MotorVault = MotorVault::new();
        let stats = vault.snapshot();
        assert_eq!(stats, MotorStats::new());
        assert_eq!(vault.full_status(), 0x00);
    }

    #[test]
    fn test_target_speed_clamp_and_state() {
        let vault: MotorVault = MotorVault::new();
        for rpm in [-1_000_000, -6001, -6000, -1, 0, 1, 3000, 6000, 6001, i32::MAX, i32::MIN] {
            vault.set_target_speed(rpm).unwrap();
            let stored = vault.target_speed();
            assert!((RPM_MIN..=RPM_MAX).contains(&stored));
            assert_eq!(stored, rpm.clamp(RPM_MIN, RPM_MAX));
            let expected = if stored == 0 {
                MotorState::Stopped
            } else {
                MotorState::RunningSpeed
            };
            assert_eq!(vault.target_state(), expected);
        }
    }

    #[test]
    fn test_target_position_normalized() {
        let vault: MotorVault = MotorVault::new();
        for deg in [0, 1, 359, 360, 361, 720, -1, -360, -361, i32::MAX, i32::MIN] {
            vault.set_target_position(deg).unwrap();
            let stored = vault.target_position();
            assert!((0..360).contains(&stored), "{} -> {}", deg, stored);
            assert_eq!(vault.target_state(), MotorState::RunningPosition);
        }
        vault.set_target_position(-90).unwrap();
        assert_eq!(vault.target_position(), 270);
    }

    #[test]
    fn test_position_normalized() {
        let vault: MotorVault = MotorVault::new();
        vault.set_position(725);
        assert_eq!(vault.position(), 5);
        vault.set_position(-15);
        assert_eq!(vault.position(), 345);
    }

    #[test]
    fn test_expire_speed() {
        let vault: MotorVault = MotorVault::new();
        vault.set_speed(1500);
        assert_eq!(vault.expire_speed(|| false), 1500);
        assert_eq!(vault.state(), MotorState::RunningSpeed);

        assert_eq!(vault.expire_speed(|| true), 0);
        assert_eq!(vault.speed(), 0);
        assert_eq!(vault.state(), MotorState::Stopped);

        // EStop 中は状態コードを変えない
        vault.set_speed(800);
        vault.trigger_estop();
        assert_eq!(vault.expire_speed(|| true), 0);
        assert_eq!(vault.state(), MotorState::EStop);
    }

    #[test]
    fn test_flags_do_not_clobber_state() {
        let vault: MotorVault = MotorVault::new();
        vault.set_speed(1200);
        vault.set_flag(FaultFlags::SYNC_BAD, true);
        vault.set_flag(FaultFlags::OVERHEAT, true);
        assert_eq!(vault.state(), MotorState::RunningSpeed);
        assert_eq!(vault.full_status(), 0x10 | 0x20 | 0x01);

        // 状態コードの変更でフラグが消えない
        vault.set_speed(0);
        assert!(vault.is_sync_bad());
        assert!(vault.is_overheated());
        assert_eq!(vault.full_status(), 0x30);

        vault.set_flag(FaultFlags::SYNC_BAD, false);
        assert!(!vault.is_sync_bad());
        assert!(vault.is_overheated());
        assert_eq!(vault.state(), MotorState::Stopped);
    }

    #[test]
    fn test_estop_latches_until_init() {
        let vault: MotorVault = MotorVault::new();
        vault.set_target_speed(2500).unwrap();
        vault.set_flag(FaultFlags::SYNC_BAD, true);
        vault.trigger_estop();

        assert_eq!(vault.state(), MotorState::EStop);
        assert_eq!(vault.target_state(), MotorState::EStop);
        assert_eq!(vault.target_speed(), 0);
        assert_eq!(vault.full_status(), 0x13);

        // 惰性回転中のエッジで状態が上書きされない
        vault.set_speed(300);
        assert_eq!(vault.state(), MotorState::EStop);
        assert_eq!(vault.speed(), 300);

        assert_eq!(vault.set_target_speed(1000), Err(Error::EStopLatched));
        assert_eq!(vault.set_target_position(90), Err(Error::EStopLatched));
        assert_eq!(vault.target_speed(), 0);

        vault.init();
        assert_eq!(vault.state(), MotorState::Stopped);
        assert!(vault.flags().is_empty());
        assert!(vault.set_target_speed(1000).is_ok());
    }

    #[test]
    fn test_status_byte_roundtrip_split() {
        let status = MotorStatus {
            state: MotorState::RunningPosition,
            flags: FaultFlags::STALL,
        };
        let byte = status.to_byte();
        assert_eq!(byte, 0x82);
        assert_eq!(MotorStatus::from_byte(byte), Some(status));
        assert_eq!(MotorStatus::from_byte(0x0F), None);
    }
}
