//! 通信ウォッチドッグ
//!
//! ハートビートが `WATCHDOG_TIMEOUT_MS` 途絶えたら Vault を非常停止にします。
//! 期限切れ後は `init` されるまでキックを受け付けません。
//!
//! [`Watchdog`] は期限の状態機械だけを持ち、時刻は呼び出し側から渡します。
//! ファームウェアでは `watchdog_task` が [`WatchdogLink`] と `Timer::at(deadline)` を
//! select して駆動します。

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};

use crate::config::WATCHDOG_TIMEOUT_MS;
use crate::vault::MotorVault;

/// ウォッチドッグの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WatchdogState {
    /// 停止中（リンク未接続）
    Disarmed,
    /// 監視中
    Armed { deadline: Instant },
    /// 期限切れ（`init` 待ち）
    Expired,
}

/// 通信ウォッチドッグ
#[derive(Debug, Clone)]
pub struct Watchdog {
    state: WatchdogState,
    timeout: Duration,
}

impl Watchdog {
    pub const fn new(timeout: Duration) -> Self {
        Self {
            state: WatchdogState::Disarmed,
            timeout,
        }
    }

    pub const fn with_default_timeout() -> Self {
        Self::new(Duration::from_millis(WATCHDOG_TIMEOUT_MS))
    }

    /// 監視を開始（期限切れ状態から抜ける唯一の方法）
    pub fn init(&mut self, now: Instant) {
        self.state = WatchdogState::Armed {
            deadline: now + self.timeout,
        };
        info!("Watchdog armed ({} ms)", self.timeout.as_millis());
    }

    /// 期限を延長
    ///
    /// 停止中なら監視を開始する。期限切れ後は無視して false を返す。
    pub fn kick(&mut self, now: Instant) -> bool {
        match self.state {
            WatchdogState::Expired => false,
            WatchdogState::Disarmed | WatchdogState::Armed { .. } => {
                self.state = WatchdogState::Armed {
                    deadline: now + self.timeout,
                };
                true
            }
        }
    }

    /// 監視を停止（リンクが正常に閉じられた）
    pub fn stop(&mut self) {
        if self.state != WatchdogState::Disarmed {
            info!("Watchdog stopped");
        }
        self.state = WatchdogState::Disarmed;
    }

    /// 期限を確認し、切れていれば非常停止する
    ///
    /// 期限切れを検出した呼び出しだけ true を返す。
    pub fn poll<M: RawMutex>(&mut self, now: Instant, vault: &MotorVault<M>) -> bool {
        match self.state {
            WatchdogState::Armed { deadline } if now >= deadline => {
                vault.trigger_estop();
                self.state = WatchdogState::Expired;
                error!("Watchdog expired - link lost, motor halted");
                true
            }
            _ => false,
        }
    }

    /// リンクからのコマンドを適用
    pub fn apply(&mut self, command: WatchdogCommand, now: Instant) {
        match command {
            WatchdogCommand::Init => self.init(now),
            WatchdogCommand::Kick => {
                if !self.kick(now) {
                    debug!("Watchdog kick ignored (expired)");
                }
            }
            WatchdogCommand::Stop => self.stop(),
        }
    }

    /// 監視中なら期限
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            WatchdogState::Armed { deadline } => Some(deadline),
            _ => None,
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn is_expired(&self) -> bool {
        self.state == WatchdogState::Expired
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::with_default_timeout()
    }
}

/// コマンド層からウォッチドッグタスクへの指示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WatchdogCommand {
    Init,
    Kick,
    Stop,
}

impl WatchdogCommand {
    /// 未処理のコマンドに新しいコマンドを重ねる
    ///
    /// 未処理の Init は後続の Kick で消さない（期限切れからの復帰が失われるため）。
    fn merge(pending: Option<Self>, next: Self) -> Self {
        match (pending, next) {
            (Some(WatchdogCommand::Init), WatchdogCommand::Kick) => WatchdogCommand::Init,
            (_, next) => next,
        }
    }
}

/// ウォッチドッグへのノンブロッキングな窓口
///
/// 送信側はどのコンテキストからでも呼べる。未処理のコマンドは1つに畳み込まれる。
pub struct WatchdogLink<M: RawMutex = CriticalSectionRawMutex> {
    pending: Mutex<M, Cell<Option<WatchdogCommand>>>,
    wake: Signal<M, ()>,
}

impl<M: RawMutex> WatchdogLink<M> {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(Cell::new(None)),
            wake: Signal::new(),
        }
    }

    fn send(&self, command: WatchdogCommand) {
        self.pending.lock(|cell| {
            cell.set(Some(WatchdogCommand::merge(cell.get(), command)));
        });
        self.wake.signal(());
    }

    pub fn init(&self) {
        self.send(WatchdogCommand::Init);
    }

    pub fn kick(&self) {
        self.send(WatchdogCommand::Kick);
    }

    pub fn stop(&self) {
        self.send(WatchdogCommand::Stop);
    }

    /// 未処理のコマンドを取り出す
    pub fn try_take(&self) -> Option<WatchdogCommand> {
        self.pending.lock(|cell| cell.take())
    }

    /// 次のコマンドを待つ
    pub async fn wait(&self) -> WatchdogCommand {
        loop {
            if let Some(command) = self.try_take() {
                return command;
            }
            self.wake.wait().await;
        }
    }
}

impl<M: RawMutex> Default for WatchdogLink<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MotorState;

    fn ms(millis: u64) -> Instant {
        Instant::from_millis(millis)
    }

    #[test]
    fn test_kicked_every_500ms_never_expires() {
        let vault: MotorVault = MotorVault::new();
        vault.set_target_speed(2000).unwrap();
        let mut wd = Watchdog::with_default_timeout();
        wd.init(ms(0));

        for t in (0..=10_000).step_by(100) {
            if t % 500 == 0 {
                assert!(wd.kick(ms(t)));
            }
            assert!(!wd.poll(ms(t), &vault), "expired at {} ms", t);
        }
        assert_eq!(vault.target_speed(), 2000);
        assert_eq!(vault.target_state(), MotorState::RunningSpeed);
    }

    #[test]
    fn test_no_kick_forces_estop() {
        let vault: MotorVault = MotorVault::new();
        vault.set_target_speed(2000).unwrap();
        let mut wd = Watchdog::with_default_timeout();
        wd.init(ms(0));
        wd.kick(ms(500));

        assert!(!wd.poll(ms(2499), &vault));
        assert!(wd.poll(ms(2501), &vault));

        assert_eq!(vault.target_speed(), 0);
        assert_eq!(vault.target_state(), MotorState::EStop);
        assert_eq!(vault.state(), MotorState::EStop);
        // 2回目以降は検出しない
        assert!(!wd.poll(ms(3000), &vault));
    }

    #[test]
    fn test_expired_ignores_kick_until_init() {
        let vault: MotorVault = MotorVault::new();
        let mut wd = Watchdog::with_default_timeout();
        wd.init(ms(0));
        assert!(wd.poll(ms(2000), &vault));

        assert!(!wd.kick(ms(2100)));
        assert!(wd.is_expired());
        assert_eq!(wd.deadline(), None);

        wd.init(ms(3000));
        assert_eq!(wd.deadline(), Some(ms(5000)));
        assert!(wd.kick(ms(4000)));
        assert_eq!(wd.deadline(), Some(ms(6000)));
    }

    #[test]
    fn test_disarmed_never_expires_and_kick_arms() {
        let vault: MotorVault = MotorVault::new();
        let mut wd = Watchdog::with_default_timeout();
        assert!(!wd.poll(ms(100_000), &vault));

        assert!(wd.kick(ms(100_000)));
        assert_eq!(wd.deadline(), Some(ms(102_000)));

        wd.stop();
        assert_eq!(wd.state(), WatchdogState::Disarmed);
        assert!(!wd.poll(ms(200_000), &vault));
        assert_eq!(vault.state(), MotorState::Stopped);
    }

    #[test]
    fn test_link_merges_pending_commands() {
        let link: WatchdogLink = WatchdogLink::new();
        assert_eq!(link.try_take(), None);

        link.init();
        link.kick();
        assert_eq!(link.try_take(), Some(WatchdogCommand::Init));
        assert_eq!(link.try_take(), None);

        link.kick();
        link.stop();
        assert_eq!(link.try_take(), Some(WatchdogCommand::Stop));

        link.stop();
        link.kick();
        assert_eq!(link.try_take(), Some(WatchdogCommand::Kick));
    }

    #[test]
    fn test_apply_recovers_after_expiry() {
        let vault: MotorVault = MotorVault::new();
        let link: WatchdogLink = WatchdogLink::new();
        let mut wd = Watchdog::with_default_timeout();
        wd.init(ms(0));
        assert!(wd.poll(ms(2000), &vault));

        link.init();
        link.kick();
        while let Some(command) = link.try_take() {
            wd.apply(command, ms(2500));
        }
        assert_eq!(wd.deadline(), Some(ms(4500)));
    }
}
