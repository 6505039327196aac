// Command / heartbeat / telemetry framing shared by the firmware transport

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::commutation::{Direction, DirectionCell};
use crate::vault::{FaultFlags, MotorVault};
use crate::watchdog::WatchdogLink;
use crate::Error;

/// CAN message IDs
pub mod can_ids {
    /// Emergency stop (any data length)
    pub const EMERGENCY_STOP: u32 = 0x000;

    /// Motor command ([opcode: u8][value: i32 LE], 5 bytes)
    pub const COMMAND: u32 = 0x100;

    /// Heartbeat ([counter: u8], 1 byte)
    pub const HEARTBEAT: u32 = 0x101;

    /// Link closed: stop the watchdog and the motor (no data)
    pub const WATCHDOG_STOP: u32 = 0x102;

    /// Telemetry ([status: u8][filtered_speed: i32 LE][position: u16 LE], 7 bytes)
    pub const TELEMETRY: u32 = 0x200;
}

/// コマンドのオペコード
pub mod opcode {
    pub const OFF: u8 = 0x00;
    pub const INIT: u8 = 0x01;
    pub const SPEED: u8 = 0x02;
    pub const POSITION: u8 = 0x03;
    pub const DIRECTION: u8 = 0x04;
}

/// コマンドフレーム長
pub const COMMAND_LEN: usize = 5;

/// テレメトリフレーム長
pub const TELEMETRY_LEN: usize = 7;

/// フレーム解析エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// 未定義のオペコード
    UnknownOpcode(u8),
    /// データ長不足
    Truncated { len: usize },
}

/// モーターコマンド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// 停止（目標速度0）
    Off,
    /// Vault とウォッチドッグを初期化（非常停止の解除）
    Init,
    /// 目標速度 [RPM]（符号で回転方向も決まる）
    Speed(i32),
    /// 目標位置 [deg]
    Position(i32),
    /// 回転方向
    Direction(Direction),
}

impl Command {
    /// Parse a command frame
    ///
    /// # Arguments
    /// * `data` - `[opcode][value i32 LE]`, at least 5 bytes (extra bytes are ignored)
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < COMMAND_LEN {
            return Err(ProtocolError::Truncated { len: data.len() });
        }

        let value = i32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        let command = match data[0] {
            opcode::OFF => Command::Off,
            opcode::INIT => Command::Init,
            opcode::SPEED => Command::Speed(value),
            opcode::POSITION => Command::Position(value),
            opcode::DIRECTION => Command::Direction(if value == 0 {
                Direction::Cw
            } else {
                Direction::Ccw
            }),
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(command)
    }

    /// Encode into a command frame
    pub fn encode(&self) -> [u8; COMMAND_LEN] {
        let (op, value) = match *self {
            Command::Off => (opcode::OFF, 0),
            Command::Init => (opcode::INIT, 0),
            Command::Speed(rpm) => (opcode::SPEED, rpm),
            Command::Position(deg) => (opcode::POSITION, deg),
            Command::Direction(dir) => (opcode::DIRECTION, dir.is_reverse() as i32),
        };
        let mut data = [0u8; COMMAND_LEN];
        data[0] = op;
        data[1..5].copy_from_slice(&value.to_le_bytes());
        data
    }
}

/// コマンドを Vault / ウォッチドッグ / 回転方向に反映
///
/// 非常停止中は Init 以外の目標設定が `Error::EStopLatched` になる。
pub fn apply_command<M: RawMutex, L: RawMutex>(
    command: Command,
    vault: &MotorVault<M>,
    link: &WatchdogLink<L>,
    direction: &DirectionCell,
) -> Result<(), Error> {
    match command {
        Command::Off => {
            info!("Command: off");
            vault.set_target_speed(0)
        }
        Command::Init => {
            info!("Command: init");
            vault.init();
            link.init();
            Ok(())
        }
        Command::Speed(rpm) => {
            info!("Command: speed {} rpm", rpm);
            if rpm != 0 {
                direction.set(if rpm < 0 { Direction::Ccw } else { Direction::Cw });
            }
            vault.set_target_speed(rpm)
        }
        Command::Position(deg) => {
            info!("Command: position {} deg", deg);
            vault.set_target_position(deg)
        }
        Command::Direction(dir) => {
            info!("Command: direction {}", dir);
            direction.set(dir);
            Ok(())
        }
    }
}

/// リンクが正常に閉じられたときの処理（ウォッチドッグ停止・目標速度0）
pub fn close_link<M: RawMutex, L: RawMutex>(
    vault: &MotorVault<M>,
    link: &WatchdogLink<L>,
    heartbeat: &mut HeartbeatMonitor,
) {
    info!("Link closed");
    heartbeat.reset();
    link.stop();
    if vault.set_target_speed(0).is_err() {
        debug!("Link closed while e-stop is latched");
    }
}

/// ハートビート受信結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeartbeatEvent {
    /// 接続後最初のハートビート（連番チェックなし）
    First,
    /// 前回と同じ値（キックしない）
    Stale,
    /// 連番どおり
    InSync,
    /// 連番が飛んだ（差分）
    Slip(u8),
}

/// ハートビート連番の監視
#[derive(Debug, Clone, Default)]
pub struct HeartbeatMonitor {
    last: Option<u8>,
}

impl HeartbeatMonitor {
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// ハートビート受信
    ///
    /// カウンタは u8 でラップする。差分1なら SYNC_BAD を解除、2以上ならセット。
    /// Stale 以外はウォッチドッグをキックする。
    pub fn on_heartbeat<M: RawMutex, L: RawMutex>(
        &mut self,
        counter: u8,
        vault: &MotorVault<M>,
        link: &WatchdogLink<L>,
    ) -> HeartbeatEvent {
        let event = match self.last {
            None => HeartbeatEvent::First,
            Some(prev) => match counter.wrapping_sub(prev) {
                0 => HeartbeatEvent::Stale,
                1 => HeartbeatEvent::InSync,
                diff => HeartbeatEvent::Slip(diff),
            },
        };

        match event {
            HeartbeatEvent::Stale => {
                warn!("Stale heartbeat (val={})", counter);
                return event;
            }
            HeartbeatEvent::InSync => vault.set_flag(FaultFlags::SYNC_BAD, false),
            HeartbeatEvent::Slip(diff) => {
                warn!("Heartbeat sync slip: expected +1, got +{}", diff);
                vault.set_flag(FaultFlags::SYNC_BAD, true);
            }
            HeartbeatEvent::First => debug!("First heartbeat (val={})", counter),
        }

        self.last = Some(counter);
        link.kick();
        event
    }

    /// 次のハートビートを接続後最初のものとして扱う
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }
}

/// テレメトリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Telemetry {
    /// ステータスバイト（状態コード | 故障フラグ）
    pub status: u8,
    /// フィルタ後速度 [RPM]
    pub filtered_speed: i32,
    /// 機械角 [deg]（0..360）
    pub position: u16,
}

impl Telemetry {
    pub fn from_vault<M: RawMutex>(vault: &MotorVault<M>) -> Self {
        let stats = vault.snapshot();
        Self {
            status: stats.status().to_byte(),
            filtered_speed: stats.filtered_speed,
            position: stats.current_position.clamp(0, u16::MAX as i32) as u16,
        }
    }

    /// Encode telemetry into CAN data (7 bytes)
    pub fn encode(&self) -> [u8; TELEMETRY_LEN] {
        let mut data = [0u8; TELEMETRY_LEN];
        data[0] = self.status;
        data[1..5].copy_from_slice(&self.filtered_speed.to_le_bytes());
        data[5..7].copy_from_slice(&self.position.to_le_bytes());
        data
    }

    /// Decode telemetry from CAN data
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < TELEMETRY_LEN {
            return Err(ProtocolError::Truncated { len: data.len() });
        }
        Ok(Self {
            status: data[0],
            filtered_speed: i32::from_le_bytes([data[1], data[2], data[3], data[4]]),
            position: u16::from_le_bytes([data[5], data[6]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MotorState;
    use crate::watchdog::WatchdogCommand;

    #[test]
    fn test_parse_speed_command() {
        let data = [0x02, 0xB8, 0x0B, 0x00, 0x00];
        assert_eq!(Command::parse(&data), Ok(Command::Speed(3000)));

        let data = Command::Speed(-1500).encode();
        assert_eq!(Command::parse(&data), Ok(Command::Speed(-1500)));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Command::parse(&[0x02, 0x00]),
            Err(ProtocolError::Truncated { len: 2 })
        );
        assert_eq!(
            Command::parse(&[0x09, 0, 0, 0, 0]),
            Err(ProtocolError::UnknownOpcode(0x09))
        );
    }

    #[test]
    fn test_parse_direction() {
        assert_eq!(
            Command::parse(&[0x04, 1, 0, 0, 0]),
            Ok(Command::Direction(Direction::Ccw))
        );
        assert_eq!(
            Command::parse(&[0x04, 0, 0, 0, 0, 0xFF]),
            Ok(Command::Direction(Direction::Cw))
        );
    }

    #[test]
    fn test_apply_speed_sets_target_and_direction() {
        let vault: MotorVault = MotorVault::new();
        let link: WatchdogLink = WatchdogLink::new();
        let dir = DirectionCell::new();

        apply_command(Command::Speed(-2500), &vault, &link, &dir).unwrap();
        assert_eq!(vault.target_speed(), -2500);
        assert_eq!(vault.target_state(), MotorState::RunningSpeed);
        assert_eq!(dir.get(), Direction::Ccw);

        // 0 は方向を変えない
        apply_command(Command::Off, &vault, &link, &dir).unwrap();
        assert_eq!(vault.target_state(), MotorState::Stopped);
        assert_eq!(dir.get(), Direction::Ccw);
    }

    #[test]
    fn test_apply_after_estop_requires_init() {
        let vault: MotorVault = MotorVault::new();
        let link: WatchdogLink = WatchdogLink::new();
        let dir = DirectionCell::new();

        vault.trigger_estop();
        assert_eq!(
            apply_command(Command::Speed(1000), &vault, &link, &dir),
            Err(Error::EStopLatched)
        );
        assert_eq!(
            apply_command(Command::Position(90), &vault, &link, &dir),
            Err(Error::EStopLatched)
        );

        apply_command(Command::Init, &vault, &link, &dir).unwrap();
        assert_eq!(vault.state(), MotorState::Stopped);
        assert_eq!(link.try_take(), Some(WatchdogCommand::Init));

        apply_command(Command::Position(450), &vault, &link, &dir).unwrap();
        assert_eq!(vault.target_position(), 90);
        assert_eq!(vault.target_state(), MotorState::RunningPosition);
    }

    #[test]
    fn test_heartbeat_sequence() {
        let vault: MotorVault = MotorVault::new();
        let link: WatchdogLink = WatchdogLink::new();
        let mut hb = HeartbeatMonitor::new();

        // 最初は任意の値から始まる
        assert_eq!(hb.on_heartbeat(200, &vault, &link), HeartbeatEvent::First);
        assert_eq!(link.try_take(), Some(WatchdogCommand::Kick));

        assert_eq!(hb.on_heartbeat(203, &vault, &link), HeartbeatEvent::Slip(3));
        assert!(vault.is_sync_bad());

        assert_eq!(hb.on_heartbeat(203, &vault, &link), HeartbeatEvent::Stale);
        assert!(vault.is_sync_bad());
        link.try_take();

        assert_eq!(hb.on_heartbeat(204, &vault, &link), HeartbeatEvent::InSync);
        assert!(!vault.is_sync_bad());
        assert_eq!(link.try_take(), Some(WatchdogCommand::Kick));
    }

    #[test]
    fn test_stale_heartbeat_does_not_kick() {
        let vault: MotorVault = MotorVault::new();
        let link: WatchdogLink = WatchdogLink::new();
        let mut hb = HeartbeatMonitor::new();

        hb.on_heartbeat(7, &vault, &link);
        link.try_take();
        assert_eq!(hb.on_heartbeat(7, &vault, &link), HeartbeatEvent::Stale);
        assert_eq!(link.try_take(), None);
    }

    #[test]
    fn test_heartbeat_counter_wraps() {
        let vault: MotorVault = MotorVault::new();
        let link: WatchdogLink = WatchdogLink::new();
        let mut hb = HeartbeatMonitor::new();

        hb.on_heartbeat(255, &vault, &link);
        assert_eq!(hb.on_heartbeat(0, &vault, &link), HeartbeatEvent::InSync);
    }

    #[test]
    fn test_close_link() {
        let vault: MotorVault = MotorVault::new();
        let link: WatchdogLink = WatchdogLink::new();
        let mut hb = HeartbeatMonitor::new();

        vault.set_target_speed(1200).unwrap();
        hb.on_heartbeat(1, &vault, &link);
        close_link(&vault, &link, &mut hb);

        assert_eq!(vault.target_speed(), 0);
        assert_eq!(hb.last(), None);
        assert_eq!(link.try_take(), Some(WatchdogCommand::Stop));
    }

    #[test]
    fn test_telemetry_layout() {
        let vault: MotorVault = MotorVault::new();
        vault.publish_filtered_speed(-1200);
        vault.set_position(300);
        vault.set_flag(FaultFlags::SYNC_BAD, true);
        vault.set_speed(-1180);

        let data = Telemetry::from_vault(&vault).encode();
        assert_eq!(data[0], 0x11);
        assert_eq!(&data[1..5], &(-1200i32).to_le_bytes());
        assert_eq!(&data[5..7], &300u16.to_le_bytes());
        assert_eq!(
            Telemetry::decode(&data).map(|t| t.position),
            Ok(300)
        );
    }
}
