//! ハードウェアの設定パラメータ

/// システムクロック [Hz]（DWTサイクルカウンタの周波数）
pub const SYSCLK_HZ: u32 = 170_000_000;

/// 状態ログの出力間隔 [ms]
pub const STATUS_LOG_PERIOD_MS: u64 = 1000;

/// PWM設定
pub mod pwm {
    use embassy_stm32::time::Hertz;

    /// PWM周波数（20kHz）（デフォルト値）
    pub const DEFAULT_FREQUENCY: Hertz = Hertz(20_000);

    /// デッドタイム [タイマクロック]（170MHz で約1µs）（デフォルト値）
    pub const DEFAULT_DEAD_TIME: u16 = 170;
}

/// Hallセンサー（TIM4 XORモード）設定
pub mod hall {
    /// TIM4割り込み優先度（上位4ビット有効、2 = 0x20）
    pub const IRQ_PRIORITY: u8 = 0x20;

    /// Hall入力の GPIOB ピン番号（PB6 = U, PB7 = V, PB8 = W）
    pub const PIN_U: usize = 6;
    pub const PIN_V: usize = 7;
    pub const PIN_W: usize = 8;
}

/// CAN設定
pub mod can {
    /// CANビットレート（250kbps）（デフォルト値）
    pub const DEFAULT_BITRATE: u32 = 250_000;
}
