//! Status LEDs: metric-to-color mapping, link status and blink patterns.

use clap::ValueEnum;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use crate::link::ConnectionState;

pub const SOUND_ALERT_DB: f32 = 70.0;
pub const SOUND_WARNING_DB: f32 = 50.0;
pub const BATTERY_GOOD_PERCENT: f32 = 75.0;
pub const BATTERY_LOW_PERCENT: f32 = 25.0;

pub const CONNECTING_BLINK_MS: u64 = 500;
pub const FAST_BLINK_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundState {
    Normal,
    Warning,
    Alert,
}

impl SoundState {
    pub fn from_decibels(db: f32) -> SoundState {
        if db >= SOUND_ALERT_DB {
            SoundState::Alert
        } else if db >= SOUND_WARNING_DB {
            SoundState::Warning
        } else {
            SoundState::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryState {
    Good,
    Caution,
    Low,
}

impl BatteryState {
    pub fn from_percent(percent: f32) -> BatteryState {
        if percent > BATTERY_GOOD_PERCENT {
            BatteryState::Good
        } else if percent > BATTERY_LOW_PERCENT {
            BatteryState::Caution
        } else {
            BatteryState::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Green,
    Blue,
}

impl From<SoundState> for Color {
    fn from(state: SoundState) -> Self {
        match state {
            SoundState::Alert => Color::Red,
            SoundState::Warning => Color::Blue,
            SoundState::Normal => Color::Green,
        }
    }
}

impl From<BatteryState> for Color {
    fn from(state: BatteryState) -> Self {
        match state {
            BatteryState::Good => Color::Green,
            BatteryState::Caution => Color::Blue,
            BatteryState::Low => Color::Red,
        }
    }
}

/// What the status LED does while the link is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DisconnectedPattern {
    #[default]
    Off,
    FastBlink,
}

/// Steady-state level of the status LED at `now_ms`.
pub fn status_level(state: ConnectionState, pattern: DisconnectedPattern, now_ms: u64) -> bool {
    match state {
        ConnectionState::Connected => true,
        ConnectionState::Connecting => (now_ms / CONNECTING_BLINK_MS) % 2 == 1,
        ConnectionState::Disconnected => match pattern {
            DisconnectedPattern::Off => false,
            DisconnectedPattern::FastBlink => (now_ms / FAST_BLINK_MS) % 2 == 1,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkPattern {
    pub count: u8,
    pub period_ms: u32,
}

pub const SUCCESS_BLINK: BlinkPattern = BlinkPattern {
    count: 3,
    period_ms: 100,
};
pub const FAILURE_BLINK: BlinkPattern = BlinkPattern {
    count: 2,
    period_ms: 500,
};

/// A GPIO-driven LED that knows its polarity.
#[derive(Debug)]
pub struct Led<P> {
    pin: P,
    active_low: bool,
}

impl<P: OutputPin> Led<P> {
    pub fn new(pin: P, active_low: bool) -> Led<P> {
        Led { pin, active_low }
    }

    pub fn set(&mut self, on: bool) {
        let result = if on != self.active_low {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(e) = result {
            log::warn!("Failed to drive LED: {e:?}");
        }
    }
}

#[derive(Debug)]
pub struct RgbLed<P> {
    red: Led<P>,
    green: Led<P>,
    blue: Led<P>,
}

impl<P: OutputPin> RgbLed<P> {
    pub fn new(red: Led<P>, green: Led<P>, blue: Led<P>) -> RgbLed<P> {
        let mut rgb = RgbLed { red, green, blue };
        rgb.off();
        rgb
    }

    pub fn off(&mut self) {
        self.red.set(false);
        self.green.set(false);
        self.blue.set(false);
    }

    /// Clears every channel before lighting `color`.
    pub fn show(&mut self, color: Color) {
        self.off();
        match color {
            Color::Red => self.red.set(true),
            Color::Green => self.green.set(true),
            Color::Blue => self.blue.set(true),
        }
    }
}

#[derive(Debug)]
pub struct StatusLed<P> {
    led: Led<P>,
    disconnected: DisconnectedPattern,
}

impl<P: OutputPin> StatusLed<P> {
    pub fn new(led: Led<P>, disconnected: DisconnectedPattern) -> StatusLed<P> {
        StatusLed { led, disconnected }
    }

    pub fn update(&mut self, state: ConnectionState, now_ms: u64) {
        self.led.set(status_level(state, self.disconnected, now_ms));
    }

    pub fn into_led(self) -> Led<P> {
        self.led
    }

    /// Plays `pattern` to completion, leaving the LED off.
    pub fn blink<D: DelayNs>(&mut self, pattern: BlinkPattern, delay: &mut D) {
        for _ in 0..pattern.count {
            self.led.set(true);
            delay.delay_ms(pattern.period_ms);
            self.led.set(false);
            delay.delay_ms(pattern.period_ms);
        }
    }
}
