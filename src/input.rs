// Keyboard input - held keys, bindings, playback signals
//
// Key state is sampled once per frame by the camera. Playback controls are
// published through `PlaybackSignals`, shared with whoever drives the video.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ConfigError;

/// Windows-style virtual key code. Only codes below 256 exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualKey(u8);

impl VirtualKey {
    pub const TAB: Self = Self(0x09);
    pub const ENTER: Self = Self(0x0D);
    pub const ESCAPE: Self = Self(0x1B);
    pub const SPACE: Self = Self(0x20);
    pub const LEFT: Self = Self(0x25);
    pub const UP: Self = Self(0x26);
    pub const RIGHT: Self = Self(0x27);
    pub const DOWN: Self = Self(0x28);

    pub fn from_code(code: u32) -> Option<Self> {
        u8::try_from(code).ok().map(Self)
    }

    /// Letter and digit keys use their uppercase ASCII code.
    pub fn from_char(c: char) -> Option<Self> {
        let c = c.to_ascii_uppercase();
        (c.is_ascii_uppercase() || c.is_ascii_digit()).then(|| Self(c as u8))
    }

    pub fn code(self) -> u8 {
        self.0
    }

    /// Parse a key name as written in the config file ("W", "Up", "Space", "F5").
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        let mut chars = name.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return Self::from_char(c);
        }

        match name.to_ascii_lowercase().as_str() {
            "up" => Some(Self::UP),
            "down" => Some(Self::DOWN),
            "left" => Some(Self::LEFT),
            "right" => Some(Self::RIGHT),
            "space" => Some(Self::SPACE),
            "escape" | "esc" => Some(Self::ESCAPE),
            "enter" | "return" => Some(Self::ENTER),
            "tab" => Some(Self::TAB),
            other => {
                let n: u8 = other.strip_prefix('f')?.parse().ok()?;
                (1..=12).contains(&n).then(|| Self(0x70 + n - 1))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMessage {
    KeyDown,
    KeyUp,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    MoveForward,
    MoveBackward,
    StrafeLeft,
    StrafeRight,
    MoveUp,
    MoveDown,
    TurnLeft,
    TurnRight,
    PitchUp,
    PitchDown,
    TogglePause,
    FastForward,
    CancelFastForward,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Action::MoveForward => "move_forward",
            Action::MoveBackward => "move_backward",
            Action::StrafeLeft => "strafe_left",
            Action::StrafeRight => "strafe_right",
            Action::MoveUp => "move_up",
            Action::MoveDown => "move_down",
            Action::TurnLeft => "turn_left",
            Action::TurnRight => "turn_right",
            Action::PitchUp => "pitch_up",
            Action::PitchDown => "pitch_down",
            Action::TogglePause => "toggle_pause",
            Action::FastForward => "fast_forward",
            Action::CancelFastForward => "cancel_fast_forward",
        }
    }
}

/// Sparse key to action map. A key triggers at most one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBindings {
    map: HashMap<VirtualKey, Action>,
}

impl Default for KeyBindings {
    fn default() -> Self {
        let letter = |c: char| VirtualKey(c as u8);
        let defaults = [
            (letter('W'), Action::MoveForward),
            (VirtualKey::UP, Action::MoveForward),
            (letter('S'), Action::MoveBackward),
            (VirtualKey::DOWN, Action::MoveBackward),
            (letter('A'), Action::StrafeLeft),
            (letter('D'), Action::StrafeRight),
            (letter('E'), Action::MoveUp),
            (letter('C'), Action::MoveDown),
            (VirtualKey::LEFT, Action::TurnLeft),
            (VirtualKey::RIGHT, Action::TurnRight),
            (letter('Q'), Action::PitchUp),
            (letter('Z'), Action::PitchDown),
            (VirtualKey::SPACE, Action::TogglePause),
            (letter('F'), Action::FastForward),
            (letter('N'), Action::CancelFastForward),
        ];
        Self {
            map: defaults.into_iter().collect(),
        }
    }
}

impl KeyBindings {
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Build from `(action, key names)` pairs. Unknown names are rejected.
    pub fn from_names<'a, I, N>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (Action, N)>,
        N: IntoIterator<Item = &'a String>,
    {
        let mut bindings = Self::empty();
        for (action, names) in entries {
            for name in names {
                let key = VirtualKey::from_name(name).ok_or_else(|| ConfigError::UnknownKey {
                    name: name.clone(),
                    action: action.name(),
                })?;
                bindings.bind(key, action);
            }
        }
        Ok(bindings)
    }

    pub fn bind(&mut self, key: VirtualKey, action: Action) {
        if let Some(previous) = self.map.insert(key, action) {
            if previous != action {
                log::warn!("Key {:?} rebound from {:?} to {:?}", key, previous, action);
            }
        }
    }

    pub fn action(&self, key: VirtualKey) -> Option<Action> {
        self.map.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Playback requests raised by the keyboard and consumed by the video side.
#[derive(Debug, Default)]
pub struct PlaybackSignals {
    paused: AtomicBool,
    fast_forward: AtomicBool,
    cancel_fast_forward: AtomicBool,
}

impl PlaybackSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn toggle_pause(&self) {
        self.paused.fetch_xor(true, Ordering::AcqRel);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn request_fast_forward(&self) {
        self.fast_forward.store(true, Ordering::Release);
    }

    pub fn fast_forward_requested(&self) -> bool {
        self.fast_forward.load(Ordering::Acquire)
    }

    /// Read and clear the fast-forward request.
    pub fn take_fast_forward(&self) -> bool {
        self.fast_forward.swap(false, Ordering::AcqRel)
    }

    pub fn request_cancel_fast_forward(&self) {
        self.cancel_fast_forward.store(true, Ordering::Release);
    }

    pub fn cancel_fast_forward_requested(&self) -> bool {
        self.cancel_fast_forward.load(Ordering::Acquire)
    }

    pub fn take_cancel_fast_forward(&self) -> bool {
        self.cancel_fast_forward.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug)]
pub struct InputState {
    held: HashSet<VirtualKey>,
    bindings: KeyBindings,
    signals: Arc<PlaybackSignals>,
}

impl InputState {
    pub fn new(bindings: KeyBindings, signals: Arc<PlaybackSignals>) -> Self {
        Self {
            held: HashSet::new(),
            bindings,
            signals,
        }
    }

    /// Update held keys, then re-evaluate the playback actions.
    ///
    /// Playback actions fire on every message while their key is held, so a
    /// held pause key toggles once per message.
    pub fn on_key(&mut self, message: KeyMessage, code: u32) {
        let Some(key) = VirtualKey::from_code(code) else {
            log::debug!("Ignoring out-of-range key code {}", code);
            return;
        };
        match message {
            KeyMessage::KeyDown => {
                self.held.insert(key);
            }
            KeyMessage::KeyUp => {
                self.held.remove(&key);
            }
            KeyMessage::Other => {}
        }

        if self.is_active(Action::TogglePause) {
            self.signals.toggle_pause();
        }
        if self.is_active(Action::FastForward) {
            self.signals.request_fast_forward();
        }
        if self.is_active(Action::CancelFastForward) {
            self.signals.request_cancel_fast_forward();
        }
    }

    pub fn is_held(&self, key: VirtualKey) -> bool {
        self.held.contains(&key)
    }

    /// Any held key is bound to `action`.
    pub fn is_active(&self, action: Action) -> bool {
        self.held
            .iter()
            .any(|&key| self.bindings.action(key) == Some(action))
    }

    pub fn signals(&self) -> &Arc<PlaybackSignals> {
        &self.signals
    }

    pub fn bindings(&self) -> &KeyBindings {
        &self.bindings
    }
}

/// Map a physical winit key to its virtual key code.
#[cfg(feature = "vulkan")]
pub fn winit_key(code: winit::keyboard::KeyCode) -> Option<VirtualKey> {
    use winit::keyboard::KeyCode;

    let key = match code {
        KeyCode::ArrowUp => VirtualKey::UP,
        KeyCode::ArrowDown => VirtualKey::DOWN,
        KeyCode::ArrowLeft => VirtualKey::LEFT,
        KeyCode::ArrowRight => VirtualKey::RIGHT,
        KeyCode::Space => VirtualKey::SPACE,
        KeyCode::Escape => VirtualKey::ESCAPE,
        KeyCode::Enter => VirtualKey::ENTER,
        KeyCode::Tab => VirtualKey::TAB,
        other => {
            // "KeyW" / "Digit5" / "F5"
            let name = format!("{:?}", other);
            let short = name
                .strip_prefix("Key")
                .or_else(|| name.strip_prefix("Digit"))
                .unwrap_or(name.as_str());
            return VirtualKey::from_name(short);
        }
    };
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(c: char) -> u32 {
        c as u32
    }

    #[test]
    fn test_key_names() {
        assert_eq!(VirtualKey::from_name("w"), VirtualKey::from_char('W'));
        assert_eq!(VirtualKey::from_name("Up"), Some(VirtualKey::UP));
        assert_eq!(VirtualKey::from_name("F1").map(VirtualKey::code), Some(0x70));
        assert_eq!(VirtualKey::from_name("F12").map(VirtualKey::code), Some(0x7B));
        assert_eq!(VirtualKey::from_name("F13"), None);
        assert_eq!(VirtualKey::from_name("Banana"), None);
        assert_eq!(VirtualKey::from_code(256), None);
    }

    #[test]
    fn test_held_keys_follow_messages() {
        let mut input = InputState::new(KeyBindings::default(), PlaybackSignals::new());
        input.on_key(KeyMessage::KeyDown, code('W'));
        assert!(input.is_active(Action::MoveForward));
        input.on_key(KeyMessage::Other, code('W'));
        assert!(input.is_active(Action::MoveForward));
        input.on_key(KeyMessage::KeyUp, code('W'));
        assert!(!input.is_active(Action::MoveForward));
    }

    #[test]
    fn test_out_of_range_codes_are_ignored() {
        let mut input = InputState::new(KeyBindings::default(), PlaybackSignals::new());
        input.on_key(KeyMessage::KeyDown, 0x157);
        assert!(input.held.is_empty());
    }

    #[test]
    fn test_fast_forward_is_sticky() {
        let signals = PlaybackSignals::new();
        let mut input = InputState::new(KeyBindings::default(), signals.clone());
        input.on_key(KeyMessage::KeyDown, code('F'));
        assert!(signals.fast_forward_requested());
        input.on_key(KeyMessage::KeyUp, code('F'));
        assert!(signals.fast_forward_requested());
        assert!(signals.take_fast_forward());
        assert!(!signals.fast_forward_requested());
    }

    #[test]
    fn test_held_pause_toggles_per_message() {
        let signals = PlaybackSignals::new();
        let mut input = InputState::new(KeyBindings::default(), signals.clone());
        input.on_key(KeyMessage::KeyDown, VirtualKey::SPACE.code() as u32);
        assert!(signals.is_paused());
        input.on_key(KeyMessage::Other, 0);
        assert!(!signals.is_paused());
        input.on_key(KeyMessage::KeyUp, VirtualKey::SPACE.code() as u32);
        assert!(!signals.is_paused());
    }

    #[test]
    fn test_bindings_from_names() {
        let forward = vec!["I".to_string(), "Up".to_string()];
        let bindings = KeyBindings::from_names([(Action::MoveForward, &forward)]).unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings.action(VirtualKey::UP), Some(Action::MoveForward));

        let bad = vec!["Hyper".to_string()];
        let err = KeyBindings::from_names([(Action::FastForward, &bad)]).unwrap_err();
        assert!(err.to_string().contains("fast_forward"));
    }
}
