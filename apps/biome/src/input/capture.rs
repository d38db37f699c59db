use std::borrow::Cow;
use std::collections::BTreeSet;
use tracing::trace;

/// Physical key as reported by the host. Keys outside the engine's button
/// table arrive as [`Key::Other`] and are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Char(char),
    Up,
    Down,
    Left,
    Right,
    Shift,
    Ctrl,
    Space,
    Tab,
    Enter,
    Escape,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Button identifier understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Button {
    Letter(char),
    Digit(char),
    Up,
    Down,
    Left,
    Right,
    Shift,
    Ctrl,
    Space,
    Tab,
    Enter,
    MouseLeft,
    MouseRight,
    MouseMiddle,
}

impl Button {
    pub fn wire_name(self) -> Cow<'static, str> {
        match self {
            Button::Letter(c) | Button::Digit(c) => Cow::Owned(c.to_string()),
            Button::Up => Cow::Borrowed("UP"),
            Button::Down => Cow::Borrowed("DOWN"),
            Button::Left => Cow::Borrowed("LEFT"),
            Button::Right => Cow::Borrowed("RIGHT"),
            Button::Shift => Cow::Borrowed("SHIFT"),
            Button::Ctrl => Cow::Borrowed("CTRL"),
            Button::Space => Cow::Borrowed("SPACE"),
            Button::Tab => Cow::Borrowed("TAB"),
            Button::Enter => Cow::Borrowed("ENTER"),
            Button::MouseLeft => Cow::Borrowed("MOUSE_LEFT"),
            Button::MouseRight => Cow::Borrowed("MOUSE_RIGHT"),
            Button::MouseMiddle => Cow::Borrowed("MOUSE_MIDDLE"),
        }
    }
}

impl From<MouseButton> for Button {
    fn from(button: MouseButton) -> Self {
        match button {
            MouseButton::Left => Button::MouseLeft,
            MouseButton::Right => Button::MouseRight,
            MouseButton::Middle => Button::MouseMiddle,
        }
    }
}

impl Key {
    /// Engine button for this key, if it is forwarded at all.
    pub fn button(self) -> Option<Button> {
        match self {
            Key::Char(c) if c.is_ascii_alphabetic() => Some(Button::Letter(c.to_ascii_uppercase())),
            Key::Char(c) if c.is_ascii_digit() => Some(Button::Digit(c)),
            Key::Char(' ') | Key::Space => Some(Button::Space),
            Key::Up => Some(Button::Up),
            Key::Down => Some(Button::Down),
            Key::Left => Some(Button::Left),
            Key::Right => Some(Button::Right),
            Key::Shift => Some(Button::Shift),
            Key::Ctrl => Some(Button::Ctrl),
            Key::Tab => Some(Button::Tab),
            Key::Enter => Some(Button::Enter),
            _ => None,
        }
    }

    fn reserved(self) -> Option<Reserved> {
        match self {
            Key::Char('u' | 'U') => Some(Reserved::Reset),
            Key::Escape => Some(Reserved::Menu),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reserved {
    Reset,
    Menu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedAction {
    Reset,
    ToggleMenu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    /// The key is part of the button set.
    Forwarded,
    /// Not a key the engine knows.
    Ignored,
    /// A reserved key; never forwarded. Carries the action to run, if any.
    Consumed(Option<ReservedAction>),
}

/// One sample of the input state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputSnapshot {
    pub buttons: Vec<Button>,
    pub mouse_dx: f64,
    pub mouse_dy: f64,
}

impl InputSnapshot {
    pub fn button_names(&self) -> Vec<String> {
        self.buttons.iter().map(|b| b.wire_name().into_owned()).collect()
    }
}

/// Pressed keys, pressed mouse buttons and accumulated motion.
///
/// Fed with every host event regardless of whether dispatch is running, so
/// reserved keys always work.
#[derive(Debug, Default)]
pub struct InputCapture {
    keys: BTreeSet<Button>,
    mouse: BTreeSet<Button>,
    mouse_dx: f64,
    mouse_dy: f64,
    pointer_captured: bool,
    dispatch_enabled: bool,
}

impl InputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_down(&mut self, key: Key) -> KeyOutcome {
        if let Some(reserved) = key.reserved() {
            let action = match reserved {
                Reserved::Reset if self.dispatch_enabled => Some(ReservedAction::Reset),
                Reserved::Reset => None,
                Reserved::Menu => Some(ReservedAction::ToggleMenu),
            };
            trace!(target: "biome::input", ?key, ?action, "reserved key");
            return KeyOutcome::Consumed(action);
        }
        match key.button() {
            Some(button) => {
                self.keys.insert(button);
                KeyOutcome::Forwarded
            }
            None => KeyOutcome::Ignored,
        }
    }

    pub fn key_up(&mut self, key: Key) -> KeyOutcome {
        if key.reserved().is_some() {
            return KeyOutcome::Consumed(None);
        }
        match key.button() {
            Some(button) => {
                self.keys.remove(&button);
                KeyOutcome::Forwarded
            }
            None => KeyOutcome::Ignored,
        }
    }

    pub fn mouse_down(&mut self, button: MouseButton) {
        self.mouse.insert(button.into());
    }

    pub fn mouse_up(&mut self, button: MouseButton) {
        self.mouse.remove(&button.into());
    }

    /// Adds motion to the accumulator. Returns whether it was kept.
    pub fn mouse_motion(&mut self, dx: f64, dy: f64) -> bool {
        if !(self.pointer_captured && self.dispatch_enabled) {
            return false;
        }
        self.mouse_dx += dx;
        self.mouse_dy += dy;
        true
    }

    pub fn set_pointer_captured(&mut self, captured: bool) {
        if self.pointer_captured && !captured {
            self.clear();
        }
        self.pointer_captured = captured;
    }

    pub fn pointer_captured(&self) -> bool {
        self.pointer_captured
    }

    pub fn focus_lost(&mut self) {
        self.clear();
    }

    pub fn set_dispatch_enabled(&mut self, enabled: bool) {
        self.dispatch_enabled = enabled;
    }

    pub fn dispatch_enabled(&self) -> bool {
        self.dispatch_enabled
    }

    /// Current buttons plus the motion accumulated since the last call,
    /// which is zeroed.
    pub fn take_snapshot(&mut self) -> InputSnapshot {
        let mut buttons: Vec<Button> = self.keys.iter().copied().collect();
        buttons.extend(self.mouse.iter().copied());
        InputSnapshot {
            buttons,
            mouse_dx: std::mem::take(&mut self.mouse_dx),
            mouse_dy: std::mem::take(&mut self.mouse_dy),
        }
    }

    /// Drops all pressed state and pending motion.
    pub fn clear(&mut self) {
        if !self.keys.is_empty() || !self.mouse.is_empty() {
            trace!(target: "biome::input", keys = self.keys.len(), mouse = self.mouse.len(), "clearing held input");
        }
        self.keys.clear();
        self.mouse.clear();
        self.mouse_dx = 0.0;
        self.mouse_dy = 0.0;
    }
}
