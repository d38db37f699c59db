//! Terminal events to session input.
//!
//! Most terminals only report key presses. When release events are not
//! available a key counts as held until it stops auto-repeating for
//! [`HELD_KEY_TIMEOUT`]. Mouse motion is reported in cells, converted to
//! pixels with a nominal cell size.

use crossterm::event::{
    KeyCode, KeyEventKind, ModifierKeyCode, MouseButton as TermButton, MouseEvent,
    MouseEventKind,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::input::{Key, MouseButton};
use crate::session::InputEvent;

pub const CELL_WIDTH_PX: f64 = 8.0;
pub const CELL_HEIGHT_PX: f64 = 16.0;
/// Longer than the usual auto-repeat delay, so a held key is not released
/// between its first press and the first repeat.
pub const HELD_KEY_TIMEOUT: Duration = Duration::from_millis(550);

pub fn map_key(code: KeyCode) -> Option<Key> {
    let key = match code {
        KeyCode::Char(' ') => Key::Space,
        KeyCode::Char(c) => Key::Char(c),
        KeyCode::Up => Key::Up,
        KeyCode::Down => Key::Down,
        KeyCode::Left => Key::Left,
        KeyCode::Right => Key::Right,
        KeyCode::Tab | KeyCode::BackTab => Key::Tab,
        KeyCode::Enter => Key::Enter,
        KeyCode::Esc => Key::Escape,
        KeyCode::Modifier(
            ModifierKeyCode::LeftShift | ModifierKeyCode::RightShift,
        ) => Key::Shift,
        KeyCode::Modifier(
            ModifierKeyCode::LeftControl | ModifierKeyCode::RightControl,
        ) => Key::Ctrl,
        _ => return None,
    };
    Some(key)
}

pub fn map_button(button: TermButton) -> MouseButton {
    match button {
        TermButton::Left => MouseButton::Left,
        TermButton::Right => MouseButton::Right,
        TermButton::Middle => MouseButton::Middle,
    }
}

/// Tracks which keys are down.
#[derive(Debug)]
pub struct HeldKeys {
    pressed: HashMap<Key, Instant>,
    release_events: bool,
}

impl HeldKeys {
    /// `release_events` is whether the terminal reports key releases.
    pub fn new(release_events: bool) -> Self {
        Self {
            pressed: HashMap::new(),
            release_events,
        }
    }

    pub fn on_key(&mut self, key: Key, kind: KeyEventKind, now: Instant) -> Vec<InputEvent> {
        match kind {
            KeyEventKind::Press | KeyEventKind::Repeat => {
                if self.pressed.insert(key, now).is_some() {
                    Vec::new()
                } else {
                    vec![InputEvent::KeyDown(key)]
                }
            }
            KeyEventKind::Release => match self.pressed.remove(&key) {
                Some(_) => vec![InputEvent::KeyUp(key)],
                None => Vec::new(),
            },
        }
    }

    /// Releases keys that stopped repeating. No-op when the terminal reports
    /// releases itself.
    pub fn expire(&mut self, now: Instant) -> Vec<InputEvent> {
        if self.release_events {
            return Vec::new();
        }
        let mut released = Vec::new();
        self.pressed.retain(|key, last| {
            if now.saturating_duration_since(*last) >= HELD_KEY_TIMEOUT {
                released.push(InputEvent::KeyUp(*key));
                false
            } else {
                true
            }
        });
        released
    }

    pub fn release_all(&mut self) -> Vec<InputEvent> {
        self.pressed
            .drain()
            .map(|(key, _)| InputEvent::KeyUp(key))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pressed.is_empty()
    }
}

/// Turns absolute cell positions into pixel deltas.
#[derive(Debug, Default)]
pub struct MouseTracker {
    last: Option<(u16, u16)>,
}

impl MouseTracker {
    pub fn on_mouse(&mut self, event: MouseEvent) -> Vec<InputEvent> {
        let position = (event.column, event.row);
        let motion = self.motion_to(position);
        match event.kind {
            MouseEventKind::Moved | MouseEventKind::Drag(_) => motion.into_iter().collect(),
            MouseEventKind::Down(button) => motion
                .into_iter()
                .chain([InputEvent::MouseDown(map_button(button))])
                .collect(),
            MouseEventKind::Up(button) => motion
                .into_iter()
                .chain([InputEvent::MouseUp(map_button(button))])
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Forgets the last position so the next event starts a new track.
    pub fn reset(&mut self) {
        self.last = None;
    }

    fn motion_to(&mut self, position: (u16, u16)) -> Option<InputEvent> {
        let previous = self.last.replace(position)?;
        let dx = (f64::from(position.0) - f64::from(previous.0)) * CELL_WIDTH_PX;
        let dy = (f64::from(position.1) - f64::from(previous.1)) * CELL_HEIGHT_PX;
        (dx != 0.0 || dy != 0.0).then_some(InputEvent::MouseMotion { dx, dy })
    }
}
