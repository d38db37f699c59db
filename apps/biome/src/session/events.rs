use std::fmt;

use crate::client::LinkSignal;
use crate::engine::{EngineError, EngineStatus};
use crate::frame::{DecodedFrame, FrameError, PresentationSurface};
use crate::input::{Key, MouseButton};

/// Identifies one session attempt. Timer and engine events carry the id of
/// the attempt that scheduled them and are dropped once it is over.
pub type AttemptId = u64;

/// Requests from the user or the embedding front-end.
#[derive(Debug)]
pub enum Command {
    Submit(String),
    Logout,
    DismissConnectionLost,
    ToggleMenu,
    Reset,
    SendPrompt(String),
    SendPromptWithSeed { prompt: String, seed_url: String },
    SetMouseSensitivity(f64),
    AttachSurface(SurfaceAttachment),
    DetachSurface,
    Shutdown,
}

pub struct SurfaceAttachment(pub Box<dyn PresentationSurface>);

impl fmt::Debug for SurfaceAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SurfaceAttachment(..)")
    }
}

/// Raw input from the host window or terminal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    KeyDown(Key),
    KeyUp(Key),
    MouseDown(MouseButton),
    MouseUp(MouseButton),
    MouseMotion { dx: f64, dy: f64 },
    PointerCaptureChanged(bool),
    FocusLost,
    FocusGained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    FirstFrame,
    EngineReady,
    WarmupGrace,
    /// Republishes the frame rate while frames are expected.
    FrameRate,
}

#[derive(Debug)]
pub enum EngineEvent {
    Status {
        status: EngineStatus,
        port_in_use: bool,
    },
    Started(Result<(), EngineError>),
    Ready,
}

/// Everything the orchestrator reacts to arrives as one of these.
#[derive(Debug)]
pub enum SessionEvent {
    Command(Command),
    Input(InputEvent),
    Link(LinkSignal),
    Engine {
        attempt: AttemptId,
        event: EngineEvent,
    },
    Timer {
        attempt: AttemptId,
        kind: TimerKind,
    },
    InputTick {
        generation: u64,
    },
    FrameDecoded {
        attempt: AttemptId,
        result: Result<DecodedFrame, FrameError>,
    },
    ClearInputError {
        seq: u64,
    },
}

/// Things only the host can do for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRequest {
    CapturePointer,
    ReleasePointer,
}

impl From<Command> for SessionEvent {
    fn from(command: Command) -> Self {
        SessionEvent::Command(command)
    }
}

impl From<InputEvent> for SessionEvent {
    fn from(input: InputEvent) -> Self {
        SessionEvent::Input(input)
    }
}
