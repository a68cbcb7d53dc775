//! Gamepad adapter - raw joystick codes to named controls
//!
//! Translates [`RawEvent`]s of a DualShock 4 style controller into
//! [`SemanticEvent`]s using a fixed mapping table.
//!
//! # Mapping
//!
//! | type | code | control |
//! |------|------|---------|
//! | 1 | 0 / 1 / 2 / 3 | Cross / Circle / Triangle / Square |
//! | 1 | 4 / 5 | L1 / R1 |
//! | 1 | 6 / 7 | L2 / R2 (digital) |
//! | 1 | 8 / 9 | Share / Option |
//! | 1 | 11 / 12 | L3 / R3 |
//! | 2 | 0 / 1 | L3Horizontal / L3Vertical |
//! | 2 | 3 / 4 | R3Horizontal / R3Vertical |
//! | 2 | 5 / 2 | L2Force / R2Force (renormalized to 0..=65535) |
//! | 2 | 6 | DPadLeft (< 0) / DPadRight (> 0) |
//! | 2 | 7 | DPadUp (< 0) / DPadDown (> 0) |
//!
//! The D-pad is reported by the driver as two axes. Each direction is
//! turned into an independent latched button: a press is emitted when the
//! axis points towards a direction that is not latched yet, and an axis
//! returning to neutral releases whichever of its two directions are
//! latched. A neutral reading with nothing latched is not a transition and
//! is reported as an unknown event.

use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::event_source::{SourceError, SourceHandle};
use super::record::{RawEvent, TYPE_AXIS, TYPE_BUTTON};
use super::{deliver, Delivery};

/// Offset added to trigger force axes, moves `i16::MIN..=i16::MAX` to `0..=65535`
pub const TRIGGER_OFFSET: i32 = 0x8000;

// Named gamepad controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ButtonId {
    DPadUp,
    DPadRight,
    DPadDown,
    DPadLeft,
    Triangle,
    Circle,
    Cross,
    Square,
    Share,
    Option,
    L1,
    L2,
    L2Force,
    L3,
    L3Vertical,
    L3Horizontal,
    R1,
    R2,
    R2Force,
    R3,
    R3Vertical,
    R3Horizontal,
}

impl ButtonId {
    pub const ALL: [ButtonId; 22] = [
        ButtonId::DPadUp,
        ButtonId::DPadRight,
        ButtonId::DPadDown,
        ButtonId::DPadLeft,
        ButtonId::Triangle,
        ButtonId::Circle,
        ButtonId::Cross,
        ButtonId::Square,
        ButtonId::Share,
        ButtonId::Option,
        ButtonId::L1,
        ButtonId::L2,
        ButtonId::L2Force,
        ButtonId::L3,
        ButtonId::L3Vertical,
        ButtonId::L3Horizontal,
        ButtonId::R1,
        ButtonId::R2,
        ButtonId::R2Force,
        ButtonId::R3,
        ButtonId::R3Vertical,
        ButtonId::R3Horizontal,
    ];
}

impl fmt::Display for ButtonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Named control event
///
/// `value` is 0/1 for digital buttons and the D-pad, the signed axis
/// magnitude for sticks and `0..=65535` for trigger force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemanticEvent {
    pub timestamp_ms: u32,
    pub button: ButtonId,
    pub value: i32,
}

impl SemanticEvent {
    pub fn new(timestamp_ms: u32, button: ButtonId, value: i32) -> Self {
        Self {
            timestamp_ms,
            button,
            value,
        }
    }
}

impl fmt::Display for SemanticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} at {}ms", self.button, self.value, self.timestamp_ms)
    }
}

// Adapter errors
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Unknown gamepad event: {0}")]
    UnknownEventKind(RawEvent),
}

impl AdapterError {
    /// Whether the error ended the upstream source
    pub fn is_fatal(&self) -> bool {
        match self {
            AdapterError::Source(e) => e.is_fatal(),
            AdapterError::UnknownEventKind(_) => false,
        }
    }
}

/// Latched D-pad directions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DPadLatch {
    pub up: bool,
    pub right: bool,
    pub down: bool,
    pub left: bool,
}

impl DPadLatch {
    fn slot(&mut self, direction: Direction) -> &mut bool {
        match direction {
            Direction::Up => &mut self.up,
            Direction::Right => &mut self.right,
            Direction::Down => &mut self.down,
            Direction::Left => &mut self.left,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Right,
    Down,
    Left,
}

impl Direction {
    fn button(self) -> ButtonId {
        match self {
            Direction::Up => ButtonId::DPadUp,
            Direction::Right => ButtonId::DPadRight,
            Direction::Down => ButtonId::DPadDown,
            Direction::Left => ButtonId::DPadLeft,
        }
    }
}

// One physical D-pad axis shared by two directions
struct DPadAxis {
    code: u8,
    negative: Direction,
    positive: Direction,
}

#[derive(Clone, Copy)]
enum AxisKind {
    Stick,
    Trigger,
}

const DPAD_AXES: [DPadAxis; 2] = [
    DPadAxis {
        code: 7,
        negative: Direction::Up,
        positive: Direction::Down,
    },
    DPadAxis {
        code: 6,
        negative: Direction::Left,
        positive: Direction::Right,
    },
];

const DIGITAL_BUTTONS: [(u8, ButtonId); 12] = [
    (0, ButtonId::Cross),
    (1, ButtonId::Circle),
    (2, ButtonId::Triangle),
    (3, ButtonId::Square),
    (4, ButtonId::L1),
    (5, ButtonId::R1),
    (6, ButtonId::L2),
    (7, ButtonId::R2),
    (8, ButtonId::Share),
    (9, ButtonId::Option),
    (11, ButtonId::L3),
    (12, ButtonId::R3),
];

const ANALOG_AXES: [(u8, ButtonId, AxisKind); 6] = [
    (0, ButtonId::L3Horizontal, AxisKind::Stick),
    (1, ButtonId::L3Vertical, AxisKind::Stick),
    (2, ButtonId::R2Force, AxisKind::Trigger),
    (3, ButtonId::R3Horizontal, AxisKind::Stick),
    (4, ButtonId::R3Vertical, AxisKind::Stick),
    (5, ButtonId::L2Force, AxisKind::Trigger),
];

/// Remap a signed trigger reading to `0..=65535`
pub fn fix_trigger_value(value: i16) -> i32 {
    i32::from(value) + TRIGGER_OFFSET
}

/// Stateful raw-to-semantic converter.
///
/// Each instance owns its own [`DPadLatch`], so adapters for different
/// devices never interfere.
#[derive(Debug, Default)]
pub struct GamepadAdapter {
    latch: DPadLatch,
}

impl GamepadAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latch(&self) -> DPadLatch {
        self.latch
    }

    /// Convert one raw event.
    ///
    /// Returns zero, one or two semantic events. A D-pad axis back at
    /// neutral releases both of its directions if both were latched, and a
    /// repeated reading towards an already latched direction yields an
    /// empty list. A neutral reading that releases nothing is an
    /// [`AdapterError::UnknownEventKind`].
    pub fn convert(&mut self, event: RawEvent) -> Result<Vec<SemanticEvent>, AdapterError> {
        match event.type_tag {
            TYPE_AXIS => {
                if let Some(axis) = DPAD_AXES.iter().find(|axis| axis.code == event.code) {
                    return self.convert_dpad(axis, event);
                }
                if let Some((_, button, kind)) =
                    ANALOG_AXES.iter().find(|(code, ..)| *code == event.code)
                {
                    let value = match kind {
                        AxisKind::Stick => i32::from(event.value),
                        AxisKind::Trigger => fix_trigger_value(event.value),
                    };
                    return Ok(vec![SemanticEvent::new(event.timestamp_ms, *button, value)]);
                }
            }
            TYPE_BUTTON => {
                if let Some((_, button)) = DIGITAL_BUTTONS.iter().find(|(code, _)| *code == event.code)
                {
                    return Ok(vec![SemanticEvent::new(
                        event.timestamp_ms,
                        *button,
                        i32::from(event.value),
                    )]);
                }
            }
            _ => {}
        }

        Err(AdapterError::UnknownEventKind(event))
    }

    fn convert_dpad(
        &mut self,
        axis: &DPadAxis,
        event: RawEvent,
    ) -> Result<Vec<SemanticEvent>, AdapterError> {
        if event.value == 0 {
            let mut released = Vec::with_capacity(2);
            for direction in [axis.negative, axis.positive] {
                if self.release(direction) {
                    released.push(SemanticEvent::new(event.timestamp_ms, direction.button(), 0));
                }
            }
            if released.is_empty() {
                return Err(AdapterError::UnknownEventKind(event));
            }
            return Ok(released);
        }

        let direction = if event.value < 0 {
            axis.negative
        } else {
            axis.positive
        };
        if !self.press(direction) {
            trace!("{:?} already latched: {}", direction, event);
            return Ok(Vec::new());
        }
        Ok(vec![SemanticEvent::new(
            event.timestamp_ms,
            direction.button(),
            1,
        )])
    }

    // Sets the latch, true if it was released before
    fn press(&mut self, direction: Direction) -> bool {
        !std::mem::replace(self.latch.slot(direction), true)
    }

    // Clears the latch, true if it was set before
    fn release(&mut self, direction: Direction) -> bool {
        std::mem::replace(self.latch.slot(direction), false)
    }
}

/// Running adapter task with its output channels
#[derive(Debug)]
pub struct AdapterHandle {
    events: mpsc::Receiver<SemanticEvent>,
    errors: mpsc::Receiver<AdapterError>,
    task: JoinHandle<()>,
}

impl AdapterHandle {
    /// Spawn an adapter stage consuming `source`.
    ///
    /// Source errors are forwarded unchanged onto the adapter's error
    /// channel next to the adapter's own unknown-event reports.
    pub fn spawn(source: SourceHandle, channel_capacity: usize, cancel: CancellationToken) -> Self {
        let capacity = channel_capacity.max(1);
        let (event_sender, events) = mpsc::channel(capacity);
        let (error_sender, errors) = mpsc::channel(capacity);

        let task = tokio::spawn(run_adapter_loop(
            GamepadAdapter::new(),
            source,
            event_sender,
            error_sender,
            cancel,
        ));
        debug!("Gamepad adapter task spawned");

        Self {
            events,
            errors,
            task,
        }
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<SemanticEvent>,
        mpsc::Receiver<AdapterError>,
        JoinHandle<()>,
    ) {
        (self.events, self.errors, self.task)
    }
}

async fn run_adapter_loop(
    mut adapter: GamepadAdapter,
    source: SourceHandle,
    event_sender: mpsc::Sender<SemanticEvent>,
    error_sender: mpsc::Sender<AdapterError>,
    cancel: CancellationToken,
) {
    info!("Starting gamepad adapter loop");
    let (mut raw_events, mut raw_errors, source_task) = source.into_parts();
    let mut events_open = true;
    let mut errors_open = true;

    'adapter: while events_open || errors_open {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Cancellation observed, stopping gamepad adapter");
                break;
            }
            raw = raw_events.recv(), if events_open => {
                let Some(raw) = raw else {
                    debug!("Source event channel closed");
                    events_open = false;
                    continue;
                };

                match adapter.convert(raw) {
                    Ok(converted) => {
                        for event in converted {
                            debug!("Gamepad event: {}", event);
                            if !deliver(&cancel, &event_sender, event).await.is_sent() {
                                break 'adapter;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Ignoring record: {}", e);
                        if deliver(&cancel, &error_sender, e).await == Delivery::Cancelled {
                            break;
                        }
                    }
                }
            }
            err = raw_errors.recv(), if errors_open => {
                let Some(err) = err else {
                    debug!("Source error channel closed");
                    errors_open = false;
                    continue;
                };

                if deliver(&cancel, &error_sender, err.into()).await == Delivery::Cancelled {
                    break;
                }
            }
        }
    }

    // Release the source before reporting completion
    drop(raw_events);
    drop(raw_errors);
    if let Err(e) = source_task.await {
        warn!("Device event source task failed: {}", e);
    }
    info!("Gamepad adapter finished, latch state at exit: {:?}", adapter.latch());
}
