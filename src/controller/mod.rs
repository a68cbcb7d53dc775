//! Controller subsystem for joystick-class gamepad input
//!
//! Implements a three-stage processing pipeline:
//!
//! 1. [`event_source`] - Polls the device ([`device`]) and decodes raw records ([`record`])
//! 2. [`event_adapter`] - Maps raw codes to named buttons and axes
//! 3. [`state_cache`] - Keeps the last value of every control
//! 4. [`controller_handle`] - Unified API and lifecycle management
//!
//! # Architecture
//!
//! ```text
//! Device ──► Source ──► Adapter ──► StateCache ──► changed notification
//!            (RawEvent) (SemanticEvent)
//!              │          ▲   │
//!              └─errors───┘   └─errors──► application
//! ```
//!
//! Every stage runs in its own tokio task. Stages are linked by bounded mpsc
//! channels, so a slow consumer stalls the producers up to the device read.
//! Errors travel on a channel parallel to the events; the application must
//! drain both or the pipeline will block.

pub mod controller_handle;
pub mod device;
pub mod event_adapter;
pub mod event_source;
pub mod record;
pub mod state_cache;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use controller_handle::{ControllerError, ControllerHandle, ControllerSettings};
pub use event_adapter::{
    fix_trigger_value, AdapterError, AdapterHandle, ButtonId, DPadLatch, GamepadAdapter,
    SemanticEvent,
};
pub use device::JoystickDevice;
pub use event_source::{DeviceEventSource, DeviceReader, SourceError, SourceHandle};
pub use record::{decode_record, DecodeError, RawEvent, RECORD_LEN, TYPE_AXIS, TYPE_BUTTON};
pub use state_cache::{GamepadState, GamepadStateCache};

/// Outcome of handing an item to the next stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    Cancelled,
    Closed,
}

impl Delivery {
    pub(crate) fn is_sent(self) -> bool {
        self == Delivery::Sent
    }
}

// Send that gives up as soon as cancellation is signaled
pub(crate) async fn deliver<T>(
    cancel: &CancellationToken,
    sender: &mpsc::Sender<T>,
    item: T,
) -> Delivery {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Cancelled,
        res = sender.send(item) => match res {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        },
    }
}
