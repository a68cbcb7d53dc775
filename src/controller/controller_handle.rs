//! Controller Handle - Unified API for joystick gamepad processing
//!
//! Wires the three pipeline stages together and manages their lifecycle:
//! the device source, the gamepad adapter and the state cache.
//!

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::event_adapter::{AdapterError, AdapterHandle};
use super::event_source::{DeviceReader, SourceHandle};
use super::state_cache::GamepadStateCache;

/// Configuration settings for the complete controller subsystem
///
/// Settings are distributed to the stages on spawn.
///
/// - `read_timeout_ms`: deadline of a single device read. It bounds how long
///   cancellation can go unnoticed and how often an idle
///   `ReadDeadlineExceeded` is reported. It is not a business timeout.
/// - `channel_capacity`: capacity of every stage-to-stage channel. The
///   default of 1 keeps the chain close to a rendezvous, so a slow cache
///   stalls device reads instead of queueing.
///
/// # Examples
///
/// ```rust
/// use jsgamepad::controller::ControllerSettings;
///
/// let settings = ControllerSettings {
///     read_timeout_ms: 20,
///     ..Default::default()
/// };
/// assert_eq!(settings.channel_capacity, 1);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub read_timeout_ms: u64,
    pub channel_capacity: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: 50,
            channel_capacity: 1,
        }
    }
}

impl ControllerSettings {
    /// Per-read deadline, never shorter than a millisecond
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

/// Errors surfaced by the controller handle itself
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// A stage task panicked or was aborted
    #[error("Controller task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Handle for the running controller pipeline
///
/// # Threading Model
///
/// Spawns three tokio tasks:
/// 1. **Source**: deadline-bounded device reads and record decoding
/// 2. **Adapter**: raw code mapping and D-pad latching
/// 3. **Cache**: last value per control and change notification
///
/// # Resource Management
///
/// All stages share one [`CancellationToken`]. Cancelling it stops every
/// stage within one read deadline; each stage awaits its upstream before
/// finishing, so [`ControllerHandle::join`] returns only after the device
/// has been released.
#[derive(Debug)]
pub struct ControllerHandle {
    cache: GamepadStateCache,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ControllerHandle {
    /// Spawns the complete pipeline on `device`
    ///
    /// Returns the handle together with the error channel. The error
    /// channel carries idle read deadlines, malformed records, unknown
    /// events and the fatal read failure. It must be drained for as long
    /// as the pipeline runs, otherwise the stages block once it fills up.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use jsgamepad::controller::{ButtonId, ControllerHandle, JoystickDevice};
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let device = JoystickDevice::open("/dev/input/js0")?;
    /// let (handle, mut errors) = ControllerHandle::spawn(device, None, CancellationToken::new());
    /// let mut changed = handle.subscribe();
    ///
    /// loop {
    ///     tokio::select! {
    ///         res = changed.changed() => {
    ///             if res.is_err() { break; }
    ///             println!("cross: {:?}", handle.cache().value(ButtonId::Cross).await);
    ///         }
    ///         Some(err) = errors.recv() => eprintln!("{err}"),
    ///     }
    /// }
    /// handle.join().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawn(
        device: impl DeviceReader + 'static,
        settings: Option<ControllerSettings>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<AdapterError>) {
        let settings = settings.unwrap_or_default();
        info!(
            "Initializing controller pipeline with settings: {:?}",
            settings
        );

        let source = SourceHandle::spawn(device, Some(settings.clone()), cancel.clone());
        info!("Device event source spawned");

        let adapter = AdapterHandle::spawn(source, settings.channel_capacity, cancel.clone());
        let (events, errors, adapter_task) = adapter.into_parts();
        info!("Gamepad adapter spawned");

        let (cache, task) = GamepadStateCache::spawn(events, Some(adapter_task), cancel.clone());
        info!("Gamepad state cache spawned");

        (
            Self {
                cache,
                task,
                cancel,
            },
            errors,
        )
    }

    pub fn cache(&self) -> &GamepadStateCache {
        &self.cache
    }

    /// Subscribe to "state changed" notifications
    pub fn subscribe(&self) -> watch::Receiver<()> {
        debug!("New subscriber to gamepad state");
        self.cache.subscribe()
    }

    /// Request cooperative shutdown of all stages
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until every stage has finished and the device is released
    pub async fn join(self) -> Result<(), ControllerError> {
        self.task.await?;
        info!("Controller pipeline stopped");
        Ok(())
    }
}
