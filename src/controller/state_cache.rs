//! Gamepad state cache
//!
//! Keeps the most recent value of every control seen on the semantic event
//! stream. A single task owns the writes; any number of callers read
//! through cheap clones of [`GamepadStateCache`].
//!
//! Change notification is a `watch` channel carrying `()`. However many
//! events arrive between two checks, a subscriber sees one pending change,
//! so consumers always re-read the current state instead of counting
//! notifications.

use chrono::Local;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event_adapter::{ButtonId, SemanticEvent};

/// Last value per control plus the last event seen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GamepadState {
    last_event: Option<SemanticEvent>,
    values: HashMap<ButtonId, i32>,
}

impl GamepadState {
    pub fn apply(&mut self, event: SemanticEvent) {
        self.last_event = Some(event);
        self.values.insert(event.button, event.value);
    }

    pub fn last_event(&self) -> Option<SemanticEvent> {
        self.last_event
    }

    /// `None` if the control was never observed
    pub fn value(&self, button: ButtonId) -> Option<i32> {
        self.values.get(&button).copied()
    }

    pub fn values(&self) -> impl Iterator<Item = (ButtonId, i32)> + '_ {
        self.values.iter().map(|(button, value)| (*button, *value))
    }
}

/// Read side of the cache
#[derive(Debug, Clone)]
pub struct GamepadStateCache {
    state: Arc<RwLock<GamepadState>>,
    changed: watch::Receiver<()>,
}

impl GamepadStateCache {
    /// Spawn the aggregation task.
    ///
    /// `upstream` is the task producing `events`; it is awaited when the
    /// cache stops so the whole chain is torn down before the returned
    /// handle completes.
    pub fn spawn(
        events: mpsc::Receiver<SemanticEvent>,
        upstream: Option<JoinHandle<()>>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let state = Arc::new(RwLock::new(GamepadState::default()));
        let (changed_sender, changed) = watch::channel(());

        let task = tokio::spawn(run_cache_loop(
            state.clone(),
            events,
            upstream,
            changed_sender,
            cancel,
        ));
        debug!("Gamepad state cache task spawned");

        (Self { state, changed }, task)
    }

    pub async fn last_event(&self) -> Option<SemanticEvent> {
        self.state.read().await.last_event()
    }

    pub async fn value(&self, button: ButtonId) -> Option<i32> {
        self.state.read().await.value(button)
    }

    pub async fn is_pressed(&self, button: ButtonId) -> bool {
        self.value(button).await.is_some_and(|value| value > 0)
    }

    /// Consistent copy of the whole state
    pub async fn snapshot(&self) -> GamepadState {
        self.state.read().await.clone()
    }

    /// New change subscription; errors on `changed()` once the cache stopped
    pub fn subscribe(&self) -> watch::Receiver<()> {
        let mut receiver = self.changed.clone();
        receiver.mark_unchanged();
        receiver
    }
}

async fn run_cache_loop(
    state: Arc<RwLock<GamepadState>>,
    mut events: mpsc::Receiver<SemanticEvent>,
    upstream: Option<JoinHandle<()>>,
    changed: watch::Sender<()>,
    cancel: CancellationToken,
) {
    info!("Starting gamepad state cache loop");

    let mut event_count = 0u64;
    let mut last_log_time = Local::now();
    let log_interval = chrono::Duration::seconds(10);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Cancellation observed, stopping gamepad state cache");
                break;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    info!("Gamepad event stream ended");
                    break;
                }
            },
        };

        state.write().await.apply(event);

        // Coalesces with any change the subscribers have not looked at yet
        changed.send_replace(());
        event_count += 1;

        let now = Local::now();
        if now - last_log_time > log_interval {
            info!(
                "State cache stats: {} updates in last {} seconds",
                event_count,
                log_interval.num_seconds()
            );
            event_count = 0;
            last_log_time = now;
        }
    }

    drop(changed);
    drop(events);
    if let Some(upstream) = upstream {
        if let Err(e) = upstream.await {
            warn!("Gamepad adapter task failed: {}", e);
        }
    }
    info!("Gamepad state cache finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_millis(500);

    async fn wait_for_value(cache: &GamepadStateCache, button: ButtonId, value: i32) {
        timeout(WAIT, async {
            while cache.value(button).await != Some(value) {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("cache never reached expected value");
    }

    #[test]
    fn state_distinguishes_zero_from_unseen() {
        let mut state = GamepadState::default();
        assert_eq!(state.value(ButtonId::Cross), None);
        state.apply(SemanticEvent::new(1, ButtonId::Cross, 0));
        assert_eq!(state.value(ButtonId::Cross), Some(0));
        assert_eq!(state.values().count(), 1);
    }

    #[tokio::test]
    async fn keeps_only_latest_value() {
        let (sender, events) = mpsc::channel(1);
        let (cache, _task) = GamepadStateCache::spawn(events, None, CancellationToken::new());
        assert_eq!(cache.last_event().await, None);

        for (ts, value) in [(1, 100), (2, -200), (3, 300)] {
            sender
                .send(SemanticEvent::new(ts, ButtonId::L3Horizontal, value))
                .await
                .unwrap();
        }
        wait_for_value(&cache, ButtonId::L3Horizontal, 300).await;

        assert_eq!(
            cache.last_event().await,
            Some(SemanticEvent::new(3, ButtonId::L3Horizontal, 300))
        );
        assert_eq!(cache.value(ButtonId::R3Horizontal).await, None);
    }

    #[tokio::test]
    async fn bursts_coalesce_into_one_notification() {
        let (sender, events) = mpsc::channel(1);
        let (cache, _task) = GamepadStateCache::spawn(events, None, CancellationToken::new());
        let mut changed = cache.subscribe();
        assert!(!changed.has_changed().unwrap());

        for value in 0..10 {
            sender
                .send(SemanticEvent::new(value as u32, ButtonId::R2Force, value))
                .await
                .unwrap();
        }
        wait_for_value(&cache, ButtonId::R2Force, 9).await;

        assert!(changed.has_changed().unwrap());
        timeout(WAIT, changed.changed()).await.unwrap().unwrap();
        assert!(!changed.has_changed().unwrap());
    }

    #[tokio::test]
    async fn pressed_reflects_last_digital_value() {
        let (sender, events) = mpsc::channel(1);
        let (cache, _task) = GamepadStateCache::spawn(events, None, CancellationToken::new());

        sender
            .send(SemanticEvent::new(1, ButtonId::DPadUp, 1))
            .await
            .unwrap();
        wait_for_value(&cache, ButtonId::DPadUp, 1).await;
        assert!(cache.is_pressed(ButtonId::DPadUp).await);

        sender
            .send(SemanticEvent::new(2, ButtonId::DPadUp, 0))
            .await
            .unwrap();
        wait_for_value(&cache, ButtonId::DPadUp, 0).await;
        assert!(!cache.is_pressed(ButtonId::DPadUp).await);
        assert!(!cache.is_pressed(ButtonId::DPadDown).await);
    }

    #[tokio::test]
    async fn closes_notification_when_stream_ends() {
        let (sender, events) = mpsc::channel(1);
        let upstream = tokio::spawn(async {});
        let (cache, task) =
            GamepadStateCache::spawn(events, Some(upstream), CancellationToken::new());
        let mut changed = cache.subscribe();

        sender
            .send(SemanticEvent::new(1, ButtonId::Share, 1))
            .await
            .unwrap();
        drop(sender);

        timeout(WAIT, task).await.unwrap().unwrap();
        // A pending change is still delivered before the closed channel is reported
        while changed.changed().await.is_ok() {}
        assert_eq!(cache.value(ButtonId::Share).await, Some(1));
    }

    #[tokio::test]
    async fn cancellation_stops_consuming() {
        let (sender, events) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let (cache, task) = GamepadStateCache::spawn(events, None, cancel.clone());

        cancel.cancel();
        timeout(WAIT, task).await.unwrap().unwrap();

        assert!(sender
            .send(SemanticEvent::new(1, ButtonId::L1, 1))
            .await
            .is_err());
        assert_eq!(cache.snapshot().await, GamepadState::default());
        assert!(cache.subscribe().changed().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_see_consistent_values() {
        let (sender, events) = mpsc::channel(1);
        let (cache, _task) = GamepadStateCache::spawn(events, None, CancellationToken::new());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        if let Some(value) = cache.value(ButtonId::L3Vertical).await {
                            assert!((0..50).contains(&value));
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for value in 0..50 {
            sender
                .send(SemanticEvent::new(value as u32, ButtonId::L3Vertical, value))
                .await
                .unwrap();
        }

        for reader in readers {
            reader.await.unwrap();
        }
        wait_for_value(&cache, ButtonId::L3Vertical, 49).await;
    }
}
