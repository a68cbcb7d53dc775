use chrono::Local;
use statum::{machine, state};
use std::fmt::Debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::controller_handle::ControllerSettings;
use super::record::{DecodeError, RawEvent, RECORD_LEN};
use super::{deliver, Delivery};

/// Readable device handle polled by the source.
///
/// Any async byte stream qualifies: a [`JoystickDevice`] for `/dev/input/jsX`,
/// or an in-memory pipe for synthetic input. The reader must be
/// cancel-safe: dropping a pending read may not leave work running behind
/// it, which rules out `tokio::fs::File`.
///
/// [`JoystickDevice`]: super::device::JoystickDevice
pub trait DeviceReader: AsyncRead + Unpin + Send + Debug {}

impl<T> DeviceReader for T where T: AsyncRead + Unpin + Send + Debug {}

// Source errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to decode record: {0}")]
    Decode(#[from] DecodeError),

    #[error("No record within read deadline of {0:?}")]
    ReadDeadlineExceeded(Duration),

    #[error("Failed to read from device: {0}")]
    ReadFailure(#[source] std::io::Error),
}

impl SourceError {
    /// Fatal errors terminate the source; everything else is reported and skipped
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::ReadFailure(_))
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SourceState {
    Idle,
    Polling,
}

#[machine]
#[derive(Debug)]
pub struct DeviceEventSource<S: SourceState> {
    // Owned device, dropped exactly once when the machine is consumed
    device: Box<dyn DeviceReader>,

    settings: ControllerSettings,

    // Bytes still owed by a record that arrived short
    resync: usize,

    event_sender: mpsc::Sender<RawEvent>,
    error_sender: mpsc::Sender<SourceError>,

    cancel: CancellationToken,
}

// Result of a single poll iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Record,
    Idle,
    Dropped,
    Stop,
}

impl<S: SourceState> DeviceEventSource<S> {
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }
}

impl DeviceEventSource<Idle> {
    pub fn create(
        device: impl DeviceReader + 'static,
        settings: Option<ControllerSettings>,
        event_sender: mpsc::Sender<RawEvent>,
        error_sender: mpsc::Sender<SourceError>,
        cancel: CancellationToken,
    ) -> Self {
        let settings = settings.unwrap_or_default();
        debug!("Creating device event source with settings: {:?}", settings);
        Self::new(
            Box::new(device),
            settings,
            0,
            event_sender,
            error_sender,
            cancel,
        )
    }

    pub fn start(self) -> DeviceEventSource<Polling> {
        info!(
            "Device event source ready, polling with {}ms read deadline",
            self.settings.read_timeout_ms
        );
        self.transition()
    }
}

impl DeviceEventSource<Polling> {
    /// Poll the device until cancellation, a fatal read error, end of
    /// stream, or until the downstream stage goes away.
    pub async fn run(mut self) {
        let mut buf = [0u8; RECORD_LEN];

        // For performance monitoring
        let mut record_count = 0u64;
        let mut dropped_count = 0u64;
        let mut last_log_time = Local::now();
        let log_interval = chrono::Duration::seconds(10);

        loop {
            if self.cancel.is_cancelled() {
                info!("Cancellation observed, stopping device poll loop");
                break;
            }

            match self.poll_once(&mut buf).await {
                Step::Record => record_count += 1,
                Step::Dropped => dropped_count += 1,
                Step::Idle => {}
                Step::Stop => break,
            }

            let now = Local::now();
            if now - last_log_time > log_interval {
                info!(
                    "Device source stats: {} records, {} dropped in last {} seconds",
                    record_count,
                    dropped_count,
                    log_interval.num_seconds()
                );
                record_count = 0;
                dropped_count = 0;
                last_log_time = now;
            }
        }

        info!("Releasing device");
        drop(self);
    }

    async fn poll_once(&mut self, buf: &mut [u8; RECORD_LEN]) -> Step {
        let read_timeout = self.settings.read_timeout();
        let want = if self.resync > 0 {
            self.resync
        } else {
            RECORD_LEN
        };

        // The deadline only exists to keep the read interruptible
        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Step::Stop,
            read = timeout(read_timeout, self.device.read(&mut buf[..want])) => read,
        };

        match read {
            Ok(Ok(len)) if len > 0 && self.resync > 0 => {
                self.resync -= len;
                trace!("Discarded {} trailing bytes, {} still owed", len, self.resync);
                Step::Idle
            }
            Err(_) => {
                trace!("No record within {:?}", read_timeout);
                self.report(SourceError::ReadDeadlineExceeded(read_timeout))
                    .await
                    .unwrap_or(Step::Idle)
            }
            Ok(Ok(0)) => {
                info!("Device reached end of stream");
                Step::Stop
            }
            Ok(Ok(len)) => match RawEvent::decode(&buf[..len]) {
                Ok(event) => {
                    debug!("Decoded record: {}", event);
                    match deliver(&self.cancel, &self.event_sender, event).await {
                        Delivery::Sent => Step::Record,
                        Delivery::Cancelled => Step::Stop,
                        Delivery::Closed => {
                            debug!("Event receiver dropped, stopping device poll loop");
                            Step::Stop
                        }
                    }
                }
                Err(e) => {
                    warn!("Dropping malformed record: {}", e);
                    // Skip the rest of the split record so framing recovers
                    self.resync = RECORD_LEN - len;
                    self.report(e.into()).await.unwrap_or(Step::Dropped)
                }
            },
            Ok(Err(e)) => {
                error!("Device read failed: {}", e);
                let _ = self.report(SourceError::ReadFailure(e)).await;
                Step::Stop
            }
        }
    }

    // Returns Some(Step::Stop) if cancellation interrupted the report
    async fn report(&mut self, err: SourceError) -> Option<Step> {
        match deliver(&self.cancel, &self.error_sender, err).await {
            Delivery::Cancelled => Some(Step::Stop),
            Delivery::Sent | Delivery::Closed => None,
        }
    }
}

/// Running source task together with its output channels
#[derive(Debug)]
pub struct SourceHandle {
    events: mpsc::Receiver<RawEvent>,
    errors: mpsc::Receiver<SourceError>,
    task: JoinHandle<()>,
}

impl SourceHandle {
    /// Create a source for `device` and spawn its poll loop as a tokio task
    pub fn spawn(
        device: impl DeviceReader + 'static,
        settings: Option<ControllerSettings>,
        cancel: CancellationToken,
    ) -> Self {
        let settings = settings.unwrap_or_default();
        let capacity = settings.channel_capacity.max(1);
        let (event_sender, events) = mpsc::channel(capacity);
        let (error_sender, errors) = mpsc::channel(capacity);

        let source =
            DeviceEventSource::create(device, Some(settings), event_sender, error_sender, cancel);

        let task = tokio::spawn(async move {
            source.start().run().await;
            info!("Device event source finished");
        });
        debug!("Device event source task spawned");

        Self {
            events,
            errors,
            task,
        }
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<RawEvent>,
        mpsc::Receiver<SourceError>,
        JoinHandle<()>,
    ) {
        (self.events, self.errors, self.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::record::{TYPE_AXIS, TYPE_BUTTON};
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadBuf};

    const WAIT: Duration = Duration::from_millis(500);

    fn fast_settings() -> Option<ControllerSettings> {
        Some(ControllerSettings {
            read_timeout_ms: 20,
            channel_capacity: 4,
        })
    }

    async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> Option<T> {
        timeout(WAIT, rx.recv()).await.expect("receive timed out")
    }

    // Drain errors until something other than an idle deadline shows up
    async fn next_real_error(rx: &mut mpsc::Receiver<SourceError>) -> Option<SourceError> {
        loop {
            match recv(rx).await {
                Some(SourceError::ReadDeadlineExceeded(_)) => continue,
                other => return other,
            }
        }
    }

    #[derive(Debug)]
    struct BrokenDevice;

    impl AsyncRead for BrokenDevice {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "device unplugged")))
        }
    }

    #[derive(Debug)]
    struct CountedDevice {
        inner: DuplexStream,
        drops: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountedDevice {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl Drop for CountedDevice {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn emits_decoded_records() {
        let (device, mut writer) = duplex(64);
        let cancel = CancellationToken::new();
        let (mut events, mut errors, task) =
            SourceHandle::spawn(device, fast_settings(), cancel.clone()).into_parts();

        let pressed = RawEvent::new(1200, 1, TYPE_BUTTON, 2);
        let moved = RawEvent::new(1210, -300, TYPE_AXIS, 0);
        writer.write_all(&pressed.to_bytes()).await.unwrap();
        assert_eq!(recv(&mut events).await, Some(pressed));
        writer.write_all(&moved.to_bytes()).await.unwrap();
        assert_eq!(recv(&mut events).await, Some(moved));

        cancel.cancel();
        while recv(&mut errors).await.is_some() {}
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reports_idle_deadline_without_stopping() {
        let (device, mut writer) = duplex(64);
        let cancel = CancellationToken::new();
        let (mut events, mut errors, task) =
            SourceHandle::spawn(device, fast_settings(), cancel.clone()).into_parts();

        match recv(&mut errors).await {
            Some(SourceError::ReadDeadlineExceeded(d)) => {
                assert_eq!(d, Duration::from_millis(20))
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let event = RawEvent::new(5, 0, TYPE_BUTTON, 0);
        writer.write_all(&event.to_bytes()).await.unwrap();
        assert_eq!(recv(&mut events).await, Some(event));

        cancel.cancel();
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn split_record_is_reported_and_framing_recovers() {
        let (device, mut writer) = duplex(64);
        let cancel = CancellationToken::new();
        let (mut events, mut errors, task) =
            SourceHandle::spawn(device, fast_settings(), cancel.clone()).into_parts();

        let split = RawEvent::new(6, 1, TYPE_BUTTON, 8).to_bytes();
        writer.write_all(&split[..3]).await.unwrap();
        match next_real_error(&mut errors).await {
            Some(SourceError::Decode(DecodeError::BufferLength { len })) => assert_eq!(len, 3),
            other => panic!("unexpected error: {other:?}"),
        }

        // Tail of the broken record arrives together with a whole one
        let event = RawEvent::new(7, 1, TYPE_BUTTON, 9);
        writer.write_all(&split[3..]).await.unwrap();
        writer.write_all(&event.to_bytes()).await.unwrap();
        assert_eq!(recv(&mut events).await, Some(event));

        let next = RawEvent::new(8, -5, TYPE_AXIS, 1);
        writer.write_all(&next.to_bytes()).await.unwrap();
        assert_eq!(recv(&mut events).await, Some(next));

        cancel.cancel();
        while let Some(err) = recv(&mut errors).await {
            assert!(matches!(err, SourceError::ReadDeadlineExceeded(_)));
        }
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_failure_is_fatal() {
        let cancel = CancellationToken::new();
        let (mut events, mut errors, task) =
            SourceHandle::spawn(BrokenDevice, fast_settings(), cancel).into_parts();

        let err = recv(&mut errors).await.expect("read failure expected");
        assert!(err.is_fatal());
        assert!(matches!(err, SourceError::ReadFailure(_)));

        // Both channels close once the task ends
        assert!(recv(&mut errors).await.is_none());
        assert!(recv(&mut events).await.is_none());
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn end_of_stream_closes_channels() {
        let (device, writer) = duplex(64);
        drop(writer);
        let (mut events, mut errors, task) =
            SourceHandle::spawn(device, fast_settings(), CancellationToken::new()).into_parts();

        assert!(recv(&mut events).await.is_none());
        assert!(recv(&mut errors).await.is_none());
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_releases_device_once() {
        let (inner, _writer) = duplex(64);
        let drops = Arc::new(AtomicUsize::new(0));
        let device = CountedDevice {
            inner,
            drops: drops.clone(),
        };
        let cancel = CancellationToken::new();
        let (mut events, mut errors, task) =
            SourceHandle::spawn(device, fast_settings(), cancel.clone()).into_parts();

        // Let the loop spin through at least one idle deadline
        assert!(matches!(
            recv(&mut errors).await,
            Some(SourceError::ReadDeadlineExceeded(_))
        ));

        cancel.cancel();
        timeout(Duration::from_millis(100), task)
            .await
            .expect("source did not stop within a poll interval")
            .unwrap();

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(events.recv().await.is_none());
        while let Some(err) = errors.recv().await {
            // Only reports queued before cancellation may remain
            assert!(!err.is_fatal());
        }
    }
}
