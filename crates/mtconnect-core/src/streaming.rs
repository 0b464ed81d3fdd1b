//! Long-poll streaming sessions over the observation buffer.
//!
//! Each session runs as one spawned task that repeatedly samples the buffer
//! from its cursor and pushes frames into a bounded channel:
//!
//! ```text
//! Connected -> Streaming -> (HeartbeatWait <-> Streaming) -> Closed
//! ```
//!
//! The task holds the buffer lock only inside `sample`. While idle it waits on
//! the buffer's sequence watch, the heartbeat deadline, and cancellation, so a
//! stalled consumer never blocks ingestion. If the consumer lags so far that
//! its cursor is evicted, the session emits a terminal fault and closes.

use crate::buffer::{BufferError, ObservationBuffer, ObservationFilter};
use crate::observation::Observation;
use crate::query::{QueryError, QueryParams, DEFAULT_COUNT, DEFAULT_HEARTBEAT};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Frames buffered between the session task and its consumer.
const FRAME_CHANNEL_CAPACITY: usize = 16;

/// Parameters of a streaming session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Starting sequence (default: first retained sequence)
    pub from: Option<u64>,
    /// Maximum observations per frame
    pub count: usize,
    /// Idle interval before a heartbeat frame
    pub heartbeat: Duration,
    /// Minimum delay between frames
    pub interval: Option<Duration>,
    /// Device / data item restriction
    pub filter: ObservationFilter,
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self {
            from: None,
            count: DEFAULT_COUNT,
            heartbeat: DEFAULT_HEARTBEAT,
            interval: None,
            filter: ObservationFilter::all(),
        }
    }
}

impl TryFrom<&QueryParams> for StreamRequest {
    type Error = QueryError;

    fn try_from(params: &QueryParams) -> Result<Self, Self::Error> {
        if params.at.is_some() {
            return Err(QueryError::Conflict("at", "stream"));
        }
        Ok(Self {
            from: params.from,
            count: params.count,
            heartbeat: params.heartbeat,
            interval: params.interval,
            filter: params.filter.clone(),
        })
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Start sequence validated, task not yet running
    Connected,
    /// Sampling the buffer or delivering a frame
    Streaming,
    /// Idle, waiting for new observations or the heartbeat deadline
    HeartbeatWait,
    /// Terminal
    Closed,
}

/// A unit of stream output.
#[derive(Debug, Clone)]
pub enum Frame {
    /// New observations in increasing sequence order
    Observations {
        /// Delivered observations
        observations: Vec<Arc<Observation>>,
        /// Cursor after this frame
        next_sequence: u64,
    },
    /// Keep-alive sent after an idle heartbeat interval
    Heartbeat {
        /// Unchanged cursor
        next_sequence: u64,
    },
}

/// Terminal stream fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The cursor was evicted before the consumer caught up
    #[error("stream fell behind the buffer: {0}")]
    Lagged(#[from] BufferError),
}

/// Handle to a running streaming session.
///
/// Dropping the handle cancels the session.
#[derive(Debug)]
pub struct StreamSession {
    frames: mpsc::Receiver<Result<Frame, StreamError>>,
    state: watch::Receiver<StreamState>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StreamSession {
    /// Validate the start sequence and spawn the session task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Buffer`] if `from` is outside the buffer window,
    /// or a parameter error for a zero `count` or `heartbeat`. The session is
    /// then closed without having started.
    pub fn open(buffer: Arc<ObservationBuffer>, request: StreamRequest) -> Result<Self, QueryError> {
        if request.count == 0 {
            return Err(QueryError::ZeroCount);
        }
        if request.heartbeat.is_zero() {
            return Err(QueryError::ZeroHeartbeat);
        }

        let window = buffer.window();
        let from = request.from.unwrap_or(window.first);
        if from < window.first || from > window.next() {
            tracing::debug!(from, first = window.first, last = window.last, "Rejected stream start");
            return Err(BufferError::SequenceOutOfRange {
                requested: from,
                first: window.first,
                last: window.last,
            }
            .into());
        }

        let (frame_tx, frames) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (state_tx, state) = watch::channel(StreamState::Connected);
        let (cancel, cancel_rx) = oneshot::channel();

        let task = tokio::spawn(run_session(
            buffer, request, from, frame_tx, state_tx, cancel_rx,
        ));

        Ok(Self {
            frames,
            state,
            cancel: Some(cancel),
            task: Some(task),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    /// Next frame, or `None` once the session is closed and drained.
    pub async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>> {
        self.frames.recv().await
    }

    /// Cancel the session and wait for its task to finish.
    ///
    /// No frame is produced after this returns.
    pub async fn close(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.frames.close();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "Stream task ended abnormally");
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

enum Wake {
    Data,
    Heartbeat,
    Cancelled,
}

async fn run_session(
    buffer: Arc<ObservationBuffer>,
    request: StreamRequest,
    mut cursor: u64,
    frames: mpsc::Sender<Result<Frame, StreamError>>,
    state: watch::Sender<StreamState>,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut sequences = buffer.subscribe();
    let mut last_frame_at = Instant::now();
    state.send_replace(StreamState::Streaming);
    tracing::debug!(cursor, "Stream session started");

    loop {
        // Mark seen before sampling so an insert racing the sample still wakes us.
        sequences.borrow_and_update();

        let sample = match buffer.sample(cursor, request.count, None, &request.filter) {
            Ok(sample) => sample,
            Err(err) => {
                tracing::warn!(error = %err, cursor, "Stream cursor left the buffer window");
                tokio::select! {
                    biased;
                    _ = &mut cancel => {}
                    _ = frames.send(Err(err.into())) => {}
                }
                break;
            }
        };

        let caught_up = sample.next_sequence >= sample.window.next();
        cursor = sample.next_sequence;

        if !sample.observations.is_empty() {
            let frame = Frame::Observations {
                observations: sample.observations,
                next_sequence: cursor,
            };
            tokio::select! {
                biased;
                _ = &mut cancel => break,
                sent = frames.send(Ok(frame)) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
            last_frame_at = Instant::now();

            if let Some(interval) = request.interval {
                tokio::select! {
                    biased;
                    _ = &mut cancel => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            continue;
        }

        if !caught_up {
            // Filtered out everything in this batch; keep scanning.
            continue;
        }

        state.send_replace(StreamState::HeartbeatWait);
        let wake = tokio::select! {
            biased;
            _ = &mut cancel => Wake::Cancelled,
            () = frames.closed() => Wake::Cancelled,
            changed = sequences.changed() => {
                if changed.is_ok() { Wake::Data } else { Wake::Cancelled }
            }
            () = tokio::time::sleep_until(last_frame_at + request.heartbeat) => Wake::Heartbeat,
        };
        state.send_replace(StreamState::Streaming);

        match wake {
            Wake::Data => {}
            Wake::Cancelled => break,
            Wake::Heartbeat => {
                let frame = Frame::Heartbeat {
                    next_sequence: cursor,
                };
                tokio::select! {
                    biased;
                    _ = &mut cancel => break,
                    sent = frames.send(Ok(frame)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
                last_frame_at = Instant::now();
            }
        }
    }

    state.send_replace(StreamState::Closed);
    tracing::debug!(cursor, "Stream session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::DataItemCategory;

    fn obs(device: &str, value: u64) -> Observation {
        Observation::new(device, "xpos", DataItemCategory::Sample, "POSITION")
            .with_result(value.to_string())
    }

    fn request(from: Option<u64>, count: usize, heartbeat_ms: u64) -> StreamRequest {
        StreamRequest {
            from,
            count,
            heartbeat: Duration::from_millis(heartbeat_ms),
            ..StreamRequest::default()
        }
    }

    #[tokio::test]
    async fn invalid_start_is_rejected() {
        let buffer = Arc::new(ObservationBuffer::new(2).unwrap());
        for i in 0..5 {
            buffer.insert(obs("d", i));
        }

        let err = StreamSession::open(Arc::clone(&buffer), request(Some(1), 10, 100)).unwrap_err();
        assert_eq!(
            err,
            QueryError::Buffer(BufferError::SequenceOutOfRange {
                requested: 1,
                first: 4,
                last: 5,
            })
        );

        assert!(StreamSession::open(Arc::clone(&buffer), request(Some(7), 10, 100)).is_err());
        assert_eq!(
            StreamSession::open(buffer, request(None, 0, 100)).unwrap_err(),
            QueryError::ZeroCount
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_emits_heartbeats() {
        let buffer = Arc::new(ObservationBuffer::new(8).unwrap());
        let mut session = StreamSession::open(buffer, request(None, 10, 250)).unwrap();

        for _ in 0..2 {
            match session.next_frame().await {
                Some(Ok(Frame::Heartbeat { next_sequence })) => assert_eq!(next_sequence, 1),
                other => panic!("expected heartbeat, got {other:?}"),
            }
        }
        assert_ne!(session.state(), StreamState::Closed);

        let mut state = session.watch_state();
        session.close().await;
        assert_eq!(*state.borrow_and_update(), StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_every_insert_exactly_once_in_order() {
        const M: u64 = 250;
        let buffer = Arc::new(ObservationBuffer::new(1024).unwrap());
        buffer.insert(obs("d", 0));
        let from = buffer.window().first;

        let mut session = StreamSession::open(Arc::clone(&buffer), request(Some(from), 7, 50)).unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                for i in 1..=M {
                    buffer.insert(obs("d", i));
                    if i % 40 == 0 {
                        // Long enough for the session to go idle and beat.
                        tokio::time::sleep(Duration::from_millis(120)).await;
                    } else if i % 5 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let mut delivered = Vec::new();
        let mut heartbeats = 0;
        let mut cursor = from;
        while delivered.len() < usize::try_from(M + 1).unwrap() {
            match session.next_frame().await.expect("session closed early") {
                Ok(Frame::Observations {
                    observations,
                    next_sequence,
                }) => {
                    assert!(observations.len() <= 7);
                    assert!(observations[0].sequence >= cursor);
                    delivered.extend(observations.iter().map(|o| o.sequence));
                    cursor = next_sequence;
                }
                Ok(Frame::Heartbeat { next_sequence }) => {
                    assert_eq!(next_sequence, cursor);
                    heartbeats += 1;
                }
                Err(err) => panic!("unexpected fault: {err}"),
            }
        }
        producer.await.unwrap();

        assert_eq!(delivered, (from..=from + M).collect::<Vec<_>>());
        assert!(heartbeats > 0);

        let mut state = session.watch_state();
        session.close().await;
        assert_eq!(*state.borrow_and_update(), StreamState::Closed);
        buffer.insert(obs("d", 999));
    }

    #[tokio::test]
    async fn lagging_consumer_gets_terminal_fault() {
        let buffer = Arc::new(ObservationBuffer::new(2).unwrap());
        buffer.insert(obs("d", 1));
        buffer.insert(obs("d", 2));

        let mut session = StreamSession::open(Arc::clone(&buffer), request(Some(1), 1, 10_000)).unwrap();

        for expected in [1, 2] {
            match session.next_frame().await {
                Some(Ok(Frame::Observations { observations, .. })) => {
                    assert_eq!(observations[0].sequence, expected);
                }
                other => panic!("expected observations, got {other:?}"),
            }
        }

        for i in 3..=7 {
            buffer.insert(obs("d", i));
        }

        match session.next_frame().await {
            Some(Err(StreamError::Lagged(BufferError::SequenceOutOfRange { requested, .. }))) => {
                assert_eq!(requested, 3);
            }
            other => panic!("expected lag fault, got {other:?}"),
        }
        assert!(session.next_frame().await.is_none());
        assert_eq!(session.state(), StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn filtered_stream_only_delivers_matching_device() {
        let buffer = Arc::new(ObservationBuffer::new(64).unwrap());
        let mut req = request(None, 10, 1_000);
        req.filter = ObservationFilter::device("mill");
        let mut session = StreamSession::open(Arc::clone(&buffer), req).unwrap();

        buffer.insert(obs("lathe", 1));
        buffer.insert(obs("mill", 2));
        buffer.insert(obs("lathe", 3));

        match session.next_frame().await {
            Some(Ok(Frame::Observations {
                observations,
                next_sequence,
            })) => {
                assert_eq!(observations.len(), 1);
                assert_eq!(observations[0].device_uuid, "mill");
                assert_eq!(observations[0].sequence, 2);
                assert!(next_sequence >= 3);
            }
            other => panic!("expected observations, got {other:?}"),
        }

        session.close().await;
    }

    #[test]
    fn request_from_params_rejects_at() {
        let params = QueryParams::parse([("at", "5")]).unwrap();
        assert_eq!(
            StreamRequest::try_from(&params).unwrap_err(),
            QueryError::Conflict("at", "stream")
        );

        let params = QueryParams::parse([("from", "5"), ("heartbeat", "500")]).unwrap();
        let request = StreamRequest::try_from(&params).unwrap();
        assert_eq!(request.from, Some(5));
        assert_eq!(request.heartbeat, Duration::from_millis(500));
    }

    #[test]
    fn dropping_session_stops_task() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let buffer = Arc::new(ObservationBuffer::new(4).unwrap());
        let state = runtime.block_on(async {
            let session = StreamSession::open(Arc::clone(&buffer), request(None, 10, 60_000)).unwrap();
            let mut state = session.watch_state();
            drop(session);
            while *state.borrow_and_update() != StreamState::Closed {
                if state.changed().await.is_err() {
                    break;
                }
            }
            let closed = *state.borrow();
            closed
        });

        assert_eq!(state, StreamState::Closed);
    }

    #[test]
    fn open_and_close_with_block_on() {
        let buffer = Arc::new(ObservationBuffer::new(4).unwrap());
        buffer.insert(obs("d", 1));

        tokio_test::block_on(async {
            let mut session = StreamSession::open(buffer, request(None, 10, 1_000)).unwrap();
            let frame = session.next_frame().await;
            assert!(matches!(frame, Some(Ok(Frame::Observations { .. }))));
            session.close().await;
        });
    }
}
