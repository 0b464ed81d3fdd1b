//! Fixed-capacity, sequence-ordered observation buffer.
//!
//! Every inserted observation receives the next sequence number. Once the
//! buffer holds `capacity` observations, each insert evicts the oldest one, so
//! the stored sequences always form one contiguous window
//! `[first, last]` with `last - first + 1 == len <= capacity`.
//!
//! All state sits behind a single mutex that is held only for the in-memory
//! operation. Readers receive `Arc` snapshots and never borrow the backing
//! container.

use crate::observation::Observation;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Default number of observations retained.
pub const DEFAULT_BUFFER_CAPACITY: usize = 131_072;

/// Upper bound on the up-front allocation for the backing deque.
const MAX_PREALLOCATION: usize = 16_384;

/// `(device_uuid, data_item_id)`
type DataItemKey = (String, String);

/// The range of sequence numbers currently held by the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceWindow {
    /// Oldest retained sequence
    pub first: u64,
    /// Newest assigned sequence (`first - 1` while the buffer is empty)
    pub last: u64,
}

impl SequenceWindow {
    /// Number of sequences in the window.
    #[must_use]
    pub fn len(&self) -> u64 {
        (self.last + 1).saturating_sub(self.first)
    }

    /// Whether the window holds no sequences.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sequence the next insert will receive.
    #[must_use]
    pub fn next(&self) -> u64 {
        self.last + 1
    }

    /// Whether `sequence` is retained.
    #[must_use]
    pub fn contains(&self, sequence: u64) -> bool {
        sequence >= self.first && sequence <= self.last
    }
}

/// Restricts which observations a query returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservationFilter {
    /// Only observations of this device
    pub device_uuid: Option<String>,
    /// Only observations of these data items
    pub data_item_ids: Option<HashSet<String>>,
}

impl ObservationFilter {
    /// A filter that matches everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only observations of `device_uuid`.
    #[must_use]
    pub fn device(device_uuid: impl Into<String>) -> Self {
        Self {
            device_uuid: Some(device_uuid.into()),
            data_item_ids: None,
        }
    }

    /// Additionally restrict to the given data item ids.
    #[must_use]
    pub fn with_data_items<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data_item_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Whether `observation` passes the filter.
    #[must_use]
    pub fn matches(&self, observation: &Observation) -> bool {
        if let Some(device_uuid) = &self.device_uuid {
            if observation.device_uuid != *device_uuid {
                return false;
            }
        }
        self.data_item_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&observation.data_item_id))
    }
}

/// Result of a snapshot query.
#[derive(Debug, Clone)]
pub struct Current {
    /// Latest observation per data item, ordered by sequence
    pub observations: Vec<Arc<Observation>>,
    /// Buffer window at the time of the query
    pub window: SequenceWindow,
}

/// Result of a range query.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Matching observations in strictly increasing sequence order
    pub observations: Vec<Arc<Observation>>,
    /// Sequence to resume from
    pub next_sequence: u64,
    /// Buffer window at the time of the query
    pub window: SequenceWindow,
}

/// Errors returned by buffer queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The requested sequence has been evicted or not yet assigned
    #[error("sequence {requested} is outside the buffer window [{first}, {last}]")]
    SequenceOutOfRange {
        /// Requested sequence
        requested: u64,
        /// First retained sequence
        first: u64,
        /// Last assigned sequence
        last: u64,
    },
    /// `to` precedes `from`
    #[error("invalid range: to ({to}) is before from ({from})")]
    InvalidRange {
        /// Start of the range
        from: u64,
        /// End of the range
        to: u64,
    },
    /// A buffer must hold at least one observation
    #[error("buffer capacity must be greater than zero")]
    ZeroCapacity,
}

#[derive(Debug)]
struct BufferState {
    observations: VecDeque<Arc<Observation>>,
    first_sequence: u64,
    next_sequence: u64,
    /// Latest observation per data item, including evicted ones
    current: HashMap<DataItemKey, Arc<Observation>>,
    /// Latest evicted observation per data item
    checkpoint: HashMap<DataItemKey, Arc<Observation>>,
}

impl BufferState {
    fn window(&self) -> SequenceWindow {
        SequenceWindow {
            first: self.first_sequence,
            last: self.next_sequence - 1,
        }
    }
}

fn key_of(observation: &Observation) -> DataItemKey {
    (
        observation.device_uuid.clone(),
        observation.data_item_id.clone(),
    )
}

/// Sequence-ordered ring buffer of observations.
#[derive(Debug)]
pub struct ObservationBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
    last_sequence: watch::Sender<u64>,
}

impl Default for ObservationBuffer {
    fn default() -> Self {
        Self::build(DEFAULT_BUFFER_CAPACITY)
    }
}

impl ObservationBuffer {
    /// Create a buffer holding at most `capacity` observations.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::ZeroCapacity`] if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        Ok(Self::build(capacity))
    }

    fn build(capacity: usize) -> Self {
        let (last_sequence, _) = watch::channel(0);
        Self {
            capacity,
            state: Mutex::new(BufferState {
                observations: VecDeque::with_capacity(capacity.min(MAX_PREALLOCATION)),
                first_sequence: 1,
                next_sequence: 1,
                current: HashMap::new(),
                checkpoint: HashMap::new(),
            }),
            last_sequence,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Maximum number of retained observations.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of retained observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().observations.len()
    }

    /// Whether nothing has been retained yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current sequence window.
    #[must_use]
    pub fn window(&self) -> SequenceWindow {
        self.lock().window()
    }

    /// Watch the last assigned sequence. The value changes after every insert.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.last_sequence.subscribe()
    }

    /// Store an observation and return the sequence assigned to it.
    ///
    /// Never fails: when the buffer is full the oldest observation is evicted.
    pub fn insert(&self, mut observation: Observation) -> u64 {
        let mut state = self.lock();

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        observation.sequence = sequence;

        let observation = Arc::new(observation);
        state
            .current
            .insert(key_of(&observation), Arc::clone(&observation));
        state.observations.push_back(observation);

        if state.observations.len() > self.capacity {
            if let Some(evicted) = state.observations.pop_front() {
                state.first_sequence = evicted.sequence + 1;
                state.checkpoint.insert(key_of(&evicted), evicted);
            }
        }

        // Published under the lock so watchers see sequences in order.
        self.last_sequence.send_replace(sequence);
        sequence
    }

    /// Latest observation per data item.
    ///
    /// Without `at`, every data item ever inserted is reported with its most
    /// recent value. With `at`, the snapshot reflects the buffer as of that
    /// sequence.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::SequenceOutOfRange`] if `at` is not retained.
    pub fn current(
        &self,
        filter: &ObservationFilter,
        at: Option<u64>,
    ) -> Result<Current, BufferError> {
        let state = self.lock();
        let window = state.window();

        let mut observations: Vec<Arc<Observation>> = match at {
            None => state
                .current
                .values()
                .filter(|obs| filter.matches(obs))
                .cloned()
                .collect(),
            Some(at) => {
                if !window.contains(at) {
                    return Err(BufferError::SequenceOutOfRange {
                        requested: at,
                        first: window.first,
                        last: window.last,
                    });
                }

                let retained = state.observations.iter().take_while(|obs| obs.sequence <= at);
                let mut latest: HashMap<(&str, &str), &Arc<Observation>> = HashMap::new();
                for obs in state.checkpoint.values().chain(retained) {
                    if filter.matches(obs) {
                        latest.insert((obs.device_uuid.as_str(), obs.data_item_id.as_str()), obs);
                    }
                }
                latest.into_values().cloned().collect()
            }
        };
        drop(state);

        observations.sort_by_key(|obs| obs.sequence);
        Ok(Current {
            observations,
            window,
        })
    }

    /// Up to `count` matching observations starting at sequence `from`.
    ///
    /// Stops early at `to` (inclusive) when given. `next_sequence` is one past
    /// the last sequence examined, so an unfiltered query resumes right after
    /// the last observation returned. Querying `from == window.next()` is a
    /// caught-up read and returns nothing with `next_sequence == from`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::SequenceOutOfRange`] if `from` was evicted or lies
    /// beyond the next sequence to be assigned, and
    /// [`BufferError::InvalidRange`] if `to < from`.
    pub fn sample(
        &self,
        from: u64,
        count: usize,
        to: Option<u64>,
        filter: &ObservationFilter,
    ) -> Result<Sample, BufferError> {
        if let Some(to) = to {
            if to < from {
                return Err(BufferError::InvalidRange { from, to });
            }
        }

        let state = self.lock();
        let window = state.window();

        if from < window.first || from > window.next() {
            return Err(BufferError::SequenceOutOfRange {
                requested: from,
                first: window.first,
                last: window.last,
            });
        }

        let start = usize::try_from(from - window.first).unwrap_or(usize::MAX);
        let mut observations = Vec::with_capacity(count.min(state.observations.len() - start));
        let mut next_sequence = from;

        for obs in state.observations.range(start..) {
            if observations.len() >= count || to.is_some_and(|to| obs.sequence > to) {
                break;
            }
            next_sequence = obs.sequence + 1;
            if filter.matches(obs) {
                observations.push(Arc::clone(obs));
            }
        }

        Ok(Sample {
            observations,
            next_sequence,
            window,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::DataItemCategory;

    fn obs(device: &str, id: &str, value: &str) -> Observation {
        Observation::new(device, id, DataItemCategory::Sample, "POSITION").with_result(value)
    }

    fn sequences(observations: &[Arc<Observation>]) -> Vec<u64> {
        observations.iter().map(|o| o.sequence).collect()
    }

    #[test]
    fn zero_capacity_rejected() {
        assert_eq!(
            ObservationBuffer::new(0).unwrap_err(),
            BufferError::ZeroCapacity
        );
    }

    #[test]
    fn empty_buffer_window() {
        let buffer = ObservationBuffer::new(4).unwrap();
        let window = buffer.window();

        assert_eq!(window.first, 1);
        assert_eq!(window.last, 0);
        assert!(window.is_empty());
        assert_eq!(window.next(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn sequences_are_assigned_and_caller_value_ignored() {
        let buffer = ObservationBuffer::new(10).unwrap();

        let mut first = obs("d", "x", "1");
        first.sequence = 999;

        assert_eq!(buffer.insert(first), 1);
        assert_eq!(buffer.insert(obs("d", "x", "2")), 2);
        assert_eq!(buffer.insert(obs("d", "y", "3")), 3);
    }

    #[test]
    fn capacity_three_keeps_newest() {
        let buffer = ObservationBuffer::new(3).unwrap();
        for i in 1..=4 {
            buffer.insert(obs("d", "x", &i.to_string()));
        }

        let window = buffer.window();
        assert_eq!(window.first, 2);
        assert_eq!(window.last, 4);
        assert_eq!(buffer.len(), 3);

        let sample = buffer
            .sample(2, 10, None, &ObservationFilter::all())
            .unwrap();
        assert_eq!(sequences(&sample.observations), vec![2, 3, 4]);
        assert_eq!(sample.next_sequence, 5);
    }

    #[test]
    fn stored_count_is_min_of_inserts_and_capacity() {
        for capacity in [1_usize, 2, 5, 16] {
            for inserts in [0_u64, 1, 4, 5, 6, 40] {
                let buffer = ObservationBuffer::new(capacity).unwrap();
                for i in 0..inserts {
                    buffer.insert(obs("d", "x", &i.to_string()));
                }

                let expected = inserts.min(capacity as u64);
                let window = buffer.window();
                assert_eq!(buffer.len() as u64, expected);
                assert_eq!(window.len(), expected);
                assert_eq!(window.last, inserts);
            }
        }
    }

    #[test]
    fn sample_from_first_is_gapless() {
        let buffer = ObservationBuffer::new(8).unwrap();
        for i in 0..20 {
            buffer.insert(obs("d", "x", &i.to_string()));
        }
        let first = buffer.window().first;

        for k in [1_usize, 3, 8, 50] {
            let sample = buffer
                .sample(first, k, None, &ObservationFilter::all())
                .unwrap();
            let seqs = sequences(&sample.observations);

            assert_eq!(seqs.len(), k.min(8));
            assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
            assert_eq!(seqs[0], first);
            assert_eq!(sample.next_sequence, seqs[seqs.len() - 1] + 1);
        }
    }

    #[test]
    fn sample_below_window_faults() {
        let buffer = ObservationBuffer::new(3).unwrap();
        for i in 0..10 {
            buffer.insert(obs("d", "x", &i.to_string()));
        }

        let err = buffer
            .sample(7, 100, None, &ObservationFilter::all())
            .unwrap_err();
        assert_eq!(
            err,
            BufferError::SequenceOutOfRange {
                requested: 7,
                first: 8,
                last: 10,
            }
        );
    }

    #[test]
    fn sample_beyond_next_faults_but_caught_up_is_empty() {
        let buffer = ObservationBuffer::new(3).unwrap();
        buffer.insert(obs("d", "x", "1"));

        let caught_up = buffer
            .sample(2, 10, None, &ObservationFilter::all())
            .unwrap();
        assert!(caught_up.observations.is_empty());
        assert_eq!(caught_up.next_sequence, 2);

        assert!(matches!(
            buffer.sample(3, 10, None, &ObservationFilter::all()),
            Err(BufferError::SequenceOutOfRange { requested: 3, .. })
        ));
    }

    #[test]
    fn empty_buffer_sample_returns_first() {
        let buffer = ObservationBuffer::new(3).unwrap();
        let sample = buffer
            .sample(1, 10, None, &ObservationFilter::all())
            .unwrap();

        assert!(sample.observations.is_empty());
        assert_eq!(sample.next_sequence, buffer.window().first);
    }

    #[test]
    fn sample_respects_to_and_rejects_inverted_range() {
        let buffer = ObservationBuffer::new(10).unwrap();
        for i in 0..6 {
            buffer.insert(obs("d", "x", &i.to_string()));
        }

        let sample = buffer
            .sample(2, 100, Some(4), &ObservationFilter::all())
            .unwrap();
        assert_eq!(sequences(&sample.observations), vec![2, 3, 4]);
        assert_eq!(sample.next_sequence, 5);

        assert_eq!(
            buffer
                .sample(4, 10, Some(2), &ObservationFilter::all())
                .unwrap_err(),
            BufferError::InvalidRange { from: 4, to: 2 }
        );
    }

    #[test]
    fn filtered_sample_skips_past_non_matching() {
        let buffer = ObservationBuffer::new(10).unwrap();
        buffer.insert(obs("a", "x", "1"));
        buffer.insert(obs("b", "x", "2"));
        buffer.insert(obs("b", "x", "3"));
        buffer.insert(obs("a", "y", "4"));

        let sample = buffer
            .sample(1, 10, None, &ObservationFilter::device("a"))
            .unwrap();
        assert_eq!(sequences(&sample.observations), vec![1, 4]);
        assert_eq!(sample.next_sequence, 5);

        let filter = ObservationFilter::device("a").with_data_items(["y"]);
        let sample = buffer.sample(1, 10, None, &filter).unwrap();
        assert_eq!(sequences(&sample.observations), vec![4]);
    }

    #[test]
    fn current_reports_latest_per_data_item() {
        let buffer = ObservationBuffer::new(2).unwrap();
        buffer.insert(obs("d", "x", "1"));
        buffer.insert(obs("d", "y", "2"));
        buffer.insert(obs("d", "x", "3"));
        buffer.insert(obs("d", "x", "4"));

        // y was evicted from the window but is still current.
        let current = buffer.current(&ObservationFilter::all(), None).unwrap();
        let values: Vec<_> = current
            .observations
            .iter()
            .map(|o| (o.data_item_id.as_str(), o.result().unwrap_or_default()))
            .collect();
        assert_eq!(values, vec![("y", "2"), ("x", "4")]);
    }

    #[test]
    fn current_at_uses_evicted_checkpoint() {
        let buffer = ObservationBuffer::new(3).unwrap();
        buffer.insert(obs("d", "x", "1")); // 1
        buffer.insert(obs("d", "y", "2")); // 2
        buffer.insert(obs("d", "x", "3")); // 3
        buffer.insert(obs("d", "x", "4")); // 4, evicts 1
        buffer.insert(obs("d", "y", "5")); // 5, evicts 2

        let current = buffer.current(&ObservationFilter::all(), Some(4)).unwrap();
        assert_eq!(sequences(&current.observations), vec![2, 4]);

        let current = buffer.current(&ObservationFilter::all(), Some(3)).unwrap();
        assert_eq!(sequences(&current.observations), vec![2, 3]);

        assert!(matches!(
            buffer.current(&ObservationFilter::all(), Some(2)),
            Err(BufferError::SequenceOutOfRange { requested: 2, .. })
        ));
        assert!(buffer.current(&ObservationFilter::all(), Some(6)).is_err());
    }

    #[test]
    fn watchers_see_last_sequence() {
        let buffer = ObservationBuffer::new(3).unwrap();
        let mut rx = buffer.subscribe();

        buffer.insert(obs("d", "x", "1"));
        buffer.insert(obs("d", "x", "2"));

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 2);
    }

    #[test]
    fn concurrent_inserts_leave_no_gaps() {
        let buffer = ObservationBuffer::new(10_000).unwrap();

        std::thread::scope(|scope| {
            for t in 0..4 {
                let buffer = &buffer;
                scope.spawn(move || {
                    for i in 0..500 {
                        buffer.insert(obs("d", &format!("t{t}"), &i.to_string()));
                    }
                });
            }
        });

        let sample = buffer
            .sample(1, 10_000, None, &ObservationFilter::all())
            .unwrap();
        let seqs = sequences(&sample.observations);
        assert_eq!(seqs, (1..=2000).collect::<Vec<_>>());
    }
}
