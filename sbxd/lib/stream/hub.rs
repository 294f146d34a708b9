use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use sbxapi::ExecEvent;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::DEFAULT_STREAM_BUFFER;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Capacity of each subscriber's delivery channel. A subscriber that lags
/// further than this has events dropped; the ring still retains them for
/// fresh subscribers.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 128;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The stream hub: one bounded event ring plus a live subscriber set per
/// sandbox, and a hub-global monotonic sequence counter.
///
/// Lock layering: the hub lock guards the buffer map and the sequence
/// counter; each buffer's lock guards its ring and subscriber set. The hub
/// lock nests inside a buffer lock (for seq assignment at publish time),
/// never the other way around.
pub struct StreamHub {
    inner: Mutex<HubInner>,
    limit: usize,
}

struct HubInner {
    buffers: HashMap<String, Arc<StreamBuffer>>,
    seq: i64,
}

struct StreamBuffer {
    limit: usize,
    inner: Mutex<BufferInner>,
}

#[derive(Default)]
struct BufferInner {
    events: VecDeque<ExecEvent>,
    subs: HashMap<u64, mpsc::Sender<ExecEvent>>,
    next_sub_id: u64,
}

/// A live subscription to one sandbox's events.
///
/// `snapshot` holds the ring contents at subscription time; `rx` delivers
/// every event published afterwards. The two may overlap at the boundary;
/// consumers deduplicate by `seq`. Channel closure is the only termination
/// signal.
pub struct Subscription {
    /// Identifies the subscriber for [`StreamHub::unsubscribe`].
    pub id: u64,

    /// Ring contents at subscription time, oldest first.
    pub snapshot: Vec<ExecEvent>,

    /// Live delivery channel.
    pub rx: mpsc::Receiver<ExecEvent>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StreamHub {
    /// Creates a hub whose per-sandbox rings hold `limit` events. A zero
    /// limit falls back to the default.
    pub fn new(limit: usize) -> Self {
        let limit = if limit == 0 { DEFAULT_STREAM_BUFFER } else { limit };
        Self {
            inner: Mutex::new(HubInner {
                buffers: HashMap::new(),
                seq: 0,
            }),
            limit,
        }
    }

    /// Assigns the next hub-global sequence number.
    pub fn next_seq(&self) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        inner.seq
    }

    /// Publishes an event: assigns its `seq`, appends it to the sandbox ring
    /// (evicting the oldest event on overflow), and delivers it to every
    /// live subscriber. Delivery is non-blocking best-effort; a full
    /// subscriber channel drops the event for that subscriber only.
    pub fn publish(&self, mut evt: ExecEvent) {
        let buf = self.buffer_for(&evt.sandbox_id);
        let mut inner = buf.inner.lock().unwrap();
        evt.seq = self.next_seq();
        if inner.events.len() >= buf.limit {
            inner.events.pop_front();
        }
        inner.events.push_back(evt.clone());
        inner.subs.retain(|_, tx| match tx.try_send(evt.clone()) {
            Result::Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Registers a subscriber and atomically snapshots the ring, so that no
    /// event is observable in the snapshot without also reaching the live
    /// channel beyond it.
    pub fn subscribe(&self, sandbox_id: &str) -> Subscription {
        let buf = self.buffer_for(sandbox_id);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut inner = buf.inner.lock().unwrap();
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner.subs.insert(id, tx);
        let snapshot = inner.events.iter().cloned().collect();
        Subscription { id, snapshot, rx }
    }

    /// Removes a subscriber; dropping its sender closes the channel, which
    /// is the reader's termination signal.
    pub fn unsubscribe(&self, sandbox_id: &str, id: u64) {
        let buf = self.buffer_for(sandbox_id);
        buf.inner.lock().unwrap().subs.remove(&id);
    }

    /// The configured per-sandbox ring size.
    pub fn limit(&self) -> usize {
        self.limit
    }

    fn buffer_for(&self, sandbox_id: &str) -> Arc<StreamBuffer> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .buffers
            .entry(sandbox_id.to_string())
            .or_insert_with(|| {
                Arc::new(StreamBuffer {
                    limit: self.limit,
                    inner: Mutex::new(BufferInner::default()),
                })
            })
            .clone()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
