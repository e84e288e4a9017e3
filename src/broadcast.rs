use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    },
    time::Duration,
};

use tracing::debug;

use crate::clock_state::ClockState;

pub type SubscriberId = u64;

/// The receiving end of one subscriber's channel.
///
/// Dropping it closes the channel; anything sent afterwards is discarded.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: Receiver<ClockState>,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<ClockState, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<ClockState, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Open subscriber channels keyed by connection id.
#[derive(Debug, Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    channels: Mutex<HashMap<SubscriberId, Sender<ClockState>>>,
}

impl Subscribers {
    /// Registers a new channel. `initial` is queued before the channel becomes
    /// visible to `broadcast`, so it is always the first message received.
    #[must_use]
    pub fn subscribe(&self, initial: Option<ClockState>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel();
        if let Some(state) = initial {
            let _ = sender.send(state);
        }
        self.channels().insert(id, sender);
        Subscription { id, receiver }
    }

    /// Returns whether the id was still registered.
    pub fn remove(&self, id: SubscriberId) -> bool {
        self.channels().remove(&id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels().is_empty()
    }

    /// Sends `state` to every channel registered at the time of the call and
    /// returns how many accepted it. Closed channels are dropped from the set;
    /// they never stop delivery to the others.
    pub fn broadcast(&self, state: &ClockState) -> usize {
        let snapshot: Vec<(SubscriberId, Sender<ClockState>)> = self
            .channels()
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in snapshot {
            if sender.send(*state).is_ok() {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }
        if !closed.is_empty() {
            let mut channels = self.channels();
            for id in closed {
                debug!(subscriber = id, "dropping closed subscriber channel");
                channels.remove(&id);
            }
        }
        delivered
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<SubscriberId, Sender<ClockState>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
