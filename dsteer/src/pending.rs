// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Coalescing of duplicate in-flight requests. The first arrival for a
//! fingerprint becomes the producer and goes upstream; later arrivals wait
//! on a rendezvous and receive a clone of the producer's result. At most one
//! upstream exchange happens per fingerprint at any time.

use crate::upstream::qhandle::QHandleError;
use bytes::Bytes;
use domain::base::Message;
use log::debug;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::watch;

/// The outcome shared between the producer and its waiters.
pub type SharedAnswer = Result<Message<Bytes>, Arc<QHandleError>>;

// Fingerprint plus the source network, so clients steered to different
// upstreams never share answers.
type Key = (Bytes, String);

type Slot = watch::Receiver<Option<SharedAnswer>>;

/// The at-most-one-in-flight gate keyed by request fingerprint and source
/// network.
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<Key, Slot>>>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    /// Create an empty gate.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Either become the producer for the key or a waiter on the existing
    /// in-flight request.
    pub fn acquire(&self, fingerprint: Bytes, network: String) -> Ticket {
        let key = (fingerprint, network);
        let mut map = self.inner.lock().unwrap();
        if let Some(rx) = map.get(&key) {
            debug!("duplicate in-flight request, waiting on the first one");
            return Ticket::Waiter(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        map.insert(key.clone(), rx);
        Ticket::Producer(Producer {
            map: self.inner.clone(),
            key,
            tx: Some(tx),
        })
    }
}

/// The role an arrival was assigned by the gate.
pub enum Ticket {
    /// First arrival: must go upstream and complete the rendezvous.
    Producer(Producer),
    /// Later arrival: waits for the producer's result.
    Waiter(Slot),
}

/// The producing side of a rendezvous. Dropping it without completing wakes
/// the waiters with a failure, so a dying producer never strands them.
pub struct Producer {
    map: Arc<Mutex<HashMap<Key, Slot>>>,
    key: Key,
    tx: Option<watch::Sender<Option<SharedAnswer>>>,
}

impl Producer {
    /// Deliver the result to every waiter and retire the rendezvous. The
    /// next arrival for the same fingerprint starts from scratch.
    pub fn complete(mut self, answer: SharedAnswer) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(answer));
        }
        self.map.lock().unwrap().remove(&self.key);
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        // Completing removed the entry already; this handles early exits.
        if self.tx.is_some() {
            self.map.lock().unwrap().remove(&self.key);
        }
    }
}

/// Wait for the producer's result. `None` means the producer went away
/// without delivering one.
pub async fn wait(mut slot: Slot) -> Option<SharedAnswer> {
    loop {
        if let Some(answer) = slot.borrow().clone() {
            return Some(answer);
        }
        if slot.changed().await.is_err() {
            // Producer dropped; a final value may still have been left.
            return slot.borrow().clone();
        }
    }
}
