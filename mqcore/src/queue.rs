//! Acknowledgment gate.
//!
//! Admission control keyed by packet id: at most one pending [`Ack`] per id and direction.
//! Each direction also keeps a FIFO of admitted items; releasing an id pops the head of that
//! FIFO and remembers it as the last released item.
//!
//! Per id the only transitions are `Free -> Pending` (`create_ack`, `push`) and
//! `Pending -> Free` (`release`, `remove_ack`, `cancel`). Any other attempt fails without side
//! effects.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use mqcore_utils::{format_timestamp_millis, timestamp_millis, TimestampMillis};

use crate::types::{HashMap, PacketId};

/// Pending marker for one packet id.
pub struct Ack {
    id: PacketId,
    create_time: TimestampMillis,
    released: AtomicBool,
    notify: Notify,
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ack {{ id: {}, create_time: {}, released: {} }}",
            self.id,
            format_timestamp_millis(self.create_time),
            self.is_released()
        )
    }
}

impl Ack {
    #[inline]
    fn new(id: PacketId) -> Self {
        Self { id, create_time: timestamp_millis(), released: AtomicBool::new(false), notify: Notify::new() }
    }

    #[inline]
    pub fn id(&self) -> PacketId {
        self.id
    }

    #[inline]
    pub fn create_time(&self) -> TimestampMillis {
        self.create_time
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Resolves once the gate has gone back to free for this id.
    pub async fn released(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_released() {
                return;
            }
            notified.await;
        }
    }

    /// Like [`Ack::released`], returns `false` if `timeout` elapsed first.
    pub async fn released_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.released()).await.is_ok()
    }

    #[inline]
    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

struct Gate<T> {
    acks: HashMap<PacketId, Arc<Ack>>,
    //items with the id they were admitted under
    queue: VecDeque<(PacketId, T)>,
    last_released: Option<T>,
}

/// One direction of the gate.
pub struct AckQueue<T> {
    cap: usize,
    inner: Mutex<Gate<T>>,
}

impl<T> AckQueue<T> {
    /// `cap` bounds the FIFO, `0` means unbounded.
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: Mutex::new(Gate { acks: HashMap::default(), queue: VecDeque::new(), last_released: None }),
        }
    }

    #[inline]
    pub fn create_ack(&self, id: PacketId) -> bool {
        let mut gate = self.inner.lock();
        if gate.acks.contains_key(&id) {
            false
        } else {
            gate.acks.insert(id, Arc::new(Ack::new(id)));
            true
        }
    }

    #[inline]
    pub fn has_ack(&self, id: PacketId) -> bool {
        self.inner.lock().acks.contains_key(&id)
    }

    #[inline]
    pub fn get_ack(&self, id: PacketId) -> Option<Arc<Ack>> {
        self.inner.lock().acks.get(&id).cloned()
    }

    #[inline]
    pub fn remove_ack(&self, id: PacketId) -> bool {
        if let Some(ack) = self.inner.lock().acks.remove(&id) {
            ack.release();
            true
        } else {
            false
        }
    }

    /// Admits `item` under `id` unless an ack is already pending for `id` or the queue is full,
    /// in which case the item is handed back.
    pub fn push(&self, id: PacketId, item: T) -> Result<(), T> {
        let mut gate = self.inner.lock();
        if gate.acks.contains_key(&id) {
            log::debug!("ack is pending for packet id {}, refusing a second item", id);
            return Err(item);
        }
        if self.cap > 0 && gate.queue.len() >= self.cap {
            log::warn!("ack queue is full, queue len is {}", gate.queue.len());
            return Err(item);
        }
        gate.acks.insert(id, Arc::new(Ack::new(id)));
        gate.queue.push_back((id, item));
        Ok(())
    }

    /// Withdraws a [`AckQueue::push`] of `id`: the ack goes back to free and the item admitted
    /// under `id` leaves the queue without becoming the last released one. If a release already
    /// popped that item, the newest queued item is dropped instead so the queue length matches.
    pub fn cancel(&self, id: PacketId) -> Option<T> {
        let mut gate = self.inner.lock();
        let ack = gate.acks.remove(&id)?;
        let item = match gate.queue.iter().rposition(|(qid, _)| *qid == id) {
            Some(pos) => gate.queue.remove(pos),
            None => gate.queue.pop_back(),
        };
        ack.release();
        item.map(|(_, item)| item)
    }

    /// Clears the pending ack for `id` and pops the queue head into the last released slot.
    pub fn release(&self, id: PacketId) -> bool {
        let mut gate = self.inner.lock();
        match gate.acks.remove(&id) {
            Some(ack) => {
                if let Some((_, head)) = gate.queue.pop_front() {
                    gate.last_released = Some(head);
                }
                ack.release();
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.inner.lock().acks.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Releases every pending ack and drops all queued items.
    pub fn clear(&self) {
        let mut gate = self.inner.lock();
        for (_, ack) in gate.acks.drain() {
            ack.release();
        }
        gate.queue.clear();
    }
}

impl<T: Clone> AckQueue<T> {
    #[inline]
    pub fn last_released(&self) -> Option<T> {
        self.inner.lock().last_released.clone()
    }
}

/// Inbound and outbound gates of one connection.
pub struct MessageQueue<T> {
    inbound: AckQueue<T>,
    outbound: AckQueue<T>,
}

impl<T> MessageQueue<T> {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { inbound: AckQueue::new(cap), outbound: AckQueue::new(cap) }
    }

    #[inline]
    pub fn inbound(&self) -> &AckQueue<T> {
        &self.inbound
    }

    #[inline]
    pub fn outbound(&self) -> &AckQueue<T> {
        &self.outbound
    }

    #[inline]
    pub fn create_in_ack(&self, id: PacketId) -> bool {
        self.inbound.create_ack(id)
    }

    #[inline]
    pub fn create_out_ack(&self, id: PacketId) -> bool {
        self.outbound.create_ack(id)
    }

    #[inline]
    pub fn has_in_ack(&self, id: PacketId) -> bool {
        self.inbound.has_ack(id)
    }

    #[inline]
    pub fn has_out_ack(&self, id: PacketId) -> bool {
        self.outbound.has_ack(id)
    }

    #[inline]
    pub fn get_in_ack(&self, id: PacketId) -> Option<Arc<Ack>> {
        self.inbound.get_ack(id)
    }

    #[inline]
    pub fn get_out_ack(&self, id: PacketId) -> Option<Arc<Ack>> {
        self.outbound.get_ack(id)
    }

    #[inline]
    pub fn remove_in_ack(&self, id: PacketId) -> bool {
        self.inbound.remove_ack(id)
    }

    #[inline]
    pub fn remove_out_ack(&self, id: PacketId) -> bool {
        self.outbound.remove_ack(id)
    }

    #[inline]
    pub fn push_in(&self, id: PacketId, item: T) -> Result<(), T> {
        self.inbound.push(id, item)
    }

    #[inline]
    pub fn push_out(&self, id: PacketId, item: T) -> Result<(), T> {
        self.outbound.push(id, item)
    }

    #[inline]
    pub fn cancel_in(&self, id: PacketId) -> Option<T> {
        self.inbound.cancel(id)
    }

    #[inline]
    pub fn release_in(&self, id: PacketId) -> bool {
        self.inbound.release(id)
    }

    #[inline]
    pub fn release_out(&self, id: PacketId) -> bool {
        self.outbound.release(id)
    }

    #[inline]
    pub fn clear(&self) {
        self.inbound.clear();
        self.outbound.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn single_flight_per_id() {
        let q: MessageQueue<u32> = MessageQueue::new(0);
        assert!(q.create_out_ack(5));
        assert!(!q.create_out_ack(5));
        assert!(q.has_out_ack(5));
        assert!(!q.has_in_ack(5));
        assert!(q.create_in_ack(5));

        assert!(q.release_out(5));
        assert!(!q.has_out_ack(5));
        assert!(q.get_out_ack(5).is_none());
        assert!(!q.release_out(5));

        assert!(q.remove_in_ack(5));
        assert!(!q.remove_in_ack(5));
    }

    #[test]
    fn push_refuses_pending_id() {
        let q: AckQueue<&str> = AckQueue::new(0);
        assert_eq!(q.push(1, "a"), Ok(()));
        assert_eq!(q.push(1, "b"), Err("b"));
        assert_eq!(q.push(2, "c"), Ok(()));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pending(), 2);

        assert!(q.release(1));
        assert_eq!(q.last_released(), Some("a"));
        assert_eq!(q.push(1, "d"), Ok(()));

        assert!(q.release(2));
        assert_eq!(q.last_released(), Some("c"));
        assert!(q.release(1));
        assert_eq!(q.last_released(), Some("d"));
        assert!(q.is_empty());
        assert!(!q.release(1));
    }

    #[test]
    fn push_respects_capacity() {
        let q: AckQueue<u8> = AckQueue::new(2);
        assert!(q.push(1, 1).is_ok());
        assert!(q.push(2, 2).is_ok());
        assert_eq!(q.push(3, 3), Err(3));
        assert!(!q.has_ack(3));
        assert!(q.release(1));
        assert!(q.push(3, 3).is_ok());
        assert_eq!(q.capacity(), 2);
    }

    #[test]
    fn cancel_withdraws_a_push() {
        let q: AckQueue<&str> = AckQueue::new(2);
        assert!(q.push(1, "a").is_ok());
        assert!(q.push(2, "b").is_ok());
        let ack = q.get_ack(2).unwrap();

        assert_eq!(q.cancel(2), Some("b"));
        assert!(ack.is_released());
        assert!(!q.has_ack(2));
        assert_eq!(q.len(), 1);
        assert_eq!(q.last_released(), None);
        assert_eq!(q.cancel(2), None);

        //the freed slot is usable again and FIFO order is kept
        assert!(q.push(3, "c").is_ok());
        assert!(q.release(3));
        assert_eq!(q.last_released(), Some("a"));
        assert_eq!(q.cancel(1), Some("c"));
        assert!(q.is_empty());
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn clear_releases_everything() {
        let q: AckQueue<u8> = AckQueue::new(0);
        q.push(1, 1).unwrap();
        let ack = q.get_ack(1).unwrap();
        assert_eq!(ack.id(), 1);
        assert!(ack.create_time() > 0);
        q.clear();
        assert!(ack.is_released());
        assert!(q.is_empty());
        assert_eq!(q.pending(), 0);
    }

    #[tokio::test]
    async fn await_release() {
        let q: Arc<MessageQueue<u8>> = Arc::new(MessageQueue::new(0));
        assert!(q.create_out_ack(7));
        let ack = q.get_out_ack(7).unwrap();
        assert!(!ack.is_released());
        assert!(!ack.released_timeout(Duration::from_millis(20)).await);

        let q1 = q.clone();
        let waiter = tokio::spawn(async move {
            ack.released().await;
            ack.is_released()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(q1.release_out(7));
        assert!(waiter.await.unwrap());

        let ack = q.get_out_ack(7);
        assert!(ack.is_none());
    }
}
