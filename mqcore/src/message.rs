//! In-flight message ledgers.
//!
//! Each client owns an inbound and an outbound ledger. A ledger maps the UUID of a stored packet
//! to the packet and to the sequence number it was inserted with; sequence numbers are assigned
//! under the ledger lock, so `get_all_out` returns packets in real insertion order, which is the
//! order they must be redelivered in after a reconnect.
//!
//! Locking is two-level: the client directory is a sharded `DashMap`, every ledger has its own
//! mutex. Operations on different clients never serialize on the same ledger lock.

use std::sync::Arc;

use itertools::Itertools;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::packet_id::MessageIdStore;
use crate::types::{ClientId, DashMap, HashMap, Packet};

struct Ledger<P> {
    packets: HashMap<Uuid, P>,
    seqs: HashMap<Uuid, u64>,
    next_seq: u64,
}

impl<P> Default for Ledger<P> {
    fn default() -> Self {
        Self { packets: HashMap::default(), seqs: HashMap::default(), next_seq: 0 }
    }
}

impl<P: Packet> Ledger<P> {
    #[inline]
    fn add(&mut self, p: P) -> bool {
        let uuid = p.uuid();
        if self.packets.contains_key(&uuid) {
            log::debug!("duplicate uuid {} in ledger, ignored", uuid);
            return false;
        }
        self.next_seq += 1;
        self.seqs.insert(uuid, self.next_seq);
        self.packets.insert(uuid, p);
        true
    }

    #[inline]
    fn remove(&mut self, uuid: &Uuid) -> Option<P> {
        let p = self.packets.remove(uuid)?;
        self.seqs.remove(uuid);
        Some(p)
    }

    #[inline]
    fn get(&self, uuid: &Uuid) -> Option<P> {
        self.packets.get(uuid).cloned()
    }

    fn all(&self) -> Vec<P> {
        self.seqs
            .iter()
            .sorted_unstable_by_key(|(_, seq)| **seq)
            .filter_map(|(uuid, _)| self.packets.get(uuid).cloned())
            .collect()
    }

    #[inline]
    fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    fn clear(&mut self) {
        self.packets.clear();
        self.seqs.clear();
    }
}

/// Both directions of one client, with their identifier tables.
pub struct ClientLedger<P> {
    inbound: Mutex<Ledger<P>>,
    outbound: Mutex<Ledger<P>>,
    in_ids: Arc<MessageIdStore>,
    out_ids: Arc<MessageIdStore>,
}

impl<P> Default for ClientLedger<P> {
    fn default() -> Self {
        Self {
            inbound: Mutex::new(Ledger::default()),
            outbound: Mutex::new(Ledger::default()),
            in_ids: Arc::new(MessageIdStore::new()),
            out_ids: Arc::new(MessageIdStore::new()),
        }
    }
}

impl<P: Packet> ClientLedger<P> {
    #[inline]
    pub fn add_inbound(&self, p: P) -> bool {
        self.inbound.lock().add(p)
    }

    #[inline]
    pub fn add_outbound(&self, p: P) -> bool {
        self.outbound.lock().add(p)
    }

    #[inline]
    pub fn delete_in(&self, uuid: &Uuid) -> Option<P> {
        self.inbound.lock().remove(uuid)
    }

    #[inline]
    pub fn delete_out(&self, uuid: &Uuid) -> Option<P> {
        self.outbound.lock().remove(uuid)
    }

    #[inline]
    pub fn get_inbound(&self, uuid: &Uuid) -> Option<P> {
        self.inbound.lock().get(uuid)
    }

    #[inline]
    pub fn get_outbound(&self, uuid: &Uuid) -> Option<P> {
        self.outbound.lock().get(uuid)
    }

    #[inline]
    pub fn get_all_in(&self) -> Vec<P> {
        self.inbound.lock().all()
    }

    #[inline]
    pub fn get_all_out(&self) -> Vec<P> {
        self.outbound.lock().all()
    }

    #[inline]
    pub fn len_in(&self) -> usize {
        self.inbound.lock().len()
    }

    #[inline]
    pub fn len_out(&self) -> usize {
        self.outbound.lock().len()
    }

    #[inline]
    pub fn in_ids(&self) -> Arc<MessageIdStore> {
        self.in_ids.clone()
    }

    #[inline]
    pub fn out_ids(&self) -> Arc<MessageIdStore> {
        self.out_ids.clone()
    }

    #[inline]
    fn clear(&self) {
        self.inbound.lock().clear();
        self.outbound.lock().clear();
        self.in_ids.clear();
        self.out_ids.clear();
    }
}

/// Ledgers of every connected client.
pub struct MessageStorage<P> {
    clients: DashMap<ClientId, Arc<ClientLedger<P>>>,
}

impl<P: Packet> Default for MessageStorage<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Packet> MessageStorage<P> {
    #[inline]
    pub fn new() -> Self {
        Self { clients: DashMap::default() }
    }

    #[inline]
    fn ledger(&self, client: &str) -> Option<Arc<ClientLedger<P>>> {
        let ledger = self.clients.get(client).map(|entry| entry.value().clone());
        if ledger.is_none() {
            log::debug!("{} ledger not found", client);
        }
        ledger
    }

    /// Registers a client, an already registered client keeps its ledgers and `false` is returned.
    #[inline]
    pub fn add_client(&self, client: ClientId) -> bool {
        let mut added = false;
        self.clients.entry(client).or_insert_with(|| {
            added = true;
            Arc::new(ClientLedger::default())
        });
        added
    }

    /// Drops both ledgers of `client`, `false` if the client is unknown.
    #[inline]
    pub fn close(&self, client: &str) -> bool {
        match self.clients.remove(client) {
            Some((_, ledger)) => {
                ledger.clear();
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn exists(&self, client: &str) -> bool {
        self.clients.contains_key(client)
    }

    #[inline]
    pub fn clients(&self) -> usize {
        self.clients.len()
    }

    #[inline]
    pub fn add_inbound(&self, client: &str, p: P) -> bool {
        self.ledger(client).map(|l| l.add_inbound(p)).unwrap_or(false)
    }

    #[inline]
    pub fn add_outbound(&self, client: &str, p: P) -> bool {
        self.ledger(client).map(|l| l.add_outbound(p)).unwrap_or(false)
    }

    #[inline]
    pub fn delete_in(&self, client: &str, p: &P) -> bool {
        self.ledger(client).and_then(|l| l.delete_in(&p.uuid())).is_some()
    }

    #[inline]
    pub fn delete_out(&self, client: &str, p: &P) -> bool {
        self.ledger(client).and_then(|l| l.delete_out(&p.uuid())).is_some()
    }

    #[inline]
    pub fn remove_in(&self, client: &str, uuid: &Uuid) -> Option<P> {
        self.ledger(client).and_then(|l| l.delete_in(uuid))
    }

    #[inline]
    pub fn remove_out(&self, client: &str, uuid: &Uuid) -> Option<P> {
        self.ledger(client).and_then(|l| l.delete_out(uuid))
    }

    #[inline]
    pub fn get_inbound(&self, client: &str, uuid: &Uuid) -> Option<P> {
        self.ledger(client).and_then(|l| l.get_inbound(uuid))
    }

    #[inline]
    pub fn get_outbound(&self, client: &str, uuid: &Uuid) -> Option<P> {
        self.ledger(client).and_then(|l| l.get_outbound(uuid))
    }

    #[inline]
    pub fn get_all_in(&self, client: &str) -> Vec<P> {
        self.ledger(client).map(|l| l.get_all_in()).unwrap_or_default()
    }

    /// Outbound packets in insertion order.
    #[inline]
    pub fn get_all_out(&self, client: &str) -> Vec<P> {
        self.ledger(client).map(|l| l.get_all_out()).unwrap_or_default()
    }

    #[inline]
    pub fn len_in(&self, client: &str) -> usize {
        self.ledger(client).map(|l| l.len_in()).unwrap_or_default()
    }

    #[inline]
    pub fn len_out(&self, client: &str) -> usize {
        self.ledger(client).map(|l| l.len_out()).unwrap_or_default()
    }

    #[inline]
    pub fn get_id_store_i(&self, client: &str) -> Option<Arc<MessageIdStore>> {
        self.ledger(client).map(|l| l.in_ids())
    }

    #[inline]
    pub fn get_id_store_o(&self, client: &str) -> Option<Arc<MessageIdStore>> {
        self.ledger(client).map(|l| l.out_ids())
    }
}

/// Ledgers of a single connection, for client side use.
pub struct MessageBox<P> {
    ledger: ClientLedger<P>,
}

impl<P: Packet> Default for MessageBox<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Packet> MessageBox<P> {
    #[inline]
    pub fn new() -> Self {
        Self { ledger: ClientLedger::default() }
    }

    #[inline]
    pub fn add_inbound(&self, p: P) -> bool {
        self.ledger.add_inbound(p)
    }

    #[inline]
    pub fn add_outbound(&self, p: P) -> bool {
        self.ledger.add_outbound(p)
    }

    #[inline]
    pub fn delete_in(&self, p: &P) -> bool {
        self.ledger.delete_in(&p.uuid()).is_some()
    }

    #[inline]
    pub fn delete_out(&self, p: &P) -> bool {
        self.ledger.delete_out(&p.uuid()).is_some()
    }

    #[inline]
    pub fn get_inbound(&self, uuid: &Uuid) -> Option<P> {
        self.ledger.get_inbound(uuid)
    }

    #[inline]
    pub fn get_outbound(&self, uuid: &Uuid) -> Option<P> {
        self.ledger.get_outbound(uuid)
    }

    #[inline]
    pub fn get_all_in(&self) -> Vec<P> {
        self.ledger.get_all_in()
    }

    #[inline]
    pub fn get_all_out(&self) -> Vec<P> {
        self.ledger.get_all_out()
    }

    #[inline]
    pub fn len_in(&self) -> usize {
        self.ledger.len_in()
    }

    #[inline]
    pub fn len_out(&self) -> usize {
        self.ledger.len_out()
    }

    #[inline]
    pub fn get_id_store_i(&self) -> Arc<MessageIdStore> {
        self.ledger.in_ids()
    }

    #[inline]
    pub fn get_id_store_o(&self) -> Arc<MessageIdStore> {
        self.ledger.out_ids()
    }

    /// Clears both ledgers and both identifier tables.
    #[inline]
    pub fn close(&self) {
        self.ledger.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bytes::Bytes;

    use super::*;
    use crate::types::{Publish, QoS};

    fn packet(n: usize) -> Publish {
        Publish::new("t/1", Bytes::from(n.to_string()), QoS::AtLeastOnce)
    }

    #[test]
    fn ordering() {
        let s = MessageStorage::<Publish>::new();
        assert!(s.add_client(ClientId::from("c1")));
        assert!(s.add_client(ClientId::from("c2")));
        let (p1, p2, p3) = (packet(1), packet(2), packet(3));
        assert!(s.add_outbound("c1", p1.clone()));
        assert!(s.add_outbound("c2", packet(9)));
        assert!(s.add_outbound("c1", p2.clone()));
        assert!(s.delete_out("c2", &s.get_all_out("c2")[0]));
        assert!(s.add_outbound("c1", p3.clone()));
        assert_eq!(s.get_all_out("c1"), vec![p1.clone(), p2, p3.clone()]);
        assert!(s.get_all_in("c1").is_empty());

        let second = s.get_all_out("c1")[1].clone();
        assert!(s.delete_out("c1", &second));
        assert!(!s.delete_out("c1", &second));
        assert_eq!(s.get_all_out("c1"), vec![p1, p3]);
    }

    #[test]
    fn ordering_under_concurrency() {
        let s = Arc::new(MessageStorage::<Publish>::new());
        for c in 0..4 {
            s.add_client(ClientId::from(format!("c{c}")));
        }
        let handles = (0..4)
            .map(|c| {
                let s = s.clone();
                thread::spawn(move || {
                    let client = format!("c{c}");
                    let sent = (0..200).map(packet).collect::<Vec<_>>();
                    for p in sent.iter() {
                        assert!(s.add_outbound(&client, p.clone()));
                    }
                    sent
                })
            })
            .collect::<Vec<_>>();
        for (c, h) in handles.into_iter().enumerate() {
            let sent = h.join().unwrap();
            assert_eq!(s.get_all_out(&format!("c{c}")), sent);
        }
    }

    #[test]
    fn duplicate_uuid() {
        let s = MessageStorage::<Publish>::new();
        s.add_client(ClientId::from("c1"));
        let p = packet(1);
        assert!(s.add_outbound("c1", p.clone()));
        assert!(!s.add_outbound("c1", p.clone()));
        assert_eq!(s.len_out("c1"), 1);
        assert!(s.add_inbound("c1", p.clone()));
        assert_eq!(s.get_inbound("c1", &p.uuid), Some(p.clone()));
        assert_eq!(s.get_outbound("c1", &p.uuid), Some(p));
    }

    #[test]
    fn unknown_client() {
        let s = MessageStorage::<Publish>::new();
        let p = packet(1);
        assert!(!s.close("nobody"));
        assert!(!s.exists("nobody"));
        assert!(!s.add_outbound("nobody", p.clone()));
        assert!(!s.delete_in("nobody", &p));
        assert!(s.get_all_out("nobody").is_empty());
        assert!(s.get_id_store_o("nobody").is_none());
        assert_eq!(s.clients(), 0);
    }

    #[test]
    fn reconnect_keeps_ledger() {
        let s = MessageStorage::<Publish>::new();
        assert!(s.add_client(ClientId::from("c1")));
        s.add_outbound("c1", packet(1));
        let ids = s.get_id_store_o("c1").unwrap();
        assert_eq!(ids.get_new_id(Uuid::new_v4()), 1);

        assert!(!s.add_client(ClientId::from("c1")));
        assert_eq!(s.len_out("c1"), 1);
        assert!(s.get_id_store_o("c1").unwrap().is_occupied(1));

        assert!(s.close("c1"));
        assert!(!s.exists("c1"));
        assert!(!ids.is_occupied(1));
        assert!(!s.close("c1"));
    }

    #[test]
    fn message_box() {
        let b = MessageBox::<Publish>::new();
        let (p1, p2) = (packet(1), packet(2));
        assert!(b.add_outbound(p1.clone()));
        assert!(b.add_outbound(p2.clone()));
        assert!(!b.add_outbound(p1.clone()));
        assert!(b.add_inbound(p1.clone()));
        assert_eq!(b.get_all_out(), vec![p1.clone(), p2.clone()]);
        assert_eq!(b.get_outbound(&p2.uuid), Some(p2.clone()));

        let id = b.get_id_store_o().get_new_id(p2.uuid);
        assert_eq!(b.get_id_store_o().get_uuid(id), Some(p2.uuid));
        assert!(b.delete_out(&p1));
        assert!(!b.delete_out(&p1));
        assert!(b.delete_in(&p1));
        assert_eq!(b.len_in(), 0);

        b.close();
        assert_eq!(b.len_out(), 0);
        assert!(b.get_id_store_o().is_empty());
        assert!(b.get_all_in().is_empty());
        assert!(b.get_inbound(&p1.uuid).is_none());
        assert!(b.get_id_store_i().is_empty());
    }
}
