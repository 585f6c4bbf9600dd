//! Component wiring and the publish/subscribe/acknowledge data flow.
//!
//! A published packet is matched against the router; every QoS>0 recipient gets a fresh-UUID
//! copy with an outbound packet id bound to that UUID, recorded in its outbound ledger and
//! admitted through its outbound gate. An acknowledgment reverses the three steps. Inbound
//! QoS>0 packets follow the mirror image on the inbound side.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use slog::o;
use uuid::Uuid;

use mqcore_conf::Settings;
use mqcore_utils::timestamp_millis;

use crate::logger::Logger;
use crate::message::MessageStorage;
use crate::queue::MessageQueue;
use crate::retain::{DefaultRetainStorage, RetainStorage};
use crate::router::{DefaultRouter, Router};
use crate::stats::Stats;
use crate::topic::Delimiters;
use crate::types::{ClientId, DashMap, HashMap, PacketId, Publish, QoS, TopicFilter};
use crate::{MqError, Result};

#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub logger: Logger,
    pub delims: Delimiters,
    router: Arc<dyn Router>,
    retain: Arc<dyn RetainStorage<Publish>>,
    pub messages: MessageStorage<Publish>,
    queues: DashMap<ClientId, Arc<MessageQueue<Uuid>>>,
    subscriptions: DashMap<ClientId, HashMap<TopicFilter, QoS>>,
    pub stats: Stats,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerContext {{ clients: {}, delims: {:?} }}", self.messages.clients(), self.delims)
    }
}

pub struct ServerContextBuilder {
    settings: Settings,
    logger: Option<Logger>,
    router: Option<Arc<dyn Router>>,
    retain: Option<Arc<dyn RetainStorage<Publish>>>,
}

impl ServerContextBuilder {
    #[inline]
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    #[inline]
    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    #[inline]
    pub fn retain(mut self, retain: Arc<dyn RetainStorage<Publish>>) -> Self {
        self.retain = Some(retain);
        self
    }

    pub fn build(self) -> Result<ServerContext> {
        let delims = Delimiters::from_conf(&self.settings.topic)?;
        let max_levels = self.settings.topic.max_levels;
        let router = self.router.unwrap_or_else(|| Arc::new(DefaultRouter::new(delims, max_levels)));
        let retain = self.retain.unwrap_or_else(|| Arc::new(DefaultRetainStorage::new(delims)));
        let logger = self.logger.unwrap_or_else(|| Logger::root(slog::Discard, o!()));
        Ok(ServerContext {
            inner: Arc::new(ServerContextInner {
                settings: self.settings,
                logger,
                delims,
                router,
                retain,
                messages: MessageStorage::new(),
                queues: DashMap::default(),
                subscriptions: DashMap::default(),
                stats: Stats::new(),
            }),
        })
    }
}

/// A copy of a packet addressed to one client.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub client_id: ClientId,
    pub packet: Publish,
}

#[derive(Debug, Default)]
pub struct Dispatched {
    pub deliveries: Vec<Delivery>,
    //recipients whose outbound id space or gate queue is full, nothing was recorded for them
    pub exhausted: Vec<ClientId>,
}

impl Dispatched {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty() && self.exhausted.is_empty()
    }

    fn push(&mut self, client_id: &str, res: Result<Option<Delivery>>) {
        match res {
            Ok(Some(d)) => self.deliveries.push(d),
            Ok(None) => {}
            Err(e) => {
                log::debug!("{} delivery held back, {}", client_id, e);
                self.exhausted.push(ClientId::from(client_id))
            }
        }
    }
}

impl ServerContext {
    #[allow(clippy::new_ret_no_self)]
    #[inline]
    pub fn new(settings: Settings) -> ServerContextBuilder {
        ServerContextBuilder { settings, logger: None, router: None, retain: None }
    }

    #[inline]
    pub fn router(&self) -> &dyn Router {
        self.router.as_ref()
    }

    #[inline]
    pub fn retain(&self) -> &dyn RetainStorage<Publish> {
        self.retain.as_ref()
    }

    #[inline]
    pub fn queue(&self, client_id: &str) -> Option<Arc<MessageQueue<Uuid>>> {
        self.queues.get(client_id).map(|q| q.value().clone())
    }

    #[inline]
    fn retain_enable(&self) -> bool {
        self.settings.mqtt.retain_enable && self.retain.enable()
    }

    /// Registers the client. Returns `false` for a client that is already connected, its ledgers
    /// and gates are kept for redelivery.
    pub fn connect(&self, client_id: ClientId) -> bool {
        let cap = self.settings.mqtt.max_queued_messages;
        self.queues.entry(client_id.clone()).or_insert_with(|| Arc::new(MessageQueue::new(cap)));
        let added = self.messages.add_client(client_id.clone());
        if added {
            self.stats.connections.inc();
            slog::debug!(self.logger, "{} connected", client_id);
        }
        added
    }

    /// Drops the client's subscriptions, ledgers, identifier tables and gates.
    pub fn disconnect(&self, client_id: &str) -> bool {
        if let Some((_, subs)) = self.subscriptions.remove(client_id) {
            for topic_filter in subs.keys() {
                if let Err(e) = self.router.remove(topic_filter, client_id) {
                    log::warn!("{} unsubscribe {} failed on disconnect, {}", client_id, topic_filter, e);
                }
            }
            self.stats.subscriptions.decs(subs.len() as isize);
        }
        if let Some((_, q)) = self.queues.remove(client_id) {
            q.clear();
        }
        let (len_in, len_out) = (self.messages.len_in(client_id), self.messages.len_out(client_id));
        if self.messages.close(client_id) {
            self.stats.in_inflights.decs(len_in as isize);
            self.stats.out_inflights.decs(len_out as isize);
            self.stats.connections.dec();
            slog::debug!(self.logger, "{} disconnected", client_id);
            true
        } else {
            log::debug!("{} disconnect, client not found", client_id);
            false
        }
    }

    /// Subscribes the client and hands back the retained packets the filter covers, already
    /// recorded as outbound deliveries.
    pub fn subscribe(&self, client_id: &str, topic_filter: &str, qos: QoS) -> Result<Dispatched> {
        if !self.messages.exists(client_id) {
            return Err(MqError::ClientNotFound(ClientId::from(client_id)));
        }
        let retaineds = if self.retain_enable() { self.retain.matches(topic_filter)? } else { Vec::new() };
        let prev = self.router.add(topic_filter, ClientId::from(client_id), qos)?;
        self.subscriptions
            .entry(ClientId::from(client_id))
            .or_default()
            .insert(TopicFilter::from(topic_filter), qos);
        if prev.is_none() {
            self.stats.subscriptions.inc();
        }

        let mut dispatched = Dispatched::default();
        for (_, p) in retaineds {
            let qos = p.qos.less_value(qos);
            dispatched.push(client_id, self.deliver(client_id, &p, qos, true));
        }
        Ok(dispatched)
    }

    pub fn unsubscribe(&self, client_id: &str, topic_filter: &str) -> Result<()> {
        self.router.remove(topic_filter, client_id)?;
        if let Some(mut subs) = self.subscriptions.get_mut(client_id) {
            subs.remove(topic_filter);
        }
        self.stats.subscriptions.dec();
        Ok(())
    }

    /// Updates retained storage and fans the packet out to every matching subscriber.
    pub fn publish(&self, p: Publish) -> Result<Dispatched> {
        let recipients = self.router.matches(&p.topic, p.qos)?;
        self.dispatch(p, recipients)
    }

    //the retained update is the only step that can fail, nothing is delivered before it
    fn dispatch(&self, p: Publish, recipients: Vec<(ClientId, QoS)>) -> Result<Dispatched> {
        if p.retain && self.retain_enable() {
            if p.payload.is_empty() {
                self.retain.remove(&p.topic)?;
            } else {
                self.retain.set(&p.topic, p.clone())?;
            }
        }

        let mut dispatched = Dispatched::default();
        for (client_id, _) in recipients {
            let res = self.deliver(&client_id, &p, p.qos, false);
            dispatched.push(&client_id, res);
        }
        Ok(dispatched)
    }

    //Err is backpressure (no free id or a full queue), Ok(None) an unknown client
    fn deliver(&self, client_id: &str, src: &Publish, qos: QoS, retain: bool) -> Result<Option<Delivery>> {
        let mut p = src.fork();
        p.qos = qos;
        p.retain = retain;

        if qos == QoS::AtMostOnce {
            return Ok(Some(Delivery { client_id: ClientId::from(client_id), packet: p }));
        }

        let (ids, queue) = match (self.messages.get_id_store_o(client_id), self.queue(client_id)) {
            (Some(ids), Some(queue)) => (ids, queue),
            _ => {
                log::debug!("{} is not connected, delivery dropped", client_id);
                return Ok(None);
            }
        };

        let id = ids.try_new_id(p.uuid).map_err(|e| {
            self.stats.exhausted.inc();
            e
        })?;
        p = p.packet_id(id);

        if !self.messages.add_outbound(client_id, p.clone()) {
            ids.free_id_if(id, &p.uuid);
            return Ok(None);
        }
        if queue.push_out(id, p.uuid).is_err() {
            self.messages.remove_out(client_id, &p.uuid);
            ids.free_id_if(id, &p.uuid);
            self.stats.exhausted.inc();
            return Err(MqError::from(format!("{client_id} outbound queue is full")));
        }
        self.stats.out_inflights.inc();
        Ok(Some(Delivery { client_id: ClientId::from(client_id), packet: p }))
    }

    /// PUBACK/PUBCOMP from the client, returns the completed packet.
    pub fn acknowledge(&self, client_id: &str, packet_id: PacketId) -> Result<Publish> {
        let ids = self
            .messages
            .get_id_store_o(client_id)
            .ok_or_else(|| MqError::ClientNotFound(ClientId::from(client_id)))?;
        let uuid = ids
            .get_uuid(packet_id)
            .ok_or_else(|| MqError::NotFound(format!("outbound packet id {packet_id} of {client_id}")))?;
        self.complete_out(client_id, packet_id, &uuid)
    }

    //only the caller that takes the ledger entry out touches the gate and the id
    pub(crate) fn complete_out(&self, client_id: &str, packet_id: PacketId, uuid: &Uuid) -> Result<Publish> {
        let p = self
            .messages
            .remove_out(client_id, uuid)
            .ok_or_else(|| MqError::NotFound(format!("outbound message {uuid} of {client_id}")))?;
        if let Some(q) = self.queue(client_id) {
            q.release_out(packet_id);
        }
        if let Some(ids) = self.messages.get_id_store_o(client_id) {
            ids.free_id_if(packet_id, uuid);
        }
        self.stats.out_inflights.dec();
        Ok(p)
    }

    /// Inbound publish from the client. QoS 0 packets are routed straight away. For QoS>0 the
    /// peer chosen packet id is held until [`ServerContext::release`]; a repeat of an id that is
    /// still pending returns `Ok(None)` and is not routed again. The packet is routed only once
    /// the inbound state is in place, and a failure leaves neither inbound nor routed state.
    pub fn receive(&self, client_id: &str, p: Publish) -> Result<Option<Dispatched>> {
        if p.qos == QoS::AtMostOnce {
            return self.publish(p).map(Some);
        }
        let packet_id = p.packet_id.map(|id| id.get()).ok_or_else(|| MqError::from("packet id is missing"))?;
        let (ids, queue) = match (self.messages.get_id_store_i(client_id), self.queue(client_id)) {
            (Some(ids), Some(queue)) => (ids, queue),
            _ => return Err(MqError::ClientNotFound(ClientId::from(client_id))),
        };
        let recipients = self.router.matches(&p.topic, p.qos)?;

        if queue.has_in_ack(packet_id) {
            log::debug!("{} repeated inbound packet id {}", client_id, packet_id);
            return Ok(None);
        }
        let uuid = p.uuid;
        if !ids.bind(packet_id, uuid) {
            return Err(MqError::PacketIdInUse(packet_id));
        }
        if !self.messages.add_inbound(client_id, p.clone()) {
            ids.free_id_if(packet_id, &uuid);
            return Ok(None);
        }
        if queue.push_in(packet_id, uuid).is_err() {
            self.messages.remove_in(client_id, &uuid);
            ids.free_id_if(packet_id, &uuid);
            return Err(MqError::from(format!("{client_id} inbound queue is full")));
        }

        match self.dispatch(p, recipients) {
            Ok(dispatched) => {
                self.stats.in_inflights.inc();
                Ok(Some(dispatched))
            }
            Err(e) => {
                queue.cancel_in(packet_id);
                self.messages.remove_in(client_id, &uuid);
                ids.free_id_if(packet_id, &uuid);
                Err(e)
            }
        }
    }

    /// PUBREL from the client, clears the inbound state of `packet_id`.
    pub fn release(&self, client_id: &str, packet_id: PacketId) -> Result<Publish> {
        let ids = self
            .messages
            .get_id_store_i(client_id)
            .ok_or_else(|| MqError::ClientNotFound(ClientId::from(client_id)))?;
        let uuid = ids
            .get_uuid(packet_id)
            .ok_or_else(|| MqError::NotFound(format!("inbound packet id {packet_id} of {client_id}")))?;
        let p = self
            .messages
            .remove_in(client_id, &uuid)
            .ok_or_else(|| MqError::NotFound(format!("inbound message {uuid} of {client_id}")))?;
        if let Some(q) = self.queue(client_id) {
            q.release_in(packet_id);
        }
        ids.free_id_if(packet_id, &uuid);
        self.stats.in_inflights.dec();
        Ok(p)
    }

    /// Unacknowledged outbound packets in the order they were first sent, flagged as duplicates.
    pub fn redeliver(&self, client_id: &str) -> Vec<Publish> {
        self.messages
            .get_all_out(client_id)
            .into_iter()
            .map(|mut p| {
                p.dup = true;
                p
            })
            .collect()
    }

    /// Unacknowledged outbound packets older than the retry interval.
    pub fn retry_due(&self, client_id: &str) -> Vec<Publish> {
        let interval = self.settings.mqtt.retry_interval.as_millis() as i64;
        if interval == 0 {
            return Vec::new();
        }
        let now = timestamp_millis();
        self.redeliver(client_id).into_iter().filter(|p| now - p.create_time >= interval).collect()
    }
}
