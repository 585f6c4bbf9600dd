//! Subscription routing.
//!
//! The trie is keyed by topic level. Every node keeps the `(client, qos)` pairs whose filter
//! terminates exactly there plus its children. A wildcard child anchors its subscribers at the
//! level it occupies: they match any topic that continues past that level, however many levels
//! follow.
//!
//! ```text
//! Root
//! └── a
//!     ├── b   [(c1, 1)]
//!     └── *   [(c2, 1)]
//! ```
//! `a/b` matches `c1` and `c2`, `a/b/c` matches only `c2`.

use std::fmt;

use parking_lot::RwLock;

use mqcore_utils::Counter;

use crate::topic::{Delimiters, Level, Topic, TopicError};
use crate::types::{ClientId, HashMap, QoS};
use crate::{MqError, Result};

pub type TopicTree = Node;

#[derive(Default)]
pub struct Node {
    subs: Vec<(ClientId, QoS)>,
    branches: HashMap<Level, Node>,
}

impl Node {
    /// Registers `client_id` at the node `topic_filter` ends on. An existing registration of the
    /// same client is updated in place and its previous QoS returned.
    #[inline]
    pub fn insert(&mut self, topic_filter: &Topic, client_id: ClientId, qos: QoS) -> Option<QoS> {
        let mut path = topic_filter.levels().clone();
        path.reverse();
        self._insert(path, client_id, qos)
    }

    #[inline]
    fn _insert(&mut self, mut path: Vec<Level>, client_id: ClientId, qos: QoS) -> Option<QoS> {
        if let Some(first) = path.pop() {
            self.branches.entry(first).or_default()._insert(path, client_id, qos)
        } else if let Some((_, q)) = self.subs.iter_mut().find(|(id, _)| *id == client_id) {
            Some(std::mem::replace(q, qos))
        } else {
            self.subs.push((client_id, qos));
            None
        }
    }

    /// Returns the QoS the client was registered with, `None` if the filter path or the client
    /// is unknown. Nodes left without subscribers and children are pruned.
    #[inline]
    pub fn remove(&mut self, topic_filter: &Topic, client_id: &str) -> Option<QoS> {
        self._remove(topic_filter.levels().as_ref(), client_id)
    }

    #[inline]
    fn _remove(&mut self, path: &[Level], client_id: &str) -> Option<QoS> {
        if path.is_empty() {
            let pos = self.subs.iter().position(|(id, _)| &**id == client_id)?;
            Some(self.subs.remove(pos).1)
        } else {
            let t = &path[0];
            let x = self.branches.get_mut(t)?;
            let res = x._remove(&path[1..], client_id);
            if x.subs.is_empty() && x.branches.is_empty() {
                self.branches.remove(t);
            }
            res
        }
    }

    /// Subscribers whose QoS ceiling admits `qos`.
    #[inline]
    pub fn matches(&self, topic: &Topic, qos: QoS) -> Vec<(ClientId, QoS)> {
        let mut out = Vec::new();
        self._matches(topic.levels(), qos, &mut out);
        out
    }

    #[inline]
    fn _matches(&self, path: &[Level], qos: QoS, out: &mut Vec<(ClientId, QoS)>) {
        let mut add_to_out = |subs: &[(ClientId, QoS)]| {
            out.extend(subs.iter().filter(|(_, q)| qos <= *q).cloned());
        };

        if path.is_empty() {
            //Boundary
            add_to_out(&self.subs);
        } else {
            //Anchored wildcard, no further descent
            if let Some(n) = self.branches.get(&Level::Wildcard) {
                add_to_out(&n.subs);
            }

            //Precise matching
            if let Some(n) = self.branches.get(&path[0]) {
                n._matches(&path[1..], qos, out);
            }
        }
    }

    #[inline]
    pub fn subs(&self) -> &[(ClientId, QoS)] {
        &self.subs
    }

    #[inline]
    pub fn children(&self) -> &HashMap<Level, Node> {
        &self.branches
    }

    #[inline]
    pub fn child(&self, l: &Level) -> Option<&Node> {
        self.branches.get(l)
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        self.subs.len() + len
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }

    #[inline]
    pub fn list(&self, top: usize) -> Vec<String> {
        let mut out = Vec::new();
        self._list(&mut out, top, 0);
        out
    }

    #[inline]
    fn _list(&self, out: &mut Vec<String>, top: usize, depth: usize) {
        if top == 0 {
            return;
        }
        for (l, n) in self.branches.iter() {
            out.push(format!("{} {}, subs: {:?}", " ".repeat(depth * 3), l, n.subs));
            n._list(out, top - 1, depth + 1);
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {{ nodes_size: {}, values_size: {} }}", self.nodes_size(), self.values_size())
    }
}

pub trait Router: Sync + Send {
    /// Subscribe `id` to `topic_filter`, returns the previous QoS when the client was already
    /// subscribed to the same filter.
    fn add(&self, topic_filter: &str, id: ClientId, qos: QoS) -> Result<Option<QoS>>;

    /// Remove the subscription of `id` from `topic_filter`
    fn remove(&self, topic_filter: &str, id: &str) -> Result<QoS>;

    /// Match with topic and requested qos
    fn matches(&self, topic: &str, qos: QoS) -> Result<Vec<(ClientId, QoS)>>;

    ///Returns the number of subscription pairs
    fn routes(&self) -> Counter;

    /// Topics tree
    fn topics_tree(&self) -> usize;

    ///get topic tree
    fn list_topics(&self, top: usize) -> Vec<String>;
}

pub struct DefaultRouter {
    delims: Delimiters,
    max_levels: usize,
    pub topics: RwLock<TopicTree>,
    routes_count: Counter,
}

impl Default for DefaultRouter {
    fn default() -> Self {
        Self::new(Delimiters::default(), 0)
    }
}

impl DefaultRouter {
    #[inline]
    pub fn new(delims: Delimiters, max_levels: usize) -> DefaultRouter {
        Self { delims, max_levels, topics: RwLock::new(TopicTree::default()), routes_count: Counter::new() }
    }

    #[inline]
    pub fn delimiters(&self) -> Delimiters {
        self.delims
    }

    fn parse_filter(&self, topic_filter: &str) -> Result<Topic> {
        let topic = Topic::parse(topic_filter, self.delims)?;
        if !topic.is_filter() {
            return Err(TopicError::InvalidTopic(format!(
                "wildcard is only allowed as the last level, `{topic_filter}`"
            ))
            .into());
        }
        topic.check_levels(self.max_levels)?;
        Ok(topic)
    }

    fn parse_topic(&self, topic: &str) -> Result<Topic> {
        let t = Topic::parse(topic, self.delims)?;
        if t.has_wildcard() {
            return Err(TopicError::InvalidTopic(format!("wildcard in topic name, `{topic}`")).into());
        }
        Ok(t)
    }
}

impl Router for DefaultRouter {
    #[inline]
    fn add(&self, topic_filter: &str, id: ClientId, qos: QoS) -> Result<Option<QoS>> {
        let topic = self.parse_filter(topic_filter)?;
        let prev = self.topics.write().insert(&topic, id, qos);
        if prev.is_none() {
            self.routes_count.inc();
        }
        Ok(prev)
    }

    #[inline]
    fn remove(&self, topic_filter: &str, id: &str) -> Result<QoS> {
        let topic = self.parse_filter(topic_filter)?;
        match self.topics.write().remove(&topic, id) {
            Some(qos) => {
                self.routes_count.dec();
                Ok(qos)
            }
            None => Err(MqError::NotFound(format!("subscription {id} on {topic_filter}"))),
        }
    }

    #[inline]
    fn matches(&self, topic: &str, qos: QoS) -> Result<Vec<(ClientId, QoS)>> {
        let topic = self.parse_topic(topic)?;
        Ok(self.topics.read().matches(&topic, qos))
    }

    #[inline]
    fn routes(&self) -> Counter {
        self.routes_count.clone()
    }

    #[inline]
    fn topics_tree(&self) -> usize {
        self.topics.read().nodes_size()
    }

    #[inline]
    fn list_topics(&self, top: usize) -> Vec<String> {
        self.topics.read().list(top)
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    fn ids(subs: Vec<(ClientId, QoS)>) -> Vec<String> {
        subs.into_iter().map(|(id, _)| id.to_string()).sorted().collect()
    }

    #[test]
    fn wildcard_anchoring() {
        let r = DefaultRouter::default();
        r.add("a/b", ClientId::from("c1"), QoS::AtLeastOnce).unwrap();
        r.add("a/*", ClientId::from("c2"), QoS::AtLeastOnce).unwrap();

        assert_eq!(ids(r.matches("a/b", QoS::AtMostOnce).unwrap()), vec!["c1", "c2"]);
        assert_eq!(ids(r.matches("a/b/c", QoS::AtMostOnce).unwrap()), vec!["c2"]);
        assert_eq!(ids(r.matches("a/x/y/z", QoS::AtMostOnce).unwrap()), vec!["c2"]);
        assert!(r.matches("a", QoS::AtMostOnce).unwrap().is_empty());
        assert!(r.matches("b/b", QoS::AtMostOnce).unwrap().is_empty());
    }

    #[test]
    fn qos_ceiling() {
        let r = DefaultRouter::default();
        r.add("x/y", ClientId::from("c1"), QoS::AtLeastOnce).unwrap();
        assert!(r.matches("x/y", QoS::ExactlyOnce).unwrap().is_empty());
        assert_eq!(r.matches("x/y", QoS::AtLeastOnce).unwrap(), vec![(ClientId::from("c1"), QoS::AtLeastOnce)]);
        assert_eq!(ids(r.matches("x/y", QoS::AtMostOnce).unwrap()), vec!["c1"]);
    }

    #[test]
    fn resubscribe_updates_qos() {
        let r = DefaultRouter::default();
        assert_eq!(r.add("a/b", ClientId::from("c1"), QoS::AtMostOnce).unwrap(), None);
        assert_eq!(r.add("a/b", ClientId::from("c1"), QoS::ExactlyOnce).unwrap(), Some(QoS::AtMostOnce));
        assert_eq!(r.routes().count(), 1);
        assert_eq!(r.matches("a/b", QoS::ExactlyOnce).unwrap(), vec![(ClientId::from("c1"), QoS::ExactlyOnce)]);
    }

    #[test]
    fn remove_prunes() {
        let r = DefaultRouter::default();
        r.add("a/b/c", ClientId::from("c1"), QoS::AtLeastOnce).unwrap();
        r.add("a/b", ClientId::from("c2"), QoS::AtLeastOnce).unwrap();
        assert_eq!(r.topics_tree(), 3);
        assert_eq!(r.remove("a/b/c", "c1").unwrap(), QoS::AtLeastOnce);
        assert_eq!(r.topics_tree(), 2);
        assert!(r.remove("a/b/c", "c1").unwrap_err().is_not_found());
        assert!(r.remove("a/b", "c9").unwrap_err().is_not_found());
        r.remove("a/b", "c2").unwrap();
        assert_eq!(r.topics_tree(), 0);
        assert_eq!(r.routes().count(), 0);
        assert_eq!(r.routes().max(), 2);
    }

    #[test]
    fn malformed_topics() {
        let r = DefaultRouter::default();
        assert!(matches!(r.add("/a", ClientId::from("c1"), QoS::AtMostOnce), Err(MqError::Topic(_))));
        assert!(matches!(r.add("a/b*", ClientId::from("c1"), QoS::AtMostOnce), Err(MqError::Topic(_))));
        assert!(matches!(r.add("a/*/b", ClientId::from("c1"), QoS::AtMostOnce), Err(MqError::Topic(_))));
        assert!(matches!(r.matches("a/*", QoS::AtMostOnce), Err(MqError::Topic(_))));
        assert_eq!(r.topics_tree(), 0);
    }

    #[test]
    fn max_levels() {
        let r = DefaultRouter::new(Delimiters::default(), 2);
        assert!(r.add("a/b", ClientId::from("c1"), QoS::AtMostOnce).is_ok());
        assert!(matches!(
            r.add("a/b/c", ClientId::from("c1"), QoS::AtMostOnce),
            Err(MqError::Topic(TopicError::TooManyLevels(3)))
        ));
    }

    #[test]
    fn custom_delimiters() {
        let r = DefaultRouter::new(Delimiters::new(b'.', b'+').unwrap(), 0);
        r.add("a.+", ClientId::from("c1"), QoS::AtLeastOnce).unwrap();
        assert_eq!(ids(r.matches("a.b.c", QoS::AtLeastOnce).unwrap()), vec!["c1"]);
        assert!(r.matches("a/b", QoS::AtLeastOnce).unwrap().is_empty());
        assert_eq!(r.list_topics(10).len(), 2);
    }
}
