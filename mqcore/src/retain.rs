//! Retained message storage.
//!
//! Last value cache keyed by exact topic. A node holds a packet only when a retained topic
//! terminates on it, nodes without a packet and without children are pruned on removal.
//!
//! ```text
//! Root
//! ├── x
//! │   └── y (value=m1)
//! │       └── z (value=m2)
//! └── iot
//!     └── b (value=m3)
//! ```
//! Removing `x/y` clears `m1` only, `x/y/z` keeps its packet.

use std::fmt;

use parking_lot::RwLock;

use mqcore_utils::Counter;

use crate::topic::{Delimiters, Level, Topic, TopicError};
use crate::types::{HashMap, Packet, TopicName};
use crate::{MqError, Result};

pub trait RetainStorage<P: Packet>: Sync + Send {
    ///Whether retain is supported
    #[inline]
    fn enable(&self) -> bool {
        true
    }

    ///topic - concrete topic, returns the replaced packet
    fn set(&self, topic: &str, packet: P) -> Result<Option<P>>;

    ///topic - concrete topic
    fn get(&self, topic: &str) -> Result<P>;

    ///topic - concrete topic, returns the cleared packet
    fn remove(&self, topic: &str) -> Result<Option<P>>;

    ///topic_filter - Topic filter
    fn matches(&self, topic_filter: &str) -> Result<Vec<(TopicName, P)>>;

    fn count(&self) -> isize;

    fn max(&self) -> isize;
}

pub struct DefaultRetainStorage<P> {
    delims: Delimiters,
    pub messages: RwLock<RetainTree<P>>,
    retaineds: Counter,
}

impl<P: Packet> Default for DefaultRetainStorage<P> {
    fn default() -> Self {
        Self::new(Delimiters::default())
    }
}

impl<P: Packet> DefaultRetainStorage<P> {
    #[inline]
    pub fn new(delims: Delimiters) -> DefaultRetainStorage<P> {
        Self { delims, messages: RwLock::new(RetainTree::default()), retaineds: Counter::new() }
    }

    fn parse_topic(&self, topic: &str) -> Result<Topic> {
        let t = Topic::parse(topic, self.delims)?;
        if t.has_wildcard() {
            return Err(TopicError::InvalidTopic(format!("wildcard in retained topic, `{topic}`")).into());
        }
        Ok(t)
    }

    /// Drops every packet for which `f` returns `false`, returns the number dropped.
    #[inline]
    pub fn retain<F>(&self, f: F) -> usize
    where
        F: FnMut(&mut P) -> bool,
    {
        let removeds = self.messages.write().retain(usize::MAX, f);
        self.retaineds.decs(removeds as isize);
        removeds
    }
}

impl<P: Packet> RetainStorage<P> for DefaultRetainStorage<P> {
    #[inline]
    fn set(&self, topic: &str, packet: P) -> Result<Option<P>> {
        let topic = self.parse_topic(topic)?;
        let old = self.messages.write().insert(&topic, packet);
        if old.is_none() {
            self.retaineds.inc();
        }
        Ok(old)
    }

    #[inline]
    fn get(&self, topic: &str) -> Result<P> {
        let t = self.parse_topic(topic)?;
        self.messages.read().get(&t).cloned()
    }

    #[inline]
    fn remove(&self, topic: &str) -> Result<Option<P>> {
        let t = self.parse_topic(topic)?;
        let old = self.messages.write().remove(&t);
        if old.is_some() {
            log::debug!("retained message cleared, topic: {}", topic);
            self.retaineds.dec();
        }
        Ok(old)
    }

    #[inline]
    fn matches(&self, topic_filter: &str) -> Result<Vec<(TopicName, P)>> {
        let filter = Topic::parse(topic_filter, self.delims)?;
        if !filter.is_filter() {
            return Err(TopicError::InvalidTopic(format!(
                "wildcard is only allowed as the last level, `{topic_filter}`"
            ))
            .into());
        }
        let retains = self
            .messages
            .read()
            .matches(&filter)
            .into_iter()
            .map(|(t, p)| (TopicName::from(t.to_string_with(self.delims)), p))
            .collect();
        Ok(retains)
    }

    #[inline]
    fn count(&self) -> isize {
        self.retaineds.count()
    }

    #[inline]
    fn max(&self) -> isize {
        self.retaineds.max()
    }
}

pub type RetainTree<V> = Node<V>;

pub struct Node<V> {
    value: Option<V>,
    branches: HashMap<Level, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { value: None, branches: HashMap::default() }
    }
}

impl<V> Node<V>
where
    V: fmt::Debug + Clone,
{
    /// Stores `value` at `topic`, returns the overwritten value.
    #[inline]
    pub fn insert(&mut self, topic: &Topic, value: V) -> Option<V> {
        let mut path = topic.levels().clone();
        path.reverse();
        self._insert(path, value)
    }

    #[inline]
    fn _insert(&mut self, mut path: Vec<Level>, value: V) -> Option<V> {
        if let Some(first) = path.pop() {
            self.branches.entry(first).or_default()._insert(path, value)
        } else {
            self.value.replace(value)
        }
    }

    /// `NotFound` when the path does not exist, `InvalidNode` when it exists but holds no value.
    #[inline]
    pub fn get(&self, topic: &Topic) -> Result<&V> {
        let mut node = self;
        for l in topic.levels() {
            node = node.branches.get(l).ok_or_else(|| MqError::NotFound(format!("retained topic {topic}")))?;
        }
        node.value.as_ref().ok_or_else(|| MqError::InvalidNode(format!("no retained message at {topic}")))
    }

    #[inline]
    pub fn remove(&mut self, topic: &Topic) -> Option<V> {
        self._remove(topic.levels().as_ref())
    }

    #[inline]
    fn _remove(&mut self, path: &[Level]) -> Option<V> {
        if path.is_empty() {
            self.value.take()
        } else {
            let t = &path[0];
            if let Some(x) = self.branches.get_mut(t) {
                let res = x._remove(&path[1..]);
                if x.value.is_none() && x.branches.is_empty() {
                    self.branches.remove(t);
                }
                res
            } else {
                None
            }
        }
    }

    //remove all values `v` for which `f(&mut v)` returns `false`.
    #[inline]
    pub fn retain<F>(&mut self, max_limit: usize, mut f: F) -> usize
    where
        F: FnMut(&mut V) -> bool,
    {
        let mut removeds = 0;
        self._retain(&mut f, &mut removeds, max_limit);
        removeds
    }

    #[inline]
    fn _retain<F>(&mut self, f: &mut F, removeds: &mut usize, max_limit: usize)
    where
        F: FnMut(&mut V) -> bool,
    {
        if *removeds >= max_limit {
            return;
        }
        self.branches.retain(|_, child_node| {
            child_node._retain(f, removeds, max_limit);
            if let Some(v) = child_node.value.as_mut() {
                if !f(v) {
                    let _ = child_node.value.take();
                    *removeds += 1;
                }
            }
            !(child_node.value.is_none() && child_node.branches.is_empty())
        });
    }

    /// Exact filters yield the value stored at that topic. A filter ending in the wildcard yields
    /// every value strictly below the prefix node, the same topics the router would match.
    #[inline]
    pub fn matches(&self, filter: &Topic) -> Vec<(Topic, V)> {
        let mut out = Vec::new();
        let mut node = self;
        let mut sub_path = Vec::with_capacity(filter.len());
        for l in filter.levels() {
            if l.is_wildcard() {
                for (k, n) in node.branches.iter() {
                    let mut sub_path = sub_path.clone();
                    sub_path.push(k.clone());
                    n._descendants(sub_path, &mut out);
                }
                return out;
            }
            match node.branches.get(l) {
                Some(n) => {
                    node = n;
                    sub_path.push(l.clone());
                }
                None => return out,
            }
        }
        if let Some(v) = node.value.as_ref() {
            out.push((Topic::from(sub_path), v.clone()));
        }
        out
    }

    #[inline]
    fn _descendants(&self, sub_path: Vec<Level>, out: &mut Vec<(Topic, V)>) {
        if let Some(v) = self.value.as_ref() {
            out.push((Topic::from(sub_path.clone()), v.clone()));
        }
        for (k, n) in self.branches.iter() {
            let mut sub_path = sub_path.clone();
            sub_path.push(k.clone());
            n._descendants(sub_path, out);
        }
    }

    #[inline]
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    #[inline]
    pub fn children(&self) -> &HashMap<Level, Node<V>> {
        &self.branches
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        if self.value.is_some() {
            len + 1
        } else {
            len
        }
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
            out.push(format!("{} {}, value: {:?}", " ".repeat(depth * 3), l, n.value));
            n._list(out, top - 1, depth + 1);
        }
    }
}

impl<V> fmt::Debug for Node<V>
where
    V: fmt::Debug + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {{ nodes_size: {}, values_size: {} }}", self.nodes_size(), self.values_size())
    }
}
