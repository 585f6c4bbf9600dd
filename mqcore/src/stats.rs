//! Engine statistics.
//!
//! Live counters are updated by [`ServerContext`] as clients connect, subscribe and exchange
//! packets. [`Stats::snapshot`] copies them and pulls the gauges owned by the router and the
//! retained storage.

use serde::{Deserialize, Serialize};
use serde_json::json;

use mqcore_utils::Counter;

use crate::context::ServerContext;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Stats {
    pub connections: Counter,
    pub subscriptions: Counter,
    pub retaineds: Counter,
    pub out_inflights: Counter,
    pub in_inflights: Counter,
    //recipients skipped because their outbound id space was full
    pub exhausted: Counter,

    pub routes: Counter,
    pub topics_tree: usize,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn snapshot(&self, scx: &ServerContext) -> Self {
        let retain = scx.retain();
        Self {
            connections: self.connections.clone(),
            subscriptions: self.subscriptions.clone(),
            retaineds: Counter::new_with(retain.count(), retain.max()),
            out_inflights: self.out_inflights.clone(),
            in_inflights: self.in_inflights.clone(),
            exhausted: self.exhausted.clone(),
            routes: scx.router().routes(),
            topics_tree: scx.router().topics_tree(),
        }
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "connections.count": self.connections.count(),
            "connections.max": self.connections.max(),
            "subscriptions.count": self.subscriptions.count(),
            "subscriptions.max": self.subscriptions.max(),
            "retaineds.count": self.retaineds.count(),
            "retaineds.max": self.retaineds.max(),
            "out_inflights.count": self.out_inflights.count(),
            "out_inflights.max": self.out_inflights.max(),
            "in_inflights.count": self.in_inflights.count(),
            "in_inflights.max": self.in_inflights.max(),
            "exhausted": self.exhausted.count(),
            "routes.count": self.routes.count(),
            "routes.max": self.routes.max(),
            "topics_tree": self.topics_tree,
        })
    }
}
