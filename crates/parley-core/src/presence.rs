//! Presence tracking for a channel.
//!
//! The server sends one `presence_state` snapshot after join and then
//! `presence_diff` events carrying joins and leaves. Each meta is tagged
//! with a `phx_ref` that identifies one connection of a presence key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::{event, ChannelEvent};

/// One presence key (e.g. a user) and its live connections.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub key: String,
    pub metas: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct Presence {
    state: BTreeMap<String, Vec<Value>>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a channel event. Returns `true` when the event was a presence
    /// event, i.e. a sync happened and [`Presence::list`] changed.
    pub fn apply(&mut self, evt: &ChannelEvent) -> bool {
        match evt.event.as_str() {
            event::PRESENCE_STATE => {
                self.state = parse_state(&evt.payload);
                true
            }
            event::PRESENCE_DIFF => {
                let joins = evt.payload.get("joins").map(parse_state).unwrap_or_default();
                let leaves = evt.payload.get("leaves").map(parse_state).unwrap_or_default();
                self.merge_joins(joins);
                self.remove_leaves(leaves);
                true
            }
            _ => false,
        }
    }

    pub fn list(&self) -> Vec<PresenceEntry> {
        self.state
            .iter()
            .map(|(key, metas)| PresenceEntry {
                key: key.clone(),
                metas: metas.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    fn merge_joins(&mut self, joins: BTreeMap<String, Vec<Value>>) {
        for (key, joined) in joins {
            let joined_refs: Vec<&Value> = joined.iter().filter_map(phx_ref).collect();
            let mut metas: Vec<Value> = self
                .state
                .remove(&key)
                .unwrap_or_default()
                .into_iter()
                .filter(|m| phx_ref(m).map_or(true, |r| !joined_refs.contains(&r)))
                .collect();
            metas.extend(joined.iter().cloned());
            let _ = self.state.insert(key, metas);
        }
    }

    fn remove_leaves(&mut self, leaves: BTreeMap<String, Vec<Value>>) {
        for (key, left) in leaves {
            let Some(current) = self.state.get_mut(&key) else {
                continue;
            };
            let left_refs: Vec<&Value> = left.iter().filter_map(phx_ref).collect();
            current.retain(|m| phx_ref(m).map_or(true, |r| !left_refs.contains(&r)));
            if current.is_empty() {
                let _ = self.state.remove(&key);
            }
        }
    }
}

fn phx_ref(meta: &Value) -> Option<&Value> {
    meta.get("phx_ref")
}

fn parse_state(payload: &Value) -> BTreeMap<String, Vec<Value>> {
    let Some(map) = payload.as_object() else {
        return BTreeMap::new();
    };
    map.iter()
        .map(|(key, entry)| {
            let metas = entry
                .get("metas")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            (key.clone(), metas)
        })
        .collect()
}
