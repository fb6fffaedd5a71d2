//! Structural tree captures for equality checks and fingerprinting.

use serde::{Deserialize, Serialize};

use livetree_core::{NodeId, PropValue};

use crate::tree::TreeState;

/// Deep capture of one node: identity, live properties in list order, dead
/// property names, and children. Children are sorted by name so captures
/// compare independently of sibling order, which carries no meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub type_name: Option<String>,
    pub path: String,
    pub phandle: u32,
    pub properties: Vec<(String, PropValue)>,
    pub dead_properties: Vec<String>,
    pub children: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub root: NodeSnapshot,
}

impl TreeSnapshot {
    pub(crate) fn capture(state: &TreeState) -> Self {
        Self {
            root: capture_node(state, state.root),
        }
    }

    pub fn to_msgpack(&self) -> Vec<u8> {
        rmp_serde::to_vec(self).expect("snapshot serialization cannot fail")
    }

    /// Content hash of the capture; equal trees hash equal.
    pub fn fingerprint(&self) -> [u8; 32] {
        *blake3::hash(&self.to_msgpack()).as_bytes()
    }
}

fn capture_node(state: &TreeState, id: NodeId) -> NodeSnapshot {
    let data = &state.arena.node(id).data;
    let properties = data
        .properties
        .iter()
        .map(|prop| {
            let prop = state.arena.prop(*prop);
            (prop.name.clone(), prop.value.clone())
        })
        .collect();
    let mut dead_properties: Vec<String> = data
        .dead_properties
        .iter()
        .map(|prop| state.arena.prop(*prop).name.clone())
        .collect();
    dead_properties.sort();
    let mut children: Vec<NodeSnapshot> = data
        .children
        .iter()
        .map(|child| capture_node(state, *child))
        .collect();
    children.sort_by(|a, b| a.name.cmp(&b.name));
    NodeSnapshot {
        name: data.name.clone(),
        type_name: data.type_name.clone(),
        path: data.path.clone(),
        phandle: data.phandle.raw(),
        properties,
        dead_properties,
        children,
    }
}
