//! Overlay fragments: detached subtrees describing an edit to apply to a
//! live target, plus the descriptor conventions for locating that target.

use livetree_core::{Phandle, PropValue};

use crate::error::EngineError;

/// One property carried by a fragment. A name starting with `-` marks the
/// named property for removal from the target.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentProp {
    pub name: String,
    pub value: PropValue,
}

/// A detached subtree. Child names starting with `-` mark the named child
/// for detachment from the target; everything else is merged recursively.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub name: String,
    pub type_name: Option<String>,
    pub phandle: Phandle,
    pub properties: Vec<FragmentProp>,
    pub children: Vec<Fragment>,
}

impl Fragment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: None,
            phandle: Phandle::NONE,
            properties: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn with_phandle(mut self, phandle: Phandle) -> Self {
        self.phandle = phandle;
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.properties.push(FragmentProp {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_child(mut self, child: Fragment) -> Self {
        self.children.push(child);
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropValue> {
        self.properties
            .iter()
            .find(|prop| prop.name == name)
            .map(|prop| &prop.value)
    }

    pub fn child(&self, name: &str) -> Option<&Fragment> {
        self.children.iter().find(|child| child.name == name)
    }
}

/// How an overlay locates its live target: a phandle carried in the
/// descriptor's `target` property, or a `target-path` string.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSpec {
    Phandle(Phandle),
    Path(String),
}

/// One target/fragment pair, ready to apply. `device_depth` (zero means
/// uncapped) restricts which nodes may generate device transitions.
#[derive(Debug, Clone)]
pub struct OverlayInfo {
    pub target: TargetSpec,
    pub fragment: Fragment,
    pub device_depth: usize,
}

impl OverlayInfo {
    pub fn new(target: TargetSpec, fragment: Fragment) -> Self {
        Self {
            target,
            fragment,
            device_depth: 0,
        }
    }

    pub fn with_device_depth(mut self, depth: usize) -> Self {
        self.device_depth = depth;
        self
    }

    /// Build a changeset from a container tree. Each child of the
    /// container that carries a `target` (phandle) or `target-path`
    /// property and an `__overlay__` child contributes one pair; children
    /// missing either are skipped. An optional `depth` property sets the
    /// device-transition cap.
    pub fn changeset_from_container(container: &Fragment) -> Result<Vec<OverlayInfo>, EngineError> {
        let mut infos = Vec::new();
        for child in &container.children {
            let Some(content) = child.child("__overlay__") else {
                continue;
            };
            let target = if let Some(handle) = child.property("target").and_then(PropValue::as_u32)
            {
                TargetSpec::Phandle(Phandle::new(handle))
            } else if let Some(path) = child.property("target-path").and_then(|v| v.as_str()) {
                TargetSpec::Path(path.to_string())
            } else {
                continue;
            };
            let device_depth = child
                .property("depth")
                .and_then(PropValue::as_u32)
                .unwrap_or(0) as usize;
            infos.push(OverlayInfo {
                target,
                fragment: content.clone(),
                device_depth,
            });
        }
        if infos.is_empty() {
            return Err(EngineError::InvalidFragment(
                "container holds no applicable target/fragment pairs".to_string(),
            ));
        }
        Ok(infos)
    }
}
