use serde::{Deserialize, Serialize};

/// The fixed set of reconfiguration kinds carried on the notifier bus.
///
/// Structural kinds pair with an inverse used on revert; the device kinds
/// are emitted by the overlay engine after a transaction settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    AttachNode,
    DetachNode,
    AddProperty,
    RemoveProperty,
    UpdateProperty,
    DynamicCreateDevice,
    DynamicDestroyDevice,
}

impl ChangeKind {
    /// Inverse kind dispatched when an applied change is rolled back.
    /// `UpdateProperty` is self-paired (the saved previous property swaps
    /// roles); the device kinds pair with each other.
    pub fn inverse(self) -> ChangeKind {
        match self {
            ChangeKind::AttachNode => ChangeKind::DetachNode,
            ChangeKind::DetachNode => ChangeKind::AttachNode,
            ChangeKind::AddProperty => ChangeKind::RemoveProperty,
            ChangeKind::RemoveProperty => ChangeKind::AddProperty,
            ChangeKind::UpdateProperty => ChangeKind::UpdateProperty,
            ChangeKind::DynamicCreateDevice => ChangeKind::DynamicDestroyDevice,
            ChangeKind::DynamicDestroyDevice => ChangeKind::DynamicCreateDevice,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::AttachNode => "AttachNode",
            ChangeKind::DetachNode => "DetachNode",
            ChangeKind::AddProperty => "AddProperty",
            ChangeKind::RemoveProperty => "RemoveProperty",
            ChangeKind::UpdateProperty => "UpdateProperty",
            ChangeKind::DynamicCreateDevice => "DynamicCreateDevice",
            ChangeKind::DynamicDestroyDevice => "DynamicDestroyDevice",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_is_an_involution() {
        for kind in [
            ChangeKind::AttachNode,
            ChangeKind::DetachNode,
            ChangeKind::AddProperty,
            ChangeKind::RemoveProperty,
            ChangeKind::UpdateProperty,
            ChangeKind::DynamicCreateDevice,
            ChangeKind::DynamicDestroyDevice,
        ] {
            assert_eq!(kind.inverse().inverse(), kind);
        }
    }
}
