pub mod change;
pub mod flags;
pub mod ids;
pub mod path;
pub mod value;

pub use change::ChangeKind;
pub use flags::{NodeFlags, PropFlags};
pub use ids::{NodeId, OverlayId, Phandle, PropId, SubscriberId};
pub use value::PropValue;
