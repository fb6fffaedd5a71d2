use bitflags::bitflags;

bitflags! {
    /// Node metadata bits.
    ///
    /// `POPULATED` and `POPULATED_BUS` belong to the device factory; the
    /// tree stores them but never interprets them.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// Heap-owned node created at runtime; reclaimed on release.
        const DYNAMIC = 1 << 0;
        /// Not currently linked into the live tree.
        const DETACHED = 1 << 1;
        const POPULATED = 1 << 2;
        const POPULATED_BUS = 1 << 3;
    }
}

bitflags! {
    /// Property metadata bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PropFlags: u32 {
        /// Created at runtime (overlay copy or transaction add).
        const DYNAMIC = 1 << 0;
    }
}
