//! File system helpers shared by the catalog source and the local gateway.

pub mod walker;
