//! Infrastructure layer: everything that touches the network, the disk or
//! another process.

pub mod network;
pub mod storage;
pub mod ui_bridge;
