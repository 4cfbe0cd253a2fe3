#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod addr;
pub mod comtree;
pub mod config;
pub mod ctl;
pub mod iface;
pub mod link;
pub mod packet;
pub mod qmgr;
pub mod route;
pub mod router;
pub mod stats;
pub mod store;
pub mod time;

pub use addr::FAdr;
pub use comtree::{ComtreeEntry, ComtreeTable, LinkSet};
pub use ctl::{CpAttr, CpType, CtlPkt, RrType};
pub use iface::InterfaceTable;
pub use link::{LinkTable, NodeType};
pub use packet::{Header, PktType};
pub use qmgr::QueueManager;
pub use route::{RouteTable, RouteTarget};
pub use router::{ConfigFiles, Limits, Router};
pub use store::PacketStore;
pub use time::Micros;

/// UDP port all forest traffic uses.
pub const FOREST_PORT: u16 = 30123;
