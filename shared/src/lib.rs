pub mod types;

pub use types::{Peer, Protocol, Service, Subnet, Topology};
