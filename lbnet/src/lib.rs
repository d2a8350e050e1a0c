//! lbnet - control plane of a software load balancer and router.
//!
//! The crate keeps an in-memory model of ports, bridge domains, L2 forwarding
//! entries, interface addresses, neighbors, routes and NAT/firewall rules,
//! and mirrors every change into an external forwarding engine through an
//! asynchronous work queue.
//!
//! Modules, leaf first:
//! - `counter`: bounded hardware-mark allocators
//! - `model`: MAC addresses and port kind/property bit sets
//! - `dp`: datapath work items, the `Datapath` trait and the broker thread
//! - `lpm`: longest-prefix-match table
//! - `port`, `vlan`, `fdb`, `l3`, `neighbor`, `route`: forwarding tables
//! - `rules`: NAT/load-balancing and firewall rule engine
//! - `mirror`, `policer`: port mirroring and rate limiting
//! - `session`: user sessions and their uplink classifiers
//! - `zone`: the aggregate owning one instance of every table
//! - `ticker`, `probe`: periodic reconciliation and endpoint health checks
//! - `xsync`: connection-tracking replication between cluster peers
//! - `api`: the inbound control interface
//! - `config`: daemon configuration

pub mod api;
pub mod config;
pub mod counter;
pub mod dp;
pub mod error;
pub mod fdb;
pub mod l3;
pub mod lpm;
pub mod mirror;
pub mod model;
pub mod neighbor;
pub mod policer;
pub mod port;
pub mod probe;
pub mod route;
pub mod rules;
pub mod session;
pub mod ticker;
pub mod vlan;
pub mod xsync;
pub mod zone;

pub use api::{NetApi, NetApiImpl};
pub use config::Config;
pub use error::NetError;
pub use model::{MacAddr, PortKind, PortProp, TunnelType};
pub use zone::{Zone, ZoneH};
