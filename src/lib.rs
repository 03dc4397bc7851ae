//! swtchbrd: a userspace virtual network switchboard.
//!
//! Attaches to a host-provided layer-2 interface, synthesizes a small
//! logical network of named hosts with allocated MAC/IPv4/IPv6
//! identities, and forwards selected TCP/UDP flows through user-defined
//! rules, rewriting addresses and ports toward real endpoints.
//!
//! # Example
//!
//! ```no_run
//! use swtchbrd::iface::MemoryInterface;
//! use swtchbrd::hosts::HostSpec;
//! use swtchbrd::{Protocol, Rule, Vnet};
//!
//! #[tokio::main]
//! async fn main() -> swtchbrd::Result<()> {
//!     let (iface, _handle) =
//!         MemoryInterface::new(smoltcp::wire::EthernetAddress([0x02, 0, 0, 0, 0, 1]));
//!     let vnet = Vnet::run(iface)?;
//!
//!     let host = vnet.add_host(HostSpec::named("web").ipv4([10, 0, 0, 30].into()).up())?;
//!     vnet.add_rule(Rule {
//!         id: String::new(),
//!         protocol: Protocol::Tcp,
//!         src_host_id: host.id,
//!         src_port: 80,
//!         dst_ip: Some([192, 168, 1, 10].into()),
//!         dst_port: 8080,
//!     })?;
//!
//!     vnet.shutdown();
//!     vnet.wait().await;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod hosts;
pub mod iface;
pub mod peers;
pub mod pool;
pub mod ports;
pub mod protocols;
pub mod routes;
pub mod rules;
pub mod shutdown;
pub mod system;

// Host-side bridges
pub mod proxy;

// Re-exports for convenience
pub use dispatcher::Vnet;
pub use error::{DriverError, Error, Result};
pub use protocols::Protocol;
pub use rules::Rule;

// Prelude for common imports
pub mod prelude {
    pub use crate::dispatcher::Vnet;
    pub use crate::error::{DriverError, Error, Result};
    pub use crate::hosts::{Host, HostSpec};
    pub use crate::iface::Interface;
    pub use crate::protocols::Protocol;
    pub use crate::routes::RouteSpec;
    pub use crate::rules::Rule;
    pub use crate::shutdown::Shutdown;
}
