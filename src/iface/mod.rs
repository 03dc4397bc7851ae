//! L2 interface drivers.
//!
//! The dispatcher only ever talks to the [`Interface`] trait: a raw
//! Ethernet device with a blocking read, a concurrent-safe write, and a
//! known MAC and maximum packet size. The memory driver backs tests; the
//! TAP driver (Linux) attaches to a real kernel device.

mod memory;
#[cfg(target_os = "linux")]
mod tap;

pub use memory::{MemoryHandle, MemoryInterface};
#[cfg(target_os = "linux")]
pub use tap::TapInterface;

use async_trait::async_trait;
use smoltcp::wire::EthernetAddress;

use crate::error::Result;

/// A host-provided layer-2 device supplying raw Ethernet frames.
#[async_trait]
pub trait Interface: Send + Sync {
    /// Stable identifier of the attachment (device name or uuid).
    fn id(&self) -> &str;

    /// The interface's own MAC address.
    fn hardware_addr(&self) -> EthernetAddress;

    /// Largest frame `read_packet` can return or `write_packet` accepts.
    fn max_packet_size(&self) -> usize;

    /// Read one frame into `buf`. Blocks until a frame arrives; returns
    /// `Ok(None)` at end-of-stream (shutdown), and the frame length plus
    /// a driver flags word otherwise. Single-consumer: only the reader
    /// task calls this.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<Option<(usize, u32)>>;

    /// Write one frame. Safe to call concurrently from any handler.
    async fn write_packet(&self, frame: &[u8], flags: u32) -> Result<usize>;

    /// Shut the device down; pending and future reads return
    /// end-of-stream.
    async fn close(&self) -> Result<()>;
}
