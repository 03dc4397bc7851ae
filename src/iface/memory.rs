//! In-memory interface driver for tests.
//!
//! Frames pushed through the [`MemoryHandle`] come out of
//! `read_packet`; frames the pipeline writes are captured for the test
//! to inspect. Dropping the handle ends the read stream, which the
//! dispatcher treats as driver EOF.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use smoltcp::wire::EthernetAddress;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::error::{DriverError, Result};

use super::Interface;

const DEFAULT_MAX_PACKET_SIZE: usize = 1518;

pub struct MemoryInterface {
    id: String,
    mac: EthernetAddress,
    max_packet_size: usize,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
    closed_notify: Notify,
}

/// Test-side handle: inject frames, read back captured writes.
pub struct MemoryHandle {
    inject: mpsc::Sender<Vec<u8>>,
    captured: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryInterface {
    pub fn new(mac: EthernetAddress) -> (Arc<Self>, MemoryHandle) {
        Self::with_max_packet_size(mac, DEFAULT_MAX_PACKET_SIZE)
    }

    pub fn with_max_packet_size(
        mac: EthernetAddress,
        max_packet_size: usize,
    ) -> (Arc<Self>, MemoryHandle) {
        let (inject, rx) = mpsc::channel(64);
        let (tx, captured) = mpsc::unbounded_channel();
        let iface = Arc::new(Self {
            id: "memory".to_string(),
            mac,
            max_packet_size,
            rx: Mutex::new(rx),
            tx,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });
        let handle = MemoryHandle {
            inject,
            captured: Mutex::new(captured),
        };
        (iface, handle)
    }
}

#[async_trait]
impl Interface for MemoryInterface {
    fn id(&self) -> &str {
        &self.id
    }

    fn hardware_addr(&self) -> EthernetAddress {
        self.mac
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<Option<(usize, u32)>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if frame.len() > buf.len() {
                        return Err(DriverError::PacketTooLarge.into());
                    }
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(Some((frame.len(), 0)))
                }
                None => Ok(None),
            },
            _ = self.closed_notify.notified() => Ok(None),
        }
    }

    async fn write_packet(&self, frame: &[u8], _flags: u32) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::SetupIncomplete.into());
        }
        if frame.len() > self.max_packet_size {
            return Err(DriverError::PacketTooLarge.into());
        }
        self.tx
            .send(frame.to_vec())
            .map_err(|_| DriverError::Generic)?;
        Ok(frame.len())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
        Ok(())
    }
}

impl MemoryHandle {
    /// Queue a frame for the pipeline to read.
    pub async fn inject(&self, frame: Vec<u8>) -> Result<()> {
        self.inject
            .send(frame)
            .await
            .map_err(|_| DriverError::SetupIncomplete.into())
    }

    /// Next frame the pipeline wrote, or `None` once the interface is
    /// gone.
    pub async fn next_written(&self) -> Option<Vec<u8>> {
        self.captured.lock().await.recv().await
    }
}
