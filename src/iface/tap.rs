//! Linux TAP interface driver.
//!
//! Attaches to a kernel TAP device via /dev/net/tun (IFF_TAP,
//! IFF_NO_PI) and drives the nonblocking fd through tokio readiness.
//! Bringing the device up and addressing it is the administrator's job.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use smoltcp::wire::EthernetAddress;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;

use crate::error::{DriverError, Error, Result};

use super::Interface;

// From <linux/if_tun.h>.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

pub struct TapInterface {
    name: String,
    mac: EthernetAddress,
    max_packet_size: usize,
    fd: AsyncFd<OwnedFd>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl TapInterface {
    /// Attach to the TAP device `name`, creating it if absent (requires
    /// /dev/net/tun access, typically CAP_NET_ADMIN).
    pub fn open(name: &str) -> Result<Arc<Self>> {
        let raw = unsafe {
            let path = b"/dev/net/tun\0";
            libc::open(
                path.as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(map_os_error(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let cname = CString::new(name)
            .map_err(|e| Error::invalid(format!("invalid TAP device name '{name}': {e}")))?;
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        unsafe {
            libc::strncpy(
                ifr.ifr_name.as_mut_ptr(),
                cname.as_ptr(),
                libc::IFNAMSIZ - 1,
            );
            ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;
            if libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &ifr) < 0 {
                return Err(map_os_error(io::Error::last_os_error()));
            }
        }

        let mac = query_mac(&cname)?;
        let mtu = query_mtu(&cname)?;

        Ok(Arc::new(Self {
            name: name.to_string(),
            mac,
            // Ethernet header on top of the device MTU.
            max_packet_size: mtu + 14,
            fd: AsyncFd::new(fd)?,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }))
    }
}

#[async_trait]
impl Interface for TapInterface {
    fn id(&self) -> &str {
        &self.name
    }

    fn hardware_addr(&self) -> EthernetAddress {
        self.mac
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<Option<(usize, u32)>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            tokio::select! {
                guard = self.fd.readable() => {
                    let mut guard = guard?;
                    match guard.try_io(|fd| {
                        let n = unsafe {
                            libc::read(
                                fd.as_raw_fd(),
                                buf.as_mut_ptr() as *mut libc::c_void,
                                buf.len(),
                            )
                        };
                        if n < 0 {
                            Err(io::Error::last_os_error())
                        } else {
                            Ok(n as usize)
                        }
                    }) {
                        Ok(Ok(n)) => return Ok(Some((n, 0))),
                        Ok(Err(err)) => return Err(map_os_error(err)),
                        Err(_would_block) => continue,
                    }
                }
                _ = self.closed_notify.notified() => return Ok(None),
            }
        }
    }

    async fn write_packet(&self, frame: &[u8], _flags: u32) -> Result<usize> {
        if frame.len() > self.max_packet_size {
            return Err(DriverError::PacketTooLarge.into());
        }
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(DriverError::SetupIncomplete.into());
            }
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|fd| {
                let n = unsafe {
                    libc::write(
                        fd.as_raw_fd(),
                        frame.as_ptr() as *const libc::c_void,
                        frame.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(err)) => return Err(map_os_error(err)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
        Ok(())
    }
}

fn map_os_error(err: io::Error) -> Error {
    let mapped = match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => DriverError::PermissionDenied,
        Some(libc::ENOMEM) => DriverError::OutOfMemory,
        Some(libc::EINVAL) => DriverError::InvalidArgument,
        Some(libc::EMSGSIZE) => DriverError::PacketTooLarge,
        Some(libc::ENOBUFS) => DriverError::BuffersExhausted,
        _ => return Error::Io(err),
    };
    mapped.into()
}

fn query_mac(name: &CString) -> Result<EthernetAddress> {
    with_query_socket(|sock| {
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        unsafe {
            libc::strncpy(ifr.ifr_name.as_mut_ptr(), name.as_ptr(), libc::IFNAMSIZ - 1);
            if libc::ioctl(sock, libc::SIOCGIFHWADDR, &mut ifr) < 0 {
                return Err(map_os_error(io::Error::last_os_error()));
            }
            let data = ifr.ifr_ifru.ifru_hwaddr.sa_data;
            let mut mac = [0u8; 6];
            for (dst, src) in mac.iter_mut().zip(data.iter()) {
                *dst = *src as u8;
            }
            Ok(EthernetAddress(mac))
        }
    })
}

fn query_mtu(name: &CString) -> Result<usize> {
    with_query_socket(|sock| {
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        unsafe {
            libc::strncpy(ifr.ifr_name.as_mut_ptr(), name.as_ptr(), libc::IFNAMSIZ - 1);
            if libc::ioctl(sock, libc::SIOCGIFMTU, &mut ifr) < 0 {
                return Err(map_os_error(io::Error::last_os_error()));
            }
            Ok(ifr.ifr_ifru.ifru_mtu as usize)
        }
    })
}

fn with_query_socket<T>(f: impl FnOnce(libc::c_int) -> Result<T>) -> Result<T> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(map_os_error(io::Error::last_os_error()));
    }
    let result = f(sock);
    unsafe { libc::close(sock) };
    result
}
