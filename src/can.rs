//! Raw CAN endpoints and the 16-byte wire record.
//!
//! Everything above this module is endpoint-agnostic: the hardware talks
//! through [`SocketCan`], tests and simulators through a [`Loopback`] pair.

use async_trait::async_trait;
use bytemuck::{Pod, Zeroable};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

pub const CAN_MAX_DLEN: usize = 8;

/// CAN frame record matching linux/include/uapi/linux/can.h
#[derive(Debug, Default, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct CanRecord {
    pub can_id: u32,
    pub len: u8,
    pub pad: u8,
    pub res0: u8,
    pub len8_dlc: u8,
    pub can_data: [u8; CAN_MAX_DLEN],
}

impl From<CanRecord> for [u8; 16] {
    fn from(record: CanRecord) -> Self {
        bytemuck::cast(record)
    }
}

impl From<[u8; 16]> for CanRecord {
    fn from(bytes: [u8; 16]) -> Self {
        bytemuck::cast(bytes)
    }
}

/// One bus endpoint: a single point of frame I/O.
#[async_trait]
pub trait CanEndpoint: Send + Sync + 'static {
    async fn send_record(&self, record: &CanRecord) -> io::Result<()>;
    async fn recv_record(&self) -> io::Result<CanRecord>;
}

/// Raw SocketCAN endpoint following the AsyncFd + libc pattern.
pub struct SocketCan {
    async_fd: AsyncFd<RawFd>,
    interface_name: String,
}

impl SocketCan {
    pub fn open(interface_name: &str) -> crate::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::from(libc::AF_CAN),
            socket2::Type::RAW,
            Some(socket2::Protocol::from(libc::CAN_RAW)),
        )?;

        let if_index = unsafe {
            let cstr = std::ffi::CString::new(interface_name)
                .map_err(|_| crate::TalusError::Can("Invalid interface name".into()))?;
            libc::if_nametoindex(cstr.as_ptr())
        };

        if if_index == 0 {
            return Err(crate::TalusError::UnknownBus(interface_name.to_string()));
        }

        let addr = libc::sockaddr_can {
            can_family: libc::AF_CAN as _,
            can_ifindex: if_index as i32,
            can_addr: unsafe { std::mem::zeroed() },
        };

        let mut sockaddr_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                &addr as *const _ as *const u8,
                &mut sockaddr_storage as *mut _ as *mut u8,
                std::mem::size_of::<libc::sockaddr_can>(),
            );
        }

        let sockaddr = unsafe {
            socket2::SockAddr::new(
                sockaddr_storage,
                std::mem::size_of::<libc::sockaddr_can>() as u32,
            )
        };

        socket.bind(&sockaddr)?;
        socket.set_nonblocking(true)?;

        let raw_fd = socket.as_raw_fd();
        let async_fd = AsyncFd::new(raw_fd)?;

        // AsyncFd owns the fd from here on
        std::mem::forget(socket);

        Ok(SocketCan {
            async_fd,
            interface_name: interface_name.to_string(),
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }
}

#[async_trait]
impl CanEndpoint for SocketCan {
    async fn send_record(&self, record: &CanRecord) -> io::Result<()> {
        let bytes: [u8; 16] = (*record).into();

        loop {
            let mut guard = self.async_fd.writable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        bytes.as_ptr() as *const libc::c_void,
                        bytes.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(_)) => break,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    async fn recv_record(&self) -> io::Result<CanRecord> {
        let mut buffer = [0u8; 16];

        loop {
            let mut guard = self.async_fd.readable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buffer.as_mut_ptr() as *mut libc::c_void,
                        buffer.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else if n == 0 {
                    Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Socket closed"))
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(_)) => break,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }

        Ok(CanRecord::from(buffer))
    }
}

/// In-memory endpoint. [`Loopback::pair`] yields two cross-connected ends;
/// the far end plays the firmware side in tests and simulation.
pub struct Loopback {
    tx: mpsc::UnboundedSender<CanRecord>,
    rx: Mutex<mpsc::UnboundedReceiver<CanRecord>>,
}

impl Loopback {
    pub fn pair() -> (Loopback, Loopback) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Loopback {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Loopback {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl CanEndpoint for Loopback {
    async fn send_record(&self, record: &CanRecord) -> io::Result<()> {
        self.tx
            .send(*record)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer dropped"))
    }

    async fn recv_record(&self) -> io::Result<CanRecord> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "loopback peer dropped"))
    }
}
