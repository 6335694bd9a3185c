//! SocketCAN transport (Linux).
//!
//! The connect sequence is run step by step instead of through
//! `CanSocket::open` so that each failure can be reported on its own:
//! socket creation, interface resolution, bind, and the two receive options.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use socketcan::{CanSocket, SocketOptions};

use crate::core::error::{CanbusError, Result};
use crate::core::frame::FRAME_SIZE;

use super::config::CanConfig;
use super::transport::{Connector, Transport};

/// Opens raw `PF_CAN` sockets bound to the configured interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketCanConnector;

impl Connector for SocketCanConnector {
    type Transport = CanSocketTransport;

    fn open(&self, config: &CanConfig) -> Result<CanSocketTransport> {
        config.validate()?;
        let interface = config.can_interface.as_str();

        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::PF_CAN,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::CAN_RAW,
            )
        };
        if raw < 0 {
            return Err(CanbusError::SocketCreate(io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nothing else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let ifindex = resolve_ifindex(interface)?;
        bind_can(fd.as_raw_fd(), ifindex).map_err(|source| CanbusError::SocketBind {
            interface: interface.to_string(),
            source,
        })?;

        let socket = CanSocket::from(fd);

        let err_filter = if config.receive_error_frames {
            socket.set_error_filter_accept_all()
        } else {
            socket.set_error_filter_drop_all()
        };
        err_filter.map_err(|source| CanbusError::SocketOption {
            option: "CAN_RAW_ERR_FILTER",
            source,
        })?;

        socket
            .set_recv_own_msgs(config.receive_own_messages)
            .map_err(|source| CanbusError::SocketOption {
                option: "CAN_RAW_RECV_OWN_MSGS",
                source,
            })?;

        if let Some(timeout) = config.read_timeout {
            set_receive_timeout(socket.as_raw_fd(), timeout).map_err(|source| {
                CanbusError::SocketOption {
                    option: "SO_RCVTIMEO",
                    source,
                }
            })?;
        }

        #[cfg(feature = "tracing-support")]
        tracing::debug!(
            "{} socket descriptor: {} (ifindex {})",
            interface,
            socket.as_raw_fd(),
            ifindex
        );

        Ok(CanSocketTransport { socket })
    }
}

/// A bound raw CAN socket.
#[derive(Debug)]
pub struct CanSocketTransport {
    socket: CanSocket,
}

impl Transport for CanSocketTransport {
    fn recv(&self, record: &mut [u8; FRAME_SIZE]) -> io::Result<usize> {
        // SAFETY: the buffer is valid for FRAME_SIZE bytes and outlives the call.
        let n = unsafe {
            libc::read(
                self.socket.as_raw_fd(),
                record.as_mut_ptr().cast::<libc::c_void>(),
                FRAME_SIZE,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn send(&self, record: &[u8; FRAME_SIZE]) -> io::Result<usize> {
        // SAFETY: the buffer is valid for FRAME_SIZE bytes and outlives the call.
        let n = unsafe {
            libc::write(
                self.socket.as_raw_fd(),
                record.as_ptr().cast::<libc::c_void>(),
                FRAME_SIZE,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn close(self) -> io::Result<()> {
        let fd = self.socket.into_raw_fd();
        // SAFETY: `fd` was released by the socket and is closed exactly once here.
        if unsafe { libc::close(fd) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn descriptor(&self) -> Option<i32> {
        Some(self.socket.as_raw_fd())
    }
}

/// Resolve an interface name to its index.
fn resolve_ifindex(interface: &str) -> Result<u32> {
    let name = CString::new(interface).map_err(|_| {
        CanbusError::config(format!("CAN interface name {:?} contains NUL", interface))
    })?;

    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(CanbusError::config(format!(
            "unable to find CAN interface {}: {}",
            interface,
            io::Error::last_os_error()
        )));
    }
    Ok(index)
}

fn bind_can(fd: RawFd, ifindex: u32) -> io::Result<()> {
    // SAFETY: sockaddr_can is plain data; all-zero is a valid value.
    let mut addr: libc::sockaddr_can = unsafe { mem::zeroed() };
    addr.can_family = libc::AF_CAN as libc::sa_family_t;
    addr.can_ifindex = ifindex as libc::c_int;

    // SAFETY: `addr` is a fully initialized sockaddr_can and the length matches it.
    let rc = unsafe {
        libc::bind(
            fd,
            (&addr as *const libc::sockaddr_can).cast::<libc::sockaddr>(),
            mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_receive_timeout(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };

    // SAFETY: `tv` is a valid timeval and the length matches it.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            (&tv as *const libc::timeval).cast::<libc::c_void>(),
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
