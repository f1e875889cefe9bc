// src/syscalls.rs
//
// Thin libc wrappers for the reactor: listening-socket setup, accept,
// the epoll instance, and the non-blocking read/writev paths. Linux only;
// the whole design is built around epoll one-shot semantics.
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};

use libc::{c_int, c_void, socklen_t};

use crate::error::{PetrelError, PetrelResult};

pub use libc::epoll_event;

/// Interest in read readiness.
pub const READABLE: i32 = libc::EPOLLIN;
/// Interest in write readiness.
pub const WRITABLE: i32 = libc::EPOLLOUT;

/// Set O_NONBLOCK on a descriptor.
pub fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Best-effort SO_REUSEPORT on a socket. Failure is ignored by callers on
/// accepted sockets; it only matters for the listener.
pub fn set_reuseport(fd: c_int) -> io::Result<()> {
    let one: c_int = 1;
    unsafe {
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create a non-blocking IPv4 TCP listener with SO_REUSEADDR + SO_REUSEPORT.
pub fn create_listen_socket(host: &str, port: u16) -> PetrelResult<c_int> {
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| PetrelError::Setup(format!("invalid bind address {host:?}")))?;

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        if let Err(e) = set_reuseport(fd) {
            libc::close(fd);
            return Err(e.into());
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(ip.octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Accept one pending connection. `Ok(None)` means the backlog is drained.
pub fn accept_connection(listen_fd: c_int) -> PetrelResult<Option<(c_int, SocketAddrV4)>> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut sin as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let peer = SocketAddrV4::new(ip, u16::from_be(sin.sin_port));
            Ok(Some((fd, peer)))
        }
    }
}

/// The process-wide readiness instance. Connection descriptors are always
/// registered edge-triggered with hangup detection; one-shot registration
/// suppresses redelivery until the owning thread re-arms the descriptor.
pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> PetrelResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    fn flags(interests: i32, one_shot: bool) -> u32 {
        let mut ev = interests | libc::EPOLLET | libc::EPOLLRDHUP;
        if one_shot {
            ev |= libc::EPOLLONESHOT;
        }
        ev as u32
    }

    /// Add a descriptor, forcing it non-blocking.
    pub fn register(&self, fd: c_int, token: u64, interests: i32, one_shot: bool) -> PetrelResult<()> {
        let mut event = epoll_event {
            events: Self::flags(interests, one_shot),
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        set_nonblocking(fd)?;
        Ok(())
    }

    /// Re-register a one-shot descriptor for a new interest set. Required
    /// after every consumed event, or the descriptor stays silent.
    pub fn rearm(&self, fd: c_int, token: u64, interests: i32) -> PetrelResult<()> {
        let mut event = epoll_event {
            events: Self::flags(interests, true),
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Remove a descriptor from the instance and close it.
    pub fn unregister(&self, fd: c_int) -> PetrelResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    libc::close(fd);
                    return Err(err.into());
                }
            }
            libc::close(fd);
        }
        Ok(())
    }

    /// Blocking wait. EINTR reports zero events so the caller can re-check
    /// its shutdown flag and retry; any other failure is fatal.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> PetrelResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// One non-blocking read. `Ok(None)` means the socket is drained,
/// `Ok(Some(0))` means the peer closed.
pub fn recv_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<Option<usize>> {
    unsafe {
        let res = libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// One non-blocking scatter/gather write over up to two segments.
/// `Ok(None)` means the kernel buffer is full.
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> io::Result<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(2);
    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}
