//! IPv4 socket address representation crossing the plugin FFI boundary, and recovery of the
//! pre-redirect destination from a transparently-redirected accepted socket.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

/// `#[repr(C)]` view of an IPv4 socket address handed to plugins through a [`PluginRecord`].
///
/// Fields are stored in network byte order, matching `struct sockaddr_in`'s `sin_addr`/`sin_port`
/// — a plugin written in C can reinterpret this as the tail of a `sockaddr_in` without any
/// conversion.
///
/// [`PluginRecord`]: crate::plugin::PluginRecord
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSockAddr {
    /// IPv4 address, network byte order.
    pub addr: u32,
    /// Port, network byte order.
    pub port: u16,
}

impl From<SocketAddrV4> for RawSockAddr {
    fn from(addr: SocketAddrV4) -> Self {
        RawSockAddr {
            addr: u32::from_be_bytes(addr.ip().octets()),
            port: addr.port().to_be(),
        }
    }
}

impl From<RawSockAddr> for SocketAddrV4 {
    fn from(raw: RawSockAddr) -> Self {
        SocketAddrV4::new(Ipv4Addr::from(raw.addr.to_be_bytes()), u16::from_be(raw.port))
    }
}

/// Linux's `getsockopt(SOL_IP, SO_ORIGINAL_DST)`, used by netfilter's `REDIRECT`/`TPROXY` targets
/// to let the program that absorbed a transparently-redirected connection recover where the
/// client actually dialed. Not present in `libc`'s constant set because it's a netfilter-specific
/// extension rather than a generic socket option; the numeric value is stable ABI
/// (`include/uapi/linux/netfilter_ipv4.h`).
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Recovers the original (pre-redirect) destination of an accepted, transparently-redirected
/// socket. Returns an error if the kernel has no connection-tracking entry for this socket, which
/// is the case whenever the accepted connection wasn't actually subject to a `REDIRECT` rule.
pub fn original_dst(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    // SAFETY: `raw`/`len` describe a correctly sized buffer for `getsockopt` to fill; `fd` is a
    // valid, open socket for the duration of this call.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut raw as *mut libc::sockaddr_in as *mut libc::c_void,
            &mut len,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
    let port = u16::from_be(raw.sin_port);
    Ok(SocketAddrV4::new(ip, port))
}
