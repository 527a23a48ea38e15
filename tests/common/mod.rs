//! Shared scaffolding for the integration tests: a loopback-only destination resolver (standing
//! in for the kernel's `SO_ORIGINAL_DST` lookup, which only answers for sockets a real netfilter
//! `REDIRECT` rule actually touched) and a helper that single-steps an `Engine` the way
//! `tests/tcp.rs` in the reactor this crate is built on single-steps a bare `Poll` instance.

#![allow(dead_code)]

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::Once;
use std::time::{Duration, Instant};

use socket2::Socket;

use relayd::engine::Engine;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Stand-in for `addr::original_dst` used only by this test suite: a plain loopback `connect()`
/// never passes through a netfilter `REDIRECT` rule, so there is no conntrack entry for the real
/// lookup to recover. The accepted socket's own local address is used as "the destination"
/// instead, which is enough to exercise every code path downstream of admission.
pub fn loopback_resolver(fd: RawFd) -> io::Result<SocketAddrV4> {
    unsafe {
        let mut raw: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = libc::getsockname(fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len);
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
        let port = u16::from_be(raw.sin_port);
        Ok(SocketAddrV4::new(ip, port))
    }
}

pub fn any_loopback() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("client connect failed");
    stream.set_nodelay(true).ok();
    stream
}

/// Connects with a deliberately small `SO_RCVBUF`, so a server that bursts far more than
/// `recv_buf` bytes while this client isn't reading is guaranteed to see its own send buffer fill
/// and start queuing, rather than relying on whatever the kernel's default buffer autotuning
/// happens to allow over loopback.
pub fn connect_with_small_recv_buffer(addr: SocketAddr, recv_buf: usize) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("client connect failed");
    stream.set_nodelay(true).ok();
    let socket = Socket::from(stream);
    socket
        .set_recv_buffer_size(recv_buf)
        .expect("failed to shrink client receive buffer");
    socket.into()
}

/// Single-steps `engine` with short poll timeouts until `done` returns `true` or `timeout`
/// elapses. Returns whether `done` fired. A client thread performing blocking I/O on its own
/// `TcpStream` runs concurrently with these steps; the engine itself is driven entirely from the
/// calling thread, matching the single-threaded reactor this crate implements.
pub fn drive_until(engine: &mut Engine, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return done();
        }
        engine
            .poll_once(Some(Duration::from_millis(10)))
            .expect("poll_once failed");
    }
}
