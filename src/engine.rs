//! The event loop: accepts connections, drives the read/write path for every relay session, and
//! hosts the Callback Bus the plugins call back through.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, SocketAddrV4};
use std::os::raw::c_int;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::addr::original_dst;
use crate::callback::{self, EngineGuard};
use crate::config;
use crate::error::{Error, Result};
use crate::plugin::loader::{self, LoadedPlugin};
use crate::plugin::{HookTable, InitInfo, PluginRecord};
use crate::table::RelayTable;

const LISTENER_TOKEN: Token = Token(0);

/// Recovers the pre-redirect destination of a freshly accepted socket, per spec §4.4 step 2.
/// A function pointer rather than a hardcoded call so the integration test suite can stand in
/// for the kernel's `SO_ORIGINAL_DST` lookup, which only yields a real answer for a socket that
/// actually passed through a netfilter `REDIRECT`/`TPROXY` rule — something a test harness has no
/// way to set up against a loopback listener. Production always uses [`addr::original_dst`].
pub type DstResolver = fn(RawFd) -> io::Result<SocketAddrV4>;

/// The single-threaded reactor. One `Engine` owns the listening socket, every live session, the
/// resolved plugin hook tables, and (for plugins loaded from disk) the `Library` handles that keep
/// their code mapped.
pub struct Engine {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    table: RelayTable,
    hooks: Vec<HookTable>,
    streams: Box<[Option<TcpStream>]>,
    interests: Box<[Option<Interest>]>,
    // Keeps plugin shared objects mapped for as long as `hooks` points into them. Empty when an
    // `Engine` is built from hooks supplied directly (as the test suite does).
    _plugins: Vec<LoadedPlugin>,
    resolve_dst: DstResolver,
}

fn is_transient(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn bind_listener(addr: SocketAddrV4, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| Error::Bind { addr, source })?;
    socket
        .set_reuse_address(true)
        .map_err(|source| Error::Bind { addr, source })?;
    socket
        .bind(&SockAddr::from(SocketAddr::V4(addr)))
        .map_err(|source| Error::Bind { addr, source })?;
    socket
        .listen(backlog)
        .map_err(|source| Error::Bind { addr, source })?;
    socket
        .set_nonblocking(true)
        .map_err(|source| Error::Bind { addr, source })?;
    Ok(TcpListener::from_std(socket.into()))
}

impl Engine {
    /// Production constructor: scans `plugin_dir` and binds to `listen_addr`.
    pub fn new(
        listen_addr: SocketAddrV4,
        plugin_dir: &Path,
        max_relays: usize,
        buffer_size: usize,
    ) -> Result<Engine> {
        let plugins = loader::load(plugin_dir)?;
        let hooks = plugins.iter().map(|p| *p.hooks()).collect();
        Engine::build(listen_addr, hooks, plugins, max_relays, buffer_size, original_dst)
    }

    /// Test constructor: hooks are supplied directly (hand-written `extern "C"` stand-ins), no
    /// plugin directory is scanned and no `Library` is kept alive. Uses the real
    /// [`addr::original_dst`] resolver, so it only admits sessions for sockets actually redirected
    /// by a netfilter rule; see [`Engine::with_hooks_and_resolver`] for loopback-only tests.
    pub fn with_hooks(
        listen_addr: SocketAddrV4,
        hooks: Vec<HookTable>,
        max_relays: usize,
        buffer_size: usize,
    ) -> Result<Engine> {
        Engine::with_hooks_and_resolver(listen_addr, hooks, max_relays, buffer_size, original_dst)
    }

    /// Test constructor that additionally overrides how the pre-redirect destination is
    /// recovered, so a test can drive a real accept/read/write cycle against a plain loopback
    /// listener without a netfilter `REDIRECT` rule in place.
    pub fn with_hooks_and_resolver(
        listen_addr: SocketAddrV4,
        hooks: Vec<HookTable>,
        max_relays: usize,
        buffer_size: usize,
        resolve_dst: DstResolver,
    ) -> Result<Engine> {
        Engine::build(listen_addr, hooks, Vec::new(), max_relays, buffer_size, resolve_dst)
    }

    fn build(
        listen_addr: SocketAddrV4,
        hooks: Vec<HookTable>,
        plugins: Vec<LoadedPlugin>,
        max_relays: usize,
        buffer_size: usize,
        resolve_dst: DstResolver,
    ) -> Result<Engine> {
        let poll = Poll::new().map_err(Error::Poll)?;
        let mut listener = bind_listener(listen_addr, config::LISTEN_BACKLOG as i32)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(Error::Register)?;

        let plugin_count = hooks.len();
        let table = RelayTable::new(max_relays, plugin_count, buffer_size);
        let streams = (0..max_relays).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        let interests = (0..max_relays).map(|_| None).collect::<Vec<_>>().into_boxed_slice();

        let mut engine = Engine {
            poll,
            events: Events::with_capacity(1024),
            listener,
            table,
            hooks,
            streams,
            interests,
            _plugins: plugins,
            resolve_dst,
        };

        engine.run_on_init();
        log::info!(
            "engine listening on {} with {} plugin(s), table capacity {}",
            listen_addr,
            engine.hooks.len(),
            engine.table.capacity()
        );
        Ok(engine)
    }

    fn run_on_init(&mut self) {
        let _guard = EngineGuard::install(self);
        for (plugin_id, hook) in self.hooks.iter().enumerate() {
            let info = InitInfo {
                event_loop: std::ptr::null_mut(),
                plugin_id,
                relay_send: callback::relay_send,
                relay_close: callback::relay_close,
                relay_pause_recv: callback::relay_pause_recv,
            };
            (hook.on_init)(&info as *const InitInfo);
        }
    }

    /// Number of currently active sessions.
    pub fn live_count(&self) -> usize {
        self.table.live_count()
    }

    /// The address the listening socket is actually bound to. Primarily useful in tests that bind
    /// an ephemeral port (`:0`) and need to learn which port the kernel assigned.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the reactor until a fatal polling error occurs. Does not return otherwise.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.poll_once(None)?;
        }
    }

    /// Waits for and processes exactly one batch of readiness events. `None` blocks indefinitely;
    /// a test driving the loop by hand typically passes a short timeout instead.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.poll.poll(&mut self.events, timeout).map_err(Error::Poll)?;

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        let _guard = EngineGuard::install(self);
        for (token, readable, writable) in ready {
            if token == LISTENER_TOKEN {
                if readable {
                    self.accept();
                }
                continue;
            }

            let relay_id = token.0 - 1;
            if relay_id >= self.table.capacity() || !self.table.get(relay_id).active {
                continue;
            }
            if readable {
                self.handle_readable(relay_id);
            }
            if writable && self.table.get(relay_id).active {
                self.handle_writable(relay_id);
            }
        }
        Ok(())
    }

    // ---- Acceptor (spec §4.4) ----

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _peer)) => self.handle_accepted(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed, listener remains armed: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_accepted(&mut self, stream: TcpStream) {
        let fd = stream.as_raw_fd();

        let dst = match (self.resolve_dst)(fd) {
            Ok(dst) => dst,
            Err(e) => {
                log::warn!("admission refused for fd {}: no original destination: {}", fd, e);
                return;
            }
        };
        let src = match stream.peer_addr() {
            Ok(SocketAddr::V4(v4)) => v4,
            _ => {
                log::warn!("admission refused for fd {}: not an IPv4 peer", fd);
                return;
            }
        };

        let relay_id = match self.table.allocate(fd, src, dst) {
            Some(id) => id,
            None => {
                log::warn!("admission refused: relay table full ({} live)", self.table.live_count());
                return;
            }
        };

        self.streams[relay_id] = Some(stream);
        self.interests[relay_id] = None;

        for i in 0..self.hooks.len() {
            let record = &mut self.table.get_mut(relay_id).plugin_state[i] as *mut PluginRecord;
            (self.hooks[i].on_connect)(record);
        }

        self.table.get_mut(relay_id).read_armed = true;
        if let Err(e) = self.sync_interest(relay_id) {
            log::warn!("failed to register session {}: {}", relay_id, e);
            self.close(relay_id);
            return;
        }

        log::info!("session {} accepted: {} -> {}", relay_id, src, dst);
    }

    // ---- Read path (spec §4.5) ----

    fn handle_readable(&mut self, relay_id: usize) {
        loop {
            if !self.table.get(relay_id).active {
                return;
            }

            let mut buf = vec![0u8; config::BUFFER_SIZE];
            let stream = match self.streams[relay_id].as_mut() {
                Some(s) => s,
                None => return,
            };

            match stream.read(&mut buf) {
                Ok(0) => {
                    self.close(relay_id);
                    return;
                }
                Ok(n) => {
                    self.fanout_recv(relay_id, buf, n);
                    if !self.table.get(relay_id).active {
                        return;
                    }
                    // The selector registers interest edge-triggered: keep draining this socket
                    // until it reports EAGAIN, or a later arrival that doesn't cross a fresh edge
                    // would never be reported.
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_transient(&e) => return,
                Err(_) => {
                    self.close(relay_id);
                    return;
                }
            }
        }
    }

    fn fanout_recv(&mut self, relay_id: usize, mut buf: Vec<u8>, n: usize) {
        let mut len = n;
        for i in 0..self.hooks.len() {
            if !self.table.get(relay_id).active {
                return;
            }
            let record = &mut self.table.get_mut(relay_id).plugin_state[i] as *mut PluginRecord;
            let mut local_len = len;
            (self.hooks[i].on_recv)(record, buf.as_mut_ptr(), &mut local_len as *mut usize);
            len = local_len.min(buf.len());
        }
    }

    // ---- Write path (spec §4.5) ----

    fn handle_writable(&mut self, relay_id: usize) {
        if self.table.get(relay_id).pending_out.is_empty() {
            self.table.get_mut(relay_id).write_armed = false;
            let _ = self.sync_interest(relay_id);
            return;
        }

        let result = loop {
            let slot = self.table.get(relay_id);
            let stream = self.streams[relay_id]
                .as_mut()
                .expect("stream present while slot is active");
            match stream.write(&slot.pending_out) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match result {
            Ok(sent) => {
                let slot = self.table.get_mut(relay_id);
                slot.pending_out.drain(0..sent);
                if slot.pending_out.is_empty() {
                    slot.write_armed = false;
                    let _ = self.sync_interest(relay_id);
                    self.notify_backpressure(relay_id, false);
                }
            }
            Err(e) if is_transient(&e) => {}
            Err(_) => self.close(relay_id),
        }
    }

    fn notify_backpressure(&mut self, relay_id: usize, pause: bool) {
        use crate::plugin::{PAUSE, RESUME};
        let flag: c_int = if pause { PAUSE } else { RESUME };
        for i in 0..self.hooks.len() {
            if !self.table.get(relay_id).active {
                return;
            }
            let record = &mut self.table.get_mut(relay_id).plugin_state[i] as *mut PluginRecord;
            (self.hooks[i].pause_remote_recv)(record, flag);
        }
    }

    // ---- Callback Bus (spec §4.5) ----

    pub(crate) fn relay_send(&mut self, relay_id: usize, buffer: &[u8], _flags: c_int) -> isize {
        if !self.table.get(relay_id).active {
            return -1;
        }

        let mut buf = buffer.to_vec();
        let mut len = buf.len();
        buf.resize(len + config::BUFFER_SIZE, 0);

        for i in 0..self.hooks.len() {
            if !self.table.get(relay_id).active {
                return -1;
            }
            let record = &mut self.table.get_mut(relay_id).plugin_state[i] as *mut PluginRecord;
            let mut local_len = len;
            (self.hooks[i].on_send)(record, buf.as_mut_ptr(), &mut local_len as *mut usize);
            len = local_len.min(buf.len());
        }

        if !self.table.get(relay_id).active {
            return -1;
        }
        buf.truncate(len);

        let had_pending = !self.table.get(relay_id).pending_out.is_empty();
        let sent = if had_pending {
            0
        } else {
            let stream = self.streams[relay_id]
                .as_mut()
                .expect("stream present while slot is active");
            loop {
                match stream.write(&buf) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Ok(k) => break k,
                    Err(e) if is_transient(&e) => break 0,
                    Err(_) => {
                        self.close(relay_id);
                        return -1;
                    }
                }
            }
        };

        if sent < buf.len() {
            let slot = self.table.get_mut(relay_id);
            slot.pending_out.extend_from_slice(&buf[sent..]);
            slot.write_armed = true;
            let _ = self.sync_interest(relay_id);
            if !had_pending {
                self.notify_backpressure(relay_id, true);
            }
        }

        buf.len() as isize
    }

    pub(crate) fn relay_close(&mut self, relay_id: usize) -> c_int {
        if !self.table.get(relay_id).active {
            return -1;
        }
        self.close(relay_id);
        0
    }

    pub(crate) fn relay_pause_recv(&mut self, relay_id: usize, pause: bool) {
        if !self.table.get(relay_id).active {
            return;
        }
        self.table.get_mut(relay_id).read_armed = !pause;
        let _ = self.sync_interest(relay_id);
    }

    // ---- Close path (spec §4.5) ----

    fn close(&mut self, relay_id: usize) {
        // Flipped before the fan-out runs: a plugin that re-enters `relay_close` for this same
        // session from within `on_close` must see "already gone", not recurse.
        self.table.get_mut(relay_id).active = false;

        for i in 0..self.hooks.len() {
            let record = &mut self.table.get_mut(relay_id).plugin_state[i] as *mut PluginRecord;
            (self.hooks[i].on_close)(record);
        }

        if self.interests[relay_id].take().is_some() {
            if let Some(stream) = self.streams[relay_id].as_mut() {
                let _ = self.poll.registry().deregister(stream);
            }
        }
        self.streams[relay_id] = None;
        self.table.release(relay_id);
        log::info!("session {} closed", relay_id);
    }

    // ---- Interest bookkeeping ----

    fn sync_interest(&mut self, relay_id: usize) -> io::Result<()> {
        let slot = self.table.get(relay_id);
        let desired = match (slot.read_armed, slot.write_armed) {
            (false, false) => None,
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        };
        let current = self.interests[relay_id];
        if current == desired {
            return Ok(());
        }

        let token = Token(relay_id + 1);
        {
            let stream = self.streams[relay_id]
                .as_mut()
                .expect("stream present while a relay slot is active");
            match (current, desired) {
                (Some(_), Some(interest)) => {
                    self.poll.registry().reregister(stream, token, interest)?;
                }
                (None, Some(interest)) => {
                    self.poll.registry().register(stream, token, interest)?;
                }
                (Some(_), None) => {
                    self.poll.registry().deregister(stream)?;
                }
                (None, None) => unreachable!(),
            }
        }
        self.interests[relay_id] = desired;
        Ok(())
    }
}
