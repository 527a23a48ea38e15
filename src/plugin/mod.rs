//! The stable plugin ABI: the types a dynamically loaded filter module is compiled against.
//!
//! Everything in this module is `#[repr(C)]` or a bare function pointer so that a plugin written
//! in C, or any other language that can export a C ABI, sees exactly the layout this module
//! defines. Nothing here may gain or lose a field without breaking every compiled plugin.

pub mod loader;

use std::ffi::c_void;
use std::os::raw::c_int;

use crate::addr::RawSockAddr;

/// Per-session, per-plugin record passed to every hook invocation for that plugin.
///
/// `relay_id` is a back-index into the engine's relay table rather than a pointer to session
/// state, so the engine can always re-resolve (and validate) the owning slot instead of trusting
/// a plugin-held pointer into memory that may have been released. `data` is owned entirely by the
/// plugin: the engine stores it, passes it back on every subsequent hook call for this session,
/// and never reads or frees it.
#[repr(C)]
pub struct PluginRecord {
    pub plugin_id: usize,
    pub relay_id: usize,
    pub data: *mut c_void,
    pub shared_data: *mut u8,
    pub shared_data_len: usize,
    pub src_addr: *const RawSockAddr,
    pub dst_addr: *const RawSockAddr,
    pub takeovered: *mut bool,
}

/// Called once, at startup, after every plugin has been registered but before any session exists.
pub type OnInitFn = extern "C" fn(*const InitInfo);
/// Called once per new session, immediately after the relay slot is allocated.
pub type OnConnectFn = extern "C" fn(*mut PluginRecord);
/// Called once per successful read, with the length field mutable in place.
pub type OnRecvFn = extern "C" fn(*mut PluginRecord, *mut u8, *mut usize);
/// Called once per `relay_send` call, before the engine attempts to send or queue the bytes.
pub type OnSendFn = extern "C" fn(*mut PluginRecord, *mut u8, *mut usize);
/// Called once per session, during close, so the plugin can release its `data`.
pub type OnCloseFn = extern "C" fn(*mut PluginRecord);
/// Called whenever the engine's backpressure state toggles (`1` = pause, `0` = resume).
pub type PauseRemoteRecvFn = extern "C" fn(*mut PluginRecord, c_int);

/// The three Callback Bus entry points a plugin uses to reach back into the engine, handed to
/// every plugin via [`InitInfo`].
pub type RelaySendFn = extern "C" fn(*mut PluginRecord, *const u8, usize, c_int) -> isize;
pub type RelayCloseFn = extern "C" fn(*mut PluginRecord) -> c_int;
pub type RelayPauseRecvFn = extern "C" fn(*mut PluginRecord, c_int);

/// The record passed to a plugin's `on_init`, exactly once, at startup.
#[repr(C)]
pub struct InitInfo {
    /// Opaque handle to the event loop. Plugins are not meant to dereference this; it exists so a
    /// plugin that manages its own I/O sources can, in principle, be handed a way to reach the
    /// shared loop in a future extension of this ABI. Current plugins only need the three
    /// callback pointers below.
    pub event_loop: *mut c_void,
    pub plugin_id: usize,
    pub relay_send: RelaySendFn,
    pub relay_close: RelayCloseFn,
    pub relay_pause_recv: RelayPauseRecvFn,
}

/// One loaded plugin's resolved hook symbols, registered in discovery order. This order is the
/// fan-out order for every event for the remainder of the process.
#[derive(Clone, Copy)]
pub struct HookTable {
    pub on_init: OnInitFn,
    pub on_connect: OnConnectFn,
    pub on_recv: OnRecvFn,
    pub on_send: OnSendFn,
    pub on_close: OnCloseFn,
    pub pause_remote_recv: PauseRemoteRecvFn,
}

/// `1`/`0` flag conventions used on the wire of the ABI, kept as named constants so call sites
/// read as intent rather than bare integers.
pub const PAUSE: c_int = 1;
pub const RESUME: c_int = 0;
