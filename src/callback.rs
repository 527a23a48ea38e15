//! Callback Bus: the three `extern "C"` entry points handed to every plugin through its
//! [`InitInfo`](crate::plugin::InitInfo), and the thread-local pointer they use to reach back into
//! the [`Engine`] that owns the session.
//!
//! A plugin holds only a function pointer and a `*mut PluginRecord` handed to it on some earlier
//! hook call; neither carries a safe route back to the owning `Engine`. The engine's own loop and
//! every plugin invocation run on a single thread by design (see the concurrency model this crate
//! implements), so a thread-local raw pointer to the currently running `Engine` closes that gap
//! without reaching for process-wide mutable state shared across threads — which matters in
//! practice because `cargo test` runs multiple `Engine` instances concurrently on different
//! threads, and each must only ever see its own.

use std::cell::Cell;
use std::os::raw::c_int;
use std::ptr;

use crate::engine::Engine;
use crate::plugin::{PluginRecord, PAUSE};

thread_local! {
    static CURRENT_ENGINE: Cell<*mut Engine> = Cell::new(ptr::null_mut());
}

/// Installs `engine` as the Callback Bus target for the current thread for as long as the guard
/// lives. Dropping it clears the slot, so a dangling pointer is never left behind once `engine`
/// itself is about to go out of scope.
pub(crate) struct EngineGuard {
    previous: *mut Engine,
}

impl EngineGuard {
    pub(crate) fn install(engine: &mut Engine) -> EngineGuard {
        let previous = CURRENT_ENGINE.with(|cell| cell.replace(engine as *mut Engine));
        EngineGuard { previous }
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        CURRENT_ENGINE.with(|cell| cell.set(self.previous));
    }
}

/// Re-entrant by construction: a hook invoked from within `with_engine` may itself call
/// `relay_send`/`relay_close`/`relay_pause_recv`, which calls back in here while the outer call is
/// still on the stack. Both calls see the same `Engine` because both run on this one thread
/// between one `EngineGuard::install` and its matching drop; nothing else may alias it meanwhile.
fn with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> Option<R> {
    CURRENT_ENGINE.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            return None;
        }
        // SAFETY: a non-null pointer was installed by `EngineGuard::install` for this thread and
        // is restored/cleared before the `Engine` it points to is dropped. The engine loop never
        // runs two hooks concurrently; reentry only ever happens nested on this same call stack.
        Some(f(unsafe { &mut *ptr }))
    })
}

/// `relay_send`: fans `on_send` out to every plugin, then sends or queues the (possibly
/// plugin-mutated) buffer toward the client socket. Returns the byte count the caller is
/// accountable for, or `-1` if the session named by `record` no longer exists.
pub extern "C" fn relay_send(
    record: *mut PluginRecord,
    buffer: *const u8,
    length: usize,
    flags: c_int,
) -> isize {
    // SAFETY: `record` and the `buffer`/`length` pair are exactly what the engine itself handed
    // this plugin (directly or via a prior hook call), per the plugin ABI this ties into.
    let relay_id = unsafe { (*record).relay_id };
    let bytes = unsafe { std::slice::from_raw_parts(buffer, length) };

    with_engine(|engine| engine.relay_send(relay_id, bytes, flags)).unwrap_or(-1)
}

/// `relay_close`: tears the named session down immediately. Returns `0`, or `-1` if the session
/// was already gone (including a second call made from within its own close fan-out).
pub extern "C" fn relay_close(record: *mut PluginRecord) -> c_int {
    let relay_id = unsafe { (*record).relay_id };
    with_engine(|engine| engine.relay_close(relay_id)).unwrap_or(-1)
}

/// `relay_pause_recv`: arms or disarms read interest on the session's client socket.
pub extern "C" fn relay_pause_recv(record: *mut PluginRecord, pause: c_int) {
    let relay_id = unsafe { (*record).relay_id };
    with_engine(|engine| engine.relay_pause_recv(relay_id, pause == PAUSE));
}
