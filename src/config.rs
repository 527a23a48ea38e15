//! Compile-time capacity and addressing constants.
//!
//! There is no configuration file and no command-line surface for this engine (see the plugin
//! ABI and external-interfaces sections of the spec this crate implements): every tunable here is
//! fixed at build time, exactly like the `#define`s in a C reference implementation of the same
//! design. Tests that need a smaller table (to exercise admission refusal, for example) pass their
//! own sizes to [`crate::table::RelayTable::new`] and [`crate::engine::Engine::new`] rather than
//! overriding anything here.

/// Maximum number of simultaneously active relay sessions.
pub const MAX_RELAYS: usize = 1024;

/// Maximum number of plugins the hook table can hold.
pub const MAX_PLUGINS: usize = 32;

/// Read-chunk size and the initial capacity of a session's pending-out buffer.
pub const BUFFER_SIZE: usize = 4096;

/// Fixed listening port for the production binary.
pub const LISTEN_PORT: u16 = 3033;

/// `listen(2)` backlog. Small by design: this is a transparent interception point, not an
/// outward-facing server expected to absorb a thundering herd of new connections.
pub const LISTEN_BACKLOG: u32 = 2;

/// Default plugin directory scanned once at startup.
pub const PLUGIN_DIR: &str = "./plugins";

/// Shared-module filename suffix a candidate plugin file must end with.
pub const SO_SUFFIX: &str = ".so";
