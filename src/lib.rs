//! A transparent TCP interception relay driven by a single-threaded, non-blocking reactor, with
//! behavior supplied entirely by dynamically loaded plugin modules.
//!
//! The engine itself moves no application bytes on its own initiative: it accepts connections,
//! recovers each one's pre-redirect destination, and fans every read/write event out to whichever
//! plugins were found in the plugin directory at startup. Plugins are the terminus for received
//! bytes and the only source of bytes sent back to a client, reached through the three Callback
//! Bus entry points in [`callback`].

pub mod addr;
pub mod callback;
pub mod config;
pub mod engine;
pub mod error;
pub mod plugin;
pub mod table;

pub use engine::Engine;
pub use error::{Error, Result};
