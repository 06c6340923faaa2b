//! PTY bridge - pure PTY lifecycle library
//!
//! Spawns a single command under a pseudo-terminal and hands back a cloneable
//! handle for writing input, resizing, killing, and subscribing to output.
//! It has no HTTP dependencies and no knowledge of what runs inside the PTY.
//!
//! # Example
//!
//! ```no_run
//! use pty_bridge::{PtyConfig, spawn_pty};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = spawn_pty(PtyConfig {
//!         command: "tmux".to_string(),
//!         args: vec!["attach-session".to_string(), "-t".to_string(), "demo".to_string()],
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//!     let mut rx = handle.subscribe();
//!     while let Ok(chunk) = rx.recv().await {
//!         print!("{}", String::from_utf8_lossy(&chunk.data));
//!     }
//! }
//! ```

mod error;
mod pty;

pub use error::PtyError;
pub use pty::{PtyChunk, PtyConfig, PtyHandle, PtyState, spawn_pty};
