//! `procbridge`: child process launcher with relayed standard streams.
//!
//! A [`Session`] launches one external program at a time and bridges its
//! stdin, stdout and stderr through internal buffers and optional
//! caller-visible queues:
//! - pipe bridge workers move bytes between OS pipes and bounded queues
//! - a single multiplexer task merges every event source into ordered
//!   buffer and mirror writes
//! - an exit waiter owns the child and tears the run down in a fixed order
//! - `reset` terminates with escalating force and reinitializes the session
//!
//! ```no_run
//! # async fn demo() -> procbridge::Result<()> {
//! use procbridge::{ProcessAttributes, Session};
//!
//! let session = Session::new(ProcessAttributes::default());
//! let mut mirror = session.stdout_mirror();
//! let status = session.start_and_wait(None, "echo", ["hello"]).await?;
//! assert!(status.success());
//! assert_eq!(session.stdout(), "hello\n");
//! while let Some(chunk) = mirror.recv().await {
//!     print!("{}", String::from_utf8_lossy(&chunk));
//! }
//! session.reset().await;
//! # Ok(())
//! # }
//! ```

pub mod attributes;
pub mod config;
mod control;
pub mod error;
mod escalation;
mod multiplexer;
mod pipe;
mod relay;
pub mod session;
mod state;
pub mod tracing_init;
mod waiter;
mod worker;

pub use attributes::{AttributesBuilder, Credential, ProcessAttributes, group_id, user_id};
pub use config::{EscalationConfig, SessionConfig, load_config};
pub use error::{Error, Result};
pub use nix::sys::signal::Signal;
pub use relay::Chunk;
pub use session::Session;
pub use tokio_util::sync::CancellationToken;
