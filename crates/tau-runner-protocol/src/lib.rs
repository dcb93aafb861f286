//! Wire contract between the chat bridge and remote runner agents.
//!
//! Runners report projects and coding-assistant sessions over a persistent
//! connection using `{type, data}` JSON envelopes. This crate owns the typed
//! shape of those envelopes plus the raw session and message records emitted
//! by the different CLI backends.
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use tau_runner_protocol::{parse_runner_envelope, RunnerEvent};
//!
//! let raw = r#"{
//!   "type": "sync_session_discovered",
//!   "data": {
//!     "session": {
//!       "sessionId": "abc",
//!       "cliType": "codex",
//!       "projectPath": "/work/app/"
//!     }
//!   }
//! }"#;
//!
//! let Some(RunnerEvent::SyncSessionDiscovered(event)) = parse_runner_envelope(raw)? else {
//!     panic!("expected discovery event");
//! };
//! assert_eq!(event.session.session_key(), "codex:abc");
//! # Ok(())
//! # }
//! ```

pub mod runner_protocol_contract;
pub mod runner_protocol_envelope;

pub use runner_protocol_contract::*;
pub use runner_protocol_envelope::*;
