//! Session-sync reconciliation engine for runner-hosted CLI sessions.
//!
//! Presents every remote coding-assistant session reported by a runner as one
//! persistent chat thread. The engine owns cross-runner/project/session state,
//! de-duplicates message delivery across overlapping pull and push paths,
//! serializes thread creation per session, and retries lossy pull exchanges.
//!
//! Components, leaf-first:
//! - [`SyncStateStore`]: in-memory runner/project/session hierarchy, ownership
//!   markers, pending requests, dedup index and creation locks.
//! - [`normalize_messages`]: raw CLI records to canonical content blocks.
//! - [`DeliveryQueue`]: per-thread ordered, paced outbound posting.
//! - [`SessionSyncService`]: the orchestrator driving discovery, thread
//!   creation, reconciliation and retries.

pub mod runner_sync_collaborators;
pub mod runner_sync_config;
pub mod runner_sync_delivery;
pub mod runner_sync_normalizer;
pub mod runner_sync_orchestrator;
pub mod runner_sync_record_store;
pub mod runner_sync_render;
pub mod runner_sync_state;

pub use runner_sync_collaborators::*;
pub use runner_sync_config::*;
pub use runner_sync_delivery::*;
pub use runner_sync_normalizer::*;
pub use runner_sync_orchestrator::*;
pub use runner_sync_record_store::*;
pub use runner_sync_render::*;
pub use runner_sync_state::*;
