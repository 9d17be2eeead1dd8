//! Order Book Mirror
//!
//! Keeps a live, in-memory copy of an exchange's limit order books from a
//! WebSocket market-data stream of snapshots and incremental deltas, and
//! serves consistent point-in-time reads while updates keep arriving.
//!
//! # Architecture
//!
//! ```text
//!   Transport (WebSocket)
//!        │ text frames
//!   ┌────▼──────┐   ping / replay / backoff
//!   │Supervisor │◀──────────────────────────
//!   └────┬──────┘
//!        │ Decoder → FeedMessage
//!   ┌────▼──────┐
//!   │ Session   │  Idle → AwaitingSnapshot → Synced ⇄ Resyncing → Closed
//!   └────┬──────┘
//!   ┌────▼──────┐
//!   │Reconciler │  sequence check, deletes → updates → inserts
//!   └────┬──────┘
//!   ┌────▼──────┐       ┌─────────────┐
//!   │ BookStore │◀──────│ ViewBuilder │  any number of readers
//!   └───────────┘       └─────────────┘
//! ```
//!
//! One feed loop per connection is the only writer. Each symbol's book sits
//! behind its own read/write lock; a delta is applied in one write-lock
//! critical section, so readers see it entirely or not at all.

pub mod config;
pub mod decoder;
pub mod error;
pub mod level;
pub mod metrics;
pub mod protocol;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod view;

pub use config::MirrorConfig;
pub use error::{MirrorError, Result};
pub use session::{FeedSession, FeedState};
pub use store::BookStore;
pub use supervisor::{Supervisor, SupervisorHandle};
pub use view::{OrderBook, Ticker, ViewBuilder};
