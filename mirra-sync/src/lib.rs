//! # mirra-sync
//!
//! The mirror engine: raw notifications in, mirror-tree mutations out.
//!
//! ```text
//! RawNotification -> Normalizer -> ChangeEvent -> Correlator -> Mutation
//!                                                                 |
//!                                 Synchronizer <------------------+
//!                                   |- Encoder      (convert)
//!                                   |- prune        (remove, rename)
//!                                   '- reconcile    (rescan)
//! ```
//!
//! Nothing here spawns threads or owns a queue; the daemon drives the loop.
//! [`pipeline::scan`] runs a one-shot reconciliation of every root.

pub mod correlate;
pub mod debounce;
pub mod encoder;
pub mod error;
pub mod event;
pub mod normalize;
pub mod pipeline;
pub mod prune;
pub mod reconcile;
pub mod staleness;
pub mod synchronizer;

pub use correlate::Correlator;
pub use encoder::{Encoder, WebpEncoder};
pub use error::{EncodeError, SyncError};
pub use event::{ChangeEvent, ChangeKind, EventClass, MoveToken, Mutation};
pub use normalize::{Normalizer, RawKind, RawNotification};
pub use pipeline::{scan, scan_with, ScanScope};
pub use reconcile::{ReconcilePlan, RootReport};
pub use synchronizer::{Applied, Synchronizer};
