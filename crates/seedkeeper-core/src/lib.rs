//! Transfer supervision for seedkeeper.
//!
//! A [`Supervisor`] owns one shared engine session and runs at most one
//! transfer per chat session on it: metadata is resolved by the
//! [`probe`], checked by the [`policy`], and the data is fetched by an
//! executor that reports throttled progress to a [`TransferObserver`]. Live
//! transfers are mirrored to disk by the [`persistence`] store and resumed on
//! the next start.

pub mod active;
pub mod collab;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod manifest;
pub mod persistence;
pub mod placement;
pub mod policy;
pub mod probe;
pub mod progress;
pub mod session;
pub mod shutdown;
pub mod supervisor;
pub mod units;

#[cfg(test)]
mod test_support;

pub use collab::{
    Classification, Collaborators, ContentKind, DiscoveryLinkExtractor, LibraryNotifier,
    NameClassifier,
};
pub use config::{load_config, resolve_config, SupervisorConfig};
pub use descriptor::ContentDescriptor;
pub use error::TransferError;
pub use executor::TransferOutcome;
pub use manifest::{ContentManifest, ManifestEntry};
pub use persistence::{PersistenceStore, TransferRecord};
pub use policy::{PolicyValidator, Rejection};
pub use progress::{LoggingObserver, TransferObserver, TransferPhase, TransferStatus};
pub use shutdown::{cancellation_behavior, CancelAction, ShutdownFlag};
pub use supervisor::{SubmitRequest, Supervisor, TransferTicket};
pub use units::human_size;
