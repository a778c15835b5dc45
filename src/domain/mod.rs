pub mod cancel;
pub mod event;
pub mod payload;
pub mod source;
pub mod status;
pub mod sync_run;

pub use cancel::CancelToken;
pub use event::{CacheEntry, EventTime, NormalizedEvent, ShowAs};
pub use payload::{content_hash, PayloadContent, RawFeedPayload};
pub use source::{
    AuthConfig, CircuitState, SourceConfig, SourceFailure, SourceKind, SourceState, Validators,
};
pub use status::{EventsView, Freshness, SourceStatus, SyncStatus};
pub use sync_run::{OutcomeStatus, RefreshTarget, SourceOutcome, SyncRun, SyncTargets};
