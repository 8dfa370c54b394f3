//! Flotilla core types: manifests, resource keys, version tokens, work
//! orders, the error taxonomy and the conflict-retry combinator.

#![forbid(unsafe_code)]

pub mod error;
pub mod interpret;
pub mod key;
pub mod manifest;
pub mod names;
pub mod retry;
pub mod version;
pub mod work;

pub use error::{AggregateError, SyncError};
pub use key::ResourceKey;
pub use manifest::Manifest;
pub use retry::{retry_on_conflict, BackoffPolicy};
pub use version::VersionToken;
pub use work::{Condition, ConditionStatus, Work, WorkRef, WorkSpec, WorkStatus};

pub mod prelude {
    pub use super::{
        AggregateError, BackoffPolicy, Condition, ConditionStatus, Manifest, ResourceKey,
        SyncError, VersionToken, Work, WorkRef, WorkSpec, WorkStatus,
    };
}
