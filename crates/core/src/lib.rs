pub mod change_group;
pub mod checkpoint;
pub mod conflict;
pub mod error;
pub mod error_signature;
pub mod ids;
pub mod link;
pub mod scope;

pub use change_group::{ActionKind, ActionStatus, ChangeGroup, ChangeStatus, MigrationAction};
pub use checkpoint::CheckpointValue;
pub use conflict::{
    ConflictResolutionResult, ConflictResolutionRule, ConflictStatus, ConflictTarget,
    DetectionPoint, MigrationConflict, ResolutionCategory, ResolutionOutcome, ResolvedBy,
};
pub use error::CoreError;
pub use error_signature::{ErrorSignature, Fault, SignatureLevel};
pub use ids::*;
pub use link::{
    ArtifactLink, LinkActionKind, LinkActionStatus, LinkChangeAction, LinkChangeGroup,
    LinkGroupStatus, LinkTargetKind,
};
pub use scope::{BasicPathScope, ScopeInterpreter};
