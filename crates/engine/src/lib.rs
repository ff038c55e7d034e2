pub mod adapter;
pub mod change_group_service;
pub mod config;
pub mod conflict_manager;
pub mod conflict_types;
pub mod context;
pub mod error;
pub mod error_routing;
pub mod highwater;
pub mod link_service;
pub mod resolution_actions;
pub mod worker;

pub use adapter::{
    Adapter, AdapterRegistry, ChangeBatch, DetectedAction, DetectedLinkChange, LinkApplyOutcome, LinkBatch,
    MigrationResult, PathMappingTranslator, TranslationService,
};
pub use change_group_service::ChangeGroupService;
pub use config::{AgeStep, ErrorRouterConfig, PathMapping, RuleConfig, SessionConfig, SyncDirection};
pub use conflict_manager::ConflictManager;
pub use conflict_types::{ConflictType, DetectionContext};
pub use context::RunContext;
pub use error::EngineError;
pub use error_routing::{
    DefaultRoutingPolicy, ErrorChannel, ErrorManager, ErrorRoutingPolicy, MaxOccurrencePolicy, RoutingDecision,
};
pub use highwater::HighWaterMark;
pub use link_service::{LinkMigrationOutcome, LinkService};
pub use resolution_actions::ResolutionAction;
pub use worker::{PollReport, SessionState, SessionWorker};
