use tandem_core::{ErrorSignature, Fault, SessionId};

use crate::config::ErrorRouterConfig;

pub const DEFAULT_MAX_OCCURRENCE: u32 = 10;
/// Ceiling for faults caused by the environment rather than the data.
pub const ENVIRONMENTAL_MAX_OCCURRENCE: u32 = 50;

pub const FAULT_STORAGE_BUSY: &str = "StorageBusy";
pub const FAULT_NETWORK: &str = "Network";
pub const FAULT_TIMEOUT: &str = "Timeout";
pub const FAULT_UNAUTHORIZED: &str = "Unauthorized";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Reported as an ordinary error; processing continues.
    Routed,
    /// Stop the session.
    Stop,
}

/// Destination for routed faults.
pub trait ErrorChannel: Send {
    fn report(&mut self, session_id: SessionId, signature: &ErrorSignature, fault: &Fault, decision: RoutingDecision);
}

/// Reports through `tracing::error!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingChannel;

impl ErrorChannel for TracingChannel {
    fn report(&mut self, session_id: SessionId, signature: &ErrorSignature, fault: &Fault, decision: RoutingDecision) {
        tracing::error!(
            session = %session_id,
            signature = %signature,
            fault = %fault,
            inner = ?fault.inner.as_deref().map(|f| f.to_string()),
            stop = decision == RoutingDecision::Stop,
            "adapter fault"
        );
    }
}

pub trait ErrorRoutingPolicy: Send {
    fn try_route(&mut self, fault: &Fault) -> RoutingDecision;

    /// Forget occurrences counted so far.
    fn reset(&mut self) {}

    fn occurrences(&self) -> u32 {
        0
    }
}

/// Route every occurrence.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRoutingPolicy;

impl ErrorRoutingPolicy for DefaultRoutingPolicy {
    fn try_route(&mut self, _fault: &Fault) -> RoutingDecision {
        RoutingDecision::Routed
    }
}

/// Route the first `max` occurrences in a run, then stop.
#[derive(Debug, Clone)]
pub struct MaxOccurrencePolicy {
    max: u32,
    occurrences: u32,
}

impl MaxOccurrencePolicy {
    pub fn new(max: u32) -> Self {
        Self { max, occurrences: 0 }
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

impl ErrorRoutingPolicy for MaxOccurrencePolicy {
    fn try_route(&mut self, _fault: &Fault) -> RoutingDecision {
        self.occurrences = self.occurrences.saturating_add(1);
        if self.occurrences > self.max {
            RoutingDecision::Stop
        } else {
            RoutingDecision::Routed
        }
    }

    fn reset(&mut self) {
        self.occurrences = 0;
    }

    fn occurrences(&self) -> u32 {
        self.occurrences
    }
}

struct ErrorRouter {
    signature: ErrorSignature,
    policy: Box<dyn ErrorRoutingPolicy>,
}

/// Classifies adapter faults by signature and asks the matching policy
/// whether the session may continue. Registrations are kept most specific
/// first; the first match decides. A fault no signature matches stops the
/// session.
pub struct ErrorManager {
    session_id: SessionId,
    routers: Vec<ErrorRouter>,
    channels: Vec<Box<dyn ErrorChannel>>,
}

impl ErrorManager {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            routers: Vec::new(),
            channels: vec![Box::new(TracingChannel)],
        }
    }

    /// Wildcards at the default ceiling, environmental faults at the higher
    /// one, and authorization failures stop on the second occurrence.
    pub fn with_defaults(session_id: SessionId) -> Self {
        let mut manager = Self::new(session_id);
        manager.register(
            ErrorSignature::wildcard(),
            Box::new(MaxOccurrencePolicy::new(DEFAULT_MAX_OCCURRENCE)),
        );
        manager.register(
            ErrorSignature::wildcard_two_level(),
            Box::new(MaxOccurrencePolicy::new(DEFAULT_MAX_OCCURRENCE)),
        );
        for kind in [FAULT_STORAGE_BUSY, FAULT_NETWORK, FAULT_TIMEOUT] {
            manager.register(
                ErrorSignature::one_level(kind, ""),
                Box::new(MaxOccurrencePolicy::new(ENVIRONMENTAL_MAX_OCCURRENCE)),
            );
        }
        // Two levels outrank one: a wrapped Unauthorized fault falls to the
        // two-level wildcard and gets the default ceiling, not this one.
        manager.register(
            ErrorSignature::one_level(FAULT_UNAUTHORIZED, ""),
            Box::new(MaxOccurrencePolicy::new(1)),
        );
        manager
    }

    /// Defaults, overridden or extended by the configured routers.
    pub fn from_config(session_id: SessionId, routers: &[ErrorRouterConfig]) -> Self {
        let mut manager = Self::with_defaults(session_id);
        for router in routers {
            let policy: Box<dyn ErrorRoutingPolicy> = match router.max_occurrence {
                Some(max) => Box::new(MaxOccurrencePolicy::new(max)),
                None => Box::new(DefaultRoutingPolicy),
            };
            manager.register(router.signature.clone(), policy);
        }
        manager
    }

    /// Replaces any policy registered for an equal signature.
    pub fn register(&mut self, signature: ErrorSignature, policy: Box<dyn ErrorRoutingPolicy>) {
        self.routers.retain(|r| r.signature != signature);
        let at = self
            .routers
            .partition_point(|r| r.signature < signature);
        self.routers.insert(at, ErrorRouter { signature, policy });
    }

    pub fn add_channel(&mut self, channel: Box<dyn ErrorChannel>) {
        self.channels.push(channel);
    }

    /// Start of a session run: occurrence counts start again from zero.
    pub fn begin_run(&mut self) {
        for router in self.routers.iter_mut() {
            router.policy.reset();
        }
    }

    pub fn route(&mut self, fault: &Fault) -> RoutingDecision {
        let Some(router) = self.routers.iter_mut().find(|r| r.signature.matches(fault)) else {
            tracing::error!(session = %self.session_id, fault = %fault, "no error signature matches; stopping");
            return RoutingDecision::Stop;
        };
        let decision = router.policy.try_route(fault);
        for channel in self.channels.iter_mut() {
            channel.report(self.session_id, &router.signature, fault, decision);
        }
        if decision == RoutingDecision::Stop {
            tracing::warn!(
                session = %self.session_id,
                signature = %router.signature,
                occurrences = router.policy.occurrences(),
                "error ceiling reached"
            );
        }
        decision
    }

    /// Occurrences counted for the policy registered under `signature`.
    pub fn occurrences(&self, signature: &ErrorSignature) -> Option<u32> {
        self.routers
            .iter()
            .find(|r| &r.signature == signature)
            .map(|r| r.policy.occurrences())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tandem_core::SignatureLevel;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(String, RoutingDecision)>>>);

    impl ErrorChannel for Recorder {
        fn report(&mut self, _session_id: SessionId, signature: &ErrorSignature, _fault: &Fault, decision: RoutingDecision) {
            self.0.lock().unwrap().push((signature.to_string(), decision));
        }
    }

    #[test]
    fn max_occurrence_stops_on_the_next_one() {
        let mut policy = MaxOccurrencePolicy::new(3);
        let fault = Fault::new("Io", "boom");
        for _ in 0..3 {
            assert_eq!(policy.try_route(&fault), RoutingDecision::Routed);
        }
        assert_eq!(policy.try_route(&fault), RoutingDecision::Stop);
        assert_eq!(policy.try_route(&fault), RoutingDecision::Stop);
        policy.reset();
        assert_eq!(policy.try_route(&fault), RoutingDecision::Routed);
    }

    #[test]
    fn most_specific_signature_decides() {
        let mut manager = ErrorManager::new(SessionId::new());
        manager.register(ErrorSignature::wildcard(), Box::new(DefaultRoutingPolicy));
        manager.register(ErrorSignature::one_level("Io", "denied"), Box::new(MaxOccurrencePolicy::new(0)));

        assert_eq!(manager.route(&Fault::new("Io", "disk full")), RoutingDecision::Routed);
        assert_eq!(manager.route(&Fault::new("io", "access denied")), RoutingDecision::Stop);
    }

    #[test]
    fn unmatched_fault_stops() {
        let mut manager = ErrorManager::new(SessionId::new());
        manager.register(
            ErrorSignature::two_level(SignatureLevel::new("Adapter", ""), SignatureLevel::new("Io", "")),
            Box::new(DefaultRoutingPolicy),
        );
        assert_eq!(manager.route(&Fault::new("Adapter", "x")), RoutingDecision::Stop);
        let wrapped = Fault::new("Adapter", "x").with_inner(Fault::new("Io", "y"));
        assert_eq!(manager.route(&wrapped), RoutingDecision::Routed);
    }

    #[test]
    fn defaults_and_channels() {
        let session = SessionId::new();
        let mut manager = ErrorManager::with_defaults(session);
        let recorder = Recorder::default();
        manager.add_channel(Box::new(recorder.clone()));

        let denied = Fault::new(FAULT_UNAUTHORIZED, "token expired");
        assert_eq!(manager.route(&denied), RoutingDecision::Routed);
        assert_eq!(manager.route(&denied), RoutingDecision::Stop);

        let busy = Fault::new(FAULT_STORAGE_BUSY, "locked");
        for _ in 0..ENVIRONMENTAL_MAX_OCCURRENCE {
            assert_eq!(manager.route(&busy), RoutingDecision::Routed);
        }
        assert_eq!(manager.route(&busy), RoutingDecision::Stop);

        let odd = Fault::new("Parse", "bad header");
        for _ in 0..DEFAULT_MAX_OCCURRENCE {
            assert_eq!(manager.route(&odd), RoutingDecision::Routed);
        }
        assert_eq!(manager.route(&odd), RoutingDecision::Stop);
        assert_eq!(manager.occurrences(&ErrorSignature::wildcard()), Some(DEFAULT_MAX_OCCURRENCE + 1));

        manager.begin_run();
        assert_eq!(manager.occurrences(&ErrorSignature::wildcard()), Some(0));
        let reports = recorder.0.lock().unwrap();
        assert_eq!(reports.len(), 2 + (ENVIRONMENTAL_MAX_OCCURRENCE as usize + 1) + (DEFAULT_MAX_OCCURRENCE as usize + 1));
    }

    #[test]
    fn wrapped_unauthorized_falls_to_the_two_level_wildcard() {
        let mut manager = ErrorManager::with_defaults(SessionId::new());
        let wrapped = Fault::new(FAULT_UNAUTHORIZED, "token expired").with_inner(Fault::new("Io", "reset"));
        for _ in 0..DEFAULT_MAX_OCCURRENCE {
            assert_eq!(manager.route(&wrapped), RoutingDecision::Routed);
        }
        assert_eq!(manager.route(&wrapped), RoutingDecision::Stop);
        assert_eq!(
            manager.occurrences(&ErrorSignature::wildcard_two_level()),
            Some(DEFAULT_MAX_OCCURRENCE + 1)
        );
        assert_eq!(manager.occurrences(&ErrorSignature::one_level(FAULT_UNAUTHORIZED, "")), Some(0));

        let bare = Fault::new(FAULT_UNAUTHORIZED, "token expired");
        assert_eq!(manager.route(&bare), RoutingDecision::Routed);
        assert_eq!(manager.route(&bare), RoutingDecision::Stop);
    }

    #[test]
    fn configured_router_overrides_default() {
        let config = vec![ErrorRouterConfig {
            signature: ErrorSignature::wildcard(),
            max_occurrence: None,
        }];
        let mut manager = ErrorManager::from_config(SessionId::new(), &config);
        let fault = Fault::new("Parse", "bad");
        for _ in 0..(DEFAULT_MAX_OCCURRENCE * 3) {
            assert_eq!(manager.route(&fault), RoutingDecision::Routed);
        }
    }
}
