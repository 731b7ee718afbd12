//! Execution proxies.
//!
//! A proxy is the pipeline handler's concrete [`IpaInterface`] instance.
//! [`InProcessProxy`] drives the algorithm context directly in the caller's
//! address space. [`IsolatedProxy`] moves it behind a channel into a worker
//! process and survives the worker's death; [`IpaHost`] is the worker-side
//! loop that serves it.
//!
//! [`IpaInterface`]: crate::interface::IpaInterface

mod host;
mod in_process;
mod isolated;

pub use host::IpaHost;
pub use in_process::InProcessProxy;
pub use isolated::IsolatedProxy;

/// Which execution variant to construct for an algorithm module.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProxyKind {
    /// Run the algorithm in the caller's address space.
    #[default]
    InProcess,
    /// Run the algorithm behind a channel in a worker process.
    Isolated,
}

/// Connection state of an isolated proxy.
///
/// The state only moves forward: a proxy that degrades or closes is never
/// reused, the session tears down and starts over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
    /// Construction state; every proxy leaves it for `Connecting` as its
    /// channel attaches.
    Disconnected,
    /// Channel attached, init handshake not yet completed.
    Connecting,
    /// Handshake complete, operations flow.
    Ready,
    /// The peer misbehaved or vanished; operations fail fast.
    Degraded,
    /// Torn down.
    Closed,
}

impl ProxyState {
    /// Whether the state machine admits a move to `next`.
    pub fn can_transition_to(self, next: ProxyState) -> bool {
        use ProxyState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Ready)
                | (Connecting, Degraded)
                | (Connecting, Closed)
                | (Ready, Degraded)
                | (Ready, Closed)
                | (Degraded, Closed)
        )
    }
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProxyState::Disconnected => "disconnected",
            ProxyState::Connecting => "connecting",
            ProxyState::Ready => "ready",
            ProxyState::Degraded => "degraded",
            ProxyState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        use ProxyState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Closed));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        use ProxyState::*;
        assert!(!Ready.can_transition_to(Connecting));
        assert!(!Degraded.can_transition_to(Ready));
        assert!(!Closed.can_transition_to(Degraded));
        assert!(!Closed.can_transition_to(Ready));
        // A proxy always connects before it can close.
        assert!(!Disconnected.can_transition_to(Closed));
    }
}
