//! Fire-and-forget delivery of server events to live connections.
//!
//! Nothing is queued for offline users and nothing is retried: a negotiation
//! message that cannot be delivered now is worthless later.

use tandem_shared::{CallError, CallId, ServerEvent, Signal, UserId};
use tracing::debug;

use crate::registry::SessionRegistry;

#[derive(Debug, Clone)]
pub struct SignalingRelay {
    registry: SessionRegistry,
}

impl SignalingRelay {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Deliver `event` to `target` if it has a live connection.
    ///
    /// `RelayUndeliverable` is informational; callers log it and move on.
    pub fn relay(&self, target: &UserId, event: ServerEvent) -> Result<(), CallError> {
        let name = event.name();
        match self.registry.lookup(target) {
            Some(handle) if handle.deliver(event) => {
                debug!(target = %target.short(), event = name, "relayed");
                Ok(())
            }
            _ => {
                debug!(target = %target.short(), event = name, "dropped, target not connected");
                Err(CallError::RelayUndeliverable(*target))
            }
        }
    }

    /// Relay a negotiation payload. `from` must be the authenticated sender.
    pub fn forward(
        &self,
        from: UserId,
        target: &UserId,
        call_id: CallId,
        signal: Signal,
    ) -> Result<(), CallError> {
        self.relay(target, ServerEvent::relayed(call_id, from, signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;

    #[tokio::test]
    async fn test_forward_stamps_sender() {
        let registry = SessionRegistry::new();
        let relay = SignalingRelay::new(registry.clone());
        let (x, y) = (UserId::new(), UserId::new());
        let (handle, mut rx) = ConnectionHandle::new(4);
        registry.register(y, handle);

        let call_id = CallId::new();
        relay
            .forward(x, &y, call_id, Signal::Candidate("c".into()))
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.as_signal(),
            Some((call_id, x, Signal::Candidate("c".into())))
        );
    }

    #[test]
    fn test_offline_target_is_dropped() {
        let relay = SignalingRelay::new(SessionRegistry::new());
        let target = UserId::new();
        assert_eq!(
            relay.relay(&target, ServerEvent::Pong),
            Err(CallError::RelayUndeliverable(target))
        );
    }

    #[test]
    fn test_nothing_reaches_unregistered_handle() {
        let registry = SessionRegistry::new();
        let relay = SignalingRelay::new(registry.clone());
        let user = UserId::new();
        let (handle, mut rx) = ConnectionHandle::new(4);
        registry.register(user, handle);
        registry.unregister(&user);

        assert!(relay.relay(&user, ServerEvent::Pong).is_err());
        assert!(rx.try_recv().is_err());
    }
}
