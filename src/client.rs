//! Handle-addressed live client API.
//!
//! `LiveClients` is what the C ABI calls into, and what embedders and tests
//! use directly with their own registry. Every operation goes through
//! [`HandleRegistry::validate_and_cast`] before touching a session.

use std::sync::Arc;

use crate::error::NativeResult;
use crate::gateway::{GatewayConfig, GatewayFactory};
use crate::registry::{Handle, HandleRegistry, TypeTag};
use crate::session::{LiveSession, SessionCallbacks};
use crate::types::ConnectionState;

/// Live session operations over a borrowed registry.
pub struct LiveClients<'r> {
    registry: &'r HandleRegistry,
    factory: Arc<dyn GatewayFactory>,
}

impl<'r> LiveClients<'r> {
    pub fn new(registry: &'r HandleRegistry, factory: Arc<dyn GatewayFactory>) -> Self {
        Self { registry, factory }
    }

    pub fn registry(&self) -> &'r HandleRegistry {
        self.registry
    }

    /// Create a session and register it.
    pub fn create(&self, config: GatewayConfig) -> NativeResult<Handle> {
        let session = Arc::new(LiveSession::new(config, Arc::clone(&self.factory))?);
        let handle = self.registry.create(TypeTag::LiveClient, Arc::clone(&session));
        session
            .logger()
            .log_session_created(handle.as_raw(), session.dataset().as_deref());
        Ok(handle)
    }

    /// Resolve a handle to its session.
    pub fn session(&self, handle: Handle) -> NativeResult<Arc<LiveSession>> {
        Ok(self
            .registry
            .validate_and_cast::<LiveSession>(handle, TypeTag::LiveClient)?)
    }

    pub fn subscribe(
        &self,
        handle: Handle,
        dataset: Option<&str>,
        schema: &str,
        symbols: &[String],
    ) -> NativeResult<()> {
        self.session(handle)?.subscribe(dataset, schema, symbols)
    }

    pub fn subscribe_with_snapshot(
        &self,
        handle: Handle,
        dataset: Option<&str>,
        schema: &str,
        symbols: &[String],
    ) -> NativeResult<()> {
        self.session(handle)?
            .subscribe_with_snapshot(dataset, schema, symbols)
    }

    pub fn start(&self, handle: Handle, callbacks: SessionCallbacks) -> NativeResult<()> {
        self.session(handle)?.start(callbacks)
    }

    pub fn stop(&self, handle: Handle) -> NativeResult<()> {
        self.session(handle)?.stop()
    }

    pub fn reconnect(&self, handle: Handle) -> NativeResult<()> {
        self.session(handle)?.reconnect()
    }

    pub fn resubscribe(&self, handle: Handle) -> NativeResult<()> {
        self.session(handle)?.resubscribe()
    }

    /// Invalidate the handle, then tear the session down.
    ///
    /// Unknown handles and handles of other types are left alone. Returns
    /// whether a session was destroyed.
    pub fn destroy(&self, handle: Handle) -> bool {
        match self.registry.take::<LiveSession>(handle, TypeTag::LiveClient) {
            Ok(session) => {
                session.destroy();
                true
            }
            Err(_) => false,
        }
    }

    /// Connection state; invalid handles report `Disconnected`.
    pub fn connection_state(&self, handle: Handle) -> ConnectionState {
        self.session(handle)
            .map(|session| session.connection_state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn dataset(&self, handle: Handle) -> NativeResult<Option<String>> {
        Ok(self.session(handle)?.dataset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NativeError;
    use crate::gateway::ReplayGatewayFactory;

    fn clients(registry: &HandleRegistry) -> LiveClients<'_> {
        LiveClients::new(registry, Arc::new(ReplayGatewayFactory::new()))
    }

    #[test]
    fn test_create_registers_live_client() {
        let registry = HandleRegistry::new();
        let clients = clients(&registry);
        let handle = clients.create(GatewayConfig::new("key")).unwrap();

        assert_eq!(registry.tag_of(handle), Some(TypeTag::LiveClient));
        assert_eq!(clients.connection_state(handle), ConnectionState::Disconnected);
        assert_eq!(clients.dataset(handle).unwrap(), None);
    }

    #[test]
    fn test_create_failure_registers_nothing() {
        let registry = HandleRegistry::new();
        assert!(clients(&registry).create(GatewayConfig::default()).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_wrong_type_handle_is_rejected() {
        let registry = HandleRegistry::new();
        let clients = clients(&registry);
        let other = registry.create(TypeTag::Metadata, Arc::new(0u64));

        let err = clients.subscribe(other, Some("GLBX.MDP3"), "trades", &[]).unwrap_err();
        assert_eq!(
            err,
            NativeError::TypeMismatch {
                expected: TypeTag::LiveClient,
                actual: TypeTag::Metadata,
            }
        );
        // Destroying through the live API must not remove a foreign object
        assert!(!clients.destroy(other));
        assert!(registry.contains(other));
    }

    #[test]
    fn test_destroy_invalidates_handle() {
        let registry = HandleRegistry::new();
        let clients = clients(&registry);
        let handle = clients.create(GatewayConfig::new("key")).unwrap();
        clients.subscribe(handle, Some("GLBX.MDP3"), "trades", &[]).unwrap();
        assert_eq!(clients.connection_state(handle), ConnectionState::Connected);

        assert!(clients.destroy(handle));
        assert!(!clients.destroy(handle));
        assert_eq!(clients.stop(handle), Err(NativeError::InvalidHandle));
        assert_eq!(clients.connection_state(handle), ConnectionState::Disconnected);
    }

    #[test]
    fn test_isolated_registries() {
        let first = HandleRegistry::new();
        let second = HandleRegistry::new();
        let handle = clients(&first).create(GatewayConfig::new("key")).unwrap();

        assert!(clients(&second).session(handle).is_err());
        assert!(clients(&first).session(handle).is_ok());
    }
}
