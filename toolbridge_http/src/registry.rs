//! Named provider sessions, in registration order.

use crate::{
    config::BridgeConfig,
    error::{BridgeError, Result},
    session::RpcSession,
};
use tracing::info;

/// Holds one [`RpcSession`] per configured provider.
///
/// Sessions are created eagerly but spawn nothing until first used; each
/// provider's lifecycle is independent of the others.
pub struct ProviderRegistry {
    sessions: Vec<RpcSession>,
    default_provider: String,
}

impl ProviderRegistry {
    /// Build the registry from a validated configuration.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let default_provider = config
            .default_provider_name()
            .ok_or_else(|| BridgeError::Config("No default provider".to_string()))?
            .to_string();

        let sessions = config
            .providers
            .iter()
            .map(|spec| {
                RpcSession::new(
                    spec.clone(),
                    config.init_timeout,
                    config.call_timeout,
                    config.enable_colored_output,
                )
            })
            .collect::<Vec<_>>();

        info!(
            providers = ?sessions.iter().map(RpcSession::name).collect::<Vec<_>>(),
            default = %default_provider,
            "Provider registry created"
        );

        Ok(Self {
            sessions,
            default_provider,
        })
    }

    /// Look up a session without starting it.
    pub fn get(&self, key: &str) -> Option<&RpcSession> {
        self.sessions.iter().find(|s| s.name() == key)
    }

    /// Resolve `key` and make sure its session is initialized.
    ///
    /// An unknown key fails before any process is spawned.
    pub async fn ensure(&self, key: &str) -> Result<&RpcSession> {
        let session = self
            .get(key)
            .ok_or_else(|| BridgeError::UnknownProvider(key.to_string()))?;
        session.ensure_ready().await?;
        Ok(session)
    }

    /// All sessions in registration order.
    pub fn providers(&self) -> &[RpcSession] {
        &self.sessions
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn default_session(&self) -> Option<&RpcSession> {
        self.get(&self.default_provider)
    }

    /// Ask every child to terminate. Does not wait for the exits.
    pub fn shutdown_all(&self) {
        for session in &self.sessions {
            session.shutdown();
        }
    }
}

impl Drop for ProviderRegistry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSpec;
    use crate::session::SessionState;

    fn registry() -> ProviderRegistry {
        let config = BridgeConfig {
            providers: vec![
                ProviderSpec::new("xero", "/nonexistent/xero"),
                ProviderSpec::new("supabase", "/nonexistent/supabase"),
            ],
            ..BridgeConfig::default()
        };
        ProviderRegistry::from_config(&config).unwrap()
    }

    #[test]
    fn keeps_registration_order_and_default() {
        let registry = registry();
        let names: Vec<_> = registry.providers().iter().map(RpcSession::name).collect();
        assert_eq!(names, ["xero", "supabase"]);
        assert_eq!(registry.default_provider(), "xero");
        assert!(registry.get("supabase").is_some());
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(ProviderRegistry::from_config(&BridgeConfig::default()).is_err());
    }

    #[tokio::test]
    async fn unknown_key_fails_without_touching_sessions() {
        let registry = registry();
        let err = registry.ensure("ghost").await.unwrap_err();
        assert_eq!(err, BridgeError::UnknownProvider("ghost".into()));
        for session in registry.providers() {
            assert_eq!(session.state(), SessionState::Uninitialized);
        }
    }

    #[tokio::test]
    async fn one_provider_failing_leaves_others_untouched() {
        let registry = registry();
        let err = registry.ensure("xero").await.unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
        assert_eq!(registry.get("xero").unwrap().state(), SessionState::Failed);
        assert_eq!(
            registry.get("supabase").unwrap().state(),
            SessionState::Uninitialized
        );
    }
}
