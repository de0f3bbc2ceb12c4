//! Policy selection for identities.
//!
//! Address identities share one policy. Token identities get the default
//! token policy unless the token has an override of its own.

use std::collections::HashMap;

use tracing::info;

use super::identity::Identity;
use super::limiter::Policy;
use crate::config::RateLimitingConfig;

/// Resolved policies, ready to be looked up per request.
#[derive(Debug, Clone)]
pub struct PolicyRules {
    ip: Policy,
    token: Policy,
    overrides: HashMap<String, Policy>,
}

impl PolicyRules {
    pub fn new(ip: Policy, token: Policy) -> Self {
        Self {
            ip,
            token,
            overrides: HashMap::new(),
        }
    }

    /// Build the rules from configuration.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        let mut rules = Self::new(config.ip.policy(), config.token.policy());
        for (token, policy) in &config.tokens {
            rules = rules.with_override(token.clone(), policy.policy());
        }
        rules
    }

    /// Give `token` its own policy.
    pub fn with_override(mut self, token: impl Into<String>, policy: Policy) -> Self {
        self.overrides.insert(token.into(), policy);
        self
    }

    /// The policy that applies to `identity`.
    pub fn resolve(&self, identity: &Identity) -> Policy {
        match identity {
            Identity::Address(_) => self.ip,
            Identity::Token(token) => self.overrides.get(token).copied().unwrap_or(self.token),
        }
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }

    /// Log the effective policies at startup. Token values are not logged.
    pub fn log_summary(&self) {
        info!(
            limit = self.ip.limit,
            block_duration = ?self.ip.block_duration,
            "IP rate limit (requests per second)"
        );
        info!(
            limit = self.token.limit,
            block_duration = ?self.token.block_duration,
            overrides = self.overrides.len(),
            "Default token rate limit (requests per second)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use std::time::Duration;

    fn rules() -> PolicyRules {
        PolicyRules::new(
            Policy::new(10, Duration::from_secs(300)),
            Policy::new(100, Duration::from_secs(300)),
        )
        .with_override("vip", Policy::new(1000, Duration::from_secs(5)))
    }

    #[test]
    fn test_address_uses_ip_policy() {
        let policy = rules().resolve(&Identity::Address("10.0.0.1".to_string()));
        assert_eq!(policy.limit, 10);
    }

    #[test]
    fn test_token_override() {
        let policy = rules().resolve(&Identity::Token("vip".to_string()));
        assert_eq!(policy, Policy::new(1000, Duration::from_secs(5)));
    }

    #[test]
    fn test_unknown_token_uses_default() {
        let policy = rules().resolve(&Identity::Token("someone".to_string()));
        assert_eq!(policy.limit, 100);
    }

    #[test]
    fn test_override_does_not_apply_to_address() {
        let policy = rules().resolve(&Identity::Address("vip".to_string()));
        assert_eq!(policy.limit, 10);
    }

    #[test]
    fn test_from_config() {
        let mut config = RateLimitingConfig::default();
        config.ip = PolicyConfig::new(3, 1);
        config.tokens.insert("abc".to_string(), PolicyConfig::new(50, 2));

        let rules = PolicyRules::from_config(&config);
        assert_eq!(rules.override_count(), 1);
        assert_eq!(
            rules.resolve(&Identity::Token("abc".to_string())),
            Policy::new(50, Duration::from_secs(2))
        );
        assert_eq!(
            rules.resolve(&Identity::Address("1.2.3.4".to_string())),
            Policy::new(3, Duration::from_secs(1))
        );
    }
}
