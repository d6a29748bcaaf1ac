//! Pluggable proof-of-control mechanisms.
//!
//! A [`ChallengeProvider`] knows how to place and remove proof material for
//! one challenge type within its configured domain scope. Providers are
//! long-lived and shared across concurrent orders; their configuration is
//! immutable after construction, so reconfiguring means building a new
//! instance and swapping it into the registry.

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{
    error::{Error, Result},
    jws::Jwk,
    key::AccountKey,
};

mod dns;
mod http;

pub use self::{
    dns::{DnsProviderConfig, ZoneDnsProvider},
    http::{Http01Config, Http01Provider},
};

/// Challenge types this engine can satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeKind {
    Dns01,
    Http01,
}

impl ChallengeKind {
    /// The challenge `type` string on the wire.
    pub fn acme_type(self) -> &'static str {
        match self {
            ChallengeKind::Dns01 => "dns-01",
            ChallengeKind::Http01 => "http-01",
        }
    }

    pub fn from_acme_type(value: &str) -> Option<ChallengeKind> {
        match value {
            "dns-01" => Some(ChallengeKind::Dns01),
            "http-01" => Some(ChallengeKind::Http01),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.acme_type())
    }
}

/// Proof material derived from a challenge token and the account key.
///
/// See [RFC 8555 §8.1] for key authorizations, [RFC 8555 §8.4] for the TXT
/// record digest form.
///
/// [RFC 8555 §8.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.1
/// [RFC 8555 §8.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.4
#[derive(Debug, Clone)]
pub struct ProofMaterial {
    /// The challenge token.
    pub token: String,

    /// `<token>.<account key thumbprint>` — served verbatim for http-01.
    pub key_authorization: String,

    /// Base64url SHA-256 of the key authorization — the TXT value for
    /// dns-01.
    pub dns_txt_value: String,
}

impl ProofMaterial {
    pub(crate) fn new(token: &str, key: &AccountKey) -> Result<ProofMaterial> {
        let thumbprint = Jwk::from(key).thumbprint_sha256()?;
        let key_authorization = format!("{token}.{thumbprint}");
        let dns_txt_value = BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(&key_authorization));

        Ok(ProofMaterial {
            token: token.to_owned(),
            key_authorization,
            dns_txt_value,
        })
    }
}

/// One proof-of-control mechanism.
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    /// The challenge type this provider satisfies.
    fn kind(&self) -> ChallengeKind;

    /// Whether this provider is authorized to prove control of `domain`.
    fn covers(&self, domain: &str) -> bool;

    /// Place proof material. Returns only once placement is confirmed;
    /// the orchestrator will not ask the CA to validate before that.
    async fn provision(&self, domain: &str, material: &ProofMaterial) -> Result<()>;

    /// Remove proof material. Already-removed must not be an error.
    async fn cleanup(&self, domain: &str, material: &ProofMaterial) -> Result<()>;
}

/// The configured providers, in selection order.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ChallengeProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> ProviderRegistry {
        ProviderRegistry::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ChallengeProvider>) {
        self.providers.push(provider);
    }

    pub fn with(mut self, provider: Arc<dyn ChallengeProvider>) -> ProviderRegistry {
        self.register(provider);
        self
    }

    /// Challenge methods at least one provider can satisfy.
    pub fn available_methods(&self) -> Vec<ChallengeKind> {
        let mut methods = Vec::new();
        for provider in &self.providers {
            if !methods.contains(&provider.kind()) {
                methods.push(provider.kind());
            }
        }
        methods
    }

    /// Picks the first provider whose scope covers `domain` and whose
    /// challenge type is among those `offered` by the authorization.
    ///
    /// Purely local: wildcard identifiers refuse anything but dns-01 here,
    /// before any network call is made.
    pub fn select(
        &self,
        domain: &str,
        offered: &[ChallengeKind],
        wildcard: bool,
    ) -> Result<Arc<dyn ChallengeProvider>> {
        let mut rejected_for_wildcard = false;

        for provider in &self.providers {
            if !provider.covers(domain) || !offered.contains(&provider.kind()) {
                continue;
            }

            if wildcard && provider.kind() != ChallengeKind::Dns01 {
                rejected_for_wildcard = true;
                continue;
            }

            return Ok(Arc::clone(provider));
        }

        if rejected_for_wildcard {
            Err(Error::WildcardRequiresDns(domain.to_owned()))
        } else {
            Err(Error::NoProviderForDomain(domain.to_owned()))
        }
    }
}

/// True when `domain` falls inside a provider's configured scope: an exact
/// entry, a parent-domain entry, or the `*` catch-all.
pub(crate) fn domain_in_scope(scope: &[String], domain: &str) -> bool {
    scope.iter().any(|entry| {
        entry == "*" || entry == domain || domain.ends_with(&format!(".{entry}"))
    })
}
