//! Certificate order orchestration.
//!
//! [`Issuer::issue_or_renew`] runs the full lifecycle of one order: create,
//! satisfy every authorization, finalize with a CSR, and download the
//! issued chain. All waiting is bounded by deadlines and observes the
//! configured shutdown signal.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use base64::prelude::*;
use serde::Deserialize;

use crate::{
    account::Account,
    api,
    csr::{create_csr, CertificateKey, IssuedCertificate},
    error::{Error, Result},
    provider::{ChallengeKind, ProviderRegistry},
    shutdown::Shutdown,
};

mod auth;
mod state;

/// Maximum interval between polls once backoff has grown.
const MAX_POLL_DELAY: Duration = Duration::from_secs(60);

/// What certificate to ask for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CertificateSpec {
    /// Subject common name and first SAN.
    pub primary_name: String,

    /// Additional SANs.
    #[serde(default)]
    pub alt_names: Vec<String>,
}

impl CertificateSpec {
    pub fn new(primary_name: impl Into<String>) -> CertificateSpec {
        CertificateSpec {
            primary_name: primary_name.into(),
            alt_names: Vec::new(),
        }
    }

    pub fn with_alt_names(mut self, alt_names: Vec<String>) -> CertificateSpec {
        self.alt_names = alt_names;
        self
    }

    /// All names, primary first, duplicates dropped. The CSR and the order
    /// are both built from this list, so they always carry the same set.
    pub fn domains(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();

        for name in std::iter::once(self.primary_name.as_str())
            .chain(self.alt_names.iter().map(String::as_str))
        {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        names
    }
}

/// Timing knobs for order processing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    /// Initial interval between status polls; doubles up to a cap of one
    /// minute unless the CA sends Retry-After.
    pub poll_interval: Duration,

    /// Grace period after placing a dns-01 record, before asking the CA to
    /// validate.
    pub dns_settle: Duration,

    /// Hard deadline for one authorization, from provisioning to a decided
    /// status.
    pub auth_timeout: Duration,

    /// Hard deadline for the whole order.
    pub order_timeout: Duration,
}

impl Default for OrderConfig {
    fn default() -> OrderConfig {
        OrderConfig {
            poll_interval: Duration::from_secs(5),
            dns_settle: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(5 * 60),
            order_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Issues certificates through one ACME account.
///
/// Cheap to clone; clones share the account and provider registry.
#[derive(Clone)]
pub struct Issuer {
    account: Account,
    registry: Arc<ProviderRegistry>,
    config: OrderConfig,
    shutdown: Shutdown,
}

impl Issuer {
    pub fn new(account: Account, registry: Arc<ProviderRegistry>) -> Issuer {
        Issuer {
            account,
            registry,
            config: OrderConfig::default(),
            shutdown: Shutdown::never(),
        }
    }

    pub fn with_config(mut self, config: OrderConfig) -> Issuer {
        self.config = config;
        self
    }

    /// Makes all waits inside order processing abort with
    /// [`Error::Cancelled`] when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Issuer {
        self.shutdown = shutdown;
        self
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Challenge methods the configured providers can satisfy.
    pub fn available_challenge_methods(&self) -> Vec<ChallengeKind> {
        self.registry.available_methods()
    }

    /// Obtains a certificate for `spec`, driving a fresh order end to end.
    ///
    /// Renewal is the same operation: ACME has no renew verb, so a renewal
    /// is simply a new order for the same names.
    pub async fn issue_or_renew(
        &self,
        spec: &CertificateSpec,
        cert_key: &CertificateKey,
    ) -> Result<IssuedCertificate> {
        // wildcard names can only ever be proven over dns-01; reject an
        // impossible request before the CA sees the order
        const ALL_KINDS: [ChallengeKind; 2] = [ChallengeKind::Dns01, ChallengeKind::Http01];
        for domain in spec.domains() {
            if let Some(base) = domain.strip_prefix("*.") {
                self.registry.select(base, &ALL_KINDS, true)?;
            }
        }

        let deadline = Instant::now() + self.config.order_timeout;
        let transport = self.account.transport();

        let (order_url, order) = self
            .account
            .create_order(&spec.primary_name, &spec.alt_names)
            .await?;

        let mut status = order.status.unwrap_or(api::OrderStatus::Pending);
        log::info!("order {order_url} created ({status:?})");

        if status == api::OrderStatus::Pending {
            for auth_url in order.authorizations.as_deref().unwrap_or_default() {
                let auth_deadline =
                    deadline.min(Instant::now() + self.config.auth_timeout);

                // abandon on the first failed authorization; its own proof
                // material is already cleaned up, and the CA invalidates
                // sibling authorizations when the order dies
                auth::satisfy(
                    transport,
                    &self.registry,
                    auth_url,
                    &self.config,
                    auth_deadline,
                    &self.shutdown,
                )
                .await?;
            }
        }

        // all authorizations valid; wait for the CA to agree
        let order = self
            .poll_order(&order_url, &mut status, api::OrderStatus::Ready, deadline)
            .await?;

        let order = if status == api::OrderStatus::Ready {
            let csr = create_csr(cert_key, &spec.domains())?;
            let finalize = api::Finalize::new(BASE64_URL_SAFE_NO_PAD.encode(csr));

            log::info!("finalizing order {order_url}");
            transport.call(&order.finalize, &finalize).await?;

            self.poll_order(&order_url, &mut status, api::OrderStatus::Valid, deadline)
                .await?
        } else {
            order
        };

        let cert_url = order.certificate.as_deref().ok_or_else(|| {
            Error::MalformedResponse("valid order carries no certificate URL".to_owned())
        })?;

        log::info!("downloading certificate from {cert_url}");
        let chain_pem = transport.call(cert_url, &api::EmptyString).await?.body;

        IssuedCertificate::from_chain(cert_key, chain_pem)
    }

    /// Polls the order until it reaches at least `target`, folding each
    /// observation through the monotonic state function.
    async fn poll_order(
        &self,
        order_url: &str,
        status: &mut api::OrderStatus,
        target: api::OrderStatus,
        deadline: Instant,
    ) -> Result<api::Order> {
        let transport = self.account.transport();
        let mut delay = self.config.poll_interval;

        loop {
            let res = transport.call(order_url, &api::EmptyString).await?;
            let retry_after = res.retry_after;
            let order: api::Order = res.json()?;

            let observed = order.status.unwrap_or(api::OrderStatus::Pending);
            *status = state::advance(*status, observed)?;

            if *status == api::OrderStatus::Invalid {
                return Err(order_failure(&order));
            }

            if *status == target || state::is_terminal(*status) {
                return Ok(order);
            }

            wait(
                retry_after.unwrap_or(delay),
                deadline,
                &self.shutdown,
                "order processing",
            )
            .await?;
            delay = next_delay(delay);
        }
    }
}

fn order_failure(order: &api::Order) -> Error {
    match &order.error {
        Some(problem) => Error::from(problem.clone()),
        None => Error::MalformedResponse("order is invalid without an error".to_owned()),
    }
}

/// Sleeps for `dur`, clamped to `deadline`, unless shutdown fires first.
///
/// Errors with [`Error::Timeout`] once the deadline has passed and
/// [`Error::Cancelled`] on shutdown.
pub(crate) async fn wait(
    dur: Duration,
    deadline: Instant,
    shutdown: &Shutdown,
    what: &'static str,
) -> Result<()> {
    let now = Instant::now();
    if now >= deadline {
        return Err(Error::Timeout(what));
    }

    let dur = dur.min(deadline - now);

    tokio::select! {
        _ = shutdown.requested() => Err(Error::Cancelled),
        _ = tokio::time::sleep(dur) => Ok(()),
    }
}

pub(crate) fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(MAX_POLL_DELAY)
}
