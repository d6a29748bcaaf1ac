//! Background certificate renewal.
//!
//! [`RenewalScheduler`] periodically scans a [`CertificateStore`] and
//! re-orders every certificate that is inside its renewal window. One
//! failing certificate never blocks the others; its error is logged and the
//! next scan retries it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::{
    csr::{CertificateKey, IssuedCertificate},
    error::{Error, Result},
    order::{CertificateSpec, Issuer},
    shutdown::Shutdown,
};

/// A certificate under management.
#[derive(Debug, Clone)]
pub struct StoredCertificate {
    /// Stable name the store and key source identify this certificate by.
    pub name: String,

    /// Names to re-order with.
    pub spec: CertificateSpec,

    /// Leaf certificate notAfter.
    pub expires_at: OffsetDateTime,
}

/// Where managed certificates live.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Every certificate the scheduler should keep alive.
    async fn list(&self) -> Result<Vec<StoredCertificate>>;

    /// Persists a freshly issued certificate under `name`.
    async fn store(&self, name: &str, cert: &IssuedCertificate) -> Result<()>;
}

/// Supplies the private key to re-order a certificate with.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn certificate_key(&self, name: &str) -> Result<CertificateKey>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenewalConfig {
    /// Time between scans.
    pub interval: Duration,

    /// How long before expiry a certificate becomes due.
    pub window: Duration,
}

impl Default for RenewalConfig {
    fn default() -> RenewalConfig {
        RenewalConfig {
            interval: Duration::from_secs(24 * 60 * 60),
            window: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

pub struct RenewalScheduler<S, K> {
    issuer: Issuer,
    store: S,
    keys: K,
    config: RenewalConfig,
    shutdown: Shutdown,
}

impl<S: CertificateStore, K: KeySource> RenewalScheduler<S, K> {
    pub fn new(issuer: Issuer, store: S, keys: K) -> RenewalScheduler<S, K> {
        RenewalScheduler {
            issuer,
            store,
            keys,
            config: RenewalConfig::default(),
            shutdown: Shutdown::never(),
        }
    }

    pub fn with_config(mut self, config: RenewalConfig) -> RenewalScheduler<S, K> {
        self.config = config;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> RenewalScheduler<S, K> {
        self.shutdown = shutdown;
        self
    }

    /// Scans until shutdown.
    pub async fn run(&self) {
        loop {
            if let Err(err) = self.pass().await {
                log::error!("renewal scan failed: {err}");
            }

            let deadline = Instant::now() + self.config.interval;
            match crate::order::wait(self.config.interval, deadline, &self.shutdown, "renewal scan")
                .await
            {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    log::info!("renewal scheduler stopping");
                    return;
                }
                Err(err) => {
                    log::error!("renewal scheduler wait failed: {err}");
                    return;
                }
            }
        }
    }

    /// One scan over the store. Returns how many certificates were renewed.
    pub async fn pass(&self) -> Result<usize> {
        let certs = self.store.list().await?;
        let mut renewed = 0;

        for cert in certs {
            if self.shutdown.is_shutdown() {
                return Err(Error::Cancelled);
            }

            if !self.is_due(&cert) {
                continue;
            }

            log::info!(
                "{}: certificate expires {}; renewing",
                cert.name,
                cert.expires_at,
            );

            // failures are isolated per certificate
            match self.renew_one(&cert).await {
                Ok(()) => renewed += 1,
                Err(err) => log::error!("{}: renewal failed: {err}", cert.name),
            }
        }

        Ok(renewed)
    }

    fn is_due(&self, cert: &StoredCertificate) -> bool {
        let due_at = cert.expires_at - self.config.window;
        OffsetDateTime::now_utc() >= due_at
    }

    async fn renew_one(&self, cert: &StoredCertificate) -> Result<()> {
        let key = self.keys.certificate_key(&cert.name).await?;
        let issued = self.issuer.issue_or_renew(&cert.spec, &key).await?;
        self.store.store(&cert.name, &issued).await?;

        log::info!(
            "{}: renewed, new certificate expires {}",
            cert.name,
            issued.not_after(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        csr::create_p256_key,
        dir::{Directory, DirectoryUrl},
        key::{AccountKey, KeyAlgorithm},
        provider::{ChallengeKind, ChallengeProvider, ProofMaterial, ProviderRegistry},
        test::TestServer,
    };

    struct NullProvider;

    #[async_trait]
    impl ChallengeProvider for NullProvider {
        fn kind(&self) -> ChallengeKind {
            ChallengeKind::Dns01
        }

        fn covers(&self, _domain: &str) -> bool {
            true
        }

        async fn provision(&self, _domain: &str, _material: &ProofMaterial) -> Result<()> {
            Ok(())
        }

        async fn cleanup(&self, _domain: &str, _material: &ProofMaterial) -> Result<()> {
            Ok(())
        }
    }

    struct MemStore {
        certs: Vec<StoredCertificate>,
        stored: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CertificateStore for MemStore {
        async fn list(&self) -> Result<Vec<StoredCertificate>> {
            Ok(self.certs.clone())
        }

        async fn store(&self, name: &str, _cert: &IssuedCertificate) -> Result<()> {
            self.stored.lock().push(name.to_owned());
            Ok(())
        }
    }

    struct FreshKeys(AtomicUsize);

    #[async_trait]
    impl KeySource for FreshKeys {
        async fn certificate_key(&self, _name: &str) -> Result<CertificateKey> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(create_p256_key())
        }
    }

    fn stored(name: &str, domain: &str, expires_in: time::Duration) -> StoredCertificate {
        StoredCertificate {
            name: name.to_owned(),
            spec: CertificateSpec::new(domain),
            expires_at: OffsetDateTime::now_utc() + expires_in,
        }
    }

    async fn issuer_for(server: &TestServer) -> Issuer {
        let dir = Directory::new(DirectoryUrl::Other(&server.dir_url)).unwrap();
        let key = AccountKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let account = dir.register_account(key, None).await.unwrap();

        let registry = Arc::new(ProviderRegistry::new().with(Arc::new(NullProvider)));
        let config = crate::order::OrderConfig {
            poll_interval: Duration::from_millis(10),
            dns_settle: Duration::ZERO,
            ..Default::default()
        };
        Issuer::new(account, registry).with_config(config)
    }

    #[tokio::test]
    async fn pass_renews_only_due_certificates() {
        let server = TestServer::spawn();
        let issuer = issuer_for(&server).await;

        let store = MemStore {
            certs: vec![
                stored("due", "acme-test.example.com", time::Duration::days(10)),
                stored("fresh", "acme-test.example.com", time::Duration::days(60)),
            ],
            stored: Mutex::new(Vec::new()),
        };

        let scheduler = RenewalScheduler::new(issuer, store, FreshKeys(AtomicUsize::new(0)));
        let renewed = scheduler.pass().await.unwrap();

        assert_eq!(renewed, 1);
        assert_eq!(*scheduler.store.stored.lock(), vec!["due".to_owned()]);
        assert_eq!(scheduler.keys.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_certificate_does_not_block_others() {
        let server = TestServer::spawn();
        let issuer = issuer_for(&server).await;

        struct FailingKeys;

        #[async_trait]
        impl KeySource for FailingKeys {
            async fn certificate_key(&self, name: &str) -> Result<CertificateKey> {
                if name == "broken" {
                    return Err(Error::Storage("key missing".to_owned()));
                }
                Ok(create_p256_key())
            }
        }

        let store = MemStore {
            certs: vec![
                stored("broken", "acme-test.example.com", time::Duration::days(1)),
                stored("ok", "acme-test.example.com", time::Duration::days(1)),
            ],
            stored: Mutex::new(Vec::new()),
        };

        let scheduler = RenewalScheduler::new(issuer, store, FailingKeys);
        let renewed = scheduler.pass().await.unwrap();

        assert_eq!(renewed, 1);
        assert_eq!(*scheduler.store.stored.lock(), vec!["ok".to_owned()]);
    }
}
