use std::{sync::Arc, time::Duration};

use crate::{
    account::Account,
    api,
    error::{Error, Result},
    key::AccountKey,
    trans::Transport,
};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// The main Let's Encrypt directory.
    ///
    /// Not appropriate for testing / development.
    LetsEncrypt,

    /// The staging Let's Encrypt directory.
    ///
    /// Use for testing and development. Doesn't issue "valid" certificates.
    LetsEncryptStaging,

    /// Provide an arbitrary directory URL to connect to.
    Other(&'a str),
}

impl DirectoryUrl<'_> {
    fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }
}

struct DirectoryInner {
    url: String,
    client: reqwest::Client,
    // fetched on first use; the lock makes concurrent first callers await
    // one fetch instead of issuing duplicates
    cached: tokio::sync::Mutex<Option<api::Directory>>,
}

/// Entry point for accessing an ACME API.
///
/// The endpoint document is fetched lazily and cached for the process
/// lifetime; [`invalidate`](Directory::invalidate) forces a refetch.
#[derive(Clone)]
pub struct Directory {
    inner: Arc<DirectoryInner>,
}

impl Directory {
    /// Creates a directory handle. No network traffic happens until the
    /// endpoints are first needed.
    pub fn new(url: DirectoryUrl<'_>) -> Result<Directory> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;

        Ok(Directory {
            inner: Arc::new(DirectoryInner {
                url: url.to_url().to_owned(),
                client,
                cached: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// The cached endpoint document, fetching it on first use.
    ///
    /// Partial results are never cached: a failed fetch leaves the cache
    /// empty and surfaces as [`Error::DirectoryUnavailable`].
    pub async fn endpoints(&self) -> Result<api::Directory> {
        let mut cached = self.inner.cached.lock().await;

        if let Some(directory) = cached.as_ref() {
            return Ok(directory.clone());
        }

        log::debug!("Fetching ACME directory from {}", self.inner.url);

        let directory = self
            .inner
            .client
            .get(&self.inner.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| Error::DirectoryUnavailable(err.to_string()))?
            .json::<api::Directory>()
            .await
            .map_err(|err| Error::DirectoryUnavailable(err.to_string()))?;

        *cached = Some(directory.clone());
        Ok(directory)
    }

    /// Drops the cached endpoint document; the next use refetches.
    pub async fn invalidate(&self) {
        *self.inner.cached.lock().await = None;
    }

    /// Terms-of-service URL published by the CA, if any.
    pub async fn terms_of_service(&self) -> Result<Option<String>> {
        Ok(self
            .endpoints()
            .await?
            .terms_of_service()
            .map(str::to_owned))
    }

    pub async fn external_account_required(&self) -> Result<bool> {
        Ok(self.endpoints().await?.external_account_required())
    }

    /// Registers (or re-registers) an account for `key`.
    ///
    /// Registration is idempotent per RFC 8555: posting an already-known
    /// key returns the existing account and its kid, never an error.
    pub async fn register_account(
        &self,
        key: AccountKey,
        contact: Option<Vec<String>>,
    ) -> Result<Account> {
        let payload = api::Account {
            contact,
            terms_of_service_agreed: Some(true),
            ..Default::default()
        };

        self.upsert_account(key, payload).await
    }

    /// Loads an account from a private key PEM, registering if needed.
    pub async fn load_account(
        &self,
        private_key_pem: &str,
        contact: Option<Vec<String>>,
    ) -> Result<Account> {
        let key = AccountKey::from_pem(private_key_pem)?;
        self.register_account(key, contact).await
    }

    /// Loads an account that must already exist; the CA reports
    /// `accountDoesNotExist` otherwise.
    pub async fn load_existing_account(&self, private_key_pem: &str) -> Result<Account> {
        let key = AccountKey::from_pem(private_key_pem)?;

        let payload = api::Account {
            only_return_existing: Some(true),
            ..Default::default()
        };

        self.upsert_account(key, payload).await
    }

    async fn upsert_account(&self, key: AccountKey, payload: api::Account) -> Result<Account> {
        let endpoints = self.endpoints().await?;

        // newAccount is the one call addressed by JWK; every later request
        // uses the kid the server hands back in the Location header.
        let mut transport = Transport::new(self.clone(), key);
        let res = transport.call_jwk(&endpoints.new_account, &payload).await?;

        let kid = res
            .location
            .clone()
            .ok_or_else(|| Error::MalformedResponse("newAccount without Location".to_owned()))?;
        log::debug!("Account key ID is: {kid}");

        let api_account = res.json::<api::Account>()?;
        transport.set_kid(kid.clone());

        Ok(Account::new(transport, kid, api_account, self.clone()))
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.inner.client
    }
}
