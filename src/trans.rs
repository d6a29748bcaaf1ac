use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    api,
    dir::Directory,
    error::{Error, Result},
    jws::{self, Jwk, ProtectedHeader},
    key::AccountKey,
};

/// Single-slot replay-nonce cache, one per account-key identity.
///
/// Exactly one "next nonce" is held at a time. [`take`](NonceSlot::take)
/// consumes it atomically; [`observe`](NonceSlot::observe) replaces it
/// unconditionally from a response, error responses included, since the CA
/// returns a fresh nonce either way.
#[derive(Debug, Default)]
pub(crate) struct NonceSlot {
    slot: Mutex<Option<String>>,
}

impl NonceSlot {
    pub(crate) fn take(&self) -> Option<String> {
        self.slot.lock().take()
    }

    pub(crate) fn observe(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(nonce) = headers
            .get("replay-nonce")
            .and_then(|value| value.to_str().ok())
        {
            log::trace!("Caching replay nonce");
            *self.slot.lock() = Some(nonce.to_owned());
        }
    }
}

/// A decoded 2xx response from the CA.
#[derive(Debug)]
pub(crate) struct AcmeResponse {
    pub(crate) body: String,
    pub(crate) location: Option<String>,
    pub(crate) retry_after: Option<Duration>,
}

impl AcmeResponse {
    pub(crate) fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

enum Addressing {
    Jwk,
    Kid,
}

/// Signed request plumbing for one account.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against the newAccount URL
/// 3. `set_kid()` from the returned `Location` header
/// 4. `call()` for everything after that.
#[derive(Clone)]
pub(crate) struct Transport {
    directory: Directory,
    key: AccountKey,
    nonces: Arc<NonceSlot>,
}

impl Transport {
    pub(crate) fn new(directory: Directory, key: AccountKey) -> Self {
        Transport {
            directory,
            key,
            nonces: Arc::new(NonceSlot::default()),
        }
    }

    /// Records the key ID once it is known (part of setting up the
    /// transport).
    pub(crate) fn set_kid(&mut self, kid: String) {
        self.key.set_kid(kid);
    }

    /// The account key used by this transport.
    pub(crate) fn key(&self) -> &AccountKey {
        &self.key
    }

    /// One signed call addressed by the full JWK. Only for newAccount.
    pub(crate) async fn call_jwk<T>(&self, url: &str, body: &T) -> Result<AcmeResponse>
    where
        T: Serialize + ?Sized,
    {
        self.call_with(url, body, Addressing::Jwk).await
    }

    /// One signed call addressed by the account's kid.
    pub(crate) async fn call<T>(&self, url: &str, body: &T) -> Result<AcmeResponse>
    where
        T: Serialize + ?Sized,
    {
        self.call_with(url, body, Addressing::Kid).await
    }

    async fn call_with<T>(&self, url: &str, body: &T, addressing: Addressing) -> Result<AcmeResponse>
    where
        T: Serialize + ?Sized,
    {
        match self.attempt(url, body, &addressing).await {
            // A stale nonce earns exactly one retry with a fresh one; the
            // second failure is the caller's problem.
            Err(Error::Problem(problem)) if problem.is_bad_nonce() => {
                log::debug!("Retrying once on bad nonce");
                self.attempt(url, body, &addressing).await
            }
            other => other,
        }
    }

    async fn attempt<T>(&self, url: &str, body: &T, addressing: &Addressing) -> Result<AcmeResponse>
    where
        T: Serialize + ?Sized,
    {
        let nonce = self.next_nonce().await?;

        let protected = match addressing {
            Addressing::Jwk => {
                ProtectedHeader::new_jwk(Jwk::from(&self.key), &self.key, url, nonce)
            }
            Addressing::Kid => {
                let kid = self
                    .key
                    .kid()
                    .ok_or_else(|| Error::Key("account has no key ID yet".to_owned()))?;
                ProtectedHeader::new_kid(&self.key, kid, url, nonce)
            }
        };

        let envelope = jws::sign_envelope(protected, &self.key, body)?;

        log::debug!("Call endpoint: {url}");

        let res = self
            .directory
            .http_client()
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/jose+json")
            .body(envelope)
            .send()
            .await?;

        // there might be a nonce on the response whether or not the
        // request succeeded
        self.nonces.observe(res.headers());

        let status = res.status();
        let location = header_string(&res, "location");
        let retry_after = header_string(&res, "retry-after")
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = res.text().await.unwrap_or_default();

        if status.is_success() {
            return Ok(AcmeResponse {
                body,
                location,
                retry_after,
            });
        }

        let problem = serde_json::from_str::<api::Problem>(&body).unwrap_or_else(|_| api::Problem {
            _type: "httpReqError".to_owned(),
            detail: Some(format!("{status} body: {body}")),
            status: Some(status.as_u16()),
            subproblems: None,
        });

        if problem.is_rate_limited() {
            return Err(Error::RateLimited {
                problem,
                retry_after,
            });
        }

        Err(problem.into())
    }

    /// Takes the cached nonce, or fetches one from the newNonce endpoint
    /// when the slot is empty.
    async fn next_nonce(&self) -> Result<String> {
        if let Some(nonce) = self.nonces.take() {
            log::trace!("Using cached nonce");
            return Ok(nonce);
        }

        log::debug!("Requesting new nonce");
        let new_nonce_url = self.directory.endpoints().await?.new_nonce;

        let res = self
            .directory
            .http_client()
            .head(&new_nonce_url)
            .send()
            .await?;

        // handed straight to the requesting call; routing it through the
        // shared slot would let a concurrent fetch swallow it
        header_string(&res, "replay-nonce").ok_or_else(|| {
            Error::MalformedResponse("newNonce response without Replay-Nonce".to_owned())
        })
    }
}

fn header_string(res: &reqwest::Response, name: &str) -> Option<String> {
    res.headers()
        .get(name)?
        .to_str()
        .ok()
        .map(str::to_owned)
}
