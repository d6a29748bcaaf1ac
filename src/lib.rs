//! Certificate issuance and renewal against ACME (Automatic Certificate
//! Management Environment) providers such as
//! [Let's Encrypt](https://letsencrypt.org/).
//!
//! Implements the client side of [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555):
//! account registration, order processing, dns-01 / http-01 challenge
//! fulfillment through pluggable [providers](crate::provider), and
//! background [renewal](crate::renew).
//!
//! # Usage
//!
//! Build a [`Directory`] for your CA, register or load an [`Account`],
//! configure a [`ProviderRegistry`](crate::provider::ProviderRegistry) with
//! the challenge mechanisms you control, then hand both to an
//! [`Issuer`](crate::order::Issuer):
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use certforge::{
//!     order::{CertificateSpec, Issuer},
//!     provider::{DnsProviderConfig, ProviderRegistry, ZoneDnsProvider},
//!     create_p256_key, Directory, DirectoryUrl, KeyAlgorithm,
//! };
//!
//! # async fn run() -> certforge::Result<()> {
//! let dir = Directory::new(DirectoryUrl::LetsEncryptStaging)?;
//! let key = certforge::AccountKey::generate(KeyAlgorithm::EcdsaP256)?;
//! let account = dir.register_account(key, None).await?;
//!
//! let dns = ZoneDnsProvider::new(DnsProviderConfig {
//!     api_url: "https://api.cloudflare.com/client/v4".to_owned(),
//!     api_token: "...".to_owned(),
//!     domains: vec!["example.com".to_owned()],
//! })?;
//!
//! let registry = Arc::new(ProviderRegistry::new().with(Arc::new(dns)));
//! let issuer = Issuer::new(account, registry);
//!
//! let cert = issuer
//!     .issue_or_renew(&CertificateSpec::new("example.com"), &create_p256_key())
//!     .await?;
//! # Ok(()) }
//! ```
//!
//! # Domain Ownership
//!
//! Every name in an order must be proven. A
//! [`ChallengeProvider`](crate::provider::ChallengeProvider) automates one
//! way of proving it: a DNS API for `dns-01`, or an embedded well-known
//! responder for `http-01`. Wildcard names can only be proven over DNS;
//! the registry enforces this before any record is placed.
//!
//! # Rate Limits
//!
//! ACME providers rate-limit aggressively. Polling here backs off
//! exponentially and honors `Retry-After`, but keep order volume in mind,
//! and use [`DirectoryUrl::LetsEncryptStaging`] for development.

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod account;
mod csr;
mod dir;
mod error;
mod jws;
mod key;
mod trans;

pub mod api;
pub mod order;
pub mod provider;
pub mod renew;
pub mod shutdown;

#[cfg(test)]
mod test;

pub use crate::{
    account::Account,
    csr::{create_p256_key, create_p384_key, CertificateKey, IssuedCertificate},
    dir::{Directory, DirectoryUrl},
    error::{Error, Result},
    key::{AccountKey, KeyAlgorithm},
    shutdown::{Shutdown, ShutdownTrigger},
};
