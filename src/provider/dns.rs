//! dns-01 proof placement against a zone-based DNS API.
//!
//! Speaks the common `/zones` + `/zones/{id}/dns_records` REST shape. Zone
//! lookups are cached for the lifetime of the provider; record writes for
//! the same domain are serialized so concurrent orders for overlapping
//! names cannot interleave create/delete.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use super::{domain_in_scope, ChallengeKind, ChallengeProvider, ProofMaterial};
use crate::error::{Error, Result};

/// Configuration for a [`ZoneDnsProvider`]. Immutable once the provider is
/// built.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsProviderConfig {
    /// Base URL of the DNS API, e.g. `https://api.cloudflare.com/client/v4`.
    pub api_url: String,

    /// Bearer token for the API.
    pub api_token: String,

    /// Domains this provider may answer for. An entry covers itself and all
    /// subdomains; `*` covers everything.
    pub domains: Vec<String>,
}

pub struct ZoneDnsProvider {
    config: DnsProviderConfig,
    client: reqwest::Client,
    // apex domain -> zone id
    zone_ids: Mutex<HashMap<String, String>>,
    record_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default = "Vec::new")]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ZoneInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RecordInfo {
    id: String,
}

// "record already exists" on create
const CODE_RECORD_EXISTS: i64 = 81058;

impl ZoneDnsProvider {
    pub fn new(config: DnsProviderConfig) -> Result<ZoneDnsProvider> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(ZoneDnsProvider {
            config,
            client,
            zone_ids: Mutex::new(HashMap::new()),
            record_locks: Mutex::new(HashMap::new()),
        })
    }

    fn record_lock(&self, record_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.record_locks.lock();
        Arc::clone(
            locks
                .entry(record_name.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Drops the map entry once no task holds the lock anymore, so the map
    /// does not grow with every order ever processed.
    fn release_record_lock(&self, record_name: &str) {
        let mut locks = self.record_locks.lock();
        if let Some(lock) = locks.get(record_name) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(record_name);
            }
        }
    }

    fn provider_err(&self, domain: &str, reason: impl Into<String>) -> Error {
        Error::Provider {
            domain: domain.to_owned(),
            reason: reason.into(),
        }
    }

    async fn zone_id(&self, domain: &str) -> Result<String> {
        for candidate in apex_candidates(domain) {
            if let Some(id) = self.zone_ids.lock().get(&candidate).cloned() {
                return Ok(id);
            }

            let url = format!("{}/zones?name={candidate}", self.config.api_url);
            let envelope: ApiEnvelope<Vec<ZoneInfo>> = self
                .client
                .get(&url)
                .bearer_auth(&self.config.api_token)
                .send()
                .await?
                .json()
                .await?;

            if let Some(zone) = envelope.result.unwrap_or_default().into_iter().next() {
                self.zone_ids
                    .lock()
                    .insert(candidate, zone.id.clone());
                return Ok(zone.id);
            }
        }

        Err(self.provider_err(domain, "no DNS zone found for domain"))
    }

    async fn create_record(&self, zone_id: &str, name: &str, content: &str) -> Result<()> {
        let url = format!("{}/zones/{zone_id}/dns_records", self.config.api_url);
        let envelope: ApiEnvelope<RecordInfo> = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_token)
            .json(&json!({
                "type": "TXT",
                "name": name,
                "content": content,
                "ttl": 60,
            }))
            .send()
            .await?
            .json()
            .await?;

        if envelope.success {
            return Ok(());
        }

        // a leftover record with identical content is fine
        if envelope.errors.iter().any(|e| e.code == CODE_RECORD_EXISTS) {
            log::debug!("TXT record {name} already exists; keeping it");
            return Ok(());
        }

        Err(self.provider_err(
            name,
            format!("record create failed: {}", first_error(&envelope.errors)),
        ))
    }

    async fn delete_record(&self, zone_id: &str, name: &str, content: &str) -> Result<()> {
        let list_url = format!(
            "{}/zones/{zone_id}/dns_records?type=TXT&name={name}&content={content}",
            self.config.api_url,
        );
        let envelope: ApiEnvelope<Vec<RecordInfo>> = self
            .client
            .get(&list_url)
            .bearer_auth(&self.config.api_token)
            .send()
            .await?
            .json()
            .await?;

        for record in envelope.result.unwrap_or_default() {
            let url = format!("{}/zones/{zone_id}/dns_records/{}", self.config.api_url, record.id);
            let res = self
                .client
                .delete(&url)
                .bearer_auth(&self.config.api_token)
                .send()
                .await?;

            // racing cleanup is not an error
            if res.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }

            let envelope: ApiEnvelope<RecordInfo> = res.json().await?;
            if !envelope.success {
                return Err(self.provider_err(
                    name,
                    format!("record delete failed: {}", first_error(&envelope.errors)),
                ));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ChallengeProvider for ZoneDnsProvider {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Dns01
    }

    fn covers(&self, domain: &str) -> bool {
        domain_in_scope(&self.config.domains, domain)
    }

    async fn provision(&self, domain: &str, material: &ProofMaterial) -> Result<()> {
        let record_name = challenge_record_name(domain);
        let lock = self.record_lock(&record_name);
        let _guard = lock.lock().await;

        let zone_id = self.zone_id(domain).await?;
        log::debug!("placing TXT {record_name} in zone {zone_id}");
        self.create_record(&zone_id, &record_name, &material.dns_txt_value)
            .await
    }

    async fn cleanup(&self, domain: &str, material: &ProofMaterial) -> Result<()> {
        let record_name = challenge_record_name(domain);
        let lock = self.record_lock(&record_name);

        let result = {
            let _guard = lock.lock().await;
            match self.zone_id(domain).await {
                Ok(zone_id) => {
                    log::debug!("removing TXT {record_name} from zone {zone_id}");
                    self.delete_record(&zone_id, &record_name, &material.dns_txt_value)
                        .await
                }
                Err(err) => Err(err),
            }
        };

        drop(lock);
        self.release_record_lock(&record_name);
        result
    }
}

/// Record name for a dns-01 proof, per RFC 8555 §8.4.
fn challenge_record_name(domain: &str) -> String {
    format!("_acme-challenge.{domain}")
}

/// Candidate zone apexes for `domain`, most specific first. The challenge
/// name itself is never a zone.
fn apex_candidates(domain: &str) -> Vec<String> {
    let labels: Vec<&str> = domain.split('.').collect();

    // need at least two labels to form a registrable name
    (0..labels.len().saturating_sub(1))
        .map(|i| labels[i..].join("."))
        .collect()
}

fn first_error(errors: &[ApiError]) -> String {
    errors
        .first()
        .map(|e| format!("{} ({})", e.message, e.code))
        .unwrap_or_else(|| "unknown API error".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_record_names() {
        assert_eq!(
            challenge_record_name("example.com"),
            "_acme-challenge.example.com"
        );
        assert_eq!(
            challenge_record_name("www.example.com"),
            "_acme-challenge.www.example.com"
        );
    }

    #[test]
    fn apex_candidates_walk_parents() {
        assert_eq!(
            apex_candidates("a.b.example.com"),
            vec!["a.b.example.com", "b.example.com", "example.com"]
        );
        assert_eq!(apex_candidates("example.com"), vec!["example.com"]);
    }

    #[test]
    fn scope_from_config() {
        let provider = ZoneDnsProvider::new(DnsProviderConfig {
            api_url: "https://dns.invalid/v4".to_owned(),
            api_token: "token".to_owned(),
            domains: vec!["example.com".to_owned()],
        })
        .unwrap();

        assert!(provider.covers("example.com"));
        assert!(provider.covers("www.example.com"));
        assert!(!provider.covers("other.net"));
    }

    #[test]
    fn record_locks_are_evicted_when_idle() {
        let provider = ZoneDnsProvider::new(DnsProviderConfig {
            api_url: "https://dns.invalid/v4".to_owned(),
            api_token: "token".to_owned(),
            domains: vec!["example.com".to_owned()],
        })
        .unwrap();

        let name = "_acme-challenge.example.com";

        let lock = provider.record_lock(name);
        drop(lock);
        provider.release_record_lock(name);
        assert!(provider.record_locks.lock().is_empty());

        // a lock still held elsewhere stays in the map
        let lock = provider.record_lock(name);
        provider.release_record_lock(name);
        assert_eq!(provider.record_locks.lock().len(), 1);
        drop(lock);
    }

    #[test]
    fn api_envelope_parses_errors() {
        let raw = r#"{"success":false,"errors":[{"code":81058,"message":"Record already exists."}],"result":null}"#;
        let envelope: ApiEnvelope<RecordInfo> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.success);
        assert_eq!(envelope.errors[0].code, CODE_RECORD_EXISTS);
    }
}
