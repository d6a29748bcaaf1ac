//! Drives one authorization from pending to valid.

use std::time::Instant;

use crate::{
    api,
    error::{Error, Result},
    provider::{ChallengeKind, ChallengeProvider, ProofMaterial, ProviderRegistry},
    shutdown::Shutdown,
    trans::Transport,
};

use super::{wait, OrderConfig};

/// Satisfies the authorization behind `auth_url`, or explains why it cannot
/// be satisfied.
///
/// Provider selection happens before any proof is placed, so scope and
/// wildcard violations never leave stray records behind. Once material has
/// been provisioned, cleanup runs no matter how the attempt ends.
pub(crate) async fn satisfy(
    transport: &Transport,
    registry: &ProviderRegistry,
    auth_url: &str,
    config: &OrderConfig,
    deadline: Instant,
    shutdown: &Shutdown,
) -> Result<()> {
    let auth: api::Authorization = transport
        .call(auth_url, &api::EmptyString)
        .await?
        .json()?;

    let domain = auth.identifier.value.clone();

    match auth.status {
        // cached from an earlier order
        api::AuthorizationStatus::Valid => {
            log::debug!("authorization for {domain} already valid");
            return Ok(());
        }
        api::AuthorizationStatus::Pending => {}
        status => {
            return Err(Error::ChallengeFailed {
                domain,
                reason: format!("authorization is {status:?}"),
            });
        }
    }

    let offered: Vec<ChallengeKind> = auth
        .challenges
        .iter()
        .filter_map(|c| ChallengeKind::from_acme_type(&c._type))
        .collect();

    let provider = registry.select(&domain, &offered, auth.is_wildcard())?;

    let challenge = auth
        .challenge(provider.kind().acme_type())
        .ok_or_else(|| {
            Error::MalformedResponse(format!(
                "authorization for {domain} lost its {} challenge",
                provider.kind(),
            ))
        })?;

    let material = ProofMaterial::new(&challenge.token, transport.key())?;

    log::info!(
        "proving control of {domain} via {} (token {})",
        provider.kind(),
        challenge.token,
    );
    provider.provision(&domain, &material).await?;

    let result = validate(
        transport,
        &provider,
        &domain,
        auth_url,
        &challenge.url,
        config,
        deadline,
        shutdown,
    )
    .await;

    // runs on success, failure, timeout and cancellation alike
    if let Err(err) = provider.cleanup(&domain, &material).await {
        log::warn!("failed to clean up proof material for {domain}: {err}");
    }

    result
}

/// The part of the attempt that runs with proof material in place.
#[allow(clippy::too_many_arguments)]
async fn validate(
    transport: &Transport,
    provider: &std::sync::Arc<dyn ChallengeProvider>,
    domain: &str,
    auth_url: &str,
    challenge_url: &str,
    config: &OrderConfig,
    deadline: Instant,
    shutdown: &Shutdown,
) -> Result<()> {
    // DNS propagation is not instant; give resolvers a head start before
    // the CA queries the record
    if provider.kind() == ChallengeKind::Dns01 && !config.dns_settle.is_zero() {
        log::debug!(
            "waiting {:?} for DNS propagation of _acme-challenge.{domain}",
            config.dns_settle,
        );
        wait(config.dns_settle, deadline, shutdown, "dns propagation").await?;
    }

    transport.call(challenge_url, &api::EmptyObject).await?;

    let mut delay = config.poll_interval;

    loop {
        wait(delay, deadline, shutdown, "authorization validation").await?;
        delay = super::next_delay(delay);

        let res = transport.call(auth_url, &api::EmptyString).await?;
        if let Some(retry_after) = res.retry_after {
            delay = retry_after;
        }
        let auth: api::Authorization = res.json()?;

        match auth.status {
            api::AuthorizationStatus::Pending => continue,
            api::AuthorizationStatus::Valid => {
                log::info!("authorization for {domain} is valid");
                return Ok(());
            }
            status => {
                let reason = auth
                    .challenge_error()
                    .map(|problem| problem.to_string())
                    .unwrap_or_else(|| format!("authorization is {status:?}"));

                return Err(Error::ChallengeFailed {
                    domain: domain.to_owned(),
                    reason,
                });
            }
        }
    }
}
