use serde::{Deserialize, Serialize};

use crate::api;

/// The status of an [`api::Authorization`].
///
/// See [RFC 8555 §7.1.4].
///
/// [RFC 8555 §7.1.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// An ACME authorization object.
///
/// Represents a server's authorization for an account to represent one
/// identifier, together with the challenges offered to prove it.
///
/// See [RFC 8555 §7.1.4].
///
/// [RFC 8555 §7.1.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Authorization identifier.
    pub identifier: api::Identifier,

    /// Authorization status.
    pub status: AuthorizationStatus,

    /// The timestamp after which the server considers this authorization
    /// invalid. RFC 3339 format.
    pub expires: Option<String>,

    /// Challenges the client may fulfill; any single one suffices. For
    /// decided authorizations, the challenge that was attempted.
    pub challenges: Vec<api::Challenge>,

    /// Present and true only for authorizations created from a wildcard
    /// identifier. The `identifier.value` then carries the name without
    /// the `*.` prefix.
    pub wildcard: Option<bool>,
}

impl Authorization {
    /// Returns true if the authorization was created for a wildcard domain.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard.unwrap_or(false)
    }

    /// Challenge of the given type, if offered.
    pub fn challenge(&self, _type: &str) -> Option<&api::Challenge> {
        self.challenges.iter().find(|c| c._type == _type)
    }

    /// The error from whichever challenge was attempted and failed.
    pub fn challenge_error(&self) -> Option<&api::Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }
}
