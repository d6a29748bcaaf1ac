use serde::{Deserialize, Serialize};

use crate::api;

/// The status of an [`api::Challenge`].
///
/// See [RFC 8555 §7.1.6].
///
/// [RFC 8555 §7.1.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// An ACME challenge object.
///
/// One offered method of validating one authorization. POSTing `{}` to
/// `url` tells the CA that proof material is in place and validation may
/// begin.
///
/// See [RFC 8555 §7.1.5].
///
/// [RFC 8555 §7.1.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.5
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Challenge type, e.g. `dns-01` or `http-01`.
    #[serde(rename = "type")]
    pub _type: String,

    /// URL to which the "proof is ready" response is posted.
    pub url: String,

    /// Status of this challenge.
    pub status: ChallengeStatus,

    /// Time at which the server validated this challenge. RFC 3339 format.
    pub validated: Option<String>,

    /// Error that occurred while the server was validating, if any.
    pub error: Option<api::Problem>,

    pub token: String,
}
