//! Signed request envelopes per [RFC 8555 §6.2].
//!
//! [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{
    error::Result,
    key::{AccountKey, KeyPair},
};

/// JWS protected header.
///
/// > For newAccount requests, and for revokeCert requests authenticated by a
/// > certificate key, there MUST be a "jwk" field. [...] For all other
/// > requests, the request is signed using an existing account, and there
/// > MUST be a "kid" field.
///
/// The two addressing modes are mutually exclusive.
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct ProtectedHeader {
    alg: String,
    nonce: String,
    url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl ProtectedHeader {
    /// Header embedding the public key. Used only before a kid exists,
    /// i.e. for newAccount.
    pub(crate) fn new_jwk(jwk: Jwk, key: &AccountKey, url: &str, nonce: String) -> Self {
        ProtectedHeader {
            alg: key.jws_alg().to_owned(),
            url: url.to_owned(),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    /// Header addressing the account by its kid.
    pub(crate) fn new_kid(key: &AccountKey, kid: &str, url: &str, nonce: String) -> Self {
        ProtectedHeader {
            alg: key.jws_alg().to_owned(),
            url: url.to_owned(),
            nonce,
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }
}

/// Public key in JWK form, shaped per key type.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum Jwk {
    Ec {
        alg: String,
        crv: String,
        kty: String,
        #[serde(rename = "use")]
        _use: String,
        x: String,
        y: String,
    },
    Rsa {
        alg: String,
        e: String,
        kty: String,
        n: String,
        #[serde(rename = "use")]
        _use: String,
    },
}

impl From<&AccountKey> for Jwk {
    fn from(key: &AccountKey) -> Self {
        match key.pair() {
            KeyPair::P256(signing) => {
                let point = signing.verifying_key().to_encoded_point(false);
                Jwk::Ec {
                    alg: "ES256".to_owned(),
                    kty: "EC".to_owned(),
                    crv: "P-256".to_owned(),
                    _use: "sig".to_owned(),
                    x: BASE64_URL_SAFE_NO_PAD.encode(point.x().expect("uncompressed point")),
                    y: BASE64_URL_SAFE_NO_PAD.encode(point.y().expect("uncompressed point")),
                }
            }

            KeyPair::P384(signing) => {
                let point = signing.verifying_key().to_encoded_point(false);
                Jwk::Ec {
                    alg: "ES384".to_owned(),
                    kty: "EC".to_owned(),
                    crv: "P-384".to_owned(),
                    _use: "sig".to_owned(),
                    x: BASE64_URL_SAFE_NO_PAD.encode(point.x().expect("uncompressed point")),
                    y: BASE64_URL_SAFE_NO_PAD.encode(point.y().expect("uncompressed point")),
                }
            }

            KeyPair::Rsa(private) => {
                use rsa::traits::PublicKeyParts as _;

                Jwk::Rsa {
                    alg: "RS256".to_owned(),
                    kty: "RSA".to_owned(),
                    _use: "sig".to_owned(),
                    n: BASE64_URL_SAFE_NO_PAD.encode(private.n().to_bytes_be()),
                    e: BASE64_URL_SAFE_NO_PAD.encode(private.e().to_bytes_be()),
                }
            }
        }
    }
}

// LEXICAL ORDER OF FIELDS MATTERS! (RFC 7638 §3.2)
#[derive(Serialize)]
struct EcThumbprint<'a> {
    crv: &'a str,
    kty: &'a str,
    x: &'a str,
    y: &'a str,
}

// LEXICAL ORDER OF FIELDS MATTERS! (RFC 7638 §3.2)
#[derive(Serialize)]
struct RsaThumbprint<'a> {
    e: &'a str,
    kty: &'a str,
    n: &'a str,
}

impl Jwk {
    /// Base64url SHA-256 thumbprint over the required JWK members, as used
    /// in challenge key authorizations.
    pub(crate) fn thumbprint_sha256(&self) -> Result<String> {
        let json = match self {
            Jwk::Ec { crv, kty, x, y, .. } => serde_json::to_string(&EcThumbprint {
                crv,
                kty,
                x,
                y,
            })?,
            Jwk::Rsa { e, kty, n, .. } => serde_json::to_string(&RsaThumbprint { e, kty, n })?,
        };

        Ok(BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(json)))
    }
}

/// Flattened JSON serialization, [RFC 7515 §7.2.2].
///
/// [RFC 7515 §7.2.2]: https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Construct and sign the compact envelope for one request.
pub(crate) fn sign_envelope<T: Serialize + ?Sized>(
    protected: ProtectedHeader,
    key: &AccountKey,
    payload: &T,
) -> Result<String> {
    let protected = {
        let json = serde_json::to_string(&protected)?;
        BASE64_URL_SAFE_NO_PAD.encode(json)
    };

    let payload = {
        let json = serde_json::to_string(payload)?;

        // `api::EmptyString` serializes to `""`: POST-as-GET requires a
        // truly empty payload, not an encoded empty string.
        if json == "\"\"" {
            String::new()
        } else {
            BASE64_URL_SAFE_NO_PAD.encode(json)
        }
    };

    let signing_input = format!("{protected}.{payload}");
    let signature = BASE64_URL_SAFE_NO_PAD.encode(key.sign(signing_input.as_bytes())?);

    let jws = FlattenedJws {
        protected,
        payload,
        signature,
    };

    Ok(serde_json::to_string(&jws)?)
}
