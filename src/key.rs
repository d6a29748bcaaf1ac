use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Key algorithms accepted for ACME account keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    EcdsaP256,
    EcdsaP384,
    Rsa2048,
}

#[derive(Clone)]
pub(crate) enum KeyPair {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    Rsa(rsa::RsaPrivateKey),
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // private key material stays out of logs
        match self {
            KeyPair::P256(_) => f.write_str("KeyPair::P256"),
            KeyPair::P384(_) => f.write_str("KeyPair::P384"),
            KeyPair::Rsa(_) => f.write_str("KeyPair::Rsa"),
        }
    }
}

/// An account's private key plus the server-assigned key ID once known.
///
/// The key itself is immutable; the `kid` is set exactly once, when the
/// newAccount response's `Location` header comes back.
#[derive(Debug, Clone)]
pub struct AccountKey {
    pair: KeyPair,
    kid: Option<String>,
}

impl AccountKey {
    /// Generate a fresh key of the given algorithm.
    pub fn generate(algorithm: KeyAlgorithm) -> Result<AccountKey> {
        let csprng = &mut rand::thread_rng();

        let pair = match algorithm {
            KeyAlgorithm::EcdsaP256 => {
                KeyPair::P256(ecdsa::SigningKey::from(p256::SecretKey::random(csprng)))
            }
            KeyAlgorithm::EcdsaP384 => {
                KeyPair::P384(ecdsa::SigningKey::from(p384::SecretKey::random(csprng)))
            }
            KeyAlgorithm::Rsa2048 => KeyPair::Rsa(
                rsa::RsaPrivateKey::new(csprng, 2048)
                    .map_err(|err| Error::Key(format!("RSA key generation failed: {err}")))?,
            ),
        };

        Ok(AccountKey { pair, kid: None })
    }

    /// Load a key from PKCS#8 PEM, detecting the algorithm from the document.
    pub fn from_pem(pem: &str) -> Result<AccountKey> {
        let pair = if let Ok(key) = ecdsa::SigningKey::<p256::NistP256>::from_pkcs8_pem(pem) {
            KeyPair::P256(key)
        } else if let Ok(key) = ecdsa::SigningKey::<p384::NistP384>::from_pkcs8_pem(pem) {
            KeyPair::P384(key)
        } else if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_pem(pem) {
            KeyPair::Rsa(key)
        } else {
            return Err(Error::UnsupportedKey(
                "not a PKCS#8 P-256, P-384, or RSA private key".to_owned(),
            ));
        };

        Ok(AccountKey { pair, kid: None })
    }

    pub fn to_pem(&self) -> Result<Zeroizing<String>> {
        let pem = match &self.pair {
            KeyPair::P256(key) => key.to_pkcs8_pem(pem::LineEnding::LF),
            KeyPair::P384(key) => key.to_pkcs8_pem(pem::LineEnding::LF),
            KeyPair::Rsa(key) => key.to_pkcs8_pem(pem::LineEnding::LF),
        };

        pem.map_err(|err| Error::Key(format!("PEM encoding failed: {err}")))
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match &self.pair {
            KeyPair::P256(_) => KeyAlgorithm::EcdsaP256,
            KeyPair::P384(_) => KeyAlgorithm::EcdsaP384,
            KeyPair::Rsa(_) => KeyAlgorithm::Rsa2048,
        }
    }

    /// JWS `alg` header value mandated for this key type.
    pub fn jws_alg(&self) -> &'static str {
        match &self.pair {
            KeyPair::P256(_) => "ES256",
            KeyPair::P384(_) => "ES384",
            KeyPair::Rsa(_) => "RS256",
        }
    }

    /// Sign `message` with the scheme matching the key type: ECDSA with the
    /// curve-matched hash, or RSA PKCS#1 v1.5 with SHA-256.
    pub(crate) fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        use ecdsa::signature::Signer as _;

        let signature = match &self.pair {
            KeyPair::P256(key) => {
                let sig: p256::ecdsa::Signature = key.sign(message);
                sig.to_vec()
            }
            KeyPair::P384(key) => {
                let sig: p384::ecdsa::Signature = key.sign(message);
                sig.to_vec()
            }
            KeyPair::Rsa(key) => {
                use rsa::signature::SignatureEncoding as _;

                let signer = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(key.clone());
                signer.sign(message).to_vec()
            }
        };

        Ok(signature)
    }

    pub(crate) fn pair(&self) -> &KeyPair {
        &self.pair
    }

    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Record the server-assigned account URL. A kid, once set, is final.
    pub(crate) fn set_kid(&mut self, kid: String) {
        if self.kid.is_none() {
            self.kid = Some(kid);
        } else if self.kid.as_deref() != Some(kid.as_str()) {
            log::warn!("Ignoring attempt to replace account key ID");
        }
    }
}
