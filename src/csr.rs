use std::io::{BufReader, Cursor};

use der::{
    asn1::Ia5String,
    time::{OffsetDateTime, PrimitiveDateTime},
    Decode as _, Encode as _,
};
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use x509_cert::{
    builder::{Builder as _, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Private key a certificate is issued for.
///
/// Independent from the [account key](crate::AccountKey); the CA decides
/// which algorithms it signs. Let's Encrypt currently accepts RSA 2048-4096
/// and P-256/P-384 ECDSA; this engine generates the ECDSA variants.
#[derive(Clone)]
pub enum CertificateKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

/// Make a P-256 certificate private key.
pub fn create_p256_key() -> CertificateKey {
    let csprng = &mut rand::thread_rng();
    CertificateKey::P256(ecdsa::SigningKey::from(p256::SecretKey::random(csprng)))
}

/// Make a P-384 certificate private key.
pub fn create_p384_key() -> CertificateKey {
    let csprng = &mut rand::thread_rng();
    CertificateKey::P384(ecdsa::SigningKey::from(p384::SecretKey::random(csprng)))
}

impl CertificateKey {
    pub fn from_pem(pem: &str) -> Result<CertificateKey> {
        if let Ok(key) = ecdsa::SigningKey::<p256::NistP256>::from_pkcs8_pem(pem) {
            Ok(CertificateKey::P256(key))
        } else if let Ok(key) = ecdsa::SigningKey::<p384::NistP384>::from_pkcs8_pem(pem) {
            Ok(CertificateKey::P384(key))
        } else {
            Err(Error::UnsupportedKey(
                "certificate keys must be PKCS#8 P-256 or P-384".to_owned(),
            ))
        }
    }

    pub fn to_pem(&self) -> Result<Zeroizing<String>> {
        let pem = match self {
            CertificateKey::P256(key) => key.to_pkcs8_pem(pem::LineEnding::LF),
            CertificateKey::P384(key) => key.to_pkcs8_pem(pem::LineEnding::LF),
        };

        pem.map_err(|err| Error::Key(format!("PEM encoding failed: {err}")))
    }
}

/// Creates a CSR binding exactly `domains` and signs it with `key`.
///
/// The first domain becomes the Common Name; every domain lands in the
/// Subject Alternative Name extension. Returns DER bytes, ready for
/// base64url in the finalize payload.
pub(crate) fn create_csr(key: &CertificateKey, domains: &[&str]) -> Result<Vec<u8>> {
    let primary = domains
        .first()
        .ok_or_else(|| Error::Certificate("CSR requires at least one domain".to_owned()))?;

    let subject = format!("CN={primary}")
        .parse::<Name>()
        .map_err(|err| Error::Certificate(format!("bad subject: {err}")))?;

    let san = SubjectAltName(
        domains
            .iter()
            .map(|domain| {
                Ia5String::new(domain)
                    .map(GeneralName::DnsName)
                    .map_err(|err| Error::Certificate(format!("bad SAN entry {domain}: {err}")))
            })
            .collect::<Result<Vec<_>>>()?,
    );

    let csr = match key {
        CertificateKey::P256(signer) => {
            let mut builder = CsrBuilder::new(subject, signer)
                .map_err(|err| Error::Certificate(format!("CSR builder: {err}")))?;
            builder
                .add_extension(&san)
                .map_err(|err| Error::Certificate(format!("CSR SAN: {err}")))?;
            builder
                .build::<p256::ecdsa::DerSignature>()
                .map_err(|err| Error::Certificate(format!("CSR signing: {err}")))?
        }
        CertificateKey::P384(signer) => {
            let mut builder = CsrBuilder::new(subject, signer)
                .map_err(|err| Error::Certificate(format!("CSR builder: {err}")))?;
            builder
                .add_extension(&san)
                .map_err(|err| Error::Certificate(format!("CSR SAN: {err}")))?;
            builder
                .build::<p384::ecdsa::DerSignature>()
                .map_err(|err| Error::Certificate(format!("CSR signing: {err}")))?
        }
    };

    csr.to_der()
        .map_err(|err| Error::Certificate(format!("CSR DER encoding: {err}")))
}

/// An issued certificate: the PEM chain, its validity window, and the
/// private key it was issued for.
///
/// Handed to the storage collaborator once issuance completes; the engine
/// keeps no copy.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    private_key_pem: Zeroizing<String>,
    chain_pem: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl IssuedCertificate {
    /// Validates a downloaded PEM chain and captures its validity window
    /// from the end-entity certificate (first in the chain).
    pub(crate) fn from_chain(key: &CertificateKey, chain_pem: String) -> Result<Self> {
        let leaf = leaf_der(&chain_pem)?;
        let cert = x509_cert::Certificate::from_der(&leaf)
            .map_err(|err| Error::Certificate(format!("bad leaf certificate: {err}")))?;

        let validity = &cert.tbs_certificate.validity;
        let not_before = to_utc(validity.not_before.to_date_time())?;
        let not_after = to_utc(validity.not_after.to_date_time())?;

        Ok(IssuedCertificate {
            private_key_pem: key.to_pem()?,
            chain_pem,
            not_before,
            not_after,
        })
    }

    /// The private key in PEM format.
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// The issued chain in PEM format, end-entity certificate first.
    pub fn chain_pem(&self) -> &str {
        &self.chain_pem
    }

    /// The chain split into DER certificates.
    pub fn chain_der(&self) -> Result<Vec<Vec<u8>>> {
        let mut rdr = BufReader::new(Cursor::new(self.chain_pem.as_bytes()));

        let certs = rustls_pemfile::certs(&mut rdr)
            .map(|res| res.map(|cert| cert.to_vec()))
            .collect::<Result<Vec<_>, _>>();

        certs.map_err(|err| Error::Certificate(format!("bad chain PEM: {err}")))
    }

    /// Subject of the end-entity certificate, RFC 4514 form.
    pub fn leaf_subject(&self) -> Result<String> {
        let leaf = leaf_der(&self.chain_pem)?;
        let cert = x509_cert::Certificate::from_der(&leaf)
            .map_err(|err| Error::Certificate(format!("bad leaf certificate: {err}")))?;
        Ok(cert.tbs_certificate.subject.to_string())
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Number of whole days of validity left. Negative once expired.
    pub fn valid_days_left(&self) -> i64 {
        (self.not_after - OffsetDateTime::now_utc()).whole_days()
    }
}

fn leaf_der(chain_pem: &str) -> Result<Vec<u8>> {
    let mut rdr = BufReader::new(Cursor::new(chain_pem.as_bytes()));

    let first = rustls_pemfile::certs(&mut rdr).next().transpose();

    first
        .map_err(|err| Error::Certificate(format!("bad chain PEM: {err}")))?
        .map(|cert| cert.to_vec())
        .ok_or_else(|| Error::Certificate("no certificates in chain".to_owned()))
}

fn to_utc(datetime: der::DateTime) -> Result<OffsetDateTime> {
    // X.509 validity times are UTC by definition
    PrimitiveDateTime::try_from(datetime)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| Error::Certificate(format!("bad validity time: {err}")))
}
