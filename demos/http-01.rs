use std::{fs, sync::Arc};

use certforge::{
    create_p256_key,
    order::{CertificateSpec, Issuer},
    provider::{Http01Config, Http01Provider, ProviderRegistry},
    AccountKey, Directory, DirectoryUrl, KeyAlgorithm,
};

const PRIMARY_NAME: &str = "example.org";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Use `DirectoryUrl::LetsEncrypt` for production uses.
    let dir = Directory::new(DirectoryUrl::LetsEncryptStaging)?;

    // Your contact addresses, note the `mailto:`
    let contact = vec!["mailto:foo@bar.com".to_owned()];

    // Generate a private key and register an account with your ACME
    // provider. You should write it to disk and use `load_account`
    // afterwards.
    let key = AccountKey::generate(KeyAlgorithm::EcdsaP256)?;
    let account = dir.register_account(key, Some(contact.clone())).await?;

    // Example of how to load an account from its key:
    let signing_key_pem = account.private_key_pem()?;
    let account = dir.load_account(&signing_key_pem, Some(contact)).await?;

    // Serve proofs over plain HTTP. Validation traffic arrives on port 80,
    // so this needs to be reachable as http://example.org/ from the
    // outside.
    let http = Http01Provider::bind(Http01Config {
        bind_addr: "0.0.0.0:80".parse()?,
        domains: vec![PRIMARY_NAME.to_owned()],
    })?;

    let registry = Arc::new(ProviderRegistry::new().with(Arc::new(http)));
    let issuer = Issuer::new(account, registry);

    // Order a new TLS certificate for a domain. The issuer proves
    // ownership through the registered providers, finalizes the order with
    // a CSR for this key, and downloads the issued chain.
    let cert_key = create_p256_key();
    let cert = issuer
        .issue_or_renew(&CertificateSpec::new(PRIMARY_NAME), &cert_key)
        .await?;

    fs::write("cert.pem", cert.chain_pem())?;
    fs::write("cert.key", cert.private_key_pem())?;

    println!(
        "issued certificate for {PRIMARY_NAME}, valid until {}",
        cert.not_after(),
    );

    Ok(())
}
