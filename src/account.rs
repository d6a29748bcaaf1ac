use std::{collections::HashSet, iter, sync::Arc};

use zeroize::Zeroizing;

use crate::{
    api,
    dir::Directory,
    error::{Error, Result},
    trans::Transport,
};

pub(crate) struct AccountInner {
    pub(crate) transport: Transport,
    pub(crate) kid: String,
    pub(crate) api_account: api::Account,
    pub(crate) directory: Directory,
}

/// A registered account with an ACME provider.
///
/// Obtained from [`Directory::register_account()`] and friends. Cloning is
/// cheap; clones share the same signer identity and nonce slot, so
/// concurrent orders under one account stay replay-safe.
///
/// [`Directory::register_account()`]: crate::Directory::register_account()
#[derive(Clone)]
pub struct Account {
    inner: Arc<AccountInner>,
}

impl Account {
    pub(crate) fn new(transport: Transport, kid: String, api_account: api::Account, directory: Directory) -> Self {
        Self {
            inner: Arc::new(AccountInner {
                transport,
                kid,
                api_account,
                directory,
            }),
        }
    }

    /// The server-assigned account URL (key ID).
    pub fn kid(&self) -> &str {
        &self.inner.kid
    }

    /// Private key for this account, PKCS#8 PEM.
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>> {
        self.inner.transport.key().to_pem()
    }

    /// Updates the account's contact addresses.
    pub async fn update_contact(&self, contact: Vec<String>) -> Result<api::Account> {
        let payload = api::Account {
            contact: Some(contact),
            ..Default::default()
        };

        let res = self.inner.transport.call(self.kid(), &payload).await?;
        res.json::<api::Account>()
    }

    /// Account key rotation is deliberately unsupported in this version.
    pub fn rotate_key(&self) -> Result<()> {
        Err(Error::NotImplemented("account key rotation"))
    }

    /// Account deactivation is deliberately unsupported in this version.
    pub fn deactivate(&self) -> Result<()> {
        Err(Error::NotImplemented("account deactivation"))
    }

    /// Creates a new order for `primary_name` plus `alt_names`.
    ///
    /// Returns the CA-assigned order URL and the order body, with the
    /// identifier ordering we requested (some CAs permute it, which would
    /// otherwise flip the CN with a SAN).
    pub(crate) async fn create_order(
        &self,
        primary_name: &str,
        alt_names: &[String],
    ) -> Result<(String, api::Order)> {
        let mut identifiers = Vec::new();
        let mut dedup = HashSet::new();
        for domain in iter::once(primary_name).chain(alt_names.iter().map(String::as_str)) {
            if dedup.insert(domain) {
                identifiers.push(api::Identifier::dns(domain));
            }
        }

        let order = api::Order::from_identifiers(identifiers);
        let new_order_url = self.inner.directory.endpoints().await?.new_order;

        let res = self.inner.transport.call(&new_order_url, &order).await?;
        let order_url = res
            .location
            .clone()
            .ok_or_else(|| Error::MalformedResponse("newOrder without Location".to_owned()))?;
        let mut from_ca = res.json::<api::Order>()?;

        // The requested identifier set binds the CSR later; a CA answering
        // with a different set is rejected before any further calls.
        let requested: HashSet<&api::Identifier> = order.identifiers.iter().collect();
        let returned: HashSet<&api::Identifier> = from_ca.identifiers.iter().collect();
        if requested != returned {
            return Err(Error::IdentifierMismatch {
                requested: order.identifiers.iter().map(|id| id.value.clone()).collect(),
                order: from_ca.identifiers.iter().map(|id| id.value.clone()).collect(),
            });
        }
        from_ca.identifiers = order.identifiers;

        Ok((order_url, from_ca))
    }

    /// Returns a reference to the account's API object.
    ///
    /// Useful for debugging.
    pub fn api_account(&self) -> &api::Account {
        &self.inner.api_account
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.inner.transport
    }
}

#[cfg(test)]
mod tests {
    use crate::{key::AccountKey, key::KeyAlgorithm, Directory, DirectoryUrl};

    async fn test_account(server: &crate::test::TestServer) -> crate::Account {
        let dir = Directory::new(DirectoryUrl::Other(&server.dir_url)).unwrap();
        let key = AccountKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        dir.register_account(key, Some(vec!["mailto:foo@bar.com".to_owned()]))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_order_returns_url_and_body() {
        let server = crate::test::TestServer::spawn();
        let account = test_account(&server).await;

        let (url, order) = account
            .create_order("acme-test.example.com", &[])
            .await
            .unwrap();

        assert!(url.starts_with("http"));
        assert_eq!(order.domains(), vec!["acme-test.example.com"]);
    }

    #[tokio::test]
    async fn duplicate_names_are_deduplicated() {
        let server = crate::test::TestServer::spawn();
        let account = test_account(&server).await;

        let (_, order) = account
            .create_order(
                "acme-test.example.com",
                &["acme-test.example.com".to_owned()],
            )
            .await
            .unwrap();

        assert_eq!(order.identifiers.len(), 1);
    }

    #[tokio::test]
    async fn update_contact_round_trips() {
        let server = crate::test::TestServer::spawn();
        let account = test_account(&server).await;

        let updated = account
            .update_contact(vec!["mailto:new@example.com".to_owned()])
            .await
            .unwrap();

        assert!(updated.is_status_valid());
    }

    #[tokio::test]
    async fn key_rotation_and_deactivation_fail_fast() {
        let server = crate::test::TestServer::spawn();
        let account = test_account(&server).await;

        assert!(matches!(
            account.rotate_key(),
            Err(crate::Error::NotImplemented(_))
        ));
        assert!(matches!(
            account.deactivate(),
            Err(crate::Error::NotImplemented(_))
        ));
    }
}
