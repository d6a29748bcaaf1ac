use serde::{Deserialize, Serialize};

/// An ACME account resource.
///
/// Doubles as the newAccount / account-update request payload; fields not
/// relevant to a given request are omitted from the JSON.
///
/// See [RFC 8555 §7.1.2].
///
/// [RFC 8555 §7.1.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.2
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,

    /// Ask the server to look up an existing account instead of creating
    /// one; fails with `accountDoesNotExist` when none is registered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
}

impl Account {
    pub fn is_status_valid(&self) -> bool {
        self.status.as_deref() == Some("valid")
    }

    pub fn is_status_deactivated(&self) -> bool {
        self.status.as_deref() == Some("deactivated")
    }
}
