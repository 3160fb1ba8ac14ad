/// Session lookup from bearer tokens
use axum::http::{HeaderMap, header};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use subtle::ConstantTimeEq;

/// A wrapper around String that uses constant-time equality comparison
/// to prevent timing attacks on token validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstantTimeString(String);

impl From<String> for ConstantTimeString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq for ConstantTimeString {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for ConstantTimeString {}

impl Hash for ConstantTimeString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// The signed-in user a request acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
}

/// Maps (best effort) constant-time bearer tokens to user ids.
#[derive(Debug, Clone, Default)]
pub struct Sessions {
    tokens: HashMap<ConstantTimeString, String>,
}

impl Sessions {
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(token, user_id)| (ConstantTimeString::from(token), user_id))
                .collect(),
        }
    }

    /// Resolve the `Authorization: Bearer <token>` header of a request.
    pub fn resolve(&self, headers: &HeaderMap) -> Option<Session> {
        let token = headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?
            .trim();
        self.tokens
            .get(&ConstantTimeString::from(token.to_string()))
            .map(|user_id| Session {
                user_id: user_id.clone(),
            })
    }
}

/// Parse a `TOKEN=USER_ID` pair as given on the command line.
pub fn parse_token_mapping(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((token, user_id)) if !token.trim().is_empty() && !user_id.trim().is_empty() => {
            Ok((token.trim().to_string(), user_id.trim().to_string()))
        }
        _ => Err(format!("expected TOKEN=USER_ID, got '{raw}'")),
    }
}
