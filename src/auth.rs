use base64::{engine::general_purpose, Engine as _};

/// An identity/secret pair. Two independent instances exist at runtime: the
/// pair clients must present to this proxy, and the pair this proxy presents
/// to the upstream proxy. Both are immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Pre-computed `Basic <base64(username:password)>` header value for the
    /// upstream-facing leg.
    pub fn basic_header(&self) -> String {
        let pair = format!("{}:{}", self.username, self.password);
        format!("Basic {}", general_purpose::STANDARD.encode(pair.as_bytes()))
    }
}

/// Validate a literal `Proxy-Authorization` header value against the expected
/// credentials.
///
/// Requires the exact `Basic ` prefix, a base64 payload, and a byte-exact
/// match of `username:password` split on the first colon only. Any malformed
/// input is a normal negative outcome, never an error. The presented payload
/// is never logged.
pub fn validate_basic(header: Option<&str>, expected: &Credentials) -> bool {
    let Some(value) = header else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Some(colon) = decoded.iter().position(|&b| b == b':') else {
        return false;
    };
    let (username, password) = (&decoded[..colon], &decoded[colon + 1..]);
    username == expected.username.as_bytes() && password == expected.password.as_bytes()
}
