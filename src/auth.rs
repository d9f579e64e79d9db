//! Where the call gets its access token from.
//!
//! Login and token refresh live elsewhere; a call only needs to read the
//! current token once, synchronously, before connecting.

pub trait TokenSource: Send + Sync {
    /// Current bearer token, `None` if the user is not signed in.
    fn access_token(&self) -> Option<String>;
}

/// Reads the token from an environment variable.
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenSource for EnvToken {
    fn access_token(&self) -> Option<String> {
        non_blank(std::env::var(&self.var).ok())
    }
}

/// A fixed token, or none.
pub struct StaticToken(pub Option<String>);

impl TokenSource for StaticToken {
    fn access_token(&self) -> Option<String> {
        non_blank(self.0.clone())
    }
}

fn non_blank(token: Option<String>) -> Option<String> {
    token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
