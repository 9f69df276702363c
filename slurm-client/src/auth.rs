//! Credentials applied to every outgoing request

use reqwest::RequestBuilder;
use std::fmt;

pub const USER_TOKEN_HEADER: &str = "X-SLURM-USER-TOKEN";
pub const USER_NAME_HEADER: &str = "X-SLURM-USER-NAME";

pub trait AuthProvider: Send + Sync + fmt::Debug {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder;

    fn scheme(&self) -> &'static str;
}

/// JWT issued by `scontrol token`, optionally bound to a user name
#[derive(Clone)]
pub struct TokenAuth {
    token: String,
    user: Option<String>,
}

impl TokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

impl fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuth")
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

impl AuthProvider for TokenAuth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(USER_TOKEN_HEADER, &self.token);
        match &self.user {
            Some(user) => request.header(USER_NAME_HEADER, user),
            None => request,
        }
    }

    fn scheme(&self) -> &'static str {
        "token"
    }
}

#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: Option<String>,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AuthProvider for BasicAuth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, self.password.as_ref())
    }

    fn scheme(&self) -> &'static str {
        "basic"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        request
    }

    fn scheme(&self) -> &'static str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_after(auth: &dyn AuthProvider) -> reqwest::header::HeaderMap {
        let client = reqwest::Client::new();
        auth.apply(client.get("http://localhost/slurm/v0.0.42/ping"))
            .build()
            .unwrap()
            .headers()
            .clone()
    }

    #[test]
    fn test_token_auth_headers() {
        let headers = headers_after(&TokenAuth::new("abc"));
        assert_eq!(headers.get(USER_TOKEN_HEADER).unwrap(), "abc");
        assert!(headers.get(USER_NAME_HEADER).is_none());

        let headers = headers_after(&TokenAuth::new("abc").with_user("alice"));
        assert_eq!(headers.get(USER_NAME_HEADER).unwrap(), "alice");
    }

    #[test]
    fn test_basic_auth_header() {
        let headers = headers_after(&BasicAuth::new("alice", Some("secret".to_string())));
        let value = headers.get(reqwest::header::AUTHORIZATION).unwrap().to_str().unwrap();
        assert!(value.starts_with("Basic "));
    }

    #[test]
    fn test_no_auth_leaves_request_untouched() {
        let headers = headers_after(&NoAuth);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let text = format!("{:?}", TokenAuth::new("super-secret").with_user("bob"));
        assert!(!text.contains("super-secret"));
        let text = format!("{:?}", BasicAuth::new("bob", Some("hunter2".to_string())));
        assert!(!text.contains("hunter2"));
    }
}
