//! Caller authorization handed to the submission pipeline.
//!
//! Token issuance lives outside this crate; all we hold is the opaque bearer
//! credential that the backend verifies.

use crate::error::SubmissionError;

/// Environment variable the binary reads the ID token from.
pub const TOKEN_ENV_VAR: &str = "KALAKRITI_ID_TOKEN";

/// An opaque bearer credential. Never printed in full.
#[derive(Clone, PartialEq, Eq)]
pub struct Authorization {
    token: String,
}

impl Authorization {
    /// Wrap a bearer token. Blank tokens are rejected as `Unauthorized`.
    pub fn bearer(token: impl Into<String>) -> Result<Self, SubmissionError> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(SubmissionError::Unauthorized(
                "Sign in to generate a marketing kit".to_string(),
            ));
        }
        Ok(Self { token })
    }

    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorization")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_tokens_are_unauthorized() {
        for token in ["", "   ", "\n"] {
            let err = Authorization::bearer(token).unwrap_err();
            assert!(matches!(err, SubmissionError::Unauthorized(_)));
        }
    }

    #[test]
    fn header_carries_bearer_scheme() {
        let auth = Authorization::bearer(" abc.def ").unwrap();
        assert_eq!(auth.header_value(), "Bearer abc.def");
    }

    #[test]
    fn debug_output_is_redacted() {
        let auth = Authorization::bearer("super-secret").unwrap();
        let printed = format!("{:?}", auth);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("redacted"));
    }
}
