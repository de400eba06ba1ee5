//! Incoming requests to be executed idempotently.

use crate::error::IdempotencyError;
use crate::fingerprint::Fingerprint;
use serde_json::Value;

/// Maximum length of an idempotency token.
pub const MAX_TOKEN_LEN: usize = 100;

/// Maximum length of a request method.
pub const MAX_METHOD_LEN: usize = 10;

/// Maximum length of a request path.
pub const MAX_PATH_LEN: usize = 100;

/// A request as handed to the orchestrator by the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentRequest {
    /// Principal that sent the request
    pub caller_id: String,
    /// Client-supplied idempotency token
    pub idempotency_token: String,
    /// Request method (diagnostic)
    pub method: String,
    /// Request path (diagnostic)
    pub path: String,
    /// Request parameters, fingerprinted for conflict detection
    pub params: Value,
}

impl IdempotentRequest {
    /// Create a new request.
    #[must_use]
    pub fn new(
        caller_id: impl Into<String>,
        idempotency_token: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            caller_id: caller_id.into(),
            idempotency_token: idempotency_token.into(),
            method: method.into(),
            path: path.into(),
            params,
        }
    }

    /// Canonical fingerprint of the parameters.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_params(&self.params)
    }

    /// Check the request fits the key schema.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::InvalidRequest`] if the caller or token is
    /// empty, or the token, method or path exceeds its column width.
    pub fn validate(&self) -> Result<(), IdempotencyError> {
        if self.caller_id.is_empty() {
            return Err(IdempotencyError::InvalidRequest(
                "caller ID must not be empty".to_string(),
            ));
        }
        if self.idempotency_token.is_empty() {
            return Err(IdempotencyError::InvalidRequest(
                "Idempotency-Key must not be empty".to_string(),
            ));
        }
        check_len("Idempotency-Key", &self.idempotency_token, MAX_TOKEN_LEN)?;
        check_len("request method", &self.method, MAX_METHOD_LEN)?;
        check_len("request path", &self.path, MAX_PATH_LEN)?;
        Ok(())
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), IdempotencyError> {
    let len = value.chars().count();
    if len > max {
        return Err(IdempotencyError::InvalidRequest(format!(
            "{field} must be at most {max} characters (got {len})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(token: &str) -> IdempotentRequest {
        IdempotentRequest::new("user-1", token, "POST", "/rides", json!({}))
    }

    #[test]
    fn accepts_reasonable_request() {
        assert!(request("0f3c2c1e-6b1a-4a57-9d55-4b0b8f0f1d2a").validate().is_ok());
    }

    #[test]
    fn rejects_empty_token() {
        assert!(matches!(
            request("").validate(),
            Err(IdempotencyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn rejects_overlong_token() {
        let token = "k".repeat(MAX_TOKEN_LEN + 1);
        assert!(matches!(
            request(&token).validate(),
            Err(IdempotencyError::InvalidRequest(_))
        ));
        assert!(request(&"k".repeat(MAX_TOKEN_LEN)).validate().is_ok());
    }

    #[test]
    fn rejects_overlong_method() {
        let mut req = request("token");
        req.method = "PROPPATCHXX".to_string();
        assert!(req.validate().is_err());
    }
}
