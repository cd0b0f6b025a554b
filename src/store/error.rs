/*!
 * Error types for object store operations
 */

use thiserror::Error;

/// Errors that can occur while talking to the object store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The request could not be sent or the response not read
    #[error("Request error: {0}")]
    Request(String),

    /// The store answered with a non-success HTTP status
    #[error("API error {status}: {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body, as text
        body: String,
    },

    /// No value stored under this key
    #[error("Key not found: {0}")]
    NotFound(String),

    /// The response envelope did not parse
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Specialized Result type for object store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<reqwest::Error> for StoreError {
    fn from(error: reqwest::Error) -> Self {
        StoreError::Request(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Malformed(error.to_string())
    }
}
