/*!
 * Remote key-value object store boundary
 */

mod cloudflare;
mod error;
mod memory;

pub use cloudflare::{Account, CloudflareKv, CLOUDFLARE_API, DEFAULT_REQUEST_TIMEOUT};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};

/// Largest value the store accepts in a single write
pub const MAX_VALUE_SIZE: usize = 25 * 1024 * 1024;

/// Outcome of a write as reported by the store's response envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    /// Whether the value was stored
    pub success: bool,
    /// Error messages, if any
    #[serde(default)]
    pub errors: Vec<String>,
}

impl PutResponse {
    /// A successful response
    pub fn ok() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
        }
    }

    /// A rejected response carrying one message
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![message.into()],
        }
    }
}

/// One stored key and the metadata written alongside it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEntry {
    /// Remote key
    pub name: String,
    /// Metadata side field, if any
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Operations the backup core needs from a remote store.
///
/// Authentication, retries and transport framing belong to the
/// implementation; callers only look at `success` and the metadata echo.
pub trait ObjectStore: Send + Sync {
    /// Write `value` under `key` with a JSON metadata side field
    fn put(&self, key: &str, value: Vec<u8>, metadata: &serde_json::Value)
        -> StoreResult<PutResponse>;

    /// Read the value stored under `key`
    fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// List every key together with its metadata
    fn list_keys(&self) -> StoreResult<Vec<KeyEntry>>;
}
