//! Content cache interface (C12): stubbed out. Real content-addressed
//! storage is out of scope (§2 Non-goals); what remains is the `content.*`
//! verb surface so a module can be written against it today and only the
//! backing store needs to change later.

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::message::Message;
use crate::router::{BuiltinService, Router};

#[derive(Debug, Serialize, Deserialize)]
pub struct ContentLoadRequest {
    pub hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContentStoreRequest {
    #[serde(with = "serde_bytes_vec")]
    pub data: Vec<u8>,
}

mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

/// Always reports `ENOSYS`-equivalent: no backing store is wired up.
pub struct NullContentService;

#[async_trait::async_trait]
impl BuiltinService for NullContentService {
    async fn call(&self, _router: &Router, msg: &Message) -> Result<Message, BrokerError> {
        Err(BrokerError::NotImplemented(format!(
            "content service has no backing store (topic '{}')",
            msg.topic
        )))
    }
}
