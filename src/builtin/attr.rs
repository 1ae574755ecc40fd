//! `attr.*`: the attribute store's wire surface. `attr.set` requires the
//! caller to carry [`ROLE_OWNER`](crate::message::ROLE_OWNER) — the role
//! bit the broker grants its own injected traffic — so an arbitrary
//! remote client can read attributes but not overwrite them.

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::message::{Message, ROLE_OWNER};
use crate::router::{BuiltinService, Router};

#[derive(Debug, Serialize, Deserialize)]
pub struct AttrGetRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttrSetRequest {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttrRmRequest {
    pub name: String,
    #[serde(default)]
    pub force: bool,
}

pub struct AttrService;

#[async_trait::async_trait]
impl BuiltinService for AttrService {
    async fn call(&self, router: &Router, msg: &Message) -> Result<Message, BrokerError> {
        match msg.topic.as_str() {
            "attr.get" => {
                let req: AttrGetRequest = msg.decode()?;
                let attrs = router.attrs.lock().await;
                let value = attrs.get(&req.name)?.to_string();
                Message::response_to(msg, &value)
            }
            "attr.set" => {
                if msg.rolemask & ROLE_OWNER == 0 {
                    return Err(BrokerError::PermissionDenied("attr.set".into()));
                }
                let req: AttrSetRequest = msg.decode()?;
                router.attrs.lock().await.set(&req.name, req.value)?;
                Message::response_to(msg, &())
            }
            "attr.rm" => {
                if msg.rolemask & ROLE_OWNER == 0 {
                    return Err(BrokerError::PermissionDenied("attr.rm".into()));
                }
                let req: AttrRmRequest = msg.decode()?;
                router.attrs.lock().await.delete(&req.name, req.force)?;
                Message::response_to(msg, &())
            }
            "attr.list" => {
                let attrs = router.attrs.lock().await;
                Message::response_to(msg, &attrs.list())
            }
            other => Err(BrokerError::NoService(other.to_string())),
        }
    }
}
