//! `service.*`: administrative service-switch verbs. Modules register
//! their own service names in bulk when they're loaded (`insmod`); these
//! verbs let an operator or script bind or unbind a broker-owned alias
//! without loading a module for it.

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::message::Message;
use crate::router::{BuiltinService, Router};
use crate::service::Owner;

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceAddRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceRemoveRequest {
    pub name: String,
}

pub struct ServiceService;

#[async_trait::async_trait]
impl BuiltinService for ServiceService {
    async fn call(&self, router: &Router, msg: &Message) -> Result<Message, BrokerError> {
        match msg.topic.as_str() {
            "service.add" => {
                let req: ServiceAddRequest = msg.decode()?;
                router.add_service(&req.name, Owner::Broker).await?;
                Message::response_to(msg, &())
            }
            "service.remove" => {
                let req: ServiceRemoveRequest = msg.decode()?;
                router.remove_service(&req.name).await?;
                Message::response_to(msg, &())
            }
            other => Err(BrokerError::NoService(other.to_string())),
        }
    }
}
