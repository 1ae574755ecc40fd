//! `log.append`: lets a module or remote client fold its own log lines
//! into this broker's tracing output instead of managing its own sink.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::error::BrokerError;
use crate::message::Message;
use crate::router::{BuiltinService, Router};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogAppendRequest {
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

pub struct LogService;

#[async_trait::async_trait]
impl BuiltinService for LogService {
    async fn call(&self, _router: &Router, msg: &Message) -> Result<Message, BrokerError> {
        match msg.topic.as_str() {
            "log.append" => {
                let req: LogAppendRequest = msg.decode()?;
                match req.level {
                    LogLevel::Trace => trace!(source = %req.source, "{}", req.message),
                    LogLevel::Debug => debug!(source = %req.source, "{}", req.message),
                    LogLevel::Info => info!(source = %req.source, "{}", req.message),
                    LogLevel::Warn => warn!(source = %req.source, "{}", req.message),
                    LogLevel::Error => error!(source = %req.source, "{}", req.message),
                }
                Message::response_to(msg, &())
            }
            other => Err(BrokerError::NoService(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NODEID_ANY;
    use crate::overlay::ChannelOverlay;
    use std::sync::Arc;

    #[tokio::test]
    async fn append_succeeds_for_every_level() {
        let router = Router::new(Arc::new(ChannelOverlay::new(0, 1, 2)));
        for level in [LogLevel::Trace, LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            let req = Message::request(
                "log.append",
                NODEID_ANY,
                0,
                &LogAppendRequest { level, source: "test".into(), message: "hi".into() },
            )
            .unwrap();
            LogService.call(&router, &req).await.unwrap();
        }
    }
}
