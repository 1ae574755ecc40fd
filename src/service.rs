//! Service switch (C2): name → owning module + dispatch.
//!
//! Dispatch itself is resolved by the router (§9's "duck-typed message
//! dispatch" note): the switch only tells the router *who* owns a topic's
//! first component, as either a broker-local handler or a module id. The
//! router is responsible for actually delivering the message to whichever
//! one it is.

use std::collections::HashMap;

use crate::error::BrokerError;

/// Who a registered service routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// A broker-internal built-in (C13).
    Broker,
    /// A loaded module, by its stable id.
    Module(u64),
}

#[derive(Debug, Clone)]
struct Entry {
    owner: Owner,
}

/// `register(name, owner?) -> ok | exists`; `send(msg) -> dispatched | no_service`.
#[derive(Debug, Default)]
pub struct ServiceSwitch {
    services: HashMap<String, Entry>,
}

impl ServiceSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` for `owner`. Names containing `.` are rejected —
    /// the router splits topics on the first dot, so a service name must
    /// itself be dot-free.
    pub fn register(&mut self, name: &str, owner: Owner) -> Result<(), BrokerError> {
        if name.contains('.') {
            return Err(BrokerError::Malformed(format!(
                "service name '{name}' must not contain '.'"
            )));
        }
        if self.services.contains_key(name) {
            return Err(BrokerError::Exists(name.to_string()));
        }
        self.services.insert(name.to_string(), Entry { owner });
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), BrokerError> {
        self.services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))
    }

    /// Remove every service owned by `module`, returning the names removed.
    /// Used on the module's EXITED transition (§4.8, invariant #3): this
    /// must run to completion before any deferred `rmmod` response is sent.
    pub fn unregister_all_by_owner(&mut self, module: u64) -> Vec<String> {
        let trash: Vec<String> = self
            .services
            .iter()
            .filter(|(_, e)| e.owner == Owner::Module(module))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &trash {
            self.services.remove(name);
        }
        trash
    }

    /// Resolve the topic's first dot-delimited component to its owner.
    pub fn lookup(&self, topic: &str) -> Result<Owner, BrokerError> {
        let name = topic.split('.').next().unwrap_or(topic);
        self.services
            .get(name)
            .map(|e| e.owner)
            .ok_or_else(|| BrokerError::NoService(name.to_string()))
    }

    /// Service names currently owned by `module`, for `lsmod`-style
    /// introspection.
    pub fn names_by_owner(&self, module: u64) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .filter(|(_, e)| e.owner == Owner::Module(module))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
