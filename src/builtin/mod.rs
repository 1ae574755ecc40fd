//! Built-in services (C13): the handful of `Owner::Broker` verbs every
//! broker answers without a module loaded.

pub mod attr;
pub mod cmb;
pub mod log;
pub mod service;
