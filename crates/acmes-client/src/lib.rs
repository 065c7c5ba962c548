//! Client side of acmes
//!
//! [`AcmesClient`] talks to the server over the mutually authenticated
//! channel. [`AcmesClient::obtain`] hands back a rustls `ServerConfig` whose
//! certificate is kept fresh by a background [`RenewalScheduler`].

pub mod client;
pub mod resolver;
pub mod scheduler;

pub use client::{AcmesClient, ClientError};
pub use resolver::RenewableCertResolver;
pub use scheduler::{
    Clock, RemoteCertificates, RenewalHandle, RenewalScheduler, SystemClock, RENEW_RETRY_DELAY,
};
