//! Acmes wire protocol
//!
//! Clients ask the server for certificates over the mutually authenticated
//! channel with:
//! `POST /obtain` or `POST /renew`, `Content-Type: application/acme`,
//! body `{"domain": "..."}`.
//!
//! Successful responses carry a [`CertificateResponse`], failures a
//! [`ErrorResponse`] with status 500.

pub mod messages;

pub use messages::{CertificateResponse, DomainRequest, ErrorResponse, Operation};

/// Mandatory request content type
pub const ACME_CONTENT_TYPE: &str = "application/acme";

/// Path of the obtain operation
pub const OBTAIN_PATH: &str = "/obtain";

/// Path of the renew operation
pub const RENEW_PATH: &str = "/renew";
