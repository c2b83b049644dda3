//! secmgr IdP: SAML 2.0 SSO endpoints, SOAP multi-message decoding and
//! credential gathering.

pub mod auth;
pub mod cursor;
pub mod endpoint;
pub mod error;
pub mod pages;
pub mod pipeline;
pub mod redirect;
pub mod request;
pub mod routes;
pub mod saml;
pub mod soap;
pub mod soap_handler;
