//! Service Provider side of the SAML 2.0 Web Browser SSO profile.
//!
//! The crate issues `AuthnRequest`s and ingests the IdP's response: it pulls the
//! `SAMLResponse` out of the POSTed form, decrypts the `EncryptedAssertion` with
//! the SP's private key, checks the `Conditions` validity window and projects the
//! assertion into a [`ParsedAssertion`].
//!
//! **Assertion signatures are not verified.** An assertion is accepted when it
//! decrypts (or is plaintext) and is inside its validity window. Callers that
//! need XML-DSig verification must check [`ParsedAssertion::xml`] themselves.

use libxml::parser::XmlParseError;
use time::{
    format_description::well_known::iso8601::{self, TimePrecision},
    OffsetDateTime,
};

mod assertion;
mod authn_request;
mod envelope;
mod keys;
mod service_provider;
mod sp_metadata;
mod utils;
mod xml;
mod xmlenc;

pub use assertion::{
    locate_assertion, validate_assertion, Attributes, LocatedAssertion, ParsedAssertion,
};
pub use authn_request::{
    AuthnRequestBuilder, AuthnRequestContext, ProtocolBinding, RedirectEncoding,
};
pub use envelope::{extract_from_request, extract_from_xml};
pub use keys::{generate_keypair, KeyLength, KeyPair};
pub use service_provider::{ServiceProvider, ServiceProviderConfig};
pub use sp_metadata::SpMetadataBuilder;
pub use utils::generate_id;
pub use xml::{SeededDocument, SeededParser, SAML_NAMESPACES};
pub use xmlenc::{decrypt, DecryptOptions};

pub const NAME_ID_FORMAT_UNSPECIFIED: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
pub const NAME_ID_FORMAT_EMAIL_ADDRESS: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

// xs:dateTime isn't actually ISO8601, because implementors often don't support higher precisions.
pub const DATE_TIME_FORMAT: iso8601::Iso8601<
    {
        iso8601::Config::DEFAULT
            .set_time_precision(TimePrecision::Second {
                decimal_digits: None,
            })
            .encode()
    },
> = iso8601::Iso8601;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SamlError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("method {0} not allowed, SAML responses must be POSTed")]
    MethodNotAllowed(http::Method),
    #[error("failed to read request body")]
    Transport(#[source] BoxError),
    #[error("failed to decrypt assertion: {0}")]
    Decryption(String),
    #[error("assertion is not encrypted")]
    UnencryptedAssertion,
    #[error("assertion is not valid before {not_before}")]
    AssertionNotYetValid { not_before: OffsetDateTime },
    #[error("assertion expired at {not_on_or_after}")]
    AssertionExpired { not_on_or_after: OffsetDateTime },
    #[error("invalid XML: {0:?}")]
    InvalidXml(XmlParseError),
    #[error("failed to evaluate XPath expression {0:?}")]
    XPath(String),
    #[error("SAMLResponse is not valid base64 encoded UTF-8")]
    InvalidResponse,
    #[error("invalid timestamp in assertion conditions: {0:?}")]
    InvalidCondition(String),
    #[error("failed to serialize XML: {0}")]
    Serialization(String),
    #[error("failed to format timestamp")]
    TimeFormat(#[from] time::error::Format),
    #[error("system random number generator unavailable")]
    Random(#[from] rand::Error),
    #[error("crypto error")]
    Crypto(#[from] openssl::error::ErrorStack),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
