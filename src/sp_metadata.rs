use time::{Duration, OffsetDateTime};
use yaserde::YaSerialize;

use crate::{authn_request::ProtocolBinding, SamlError, DATE_TIME_FORMAT};

const METADATA_VALIDITY: Duration = Duration::hours(24);

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "md" = "urn:oasis:names:tc:SAML:2.0:metadata",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
  },
  prefix = "md"
)]
struct EntityDescriptor {
    #[yaserde(attribute = true, rename = "entityID")]
    entity_id: String,
    #[yaserde(attribute = true, rename = "validUntil")]
    valid_until: String,
    #[yaserde(rename = "SPSSODescriptor", prefix = "md")]
    sp_sso_descriptor: SPSSODescriptor,
}

#[derive(YaSerialize)]
struct SPSSODescriptor {
    #[yaserde(attribute = true, rename = "AuthnRequestsSigned")]
    authn_requests_signed: bool,
    #[yaserde(attribute = true, rename = "WantAssertionsSigned")]
    want_assertions_signed: bool,
    #[yaserde(attribute = true, rename = "protocolSupportEnumeration")]
    protocol_support_enumeration: String,
    #[yaserde(rename = "KeyDescriptor", prefix = "md")]
    key_descriptors: Vec<KeyDescriptor>,
    #[yaserde(rename = "SingleLogoutService", prefix = "md")]
    single_logout_service: Endpoint,
    #[yaserde(rename = "AssertionConsumerService", prefix = "md")]
    assertion_consumer_service: IndexedEndpoint,
}

#[derive(YaSerialize)]
struct KeyDescriptor {
    #[yaserde(attribute = true, rename = "use")]
    key_use: String,
    #[yaserde(rename = "KeyInfo", prefix = "ds")]
    key_info: KeyInfo,
}

#[derive(YaSerialize)]
struct KeyInfo {
    #[yaserde(rename = "X509Data", prefix = "ds")]
    x509_data: X509Data,
}

#[derive(YaSerialize)]
struct X509Data {
    #[yaserde(rename = "X509Certificate", prefix = "ds")]
    certificate: X509Certificate,
}

#[derive(YaSerialize)]
struct X509Certificate {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct Endpoint {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
}

#[derive(YaSerialize)]
struct IndexedEndpoint {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
    #[yaserde(attribute = true)]
    index: u32,
    #[yaserde(attribute = true, rename = "isDefault")]
    is_default: bool,
}

#[derive(Default)]
pub struct SpMetadataBuilder {
    entity_id: Option<String>,
    acs_url: Option<String>,
    slo_url: Option<String>,
    certificate: Option<String>,
    generated_at: Option<OffsetDateTime>,
}

impl SpMetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_id(self, entity_id: &str) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..self
        }
    }

    pub fn acs_url(self, acs_url: &str) -> Self {
        Self {
            acs_url: Some(acs_url.into()),
            ..self
        }
    }

    /// Defaults to the ACS URL.
    pub fn slo_url(self, slo_url: &str) -> Self {
        Self {
            slo_url: Some(slo_url.into()),
            ..self
        }
    }

    /// PEM certificate advertised for both signing and encryption.
    pub fn certificate(self, certificate_pem: &str) -> Self {
        Self {
            certificate: Some(certificate_pem.into()),
            ..self
        }
    }

    /// `validUntil` is 24 hours after this instant; the current time when unset.
    pub fn generated_at(self, instant: OffsetDateTime) -> Self {
        Self {
            generated_at: Some(instant),
            ..self
        }
    }

    pub fn build(self) -> Result<String, SamlError> {
        let missing = |what: &str| SamlError::InvalidConfiguration(format!("{what} is required"));

        let acs_url = self.acs_url.ok_or_else(|| missing("acs_url"))?;
        let certificate =
            certificate_body(&self.certificate.ok_or_else(|| missing("certificate"))?);
        let generated_at = self.generated_at.unwrap_or_else(OffsetDateTime::now_utc);

        let key_descriptor = |key_use: &str| KeyDescriptor {
            key_use: key_use.into(),
            key_info: KeyInfo {
                x509_data: X509Data {
                    certificate: X509Certificate {
                        content: certificate.clone(),
                    },
                },
            },
        };

        let metadata = EntityDescriptor {
            entity_id: self.entity_id.ok_or_else(|| missing("entity_id"))?,
            valid_until: (generated_at + METADATA_VALIDITY).format(&DATE_TIME_FORMAT)?,
            sp_sso_descriptor: SPSSODescriptor {
                authn_requests_signed: false,
                want_assertions_signed: false,
                protocol_support_enumeration: "urn:oasis:names:tc:SAML:2.0:protocol".into(),
                key_descriptors: vec![key_descriptor("signing"), key_descriptor("encryption")],
                single_logout_service: Endpoint {
                    binding: ProtocolBinding::Redirect.to_string(),
                    location: self.slo_url.unwrap_or_else(|| acs_url.clone()),
                },
                assertion_consumer_service: IndexedEndpoint {
                    binding: ProtocolBinding::Post.to_string(),
                    location: acs_url,
                    index: 0,
                    is_default: true,
                },
            },
        };
        yaserde::ser::to_string(&metadata).map_err(SamlError::Serialization)
    }
}

/// The base64 body of a PEM certificate, without armor or line breaks.
fn certificate_body(pem: &str) -> String {
    pem.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect()
}
