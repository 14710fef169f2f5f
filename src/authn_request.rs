use std::fmt::Display;

use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::deflate_bytes;
use time::OffsetDateTime;
use url::Url;
use yaserde::YaSerialize;

use crate::{utils::generate_id, SamlError, DATE_TIME_FORMAT, NAME_ID_FORMAT_UNSPECIFIED};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct AuthnRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(attribute = true, rename = "ProtocolBinding")]
    protocol_binding: String,
    #[yaserde(attribute = true, rename = "AssertionConsumerServiceURL")]
    assertion_consumer_service_url: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "NameIDPolicy", prefix = "samlp")]
    name_id_policy: NameIdPolicy,
}

#[derive(YaSerialize)]
struct Issuer {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct NameIdPolicy {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(attribute = true, rename = "AllowCreate")]
    allow_create: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolBinding {
    #[default]
    Post,
    Redirect,
}

impl Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolBinding::Post => write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"),
            ProtocolBinding::Redirect => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")
            }
        }
    }
}

/// How the `SAMLRequest` query parameter is encoded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RedirectEncoding {
    /// Plain base64 of the request XML.
    #[default]
    Base64,
    /// DEFLATE, then base64, as the HTTP-Redirect binding prescribes.
    Deflate,
}

impl RedirectEncoding {
    pub fn encode(self, xml: &str) -> String {
        match self {
            RedirectEncoding::Base64 => BASE64_STANDARD.encode(xml.as_bytes()),
            RedirectEncoding::Deflate => BASE64_STANDARD.encode(deflate_bytes(xml.as_bytes())),
        }
    }
}

#[derive(Default)]
pub struct AuthnRequestBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    protocol_binding: ProtocolBinding,
    consumer_url: Option<String>,
    name_format: Option<String>,
    deny_create: bool,
}

impl AuthnRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: &str) -> Self {
        AuthnRequestBuilder {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn auto_id(self) -> Result<Self, SamlError> {
        Ok(AuthnRequestBuilder {
            id: Some(generate_id()?),
            ..self
        })
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issued_now(self) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(OffsetDateTime::now_utc()),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        AuthnRequestBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        AuthnRequestBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    pub fn protocol_binding(self, binding: ProtocolBinding) -> Self {
        AuthnRequestBuilder {
            protocol_binding: binding,
            ..self
        }
    }

    pub fn consumer_url(self, url: &str) -> Self {
        AuthnRequestBuilder {
            consumer_url: Some(url.into()),
            ..self
        }
    }

    pub fn name_format(self, format: &str) -> Self {
        AuthnRequestBuilder {
            name_format: Some(format.into()),
            ..self
        }
    }

    pub fn allow_create(self, allow: bool) -> Self {
        AuthnRequestBuilder {
            deny_create: !allow,
            ..self
        }
    }

    pub fn build(self) -> Result<String, SamlError> {
        let req = AuthnRequest {
            id: required(self.id, "ID")?,
            version: "2.0".to_string(),
            issue_instant: required(self.issue_instant, "IssueInstant")?
                .format(&DATE_TIME_FORMAT)?,
            destination: required(self.destination, "Destination")?,
            protocol_binding: self.protocol_binding.to_string(),
            assertion_consumer_service_url: required(self.consumer_url, "consumer URL")?,
            issuer: Issuer {
                content: required(self.issuer, "Issuer")?,
            },
            name_id_policy: NameIdPolicy {
                format: self
                    .name_format
                    .unwrap_or_else(|| NAME_ID_FORMAT_UNSPECIFIED.to_string()),
                allow_create: !self.deny_create,
            },
        };
        yaserde::ser::to_string(&req).map_err(SamlError::Serialization)
    }

    pub fn build_and_encode(self, encoding: RedirectEncoding) -> Result<String, SamlError> {
        Ok(encoding.encode(&self.build()?))
    }
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, SamlError> {
    value.ok_or_else(|| SamlError::InvalidConfiguration(format!("{what} is required")))
}

pub(crate) fn parse_absolute_url(value: &str, what: &str) -> Result<Url, SamlError> {
    if value.trim().is_empty() {
        return Err(SamlError::InvalidConfiguration(format!("{what} is required")));
    }
    Url::parse(value).map_err(|e| {
        SamlError::InvalidConfiguration(format!("{what} {value:?} is not an absolute URL: {e}"))
    })
}

/// One SP initiated login attempt against an IdP.
#[derive(Debug, Clone)]
pub struct AuthnRequestContext {
    idp_url: Url,
    assertion_endpoint: Url,
}

impl AuthnRequestContext {
    pub fn new(idp_url: &str, assertion_endpoint: &str) -> Result<Self, SamlError> {
        Ok(Self {
            idp_url: parse_absolute_url(idp_url, "IdP URL")?,
            assertion_endpoint: parse_absolute_url(assertion_endpoint, "assertion endpoint")?,
        })
    }

    /// A fresh `AuthnRequest`. Every call gets a new ID and issue instant.
    pub fn generate_authn_request(&self) -> Result<String, SamlError> {
        AuthnRequestBuilder::new()
            .auto_id()?
            .issued_now()
            .destination(self.idp_url.as_str())
            .consumer_url(self.assertion_endpoint.as_str())
            .issuer(self.assertion_endpoint.as_str())
            .protocol_binding(ProtocolBinding::Post)
            .name_format(NAME_ID_FORMAT_UNSPECIFIED)
            .allow_create(true)
            .build()
    }

    /// The IdP URL with a base64 `SAMLRequest` appended to its query.
    ///
    /// The request is not deflated, see [`Self::create_authn_url_with`].
    pub fn create_authn_url(&self) -> Result<String, SamlError> {
        self.create_authn_url_with(RedirectEncoding::Base64, None)
    }

    pub fn create_authn_url_with(
        &self,
        encoding: RedirectEncoding,
        relay_state: Option<&str>,
    ) -> Result<String, SamlError> {
        let saml_request = encoding.encode(&self.generate_authn_request()?);

        let mut url = self.idp_url.clone();
        let preserved: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "SAMLRequest" && key != "RelayState")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            query.extend_pairs(preserved);
            query.append_pair("SAMLRequest", &saml_request);
            if let Some(relay_state) = relay_state {
                query.append_pair("RelayState", relay_state);
            }
        }
        Ok(url.into())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use time::macros::datetime;

    use crate::NAME_ID_FORMAT_EMAIL_ADDRESS;

    use super::*;

    const IDP: &str = "https://idp.example.com/sso?tenant=acme&lang=en";
    const ACS: &str = "https://sp.example.com/saml/acs";

    fn saml_requests(url: &str) -> Vec<String> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .filter(|(k, _)| k == "SAMLRequest")
            .map(|(_, v)| v.into_owned())
            .collect()
    }

    #[test]
    fn can_build_authn_request() {
        let xml = AuthnRequestBuilder::new()
            .id("_abc")
            .issue_instant(datetime!(2024-05-01 12:30:00 UTC))
            .issuer("issuer")
            .destination("destination")
            .consumer_url("consumer_url")
            .name_format(NAME_ID_FORMAT_EMAIL_ADDRESS)
            .build()
            .unwrap();

        assert!(xml.contains(r#"ID="_abc""#));
        assert!(xml.contains(r#"IssueInstant="2024-05-01T12:30:00Z""#));
        assert!(xml.contains(r#"AllowCreate="true""#));
        assert!(xml.contains(":Issuer>issuer</"));
    }

    #[test]
    fn missing_fields_are_configuration_errors() {
        let err = AuthnRequestBuilder::new().issued_now().build().unwrap_err();
        assert!(matches!(err, SamlError::InvalidConfiguration(_)));
    }

    #[test]
    fn rejects_relative_or_empty_urls() {
        assert!(matches!(
            AuthnRequestContext::new("", ACS),
            Err(SamlError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            AuthnRequestContext::new(IDP, "/saml/acs"),
            Err(SamlError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn request_carries_endpoints_and_policy() {
        let context = AuthnRequestContext::new(IDP, ACS).unwrap();
        let xml = context.generate_authn_request().unwrap();

        assert!(xml.contains(r#"Destination="https://idp.example.com/sso?tenant=acme&amp;lang=en""#));
        assert!(xml.contains(&format!(r#"AssertionConsumerServiceURL="{ACS}""#)));
        assert!(xml.contains(&format!(":Issuer>{ACS}</")));
        assert!(xml.contains(r#"ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST""#));
        assert!(xml.contains(&format!(r#"Format="{NAME_ID_FORMAT_UNSPECIFIED}""#)));
        assert!(xml.contains(r#"AllowCreate="true""#));
    }

    #[test]
    fn base64_request_decodes_to_identical_xml() {
        let context = AuthnRequestContext::new(IDP, ACS).unwrap();
        let xml = context.generate_authn_request().unwrap();
        let encoded = RedirectEncoding::Base64.encode(&xml);
        assert_eq!(BASE64_STANDARD.decode(encoded).unwrap(), xml.as_bytes());
    }

    #[test]
    fn url_keeps_existing_query_and_adds_one_request() {
        let context = AuthnRequestContext::new(IDP, ACS).unwrap();
        let url = context.create_authn_url().unwrap();
        let parsed = Url::parse(&url).unwrap();

        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("tenant".into(), "acme".into()));
        assert_eq!(pairs[1], ("lang".into(), "en".into()));

        let requests = saml_requests(&url);
        assert_eq!(requests.len(), 1);
        let xml = String::from_utf8(BASE64_STANDARD.decode(&requests[0]).unwrap()).unwrap();
        assert!(xml.contains("AuthnRequest"));
    }

    #[test]
    fn successive_urls_differ() {
        let context = AuthnRequestContext::new(IDP, ACS).unwrap();
        let first = context.create_authn_url().unwrap();
        let second = context.create_authn_url().unwrap();
        assert_ne!(first, second);
        assert_ne!(saml_requests(&first), saml_requests(&second));
    }

    #[test]
    fn replaces_stale_saml_request_parameter() {
        let context =
            AuthnRequestContext::new("https://idp.example.com/sso?SAMLRequest=old", ACS).unwrap();
        let url = context.create_authn_url().unwrap();
        let requests = saml_requests(&url);
        assert_eq!(requests.len(), 1);
        assert_ne!(requests[0], "old");
    }

    #[test]
    fn deflate_encoding_inflates_back() {
        let context = AuthnRequestContext::new(IDP, ACS).unwrap();
        let url = context
            .create_authn_url_with(RedirectEncoding::Deflate, Some("/after/login"))
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let relay_state = parsed
            .query_pairs()
            .find(|(k, _)| k == "RelayState")
            .map(|(_, v)| v.into_owned());
        assert_eq!(relay_state.as_deref(), Some("/after/login"));

        let compressed = BASE64_STANDARD.decode(&saml_requests(&url)[0]).unwrap();
        let mut xml = String::new();
        flate2::read::DeflateDecoder::new(compressed.as_slice())
            .read_to_string(&mut xml)
            .unwrap();
        assert!(xml.contains(&format!(":Issuer>{ACS}</")));
    }
}
