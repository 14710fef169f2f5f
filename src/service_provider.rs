use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use futures_util::Stream;
use http::Request;
use serde::Deserialize;
use time::OffsetDateTime;
use url::Url;

use crate::{
    assertion::{locate_assertion, validate_assertion, ParsedAssertion},
    authn_request::{parse_absolute_url, AuthnRequestContext},
    envelope::{extract_from_request, extract_from_xml},
    keys::{generate_keypair, KeyLength, KeyPair},
    sp_metadata::SpMetadataBuilder,
    utils::generate_id,
    xmlenc::DecryptOptions,
    BoxError, SamlError,
};

const ENV_PREFIX: &str = "SHAML_SP";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceProviderConfig {
    pub entity_id: Option<String>,
    pub assertion_endpoint: String,
    pub logout_endpoint: Option<String>,
    pub certificate: Option<String>,
    pub private_key: Option<String>,
    #[serde(default)]
    pub key_length: KeyLength,
    /// Reject responses whose assertion is not encrypted.
    #[serde(default)]
    pub require_encrypted_assertions: bool,
}

impl ServiceProviderConfig {
    /// Reads a TOML file, then applies `SHAML_SP_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, SamlError> {
        Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml))
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| SamlError::InvalidConfiguration(e.to_string()))
    }
}

/// The SP's identity and key material. Immutable once constructed.
#[derive(Debug)]
pub struct ServiceProvider {
    entity_id: String,
    assertion_endpoint: Url,
    logout_endpoint: Url,
    keypair: KeyPair,
    decrypt_options: DecryptOptions,
    require_encrypted_assertions: bool,
}

impl ServiceProvider {
    pub fn new(config: ServiceProviderConfig) -> Result<Self, SamlError> {
        let assertion_endpoint =
            parse_absolute_url(&config.assertion_endpoint, "assertion endpoint")?;
        let logout_endpoint = match &config.logout_endpoint {
            Some(endpoint) => parse_absolute_url(endpoint, "logout endpoint")?,
            None => assertion_endpoint.clone(),
        };

        let entity_id = match config.entity_id {
            Some(entity_id) if !entity_id.trim().is_empty() => entity_id,
            Some(_) => {
                return Err(SamlError::InvalidConfiguration(
                    "entity ID must not be empty".into(),
                ))
            }
            None => generate_id()?,
        };

        let keypair = match (config.certificate, config.private_key) {
            (Some(certificate), Some(private_key)) => KeyPair {
                private_key,
                certificate,
            },
            (None, None) => {
                let common_name = assertion_endpoint.host_str().unwrap_or("saml-sp");
                generate_keypair(config.key_length, common_name)?
            }
            _ => {
                return Err(SamlError::InvalidConfiguration(
                    "certificate and private key must be supplied together".into(),
                ))
            }
        };
        let decrypt_options = DecryptOptions::new(&keypair.private_key)?;

        tracing::debug!(
            entity_id = %entity_id,
            endpoint = %assertion_endpoint,
            "service provider ready"
        );

        Ok(Self {
            entity_id,
            assertion_endpoint,
            logout_endpoint,
            keypair,
            decrypt_options,
            require_encrypted_assertions: config.require_encrypted_assertions,
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn assertion_endpoint(&self) -> &Url {
        &self.assertion_endpoint
    }

    pub fn certificate(&self) -> &str {
        &self.keypair.certificate
    }

    pub fn private_key(&self) -> &str {
        &self.keypair.private_key
    }

    /// SP metadata, valid for 24 hours from now.
    pub fn metadata(&self) -> Result<String, SamlError> {
        SpMetadataBuilder::new()
            .entity_id(&self.entity_id)
            .acs_url(self.assertion_endpoint.as_str())
            .slo_url(self.logout_endpoint.as_str())
            .certificate(&self.keypair.certificate)
            .build()
    }

    pub fn authn_request(&self, idp_url: &str) -> Result<AuthnRequestContext, SamlError> {
        AuthnRequestContext::new(idp_url, self.assertion_endpoint.as_str())
    }

    pub fn write_keypair(&self, dir: &Path) -> Result<(PathBuf, PathBuf), SamlError> {
        self.keypair.write_pem_files(dir)
    }

    /// Runs the ingestion pipeline over response XML the caller already extracted.
    pub fn process_xml(&self, xml: &str) -> Result<Option<ParsedAssertion>, SamlError> {
        self.process_xml_at(xml, OffsetDateTime::now_utc())
    }

    /// Like [`Self::process_xml`], checking the validity window against `now`.
    pub fn process_xml_at(
        &self,
        xml: &str,
        now: OffsetDateTime,
    ) -> Result<Option<ParsedAssertion>, SamlError> {
        let envelope = extract_from_xml(xml);
        self.ingest(&envelope, now)
    }

    /// Reads a POSTed `SAMLResponse` and runs the ingestion pipeline over it.
    ///
    /// Non-POST requests fail with [`SamlError::MethodNotAllowed`]. A form
    /// without a `SAMLResponse`, or a response without an assertion, is `Ok(None)`.
    pub async fn process_request<B, D, E>(
        &self,
        request: Request<B>,
    ) -> Result<Option<ParsedAssertion>, SamlError>
    where
        B: Stream<Item = Result<D, E>> + Unpin,
        D: AsRef<[u8]>,
        E: Into<BoxError>,
    {
        match extract_from_request(request).await? {
            Some(envelope) => self.ingest(&envelope, OffsetDateTime::now_utc()),
            None => Ok(None),
        }
    }

    fn ingest(
        &self,
        envelope: &str,
        now: OffsetDateTime,
    ) -> Result<Option<ParsedAssertion>, SamlError> {
        let Some(located) = locate_assertion(envelope, &self.decrypt_options)? else {
            return Ok(None);
        };
        if self.require_encrypted_assertions && !located.encrypted {
            tracing::warn!(entity_id = %self.entity_id, "rejecting unencrypted assertion");
            return Err(SamlError::UnencryptedAssertion);
        }
        validate_assertion(&located.xml, now).map(Some)
    }
}
