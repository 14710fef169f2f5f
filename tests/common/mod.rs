#![allow(dead_code)]

use std::sync::OnceLock;

use base64::{prelude::BASE64_STANDARD, Engine as _};
use openssl::{
    encrypt::Encrypter,
    pkey::{PKey, Public},
    rand::rand_bytes,
    rsa::Padding,
    symm::{self, Cipher},
    x509::X509,
};
use shaml_sp::{generate_keypair, KeyLength, KeyPair, ServiceProvider, ServiceProviderConfig};
use time::{macros::datetime, OffsetDateTime};

pub const ACS: &str = "https://sp.example.com/saml/acs";
pub const SAMPLE_ASSERTION: &str = include_str!("../../static/assertion.xml");
/// An instant inside the sample assertion's validity window.
pub const SAMPLE_NOW: OffsetDateTime = datetime!(2024-03-01 12:02:00 UTC);

pub const RSA_OAEP_MGF1P: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p";
pub const RSA_1_5: &str = "http://www.w3.org/2001/04/xmlenc#rsa-1_5";
pub const AES256_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";
pub const AES128_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes128-gcm";
pub const AES256_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes256-cbc";

pub fn sp_keys() -> &'static KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(|| generate_keypair(KeyLength::Rsa2048, "sp.example.com").unwrap())
}

pub fn other_keys() -> &'static KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(|| generate_keypair(KeyLength::Rsa2048, "intruder.example.com").unwrap())
}

pub fn config() -> ServiceProviderConfig {
    ServiceProviderConfig {
        entity_id: Some("https://sp.example.com".into()),
        assertion_endpoint: ACS.into(),
        certificate: Some(sp_keys().certificate.clone()),
        private_key: Some(sp_keys().private_key.clone()),
        ..Default::default()
    }
}

pub fn service_provider() -> ServiceProvider {
    ServiceProvider::new(config()).unwrap()
}

/// How a test assertion gets encrypted.
#[derive(Debug, Clone, Copy)]
pub struct Scheme {
    pub key_transport: &'static str,
    pub data_encryption: &'static str,
}

impl Default for Scheme {
    fn default() -> Self {
        Self {
            key_transport: RSA_OAEP_MGF1P,
            data_encryption: AES256_GCM,
        }
    }
}

fn public_key(certificate_pem: &str) -> PKey<Public> {
    X509::from_pem(certificate_pem.as_bytes())
        .unwrap()
        .public_key()
        .unwrap()
}

fn wrap_key(certificate_pem: &str, key_transport: &str, session_key: &[u8]) -> Vec<u8> {
    let public_key = public_key(certificate_pem);
    let mut encrypter = Encrypter::new(&public_key).unwrap();
    let padding = if key_transport == RSA_1_5 {
        Padding::PKCS1
    } else {
        Padding::PKCS1_OAEP
    };
    encrypter.set_rsa_padding(padding).unwrap();
    let mut wrapped = vec![0; encrypter.encrypt_len(session_key).unwrap()];
    let len = encrypter.encrypt(session_key, &mut wrapped).unwrap();
    wrapped.truncate(len);
    wrapped
}

fn encrypt_payload(data_encryption: &str, plaintext: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let (cipher, gcm) = match data_encryption {
        AES128_GCM => (Cipher::aes_128_gcm(), true),
        AES256_GCM => (Cipher::aes_256_gcm(), true),
        AES256_CBC => (Cipher::aes_256_cbc(), false),
        other => panic!("no test cipher for {other}"),
    };
    let mut key = vec![0; cipher.key_len()];
    rand_bytes(&mut key).unwrap();

    let payload = if gcm {
        let mut iv = [0; 12];
        rand_bytes(&mut iv).unwrap();
        let mut tag = [0; 16];
        let ciphertext = symm::encrypt_aead(cipher, &key, Some(&iv), &[], plaintext, &mut tag).unwrap();
        [&iv[..], &ciphertext, &tag].concat()
    } else {
        let mut iv = [0; 16];
        rand_bytes(&mut iv).unwrap();
        // PKCS#7 padding also satisfies the XML-Enc padding rule.
        let ciphertext = symm::encrypt(cipher, &key, Some(&iv), plaintext).unwrap();
        [&iv[..], &ciphertext].concat()
    };
    (key, payload)
}

/// An `EncryptedAssertion` element wrapping `assertion`, addressed to `certificate_pem`.
pub fn encrypted_assertion(assertion: &str, certificate_pem: &str, scheme: Scheme) -> String {
    let (session_key, payload) = encrypt_payload(scheme.data_encryption, assertion.as_bytes());
    let wrapped = wrap_key(certificate_pem, scheme.key_transport, &session_key);
    format!(
        r#"<saml:EncryptedAssertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"><xenc:EncryptedData xmlns:xenc="http://www.w3.org/2001/04/xmlenc#" Type="http://www.w3.org/2001/04/xmlenc#Element"><xenc:EncryptionMethod Algorithm="{data}"/><ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><xenc:EncryptedKey><xenc:EncryptionMethod Algorithm="{transport}"><ds:DigestMethod Algorithm="http://www.w3.org/2000/09/xmldsig#sha1"/></xenc:EncryptionMethod><xenc:CipherData><xenc:CipherValue>{key}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedKey></ds:KeyInfo><xenc:CipherData><xenc:CipherValue>{value}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedData></saml:EncryptedAssertion>"#,
        data = scheme.data_encryption,
        transport = scheme.key_transport,
        key = BASE64_STANDARD.encode(wrapped),
        value = BASE64_STANDARD.encode(payload),
    )
}

/// A `samlp:Response` around `inner`.
pub fn response(inner: &str) -> String {
    format!(
        "<samlp:Response xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\" ID=\"_resp\" Version=\"2.0\" IssueInstant=\"2024-03-01T12:00:00Z\" Destination=\"{ACS}\">\n  <saml:Issuer xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\">https://idp.example.com</saml:Issuer>\n  <samlp:Status><samlp:StatusCode Value=\"urn:oasis:names:tc:SAML:2.0:status:Success\"/></samlp:Status>\n  {inner}\n</samlp:Response>\n"
    )
}

pub fn encrypted_response(assertion: &str) -> String {
    response(&encrypted_assertion(assertion, &sp_keys().certificate, Scheme::default()))
}

/// The urlencoded form an IdP's auto-submitting page would POST.
pub fn form_body(xml: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("SAMLResponse", &BASE64_STANDARD.encode(xml))
        .append_pair("RelayState", "/dashboard")
        .finish()
}

/// The sample assertion, re-dated so its window contains the current time.
pub fn current_assertion() -> String {
    let now = OffsetDateTime::now_utc();
    let not_before = (now - time::Duration::minutes(1))
        .format(&shaml_sp::DATE_TIME_FORMAT)
        .unwrap();
    let not_on_or_after = (now + time::Duration::minutes(5))
        .format(&shaml_sp::DATE_TIME_FORMAT)
        .unwrap();
    SAMPLE_ASSERTION
        .replace("2024-03-01T12:00:00Z", &not_before)
        .replace("2024-03-01T12:05:00Z", &not_on_or_after)
}
