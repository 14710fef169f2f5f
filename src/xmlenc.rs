//! XML Encryption for `EncryptedAssertion`s.
//!
//! Only the recipient side is implemented: the content encryption key is
//! unwrapped with the SP's RSA private key, then the payload is decrypted.

use std::fmt;

use libxml::tree::Node;
use openssl::{
    encrypt::Decrypter,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Padding,
    symm::{self, Cipher, Crypter, Mode},
};

use crate::{
    utils::decode_xml_base64,
    xml::{SeededDocument, SeededParser},
    SamlError,
};

const RSA_1_5: &str = "http://www.w3.org/2001/04/xmlenc#rsa-1_5";
const RSA_OAEP_MGF1P: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p";
const RSA_OAEP: &str = "http://www.w3.org/2009/xmlenc11#rsa-oaep";

const TRIPLEDES_CBC: &str = "http://www.w3.org/2001/04/xmlenc#tripledes-cbc";
const AES128_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes128-cbc";
const AES192_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes192-cbc";
const AES256_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes256-cbc";
const AES128_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes128-gcm";
const AES192_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes192-gcm";
const AES256_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

/// Key material and algorithm policy for decrypting assertions.
#[derive(Clone)]
pub struct DecryptOptions {
    key: PKey<Private>,
    disallow_insecure_algorithms: bool,
}

impl fmt::Debug for DecryptOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptOptions")
            .field("key", &"<redacted>")
            .field(
                "disallow_insecure_algorithms",
                &self.disallow_insecure_algorithms,
            )
            .finish()
    }
}

impl DecryptOptions {
    /// Loads a PEM encoded RSA private key (PKCS#1 or PKCS#8).
    pub fn new(private_key_pem: &str) -> Result<Self, SamlError> {
        if private_key_pem.trim().is_empty() {
            return Err(SamlError::InvalidConfiguration(
                "private key must not be empty".into(),
            ));
        }
        let key = PKey::private_key_from_pem(private_key_pem.as_bytes()).map_err(|e| {
            SamlError::InvalidConfiguration(format!("private key is not a valid PEM key: {e}"))
        })?;
        if key.rsa().is_err() {
            return Err(SamlError::InvalidConfiguration(
                "private key must be an RSA key".into(),
            ));
        }
        Ok(Self {
            key,
            disallow_insecure_algorithms: true,
        })
    }

    /// Whether RSA PKCS#1 v1.5 key transport and unauthenticated CBC payloads
    /// are refused. On by default; the assertion pipeline never turns it off.
    pub fn disallow_insecure_algorithms(self, disallow: bool) -> Self {
        Self {
            disallow_insecure_algorithms: disallow,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyTransport {
    Rsa15,
    RsaOaep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockMode {
    Cbc,
    Gcm,
}

fn key_transport(algorithm: &str) -> Result<(KeyTransport, bool), SamlError> {
    match algorithm {
        RSA_OAEP_MGF1P | RSA_OAEP => Ok((KeyTransport::RsaOaep, false)),
        RSA_1_5 => Ok((KeyTransport::Rsa15, true)),
        other => Err(SamlError::Decryption(format!(
            "unsupported key transport algorithm {other}"
        ))),
    }
}

fn block_cipher(algorithm: &str) -> Result<(Cipher, BlockMode, bool), SamlError> {
    match algorithm {
        AES128_GCM => Ok((Cipher::aes_128_gcm(), BlockMode::Gcm, false)),
        AES192_GCM => Ok((Cipher::aes_192_gcm(), BlockMode::Gcm, false)),
        AES256_GCM => Ok((Cipher::aes_256_gcm(), BlockMode::Gcm, false)),
        AES128_CBC => Ok((Cipher::aes_128_cbc(), BlockMode::Cbc, true)),
        AES192_CBC => Ok((Cipher::aes_192_cbc(), BlockMode::Cbc, true)),
        AES256_CBC => Ok((Cipher::aes_256_cbc(), BlockMode::Cbc, true)),
        TRIPLEDES_CBC => Ok((Cipher::des_ede3_cbc(), BlockMode::Cbc, true)),
        other => Err(SamlError::Decryption(format!(
            "unsupported data encryption algorithm {other}"
        ))),
    }
}

fn digest(algorithm: Option<&str>) -> Result<MessageDigest, SamlError> {
    match algorithm {
        None
        | Some("http://www.w3.org/2000/09/xmldsig#sha1")
        | Some("http://www.w3.org/2009/xmlenc11#mgf1sha1") => Ok(MessageDigest::sha1()),
        Some("http://www.w3.org/2001/04/xmlenc#sha256")
        | Some("http://www.w3.org/2009/xmlenc11#mgf1sha256") => Ok(MessageDigest::sha256()),
        Some("http://www.w3.org/2001/04/xmldsig-more#sha384")
        | Some("http://www.w3.org/2009/xmlenc11#mgf1sha384") => Ok(MessageDigest::sha384()),
        Some("http://www.w3.org/2001/04/xmlenc#sha512")
        | Some("http://www.w3.org/2009/xmlenc11#mgf1sha512") => Ok(MessageDigest::sha512()),
        Some(other) => Err(SamlError::Decryption(format!(
            "unsupported digest algorithm {other}"
        ))),
    }
}

/// Decrypts a serialized `EncryptedAssertion` (or bare `EncryptedData`) and
/// returns the plaintext XML it wraps.
pub fn decrypt(encrypted_xml: &str, options: &DecryptOptions) -> Result<String, SamlError> {
    let document = SeededParser::default().parse(encrypted_xml)?;
    let root = document
        .root_element()
        .ok_or_else(|| SamlError::Decryption("document has no root element".into()))?;
    decrypt_node(&document, &root, options)
}

pub(crate) fn decrypt_node(
    document: &SeededDocument,
    encrypted: &Node,
    options: &DecryptOptions,
) -> Result<String, SamlError> {
    let encrypted_data = if encrypted.get_name() == "EncryptedData" {
        encrypted.clone()
    } else {
        single(document.find_xmlenc(encrypted, "EncryptedData")?, "EncryptedData")?
    };

    let data_algorithm = encryption_method(document, &encrypted_data)?;
    let (cipher, mode, data_insecure) = block_cipher(&data_algorithm)?;

    let encrypted_key = document
        .find_xmlenc(encrypted, "EncryptedKey")?
        .into_iter()
        .next()
        .ok_or_else(|| SamlError::Decryption("no EncryptedKey found".into()))?;
    let key_algorithm = encryption_method(document, &encrypted_key)?;
    let (transport, key_insecure) = key_transport(&key_algorithm)?;

    if options.disallow_insecure_algorithms && (data_insecure || key_insecure) {
        let rejected = if key_insecure {
            &key_algorithm
        } else {
            &data_algorithm
        };
        tracing::warn!(algorithm = %rejected, "refusing insecure encryption algorithm");
        return Err(SamlError::Decryption(format!(
            "insecure algorithm {rejected} is not allowed"
        )));
    }

    tracing::debug!(
        key_transport = %key_algorithm,
        data_encryption = %data_algorithm,
        "decrypting assertion"
    );

    let wrapped_key = cipher_value(document, &encrypted_key)?;
    let session_key = unwrap_key(document, &encrypted_key, transport, &wrapped_key, options)?;
    if session_key.len() != cipher.key_len() {
        return Err(SamlError::Decryption(format!(
            "content encryption key is {} bytes, {data_algorithm} needs {}",
            session_key.len(),
            cipher.key_len()
        )));
    }

    let payload = cipher_value(document, &encrypted_data)?;
    let plaintext = match mode {
        BlockMode::Gcm => decrypt_gcm(cipher, &session_key, &payload)?,
        BlockMode::Cbc => decrypt_cbc(cipher, &session_key, &payload)?,
    };

    String::from_utf8(plaintext)
        .map_err(|_| SamlError::Decryption("decrypted payload is not UTF-8".into()))
}

fn single(mut nodes: Vec<Node>, what: &str) -> Result<Node, SamlError> {
    if nodes.is_empty() {
        return Err(SamlError::Decryption(format!("no {what} found")));
    }
    Ok(nodes.remove(0))
}

fn encryption_method(document: &SeededDocument, element: &Node) -> Result<String, SamlError> {
    document
        .xmlenc_child(element, "EncryptionMethod")?
        .and_then(|method| method.get_attribute("Algorithm"))
        .ok_or_else(|| {
            SamlError::Decryption(format!("{} has no EncryptionMethod", element.get_name()))
        })
}

fn cipher_value(document: &SeededDocument, element: &Node) -> Result<Vec<u8>, SamlError> {
    let cipher_data = document.xmlenc_child(element, "CipherData")?.ok_or_else(|| {
        SamlError::Decryption(format!("{} has no CipherData", element.get_name()))
    })?;
    let value = document
        .xmlenc_child(&cipher_data, "CipherValue")?
        .ok_or_else(|| SamlError::Decryption("CipherData has no CipherValue".into()))?;
    decode_xml_base64(&value.get_content())
        .map_err(|e| SamlError::Decryption(format!("CipherValue is not base64: {e}")))
}

fn unwrap_key(
    document: &SeededDocument,
    encrypted_key: &Node,
    transport: KeyTransport,
    wrapped: &[u8],
    options: &DecryptOptions,
) -> Result<Vec<u8>, SamlError> {
    let failed = |e: openssl::error::ErrorStack| {
        SamlError::Decryption(format!("failed to unwrap content encryption key: {e}"))
    };

    let mut decrypter = Decrypter::new(&options.key).map_err(failed)?;
    match transport {
        KeyTransport::Rsa15 => decrypter.set_rsa_padding(Padding::PKCS1).map_err(failed)?,
        KeyTransport::RsaOaep => {
            let method = document.xmlenc_child(encrypted_key, "EncryptionMethod")?;
            let param = |name: &str| -> Result<Option<Node>, SamlError> {
                match &method {
                    Some(method) => Ok(method
                        .get_child_elements()
                        .into_iter()
                        .find(|child| child.get_name() == name)),
                    None => Ok(None),
                }
            };
            let oaep_digest = digest(
                param("DigestMethod")?
                    .and_then(|n| n.get_attribute("Algorithm"))
                    .as_deref(),
            )?;
            let mgf_digest = digest(
                param("MGF")?
                    .and_then(|n| n.get_attribute("Algorithm"))
                    .as_deref(),
            )?;

            decrypter.set_rsa_padding(Padding::PKCS1_OAEP).map_err(failed)?;
            decrypter.set_rsa_oaep_md(oaep_digest).map_err(failed)?;
            decrypter.set_rsa_mgf1_md(mgf_digest).map_err(failed)?;
            if let Some(label) = param("OAEPparams")? {
                let label = decode_xml_base64(&label.get_content())
                    .map_err(|e| SamlError::Decryption(format!("OAEPparams is not base64: {e}")))?;
                if !label.is_empty() {
                    decrypter.set_rsa_oaep_label(&label).map_err(failed)?;
                }
            }
        }
    }

    let mut key = vec![0; decrypter.decrypt_len(wrapped).map_err(failed)?];
    let len = decrypter.decrypt(wrapped, &mut key).map_err(failed)?;
    key.truncate(len);
    Ok(key)
}

fn decrypt_gcm(cipher: Cipher, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, SamlError> {
    if payload.len() < GCM_IV_LEN + GCM_TAG_LEN {
        return Err(SamlError::Decryption("ciphertext too short".into()));
    }
    let (iv, rest) = payload.split_at(GCM_IV_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);
    symm::decrypt_aead(cipher, key, Some(iv), &[], ciphertext, tag)
        .map_err(|_| SamlError::Decryption("ciphertext failed authentication".into()))
}

fn decrypt_cbc(cipher: Cipher, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, SamlError> {
    let block = cipher.block_size();
    if payload.len() < 2 * block || payload.len() % block != 0 {
        return Err(SamlError::Decryption("ciphertext has invalid length".into()));
    }
    let (iv, ciphertext) = payload.split_at(block);
    let failed = |e: openssl::error::ErrorStack| {
        SamlError::Decryption(format!("CBC decryption failed: {e}"))
    };

    let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv)).map_err(failed)?;
    crypter.pad(false);
    let mut plaintext = vec![0; ciphertext.len() + block];
    let count = crypter.update(ciphertext, &mut plaintext).map_err(failed)?;
    let rest = crypter.finalize(&mut plaintext[count..]).map_err(failed)?;
    plaintext.truncate(count + rest);

    // XML-Enc padding: only the final byte (the pad length) is meaningful.
    let pad = plaintext.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > block || pad > plaintext.len() {
        return Err(SamlError::Decryption("invalid padding".into()));
    }
    plaintext.truncate(plaintext.len() - pad);
    Ok(plaintext)
}
