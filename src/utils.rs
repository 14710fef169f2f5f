use base64::{prelude::BASE64_STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};

use crate::SamlError;

const ID_RANDOM_BYTES: usize = 21;

/// Generates an opaque SAML identifier: `_` followed by 42 hex characters.
///
/// The bytes come straight from the operating system RNG. If that is unavailable
/// the error is returned, there is no fallback to a weaker source.
pub fn generate_id() -> Result<String, SamlError> {
    let mut bytes = [0u8; ID_RANDOM_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(format!("_{}", hex::encode(bytes)))
}

pub fn decode_xml_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let stripped = input.replace([' ', '\n', '\r', '\t'], "");
    BASE64_STANDARD.decode(stripped)
}

/// Rewrites CRLF and lone CR line endings to LF.
pub fn normalize_newlines(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}
