use futures_util::{Stream, StreamExt as _};
use http::{Method, Request};

use crate::{
    utils::{decode_xml_base64, normalize_newlines},
    BoxError, SamlError,
};

const SAML_RESPONSE_FIELD: &str = "SAMLResponse";

/// Prepares XML handed over directly by the caller.
pub fn extract_from_xml(xml: &str) -> String {
    normalize_newlines(xml)
}

/// Reads a POSTed `application/x-www-form-urlencoded` body and decodes its
/// `SAMLResponse` field.
///
/// Returns `Ok(None)` when the form has no (or an empty) `SAMLResponse`. The
/// body is read to the end of the stream; a stream error aborts the read.
pub async fn extract_from_request<B, D, E>(request: Request<B>) -> Result<Option<String>, SamlError>
where
    B: Stream<Item = Result<D, E>> + Unpin,
    D: AsRef<[u8]>,
    E: Into<BoxError>,
{
    if request.method() != Method::POST {
        return Err(SamlError::MethodNotAllowed(request.method().clone()));
    }

    let mut body = request.into_body();
    let mut buffer = Vec::new();
    let mut chunks = 0usize;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| SamlError::Transport(e.into()))?;
        buffer.extend_from_slice(chunk.as_ref());
        chunks += 1;
    }
    tracing::debug!(bytes = buffer.len(), chunks, "read SAML response body");

    decode_form(&buffer)
}

fn decode_form(body: &[u8]) -> Result<Option<String>, SamlError> {
    let Some(encoded) = url::form_urlencoded::parse(body)
        .find(|(key, _)| key == SAML_RESPONSE_FIELD)
        .map(|(_, value)| value.into_owned())
    else {
        tracing::debug!("form has no SAMLResponse field");
        return Ok(None);
    };

    let decoded = decode_xml_base64(&encoded).map_err(|_| SamlError::InvalidResponse)?;
    let xml = String::from_utf8(decoded).map_err(|_| SamlError::InvalidResponse)?;
    if xml.trim().is_empty() {
        tracing::debug!("SAMLResponse field decodes to nothing");
        return Ok(None);
    }
    Ok(Some(normalize_newlines(&xml)))
}
