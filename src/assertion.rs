use serde::{ser::SerializeMap, Serialize, Serializer};
use time::{format_description::well_known::Iso8601, OffsetDateTime};

use crate::{
    xml::{text_content, SeededDocument, SeededParser},
    xmlenc::{decrypt_node, DecryptOptions},
    SamlError,
};

/// Attribute values keyed by attribute `Name`, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, Vec<String>)>);

impl Attributes {
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, values)| values.as_slice())
    }

    /// Replaces the values of an existing name in place, otherwise appends.
    pub fn insert(&mut self, name: String, values: Vec<String>) {
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = values,
            None => self.0.push((name, values)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Attributes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, values) in &self.0 {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

/// The consumer facing view of an assertion that passed decryption and the
/// validity window check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedAssertion {
    /// The plaintext assertion. Its signature, if any, has not been checked.
    pub xml: String,
    pub name_id: Option<String>,
    pub attributes: Attributes,
    #[serde(with = "time::serde::rfc3339::option")]
    pub not_before: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub not_on_or_after: Option<OffsetDateTime>,
}

/// The assertion found in a response, decrypted when it was encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedAssertion {
    pub xml: String,
    pub encrypted: bool,
}

/// Finds the assertion in a response envelope.
///
/// An `EncryptedAssertion` wins over a plain `Assertion`. `Ok(None)` means the
/// envelope carries no assertion at all.
pub fn locate_assertion(
    envelope: &str,
    options: &DecryptOptions,
) -> Result<Option<LocatedAssertion>, SamlError> {
    let document = SeededParser::default().parse(envelope)?;

    if let Some(encrypted) = document.find_first("EncryptedAssertion")? {
        tracing::debug!("found EncryptedAssertion");
        let xml = decrypt_node(&document, &encrypted, options)?;
        return Ok(Some(LocatedAssertion {
            xml,
            encrypted: true,
        }));
    }

    match document.find_first("Assertion")? {
        Some(assertion) => {
            tracing::debug!("found plaintext Assertion");
            Ok(Some(LocatedAssertion {
                xml: document.subtree_to_string(&assertion),
                encrypted: false,
            }))
        }
        None => {
            tracing::debug!("response carries no assertion");
            Ok(None)
        }
    }
}

fn condition_time(
    conditions: Option<&libxml::tree::Node>,
    attribute: &str,
) -> Result<Option<OffsetDateTime>, SamlError> {
    let Some(value) = conditions.and_then(|c| c.get_attribute(attribute)) else {
        return Ok(None);
    };
    OffsetDateTime::parse(value.trim(), &Iso8601::DEFAULT)
        .map(Some)
        .map_err(|_| SamlError::InvalidCondition(value))
}

/// Checks the `Conditions` window against `now` and projects the assertion.
///
/// `NotBefore` is inclusive and `NotOnOrAfter` exclusive. A missing bound does
/// not constrain.
pub fn validate_assertion(xml: &str, now: OffsetDateTime) -> Result<ParsedAssertion, SamlError> {
    let document = SeededParser::default().parse(xml)?;

    let conditions = document.find_first("Conditions")?;
    let not_before = condition_time(conditions.as_ref(), "NotBefore")?;
    let not_on_or_after = condition_time(conditions.as_ref(), "NotOnOrAfter")?;

    if let Some(not_before) = not_before {
        if now < not_before {
            tracing::warn!(%not_before, %now, "assertion not yet valid");
            return Err(SamlError::AssertionNotYetValid { not_before });
        }
    }
    if let Some(not_on_or_after) = not_on_or_after {
        if now >= not_on_or_after {
            tracing::warn!(%not_on_or_after, %now, "assertion expired");
            return Err(SamlError::AssertionExpired { not_on_or_after });
        }
    }

    let name_id = document
        .find_first("NameID")?
        .as_ref()
        .and_then(text_content);
    let attributes = extract_attributes(&document)?;

    Ok(ParsedAssertion {
        xml: xml.to_string(),
        name_id,
        attributes,
        not_before,
        not_on_or_after,
    })
}

fn extract_attributes(document: &SeededDocument) -> Result<Attributes, SamlError> {
    let mut attributes = Attributes::default();
    for attribute in document.find_all("Attribute")? {
        let Some(name) = attribute.get_attribute("Name") else {
            continue;
        };
        let values = document
            .find_children(&attribute, "AttributeValue")?
            .iter()
            .map(|value| value.get_content())
            .collect();
        attributes.insert(name, values);
    }
    Ok(attributes)
}
