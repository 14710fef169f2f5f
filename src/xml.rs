use std::borrow::Cow;

use libxml::{
    parser::{Parser as XmlParser, ParserOptions},
    tree::{Document, Node},
    xpath::Context,
};

use crate::SamlError;

pub const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XMLENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const XMLENC11_NS: &str = "http://www.w3.org/2009/xmlenc11#";

/// Prefixes every document is parsed with, whether or not it declares them.
pub const SAML_NAMESPACES: &[(&str, &str)] = &[
    ("saml", ASSERTION_NS),
    ("saml2", ASSERTION_NS),
    ("samlp", PROTOCOL_NS),
    ("samlp2", PROTOCOL_NS),
    ("ds", XMLDSIG_NS),
    ("xenc", XMLENC_NS),
    ("md", METADATA_NS),
];

/// A namespace aware parser whose prefix bindings are in scope for every
/// document it parses.
///
/// IdPs routinely hand out fragments (a decrypted assertion, an
/// `EncryptedAssertion` cut out of its response) that use `saml2:` or `xenc:`
/// without declaring them. The seed bindings are added to the root element
/// unless the document declares that prefix itself.
#[derive(Debug, Clone, Copy)]
pub struct SeededParser {
    namespaces: &'static [(&'static str, &'static str)],
}

impl Default for SeededParser {
    fn default() -> Self {
        Self::new(SAML_NAMESPACES)
    }
}

impl SeededParser {
    pub const fn new(namespaces: &'static [(&'static str, &'static str)]) -> Self {
        Self { namespaces }
    }

    pub fn parse(&self, xml: &str) -> Result<SeededDocument, SamlError> {
        let seeded = seed_root_namespaces(xml, self.namespaces);
        let options = ParserOptions {
            recover: false,
            no_net: true,
            ..Default::default()
        };
        let document = XmlParser::default()
            .parse_string_with_options(seeded.as_bytes(), options)
            .map_err(SamlError::InvalidXml)?;
        Ok(SeededDocument {
            document,
            namespaces: self.namespaces,
        })
    }
}

pub struct SeededDocument {
    document: Document,
    namespaces: &'static [(&'static str, &'static str)],
}

impl SeededDocument {
    /// All elements matching the first candidate that matches anything.
    ///
    /// Candidates are tried in order: the element in the SAML assertion
    /// namespace (whatever prefix the document uses for it), then any element
    /// with that local name. The choice is made once for the whole document, so
    /// a document never yields a mix of both sets.
    pub fn find_all(&self, local_name: &str) -> Result<Vec<Node>, SamlError> {
        self.find_candidates(local_name, None)
    }

    pub fn find_first(&self, local_name: &str) -> Result<Option<Node>, SamlError> {
        Ok(self.find_all(local_name)?.into_iter().next())
    }

    /// Same preference rule as [`Self::find_all`], scoped to the children of `parent`.
    pub fn find_children(&self, parent: &Node, local_name: &str) -> Result<Vec<Node>, SamlError> {
        self.find_candidates(local_name, Some(parent))
    }

    /// Descendants of `scope` with the given local name in the XML-Enc
    /// namespaces or in no namespace.
    pub fn find_xmlenc(&self, scope: &Node, local_name: &str) -> Result<Vec<Node>, SamlError> {
        self.evaluate(&xmlenc_xpath(".//", local_name), Some(scope))
    }

    /// Like [`Self::find_xmlenc`], restricted to direct children of `parent`.
    pub fn xmlenc_child(&self, parent: &Node, local_name: &str) -> Result<Option<Node>, SamlError> {
        Ok(self
            .evaluate(&xmlenc_xpath("./", local_name), Some(parent))?
            .into_iter()
            .next())
    }

    pub fn root_element(&self) -> Option<Node> {
        self.document.get_root_element()
    }

    /// Serializes `node` as a standalone document, carrying over the namespace
    /// declarations it inherits from its ancestors.
    pub fn subtree_to_string(&self, node: &Node) -> String {
        let fragment = self.document.node_to_string(node);

        let mut inherited: Vec<(String, String)> = Vec::new();
        let mut ancestor = node.get_parent();
        while let Some(current) = ancestor {
            if !current.is_element_node() {
                break;
            }
            for namespace in current.get_namespace_declarations() {
                let prefix = namespace.get_prefix();
                let used = prefix.is_empty() || fragment.contains(&format!("{prefix}:"));
                if used && !inherited.iter().any(|(p, _)| *p == prefix) {
                    inherited.push((prefix, namespace.get_href()));
                }
            }
            ancestor = current.get_parent();
        }

        let inherited: Vec<(&str, &str)> = inherited
            .iter()
            .map(|(prefix, href)| (prefix.as_str(), href.as_str()))
            .collect();
        seed_root_namespaces(&fragment, &inherited).into_owned()
    }

    fn find_candidates(
        &self,
        local_name: &str,
        parent: Option<&Node>,
    ) -> Result<Vec<Node>, SamlError> {
        let axis = if parent.is_some() { "" } else { "//" };
        let candidates = [
            format!("{axis}saml2:{local_name}"),
            format!("{axis}*[local-name()='{local_name}']"),
        ];
        for candidate in &candidates {
            let nodes = self.evaluate(candidate, parent)?;
            if !nodes.is_empty() {
                tracing::trace!(candidate = %candidate, count = nodes.len(), "tag lookup matched");
                return Ok(nodes);
            }
        }
        Ok(Vec::new())
    }

    fn evaluate(&self, xpath: &str, node: Option<&Node>) -> Result<Vec<Node>, SamlError> {
        let mut context =
            Context::new(&self.document).map_err(|_| SamlError::XPath(xpath.to_string()))?;
        for (prefix, href) in self.namespaces {
            context
                .register_namespace(prefix, href)
                .map_err(|_| SamlError::XPath(xpath.to_string()))?;
        }
        context
            .findnodes(xpath, node)
            .map_err(|_| SamlError::XPath(xpath.to_string()))
    }
}

fn xmlenc_xpath(axis: &str, local_name: &str) -> String {
    format!(
        "{axis}*[local-name()='{local_name}' and (namespace-uri()='{XMLENC_NS}' \
         or namespace-uri()='{XMLENC11_NS}' or namespace-uri()='')]"
    )
}

/// Element text, or `None` when the element has no text at all.
pub fn text_content(node: &Node) -> Option<String> {
    let content = node.get_content();
    if content.is_empty() {
        None
    } else {
        Some(content)
    }
}

fn seed_root_namespaces<'a>(xml: &'a str, namespaces: &[(&str, &str)]) -> Cow<'a, str> {
    let Some((name_end, tag_end)) = root_start_tag(xml) else {
        return Cow::Borrowed(xml);
    };
    let declared = declared_prefixes(&xml[name_end..tag_end]);

    let mut seed = String::new();
    for (prefix, href) in namespaces {
        if declared.iter().any(|d| d == prefix) {
            continue;
        }
        if prefix.is_empty() {
            seed.push_str(&format!(" xmlns=\"{href}\""));
        } else {
            seed.push_str(&format!(" xmlns:{prefix}=\"{href}\""));
        }
    }
    if seed.is_empty() {
        return Cow::Borrowed(xml);
    }

    let mut seeded = String::with_capacity(xml.len() + seed.len());
    seeded.push_str(&xml[..name_end]);
    seeded.push_str(&seed);
    seeded.push_str(&xml[name_end..]);
    Cow::Owned(seeded)
}

/// Byte offsets of the end of the root element's name and of its closing `>`.
fn root_start_tag(xml: &str) -> Option<(usize, usize)> {
    let mut pos = 0;
    loop {
        let start = pos + xml[pos..].find('<')?;
        let rest = &xml[start..];
        if rest.starts_with("<?") {
            pos = start + rest.find("?>")? + 2;
        } else if rest.starts_with("<!--") {
            pos = start + rest.find("-->")? + 3;
        } else if rest.starts_with("<!") {
            let end = match rest.find('[') {
                Some(open) if open < rest.find('>')? => rest.find("]>")? + 2,
                _ => rest.find('>')? + 1,
            };
            pos = start + end;
        } else {
            let name_len = rest[1..]
                .find(|c: char| c.is_whitespace() || c == '/' || c == '>')?
                + 1;
            let name_end = start + name_len;
            let tag_end = name_end + closing_bracket(&xml[name_end..])?;
            return Some((name_end, tag_end));
        }
    }
}

fn closing_bracket(tag: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in tag.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

fn declared_prefixes(attributes: &str) -> Vec<String> {
    let mut declared = Vec::new();
    let mut rest = attributes;
    while let Some(eq) = rest.find('=') {
        let name = rest[..eq].trim().trim_end_matches('/');
        let name = name.rsplit(char::is_whitespace).next().unwrap_or(name);
        if let Some(prefix) = name.strip_prefix("xmlns:") {
            declared.push(prefix.to_string());
        } else if name == "xmlns" {
            declared.push(String::new());
        }
        let after = rest[eq + 1..].trim_start();
        let Some(q) = after.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            break;
        };
        let Some(close) = after[1..].find(q) else {
            break;
        };
        rest = &after[close + 2..];
    }
    declared
}
