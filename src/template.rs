//! `@NAME@` placeholder rendering.
//!
//! Substitution is literal find-and-replace over an ordered set of
//! `(key, value)` pairs. A set is validated before anything is replaced: no
//! value may contain the token of any key in the same set, so the result is
//! independent of substitution order and nothing is substituted twice. After
//! rendering, any leftover `@NAME@` token is an error.

use tracing::debug;

use crate::error::TemplateError;

/// Ordered placeholder substitutions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    pairs: Vec<(String, String)>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a substitution, replacing the value of an existing key in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Reject any value that carries another key's token.
    pub fn validate(&self) -> Result<(), TemplateError> {
        for (key, value) in &self.pairs {
            for (other, _) in &self.pairs {
                if value.contains(&token(other)) {
                    return Err(TemplateError::Collision {
                        key: key.clone(),
                        other: other.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for Substitutions
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut subs = Self::new();
        for (k, v) in iter {
            subs.set(k, v);
        }
        subs
    }
}

/// The literal token for `key`.
pub fn token(key: &str) -> String {
    format!("@{key}@")
}

/// Whether `template` mentions `@key@` at all.
pub fn requests(template: &str, key: &str) -> bool {
    template.contains(&token(key))
}

/// Render `template` with `subs`, failing on collisions or leftover tokens.
pub fn render(template: &str, subs: &Substitutions) -> Result<String, TemplateError> {
    subs.validate()?;
    let rendered = substitute(template, subs);
    let leftover = unresolved_tokens(&rendered);
    if !leftover.is_empty() {
        return Err(TemplateError::Unresolved { tokens: leftover });
    }
    Ok(rendered)
}

/// Apply `subs` in order without validating the result.
fn substitute(template: &str, subs: &Substitutions) -> String {
    let mut out = template.to_string();
    for (key, value) in subs.iter() {
        debug!("{key} => {value}");
        out = out.replace(&token(key), value);
    }
    out
}

/// Distinct `@NAME@` tokens in `text` (NAME is `[A-Z0-9_]+`), first appearance first.
pub fn unresolved_tokens(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut found: Vec<String> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'@' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && is_name_byte(bytes[end]) {
            end += 1;
        }
        if end > start && end < bytes.len() && bytes[end] == b'@' {
            let tok = &text[i..=end];
            if !found.iter().any(|f| f == tok) {
                found.push(tok.to_string());
            }
            i = end + 1;
        } else {
            i = end.max(i + 1);
        }
    }
    found
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_'
}

/// Add `repos` as `/etc/yum.repos.d/atomic.repo` under the document's `<files>` element.
///
/// The new `<file>` element becomes the last child of `<files>`; its text is
/// XML-escaped. A self-closing `<files/>` is expanded.
pub fn inject_repo_file(xml: &str, repos: &str) -> Result<String, TemplateError> {
    let element = format!(
        "<file name=\"/etc/yum.repos.d/atomic.repo\">{}</file>",
        xml_escape(repos)
    );

    if let Some(pos) = xml.find("</files>") {
        let mut out = String::with_capacity(xml.len() + element.len());
        out.push_str(&xml[..pos]);
        out.push_str(&element);
        out.push_str(&xml[pos..]);
        return Ok(out);
    }

    if let Some(pos) = xml.find("<files/>").or_else(|| xml.find("<files />")) {
        let tag_len = if xml[pos..].starts_with("<files/>") { 8 } else { 9 };
        let mut out = String::with_capacity(xml.len() + element.len() + 16);
        out.push_str(&xml[..pos]);
        out.push_str("<files>");
        out.push_str(&element);
        out.push_str("</files>");
        out.push_str(&xml[pos + tag_len..]);
        return Ok(out);
    }

    Err(TemplateError::MissingElement { element: "files" })
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}
