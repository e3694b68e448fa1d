use std::collections::BTreeMap;

use crate::errors::DuplicatorError;

/// Represents ways to locate an element in the host document.
///
/// The host is probed structurally, so every selector eventually renders to
/// a CSS selector string that the page evaluates with `querySelector`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    /// Raw CSS, passed through untouched
    Css(String),
    /// Select by class name
    ClassName(String),
    /// Select by attribute presence, or by exact value when one is given
    Attribute { name: String, value: Option<String> },
    /// Select by multiple attribute values, all of which must match
    Attributes(BTreeMap<String, String>),
    /// Ordered candidates; the first one present in the document wins
    AnyOf(Vec<Selector>),
    /// Descendant chain, outermost first
    Chain(Vec<Selector>),
    /// Represents an invalid selector string, with a reason.
    Invalid(String),
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_css() {
            Ok(css) => write!(f, "{css}"),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        let s = s.trim();

        // Alternatives bind loosest, then descendant chains
        let alternatives: Vec<&str> = s.split("||").map(|p| p.trim()).collect();
        if alternatives.len() > 1 {
            return Selector::AnyOf(alternatives.into_iter().map(Selector::from).collect());
        }

        let parts: Vec<&str> = s.split(">>").map(|p| p.trim()).collect();
        if parts.len() > 1 {
            return Selector::Chain(parts.into_iter().map(Selector::from).collect());
        }

        match s {
            "" => Selector::Invalid("Empty selector".to_string()),
            _ if s.to_lowercase().starts_with("classname:") => {
                let name = s["classname:".len()..].trim();
                if name.is_empty() {
                    Selector::Invalid("classname: requires a class".to_string())
                } else {
                    Selector::ClassName(name.to_string())
                }
            }
            _ if s.to_lowercase().starts_with("attr:") => {
                let body = s["attr:".len()..].trim();
                match body.split_once('=') {
                    Some((name, value)) if !name.trim().is_empty() => Selector::Attribute {
                        name: name.trim().to_string(),
                        value: Some(value.trim().trim_matches('"').to_string()),
                    },
                    Some(_) => Selector::Invalid(format!("Missing attribute name in '{s}'")),
                    None if body.is_empty() => {
                        Selector::Invalid("attr: requires an attribute name".to_string())
                    }
                    None => Selector::Attribute {
                        name: body.to_string(),
                        value: None,
                    },
                }
            }
            _ if s.to_lowercase().starts_with("css:") => Selector::Css(s[4..].trim().to_string()),
            _ => Selector::Css(s.to_string()),
        }
    }
}

impl From<String> for Selector {
    fn from(s: String) -> Self {
        Selector::from(s.as_str())
    }
}

impl From<&String> for Selector {
    fn from(s: &String) -> Self {
        Selector::from(s.as_str())
    }
}

impl Selector {
    /// Build an ordered candidate list from marker strings.
    pub fn any_of<I, S>(candidates: I) -> Selector
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Selector::AnyOf(
            candidates
                .into_iter()
                .map(|c| Selector::from(c.as_ref()))
                .collect(),
        )
    }

    /// Render to a CSS selector string usable with `querySelector`.
    pub fn to_css(&self) -> Result<String, DuplicatorError> {
        match self {
            Selector::Css(css) => Ok(css.clone()),
            Selector::ClassName(name) => Ok(format!(".{}", css_identifier(name))),
            Selector::Attribute { name, value: None } => Ok(format!("[{name}]")),
            Selector::Attribute {
                name,
                value: Some(value),
            } => Ok(format!("[{name}=\"{}\"]", css_string(value))),
            Selector::Attributes(map) => {
                if map.is_empty() {
                    return Err(DuplicatorError::InvalidSelector(
                        "empty attribute set".to_string(),
                    ));
                }
                Ok(map
                    .iter()
                    .map(|(k, v)| format!("[{k}=\"{}\"]", css_string(v)))
                    .collect())
            }
            Selector::AnyOf(items) => {
                if items.is_empty() {
                    return Err(DuplicatorError::InvalidSelector(
                        "empty candidate list".to_string(),
                    ));
                }
                let rendered = items
                    .iter()
                    .map(Selector::to_css)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rendered.join(", "))
            }
            Selector::Chain(parts) => {
                let mut rendered = Vec::with_capacity(parts.len());
                for part in parts {
                    if matches!(part, Selector::AnyOf(_)) {
                        return Err(DuplicatorError::InvalidSelector(format!(
                            "alternatives cannot be nested inside a chain: {part:?}"
                        )));
                    }
                    rendered.push(part.to_css()?);
                }
                Ok(rendered.join(" "))
            }
            Selector::Invalid(reason) => Err(DuplicatorError::InvalidSelector(reason.clone())),
        }
    }

    /// The ordered candidates this selector stands for. Non-alternative
    /// selectors are their own single candidate.
    pub fn candidates(&self) -> Vec<Selector> {
        match self {
            Selector::AnyOf(items) => items.clone(),
            other => vec![other.clone()],
        }
    }
}

/// Escape a value for use inside a double-quoted CSS string.
pub fn css_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '"' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            '\n' => out.push_str("\\a "),
            _ => out.push(ch),
        }
    }
    out
}

fn css_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, ch) in name.chars().enumerate() {
        let plain = ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || !ch.is_ascii();
        if i == 0 && ch.is_ascii_digit() {
            out.push_str(&format!("\\{:x} ", ch as u32));
        } else if plain {
            out.push(ch);
        } else {
            out.push('\\');
            out.push(ch);
        }
    }
    out
}
