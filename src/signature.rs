//! Request and response signatures.
//!
//! A signatures document maps request paths to schemas for the request
//! body, the response body and the query. Validation walks a JSON value
//! against a schema and produces a filtered copy: defaults applied, fields
//! the principal may not see removed, unknown fields dropped (or rejected
//! in strict mode).
//!
//! ```json
//! {
//!   "/api/user/create": {
//!     "role": "user",
//!     "request": {
//!       "type": "object",
//!       "fields": {
//!         "name":  { "type": "string", "required": true },
//!         "email": { "type": "string", "role": "admin", "drop": "response" }
//!       }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::http::route::Roles;

/// Deepest schema nesting accepted
pub const MAX_DEPTH: usize = 8;

/// Field name that admits fields the schema does not list
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Null,
    String,
    Number,
    Boolean,
    Date,
    Object,
    Array,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DropRule {
    All(bool),
    Tag(String),
    Tags(Vec<String>),
}

impl Default for DropRule {
    fn default() -> Self {
        DropRule::All(false)
    }
}

impl DropRule {
    fn applies(&self, tag: Tag) -> bool {
        match self {
            DropRule::All(all) => *all,
            DropRule::Tag(t) => t == tag.as_str(),
            DropRule::Tags(tags) => tags.iter().any(|t| t == tag.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignatureNode {
    #[serde(rename = "type")]
    pub kind: Option<NodeType>,
    pub fields: Option<BTreeMap<String, SignatureNode>>,
    pub of: Option<Box<SignatureNode>>,
    pub required: bool,
    pub role: Option<String>,
    pub drop: DropRule,
    pub default: Option<Value>,
}

impl SignatureNode {
    /// Declared type, inferred from `fields`/`of` when omitted.
    pub fn node_type(&self) -> NodeType {
        match self.kind {
            Some(kind) => kind,
            None if self.fields.is_some() => NodeType::Object,
            None if self.of.is_some() => NodeType::Array,
            None => NodeType::String,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Signature {
    /// Default role for fields without their own
    pub role: Option<String>,
    /// Overrides the document-wide strict setting
    pub strict: Option<bool>,
    pub request: Option<SignatureNode>,
    pub response: Option<SignatureNode>,
    pub query: Option<SignatureNode>,
}

impl Signature {
    pub fn node(&self, tag: Tag) -> Option<&SignatureNode> {
        match tag {
            Tag::Request => self.request.as_ref(),
            Tag::Response => self.response.as_ref(),
            Tag::Query => self.query.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Request,
    Response,
    Query,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Request => "request",
            Tag::Response => "response",
            Tag::Query => "query",
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value that does not match its schema. Rendered to the client as-is,
/// so it only names the field and tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {tag} field \"{field}\": {message}")]
pub struct ValidationError {
    pub tag: Tag,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Signatures {
    signatures: HashMap<String, Signature>,
    strict: bool,
}

impl Signatures {
    pub fn new(signatures: HashMap<String, Signature>, strict: bool) -> Self {
        Self { signatures, strict }
    }

    /// Loads a JSON (or YAML) signatures document.
    pub fn load(path: &Path, strict: bool) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::BadArgs(format!("cannot read signatures {}: {e}", path.display())))?;
        let signatures = if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            serde_yaml::from_str(&text).map_err(|e| Error::BadArgs(format!("bad signatures: {e}")))?
        } else {
            serde_json::from_str(&text).map_err(|e| Error::BadArgs(format!("bad signatures: {e}")))?
        };
        tracing::debug!(path = %path.display(), "Loaded signatures");
        Ok(Self::new(signatures, strict))
    }

    pub fn from_value(doc: Value, strict: bool) -> Result<Self> {
        let signatures =
            serde_json::from_value(doc).map_err(|e| Error::BadArgs(format!("bad signatures: {e}")))?;
        Ok(Self::new(signatures, strict))
    }

    pub fn get(&self, path: &str) -> Option<&Signature> {
        self.signatures.get(path)
    }

    /// Global strict setting
    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn is_strict(&self, signature: &Signature) -> bool {
        signature.strict.unwrap_or(self.strict)
    }

    /// Validates `value` against the `tag` schema of `signature`.
    ///
    /// `principal` is the caller's role and `route_role` the role fields
    /// inherit when neither they nor the signature name one. Returns the
    /// filtered value, or `None` when there is no schema for the tag.
    pub fn validate(
        &self,
        signature: &Signature,
        tag: Tag,
        value: &Value,
        roles: &Roles,
        principal: Option<&str>,
        route_role: Option<&str>,
    ) -> Result<Option<Value>, ValidationError> {
        let Some(node) = signature.node(tag) else {
            return Ok(None);
        };
        let validator = Validator {
            tag,
            strict: self.is_strict(signature),
            roles,
            principal,
        };
        let role = signature.role.as_deref().or(route_role);
        let value = if value.is_null() { None } else { Some(value) };
        Ok(Some(validator.check(node, value, "", role, 0)?.unwrap_or(Value::Null)))
    }
}

struct Validator<'a> {
    tag: Tag,
    strict: bool,
    roles: &'a Roles,
    principal: Option<&'a str>,
}

impl Validator<'_> {
    fn fail(&self, field: &str, message: impl Into<String>) -> ValidationError {
        ValidationError {
            tag: self.tag,
            field: if field.is_empty() { "body".to_string() } else { field.to_string() },
            message: message.into(),
        }
    }

    /// Checks one node. `None` means the field is left out of the output.
    fn check(
        &self,
        node: &SignatureNode,
        value: Option<&Value>,
        name: &str,
        role: Option<&str>,
        depth: usize,
    ) -> Result<Option<Value>, ValidationError> {
        if depth > MAX_DEPTH {
            return Err(self.fail(name, "nesting too deep"));
        }
        if node.drop.applies(self.tag) {
            return Ok(None);
        }
        let kind = node.node_type();
        let value = match value {
            Some(Value::Null) | None if kind != NodeType::Null => {
                if let Some(default) = &node.default {
                    return Ok(Some(default.clone()));
                }
                if node.required {
                    return Err(self.fail(name, "missing required value"));
                }
                return Ok(None);
            }
            Some(value) => value,
            None => return Ok(Some(Value::Null)),
        };

        match kind {
            NodeType::String => Ok(Some(value.clone())),
            NodeType::Null => match value {
                Value::Null => Ok(Some(Value::Null)),
                Value::String(s) if s.is_empty() => Ok(Some(Value::Null)),
                _ => Err(self.fail(name, "expected null")),
            },
            NodeType::Number => match value {
                Value::Number(_) => Ok(Some(value.clone())),
                Value::String(s) if is_number(s) => Ok(Some(number_value(s))),
                _ => Err(self.fail(name, "expected a number")),
            },
            NodeType::Boolean => match value {
                Value::Bool(_) => Ok(Some(value.clone())),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Some(Value::Bool(true))),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Some(Value::Bool(false))),
                _ => Err(self.fail(name, "expected a boolean")),
            },
            NodeType::Date => match value {
                Value::String(s) if is_date(s) => Ok(Some(value.clone())),
                _ => Err(self.fail(name, "expected an ISO-8601 date")),
            },
            NodeType::Object => {
                let Value::Object(map) = value else {
                    return Err(self.fail(name, "expected an object"));
                };
                self.check_object(node, map, name, role, depth).map(Some)
            }
            NodeType::Array => {
                let Value::Array(items) = value else {
                    return Err(self.fail(name, "expected an array"));
                };
                let Some(of) = node.of.as_deref() else {
                    return Ok(Some(value.clone()));
                };
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let item_name = format!("{name}[{i}]");
                    if let Some(v) = self.check(of, Some(item), &item_name, role, depth + 1)? {
                        out.push(v);
                    }
                }
                Ok(Some(Value::Array(out)))
            }
        }
    }

    fn check_object(
        &self,
        node: &SignatureNode,
        map: &Map<String, Value>,
        name: &str,
        role: Option<&str>,
        depth: usize,
    ) -> Result<Value, ValidationError> {
        let Some(fields) = &node.fields else {
            return Ok(Value::Object(map.clone()));
        };
        let wildcard = fields.contains_key(WILDCARD);
        let mut out = Map::new();

        for (field, child) in fields.iter().filter(|(f, _)| f.as_str() != WILDCARD) {
            let child_role = child.role.as_deref().or(role);
            // Hidden fields are dropped, never reported
            if !child_role.is_none_or(|r| self.roles.satisfies(self.principal, r)) {
                continue;
            }
            let child_name = join(name, field);
            if let Some(v) = self.check(child, map.get(field), &child_name, child_role, depth + 1)? {
                out.insert(field.clone(), v);
            }
        }

        for (field, value) in map {
            if fields.contains_key(field) {
                continue;
            }
            if wildcard {
                out.insert(field.clone(), value.clone());
            } else if self.strict {
                return Err(self.fail(&join(name, field), "unexpected field"));
            }
        }
        Ok(Value::Object(out))
    }
}

fn join(parent: &str, field: &str) -> String {
    if parent.is_empty() {
        field.to_string()
    } else {
        format!("{parent}.{field}")
    }
}

/// Lexical floating-point number test: sign, digits, fraction, exponent.
pub fn is_number(s: &str) -> bool {
    let s = s.trim();
    let body = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(i) => (&body[..i], Some(&body[i + 1..])),
        None => (body, None),
    };
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let digits = |p: &str| p.bytes().all(|c| c.is_ascii_digit());
    if (int.is_empty() && frac.is_empty()) || !digits(int) || !digits(frac) {
        return false;
    }
    match exponent {
        Some(e) => {
            let e = e.strip_prefix(['-', '+']).unwrap_or(e);
            !e.is_empty() && digits(e)
        }
        None => true,
    }
}

fn number_value(s: &str) -> Value {
    let s = s.trim();
    if let Ok(n) = s.parse::<i64>() {
        return Value::from(n);
    }
    s.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(s.to_string()))
}

/// ISO-8601 date or date-time.
pub fn is_date(s: &str) -> bool {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}
