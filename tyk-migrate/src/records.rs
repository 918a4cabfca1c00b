//! Decoded source records.
//!
//! Source documents are loosely shaped, so every known field is optional and
//! decoding only fails when the payload is not an object at all. JSON documents
//! are kept verbatim next to the decoded fields.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::errors::DecodeError;
use crate::keys::Category;

/// Value as fetched from the source store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Document(String),
    FieldMap(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiDefinition {
    pub api_id: Option<String>,
    pub org_id: Option<String>,
    pub name: Option<String>,
    pub listen_path: Option<String>,
    pub target_url: Option<String>,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Certificate {
    pub org_id: Option<String>,
    pub certificate: Option<String>,
    pub private_key: Option<String>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortalUser {
    pub id: Option<String>,
    pub org_id: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub password_hash: Option<String>,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdminKey {
    pub key: Option<String>,
    pub org_id: Option<String>,
    pub hash: Option<String>,
    pub permissions: Option<Value>,
    pub raw: String,
}

/// A decoded record of any category.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    ApiDefinition(ApiDefinition),
    Certificate(Certificate),
    PortalUser(PortalUser),
    AdminKey(AdminKey),
}

impl SourceRecord {
    pub fn decode(category: Category, value: RawValue) -> Result<Self, DecodeError> {
        match (category, value) {
            (Category::Certificates, RawValue::FieldMap(fields)) => {
                Ok(SourceRecord::Certificate(decode_certificate(&fields)))
            }
            (Category::Certificates, RawValue::Document(_)) => {
                Err(DecodeError::WrongShape { expected: "field map" })
            }
            (_, RawValue::FieldMap(_)) => Err(DecodeError::WrongShape { expected: "JSON document" }),
            (Category::ApiDefinitions, RawValue::Document(raw)) => decode_api_definition(raw),
            (Category::PortalUsers, RawValue::Document(raw)) => decode_portal_user(raw),
            (Category::AdminKeys, RawValue::Document(raw)) => decode_admin_key(raw),
        }
    }

    pub fn category(&self) -> Category {
        match self {
            SourceRecord::ApiDefinition(_) => Category::ApiDefinitions,
            SourceRecord::Certificate(_) => Category::Certificates,
            SourceRecord::PortalUser(_) => Category::PortalUsers,
            SourceRecord::AdminKey(_) => Category::AdminKeys,
        }
    }

    /// Identity carried inside the document, if any.
    pub fn embedded_identity(&self) -> Option<&str> {
        match self {
            SourceRecord::ApiDefinition(api) => api.api_id.as_deref(),
            SourceRecord::Certificate(_) => None,
            SourceRecord::PortalUser(user) => user.id.as_deref(),
            SourceRecord::AdminKey(key) => key.key.as_deref(),
        }
    }

    /// Embedded identity, falling back to the key with its prefix stripped.
    pub fn resolve_identity(&self, key: &str) -> String {
        match self.embedded_identity() {
            Some(identity) => identity.to_string(),
            None => self.category().identity_from_key(key),
        }
    }
}

fn decode_api_definition(raw: String) -> Result<SourceRecord, DecodeError> {
    let object = parse_object(&raw)?;
    let proxy = object.get("proxy").and_then(Value::as_object);
    Ok(SourceRecord::ApiDefinition(ApiDefinition {
        api_id: identity_field(&object, "api_id"),
        org_id: text_field(&object, "org_id"),
        name: text_field(&object, "name"),
        listen_path: proxy.and_then(|p| text_field(p, "listen_path")),
        target_url: proxy.and_then(|p| text_field(p, "target_url")),
        raw,
    }))
}

fn decode_portal_user(raw: String) -> Result<SourceRecord, DecodeError> {
    let object = parse_object(&raw)?;
    Ok(SourceRecord::PortalUser(PortalUser {
        id: identity_field(&object, "id"),
        org_id: text_field(&object, "org_id"),
        email: text_field(&object, "email"),
        username: text_field(&object, "username"),
        password_hash: text_field(&object, "password_hash"),
        raw,
    }))
}

fn decode_admin_key(raw: String) -> Result<SourceRecord, DecodeError> {
    let object = parse_object(&raw)?;
    Ok(SourceRecord::AdminKey(AdminKey {
        key: identity_field(&object, "key"),
        org_id: text_field(&object, "org_id"),
        hash: text_field(&object, "hash"),
        permissions: object.get("permissions").filter(|v| !v.is_null()).cloned(),
        raw,
    }))
}

fn decode_certificate(fields: &BTreeMap<String, String>) -> Certificate {
    Certificate {
        org_id: fields.get("org_id").cloned(),
        certificate: fields.get("certificate").cloned(),
        private_key: fields.get("private_key").cloned(),
        fingerprint: fields.get("fingerprint").cloned(),
    }
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(object) => Ok(object),
        other => Err(DecodeError::NotAnObject {
            found: json_type_name(&other),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Scalar field rendered as text. Nested values and nulls count as missing.
fn text_field(object: &Map<String, Value>, name: &str) -> Option<String> {
    match object.get(name)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Identity fields must be a non-empty string or a number to count.
fn identity_field(object: &Map<String, Value>, name: &str) -> Option<String> {
    match object.get(name)? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(raw: &str) -> RawValue {
        RawValue::Document(raw.to_string())
    }

    #[test]
    fn decodes_api_definition_with_proxy() {
        let raw = r#"{"org_id":"acme","name":"Orders API","proxy":{"listen_path":"/orders","target_url":"http://orders.local"}}"#;
        let record = SourceRecord::decode(Category::ApiDefinitions, document(raw)).unwrap();
        let SourceRecord::ApiDefinition(api) = record else {
            panic!("expected api definition");
        };
        assert_eq!(api.api_id, None);
        assert_eq!(api.org_id.as_deref(), Some("acme"));
        assert_eq!(api.name.as_deref(), Some("Orders API"));
        assert_eq!(api.listen_path.as_deref(), Some("/orders"));
        assert_eq!(api.target_url.as_deref(), Some("http://orders.local"));
        assert_eq!(api.raw, raw);
    }

    #[test]
    fn proxy_that_is_not_an_object_is_ignored() {
        let record =
            SourceRecord::decode(Category::ApiDefinitions, document(r#"{"proxy":"nope"}"#)).unwrap();
        let SourceRecord::ApiDefinition(api) = record else {
            panic!("expected api definition");
        };
        assert_eq!(api.listen_path, None);
        assert_eq!(api.target_url, None);
    }

    #[test]
    fn rejects_invalid_json() {
        let err = SourceRecord::decode(Category::PortalUsers, document("{not json")).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn rejects_non_object_documents() {
        let err = SourceRecord::decode(Category::AdminKeys, document("[1,2]")).unwrap_err();
        assert!(matches!(err, DecodeError::NotAnObject { found: "array" }));
    }

    #[test]
    fn rejects_shape_mismatch() {
        let err = SourceRecord::decode(Category::Certificates, document("{}")).unwrap_err();
        assert!(matches!(err, DecodeError::WrongShape { .. }));

        let err = SourceRecord::decode(Category::ApiDefinitions, RawValue::FieldMap(BTreeMap::new()))
            .unwrap_err();
        assert!(matches!(err, DecodeError::WrongShape { .. }));
    }

    #[test]
    fn embedded_identity_wins_over_key() {
        let record =
            SourceRecord::decode(Category::PortalUsers, document(r#"{"id":"u-77","email":"a@b"}"#)).unwrap();
        assert_eq!(record.resolve_identity("user-something-else"), "u-77");
    }

    #[test]
    fn identity_falls_back_to_key() {
        let record = SourceRecord::decode(Category::AdminKeys, document(r#"{"hash":"h"}"#)).unwrap();
        assert_eq!(record.resolve_identity("admin-key-k1"), "k1");
    }

    #[test]
    fn empty_identity_field_counts_as_missing() {
        let record = SourceRecord::decode(Category::ApiDefinitions, document(r#"{"api_id":""}"#)).unwrap();
        assert_eq!(record.embedded_identity(), None);
        assert_eq!(record.resolve_identity("apidef-7"), "7");
    }

    #[test]
    fn numeric_identity_is_rendered_as_text() {
        let record = SourceRecord::decode(Category::ApiDefinitions, document(r#"{"api_id":42}"#)).unwrap();
        assert_eq!(record.embedded_identity(), Some("42"));
    }

    #[test]
    fn certificates_never_embed_identity() {
        let fields = BTreeMap::from([("fingerprint".to_string(), "F1".to_string())]);
        let record = SourceRecord::decode(Category::Certificates, RawValue::FieldMap(fields)).unwrap();
        assert_eq!(record.embedded_identity(), None);
        assert_eq!(record.resolve_identity("cert-abc"), "abc");
    }

    #[test]
    fn null_permissions_count_as_missing() {
        let record =
            SourceRecord::decode(Category::AdminKeys, document(r#"{"permissions":null}"#)).unwrap();
        let SourceRecord::AdminKey(key) = record else {
            panic!("expected admin key");
        };
        assert_eq!(key.permissions, None);
    }
}
