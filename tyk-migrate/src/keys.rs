//! Source key layout and per-category metadata.

use std::fmt;

use serde::Serialize;

/// How a category's value is stored in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// JSON document stored as a plain string value.
    String,
    /// Field map stored as a hash.
    Hash,
}

/// One of the four record kinds copied by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ApiDefinitions,
    Certificates,
    PortalUsers,
    AdminKeys,
}

impl Category {
    /// Run order. Categories are independent of each other.
    pub const ALL: [Category; 4] = [
        Category::ApiDefinitions,
        Category::Certificates,
        Category::PortalUsers,
        Category::AdminKeys,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Category::ApiDefinitions => "apidef-",
            Category::Certificates => "cert-",
            Category::PortalUsers => "user-",
            Category::AdminKeys => "admin-key-",
        }
    }

    /// Glob pattern matching every key of this category.
    pub fn scan_pattern(self) -> String {
        format!("{}*", self.prefix())
    }

    pub fn fetch_kind(self) -> FetchKind {
        match self {
            Category::Certificates => FetchKind::Hash,
            _ => FetchKind::String,
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Category::ApiDefinitions => "tyk_api_definitions",
            Category::Certificates => "tyk_certificates",
            Category::PortalUsers => "tyk_portal_developers",
            Category::AdminKeys => "tyk_admin_keys",
        }
    }

    pub fn identity_column(self) -> &'static str {
        match self {
            Category::ApiDefinitions => "api_id",
            Category::Certificates => "cert_id",
            Category::PortalUsers => "user_id",
            Category::AdminKeys => "key_id",
        }
    }

    /// Document field that carries the identity, when the category has one.
    pub fn identity_field(self) -> Option<&'static str> {
        match self {
            Category::ApiDefinitions => Some("api_id"),
            Category::Certificates => None,
            Category::PortalUsers => Some("id"),
            Category::AdminKeys => Some("key"),
        }
    }

    /// Human readable plural, used in progress output.
    pub fn label(self) -> &'static str {
        match self {
            Category::ApiDefinitions => "API definitions",
            Category::Certificates => "certificates",
            Category::PortalUsers => "portal users",
            Category::AdminKeys => "admin keys",
        }
    }

    /// Identity derived from a source key by stripping the category prefix.
    ///
    /// Keys that do not carry the prefix are returned unchanged.
    pub fn identity_from_key(self, key: &str) -> String {
        key.strip_prefix(self.prefix()).unwrap_or(key).to_string()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
