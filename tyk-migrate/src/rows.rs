//! Target row mapping and upsert statements.

use serde::Serialize;

use crate::keys::Category;
use crate::records::SourceRecord;

pub const DEFAULT_ORG_ID: &str = "default";
pub const DEFAULT_API_NAME: &str = "Unknown API";
pub const DEFAULT_PERMISSIONS: &str = "{}";

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    Text(String),
    /// Encoded JSON, bound as text and cast on the server.
    Json(String),
}

impl ColumnValue {
    pub fn as_str(&self) -> &str {
        match self {
            ColumnValue::Text(value) | ColumnValue::Json(value) => value,
        }
    }
}

/// Target column description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub json: bool,
}

const fn text(name: &'static str) -> Column {
    Column { name, json: false }
}

const fn json(name: &'static str) -> Column {
    Column { name, json: true }
}

const API_DEFINITION_COLUMNS: &[Column] = &[
    text("api_id"),
    text("org_id"),
    text("name"),
    text("listen_path"),
    text("target_url"),
    json("definition"),
];
const CERTIFICATE_COLUMNS: &[Column] = &[
    text("cert_id"),
    text("org_id"),
    text("certificate"),
    text("private_key"),
    text("fingerprint"),
];
const PORTAL_USER_COLUMNS: &[Column] = &[
    text("user_id"),
    text("org_id"),
    text("email"),
    text("username"),
    text("password_hash"),
    json("user_data"),
];
const ADMIN_KEY_COLUMNS: &[Column] = &[
    text("key_id"),
    text("org_id"),
    text("key_hash"),
    json("permissions"),
];

const API_DEFINITION_UPDATES: &[&str] = &["definition"];
const CERTIFICATE_UPDATES: &[&str] = &["certificate"];
const PORTAL_USER_UPDATES: &[&str] = &["user_data"];
const ADMIN_KEY_UPDATES: &[&str] = &["permissions"];

fn columns_for(category: Category) -> &'static [Column] {
    match category {
        Category::ApiDefinitions => API_DEFINITION_COLUMNS,
        Category::Certificates => CERTIFICATE_COLUMNS,
        Category::PortalUsers => PORTAL_USER_COLUMNS,
        Category::AdminKeys => ADMIN_KEY_COLUMNS,
    }
}

/// Parameterized insert-or-update for one category's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertStatement {
    pub category: Category,
    pub table: &'static str,
    pub columns: &'static [Column],
    pub conflict_column: &'static str,
    /// Payload columns overwritten on conflict. Identity and org are not.
    pub update_columns: &'static [&'static str],
    pub sql: String,
}

impl UpsertStatement {
    pub fn for_category(category: Category) -> Self {
        let columns = columns_for(category);
        let update_columns = match category {
            Category::ApiDefinitions => API_DEFINITION_UPDATES,
            Category::Certificates => CERTIFICATE_UPDATES,
            Category::PortalUsers => PORTAL_USER_UPDATES,
            Category::AdminKeys => ADMIN_KEY_UPDATES,
        };
        let table = category.table();
        let conflict_column = category.identity_column();
        let sql = render_sql(table, columns, conflict_column, update_columns);

        Self {
            category,
            table,
            columns,
            conflict_column,
            update_columns,
            sql,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

fn render_sql(
    table: &str,
    columns: &[Column],
    conflict_column: &str,
    update_columns: &[&str],
) -> String {
    let names: Vec<&str> = columns.iter().map(|column| column.name).collect();
    let placeholders: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            if column.json {
                format!("${}::jsonb", index + 1)
            } else {
                format!("${}", index + 1)
            }
        })
        .collect();
    let mut assignments: Vec<String> = update_columns
        .iter()
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect();
    assignments.push("updated_at = NOW()".to_string());

    format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({conflict_column}) DO UPDATE SET {}",
        names.join(", "),
        placeholders.join(", "),
        assignments.join(", ")
    )
}

/// A column that was missing in the source and filled with its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefaultedField {
    pub column: &'static str,
    pub default: &'static str,
}

/// Statement parameters for one record, in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRow {
    pub category: Category,
    pub identity: String,
    pub values: Vec<ColumnValue>,
    pub defaulted: Vec<DefaultedField>,
}

impl TargetRow {
    /// Look up a value by column name.
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        let index = columns_for(self.category).iter().position(|c| c.name == column)?;
        self.values.get(index)
    }
}

#[derive(Default)]
struct Defaults {
    applied: Vec<DefaultedField>,
}

impl Defaults {
    fn text(&mut self, column: &'static str, value: &Option<String>, default: &'static str) -> ColumnValue {
        match value {
            Some(value) => ColumnValue::Text(value.clone()),
            None => {
                self.applied.push(DefaultedField { column, default });
                ColumnValue::Text(default.to_string())
            }
        }
    }
}

/// Map a decoded record to row parameters, substituting defaults for missing fields.
pub fn map_record(record: &SourceRecord, key: &str) -> TargetRow {
    let identity = record.resolve_identity(key);
    let mut defaults = Defaults::default();

    let values = match record {
        SourceRecord::ApiDefinition(api) => vec![
            ColumnValue::Text(identity.clone()),
            defaults.text("org_id", &api.org_id, DEFAULT_ORG_ID),
            defaults.text("name", &api.name, DEFAULT_API_NAME),
            defaults.text("listen_path", &api.listen_path, ""),
            defaults.text("target_url", &api.target_url, ""),
            ColumnValue::Json(api.raw.clone()),
        ],
        SourceRecord::Certificate(cert) => vec![
            ColumnValue::Text(identity.clone()),
            defaults.text("org_id", &cert.org_id, DEFAULT_ORG_ID),
            defaults.text("certificate", &cert.certificate, ""),
            defaults.text("private_key", &cert.private_key, ""),
            defaults.text("fingerprint", &cert.fingerprint, ""),
        ],
        SourceRecord::PortalUser(user) => vec![
            ColumnValue::Text(identity.clone()),
            defaults.text("org_id", &user.org_id, DEFAULT_ORG_ID),
            defaults.text("email", &user.email, ""),
            defaults.text("username", &user.username, ""),
            defaults.text("password_hash", &user.password_hash, ""),
            ColumnValue::Json(user.raw.clone()),
        ],
        SourceRecord::AdminKey(admin) => {
            let permissions = match &admin.permissions {
                Some(value) => value.to_string(),
                None => {
                    defaults.applied.push(DefaultedField {
                        column: "permissions",
                        default: DEFAULT_PERMISSIONS,
                    });
                    DEFAULT_PERMISSIONS.to_string()
                }
            };
            vec![
                ColumnValue::Text(identity.clone()),
                defaults.text("org_id", &admin.org_id, DEFAULT_ORG_ID),
                defaults.text("key_hash", &admin.hash, ""),
                ColumnValue::Json(permissions),
            ]
        }
    };

    TargetRow {
        category: record.category(),
        identity,
        values,
        defaulted: defaults.applied,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::records::RawValue;

    fn decode(category: Category, raw: &str) -> SourceRecord {
        SourceRecord::decode(category, RawValue::Document(raw.to_string())).unwrap()
    }

    fn text_value(row: &TargetRow, column: &str) -> String {
        row.get(column).map(|v| v.as_str().to_string()).unwrap_or_default()
    }

    #[test]
    fn api_definition_statement_sql() {
        let statement = UpsertStatement::for_category(Category::ApiDefinitions);
        assert_eq!(
            statement.sql,
            "INSERT INTO tyk_api_definitions (api_id, org_id, name, listen_path, target_url, definition) \
             VALUES ($1, $2, $3, $4, $5, $6::jsonb) \
             ON CONFLICT (api_id) DO UPDATE SET definition = EXCLUDED.definition, updated_at = NOW()"
        );
    }

    #[test]
    fn certificate_statement_updates_only_certificate() {
        let statement = UpsertStatement::for_category(Category::Certificates);
        assert_eq!(statement.update_columns, &["certificate"]);
        assert!(statement.sql.ends_with(
            "ON CONFLICT (cert_id) DO UPDATE SET certificate = EXCLUDED.certificate, updated_at = NOW()"
        ));
        assert!(!statement.sql.contains("jsonb"));
    }

    #[test]
    fn every_statement_has_identity_first() {
        for category in Category::ALL {
            let statement = UpsertStatement::for_category(category);
            assert_eq!(statement.column_index(category.identity_column()), Some(0));
            assert!(!statement.update_columns.contains(&"org_id"));
            assert!(!statement.update_columns.contains(&statement.conflict_column));
        }
    }

    #[test]
    fn maps_orders_api_example() {
        let raw = r#"{"org_id":"acme","name":"Orders API","proxy":{"listen_path":"/orders","target_url":"http://orders.local"}}"#;
        let row = map_record(&decode(Category::ApiDefinitions, raw), "apidef-42");

        assert_eq!(row.identity, "42");
        assert_eq!(text_value(&row, "api_id"), "42");
        assert_eq!(text_value(&row, "org_id"), "acme");
        assert_eq!(text_value(&row, "name"), "Orders API");
        assert_eq!(text_value(&row, "listen_path"), "/orders");
        assert_eq!(text_value(&row, "target_url"), "http://orders.local");
        assert_eq!(row.get("definition"), Some(&ColumnValue::Json(raw.to_string())));
        assert!(row.defaulted.is_empty());
    }

    #[test]
    fn api_definition_defaults_are_flagged() {
        let row = map_record(&decode(Category::ApiDefinitions, "{}"), "apidef-1");
        assert_eq!(text_value(&row, "org_id"), DEFAULT_ORG_ID);
        assert_eq!(text_value(&row, "name"), DEFAULT_API_NAME);
        assert_eq!(text_value(&row, "listen_path"), "");
        let columns: Vec<&str> = row.defaulted.iter().map(|d| d.column).collect();
        assert_eq!(columns, ["org_id", "name", "listen_path", "target_url"]);
    }

    #[test]
    fn certificate_without_org_uses_default() {
        let fields = BTreeMap::from([
            ("certificate".to_string(), "PEM...".to_string()),
            ("private_key".to_string(), "KEY...".to_string()),
            ("fingerprint".to_string(), "F1".to_string()),
        ]);
        let record = SourceRecord::decode(Category::Certificates, RawValue::FieldMap(fields)).unwrap();
        let row = map_record(&record, "cert-abc");

        assert_eq!(row.identity, "abc");
        assert_eq!(text_value(&row, "org_id"), "default");
        assert_eq!(text_value(&row, "certificate"), "PEM...");
        assert_eq!(text_value(&row, "fingerprint"), "F1");
        assert_eq!(
            row.defaulted,
            vec![DefaultedField {
                column: "org_id",
                default: "default"
            }]
        );
    }

    #[test]
    fn portal_user_keeps_raw_document() {
        let raw = r#"{"id":"u1","email":"dev@example.com","username":"dev","extra":{"a":1}}"#;
        let row = map_record(&decode(Category::PortalUsers, raw), "user-ignored");
        assert_eq!(row.identity, "u1");
        assert_eq!(text_value(&row, "email"), "dev@example.com");
        assert_eq!(text_value(&row, "password_hash"), "");
        assert_eq!(text_value(&row, "user_data"), raw);
    }

    #[test]
    fn admin_key_encodes_permissions() {
        let raw = r#"{"key":"k1","hash":"abc","permissions":{"apis":"write"}}"#;
        let row = map_record(&decode(Category::AdminKeys, raw), "admin-key-other");
        assert_eq!(row.identity, "k1");
        assert_eq!(text_value(&row, "key_hash"), "abc");
        assert_eq!(row.get("permissions"), Some(&ColumnValue::Json(r#"{"apis":"write"}"#.to_string())));
    }

    #[test]
    fn admin_key_without_permissions_defaults_to_empty_object() {
        let row = map_record(&decode(Category::AdminKeys, r#"{"org_id":"o"}"#), "admin-key-k2");
        assert_eq!(row.identity, "k2");
        assert_eq!(row.get("permissions"), Some(&ColumnValue::Json("{}".to_string())));
        assert!(row.defaulted.iter().any(|d| d.column == "permissions"));
    }

    #[test]
    fn row_values_match_statement_columns() {
        for (category, raw) in [
            (Category::ApiDefinitions, "{}"),
            (Category::PortalUsers, "{}"),
            (Category::AdminKeys, "{}"),
        ] {
            let row = map_record(&decode(category, raw), "x");
            assert_eq!(row.values.len(), UpsertStatement::for_category(category).columns.len());
        }
    }
}
