//! JSON export adapter
//!
//! Reads provider exports laid out as `<root>/<scope>/<kind>.json`, each a
//! JSON array of objects. One object = one entity.

use async_trait::async_trait;
use serde_json::{Map, Value};
use shared::{ChildItem, ConversionError, Page, Record, ResourceAdapter, Scope, TransportError};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_KEY_FIELD: &str = "id";
pub const DEFAULT_CHILD_FIELD: &str = "labels";
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct JsonFileAdapter {
    root: PathBuf,
    kind: String,
    key_field: String,
    /// Object-valued fields turned into child collections
    child_fields: Vec<String>,
    page_size: usize,
}

impl JsonFileAdapter {
    pub fn new(root: impl Into<PathBuf>, kind: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            kind: kind.into(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
            child_fields: vec![DEFAULT_CHILD_FIELD.to_string()],
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_key_field(mut self, key_field: impl Into<String>) -> Self {
        self.key_field = key_field.into();
        self
    }

    pub fn with_child_fields(mut self, child_fields: Vec<String>) -> Self {
        self.child_fields = child_fields;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn export_path(&self, scope: &Scope) -> PathBuf {
        self.root
            .join(scope.as_str())
            .join(format!("{}.json", self.kind))
    }
}

fn io_error(path: &Path, err: io::Error) -> TransportError {
    let message = format!("{}: {err}", path.display());
    match err.kind() {
        io::ErrorKind::NotFound => TransportError::Remote {
            status: 404,
            message,
        },
        io::ErrorKind::PermissionDenied => TransportError::Auth(message),
        _ => TransportError::Network(message),
    }
}

#[async_trait]
impl ResourceAdapter for JsonFileAdapter {
    type Raw = Value;
    /// The whole export, loaded once per pass
    type Session = Vec<Value>;

    fn kind(&self) -> &str {
        &self.kind
    }

    async fn connect(&self, scope: &Scope) -> Result<Vec<Value>, TransportError> {
        let path = self.export_path(scope);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Remote {
            status: 502,
            message: format!("{}: invalid export: {e}", path.display()),
        })
    }

    async fn fetch(
        &self,
        session: &Vec<Value>,
        _scope: &Scope,
        page_token: Option<&str>,
    ) -> Result<Page<Value>, TransportError> {
        let offset = match page_token {
            None => 0,
            Some(token) => token.parse::<usize>().map_err(|_| TransportError::Remote {
                status: 400,
                message: format!("invalid page token: {token}"),
            })?,
        };
        let start = offset.min(session.len());
        let end = start.saturating_add(self.page_size).min(session.len());
        Ok(Page {
            items: session[start..end].to_vec(),
            next_token: (end < session.len()).then(|| end.to_string()),
        })
    }

    fn convert(
        &self,
        raw: Value,
        _scope: &Scope,
        collected_at: i64,
    ) -> Result<Record, ConversionError> {
        let Value::Object(mut object) = raw else {
            return Err(ConversionError::new(raw.to_string(), "expected a JSON object"));
        };

        let key = match object.remove(&self.key_field) {
            Some(Value::String(key)) if !key.is_empty() => key,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ConversionError::new(
                    Value::Object(object).to_string(),
                    format!("missing or empty key field `{}`", self.key_field),
                ));
            }
        };

        let mut children: BTreeMap<String, Vec<ChildItem>> = BTreeMap::new();
        for field in &self.child_fields {
            match object.remove(field) {
                None | Some(Value::Null) => {}
                Some(Value::Object(items)) => {
                    children.insert(field.clone(), child_items(items));
                }
                Some(other) => {
                    return Err(ConversionError::new(
                        &key,
                        format!("child field `{field}` must be an object, got {other}"),
                    ));
                }
            }
        }

        Ok(Record {
            key,
            fields: object.into_iter().collect(),
            children,
            collected_at,
        })
    }
}

fn child_items(items: Map<String, Value>) -> Vec<ChildItem> {
    items
        .into_iter()
        .map(|(key, value)| ChildItem { key, value })
        .collect()
}

/// Scopes under `root` and the resource kinds exported for each
///
/// Every subdirectory is a scope; every `*.json` file in it is a kind.
pub fn discover_sources(root: &Path) -> io::Result<BTreeMap<Scope, Vec<String>>> {
    let mut sources = BTreeMap::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(scope) = entry.file_name().to_str().map(Scope::new) else {
            continue;
        };

        let mut kinds = Vec::new();
        for file in std::fs::read_dir(entry.path())? {
            let path = file?.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(kind) = path.file_stem().and_then(|s| s.to_str())
            {
                kinds.push(kind.to_string());
            }
        }
        kinds.sort();
        if !kinds.is_empty() {
            sources.insert(scope, kinds);
        }
    }
    Ok(sources)
}
