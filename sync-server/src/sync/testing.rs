//! Scriptable in-memory adapter for engine and orchestrator tests

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use shared::{ConversionError, Page, Record, ResourceAdapter, Scope, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub(crate) struct MockState {
    pub items: Vec<Value>,
    pub page_size: usize,
    /// Errors returned by the next fetch calls, in order
    pub fetch_failures: VecDeque<TransportError>,
    /// Cancel this token when the given fetch call (1-based) returns
    pub cancel_on_fetch: Option<(usize, CancellationToken)>,
    /// Every fetch stays pending forever
    pub hang_fetch: bool,
    pub connects: usize,
    pub disconnects: usize,
    pub fetches: usize,
}

/// Items are JSON objects: `id` is the key, `labels` (object) becomes a
/// child collection, everything else is a core field.
#[derive(Clone)]
pub(crate) struct MockAdapter {
    kind: &'static str,
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(MockState {
                page_size: 100,
                ..MockState::default()
            })),
        }
    }

    pub fn set_items(&self, items: Vec<Value>) {
        self.state.lock().unwrap().items = items;
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().unwrap().page_size = page_size;
    }

    pub fn fail_next_fetch(&self, err: TransportError) {
        self.state.lock().unwrap().fetch_failures.push_back(err);
    }

    pub fn cancel_on_fetch(&self, call: usize, token: CancellationToken) {
        self.state.lock().unwrap().cancel_on_fetch = Some((call, token));
    }

    pub fn hang_fetch(&self) {
        self.state.lock().unwrap().hang_fetch = true;
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&MockState) -> R) -> R {
        f(&self.state.lock().unwrap())
    }
}

/// `{"id": id, "name": name, "labels": {...}}`
pub(crate) fn item(id: &str, name: &str, labels: &[(&str, &str)]) -> Value {
    let labels: Map<String, Value> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect();
    json!({"id": id, "name": name, "labels": labels})
}

#[async_trait]
impl ResourceAdapter for MockAdapter {
    type Raw = Value;
    type Session = ();

    fn kind(&self) -> &str {
        self.kind
    }

    async fn connect(&self, _scope: &Scope) -> Result<(), TransportError> {
        self.state.lock().unwrap().connects += 1;
        Ok(())
    }

    async fn disconnect(&self, _session: ()) {
        self.state.lock().unwrap().disconnects += 1;
    }

    async fn fetch(
        &self,
        _session: &(),
        _scope: &Scope,
        page_token: Option<&str>,
    ) -> Result<Page<Value>, TransportError> {
        let hang = self.state.lock().unwrap().hang_fetch;
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        if let Some((call, token)) = &state.cancel_on_fetch
            && *call == state.fetches
        {
            token.cancel();
        }
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }

        let offset: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let end = (offset + state.page_size).min(state.items.len());
        let items = state.items[offset..end].to_vec();
        let next_token = (end < state.items.len()).then(|| end.to_string());
        Ok(Page { items, next_token })
    }

    fn convert(
        &self,
        raw: Value,
        _scope: &Scope,
        collected_at: i64,
    ) -> Result<Record, ConversionError> {
        let Value::Object(mut object) = raw else {
            return Err(ConversionError::new(raw.to_string(), "not an object"));
        };
        let Some(Value::String(id)) = object.remove("id") else {
            return Err(ConversionError::new(
                Value::Object(object).to_string(),
                "missing id",
            ));
        };

        let mut record = Record::new(id, collected_at);
        if let Some(Value::Object(labels)) = object.remove("labels") {
            for (key, value) in labels {
                record = record.with_child("labels", key, value);
            }
        }
        for (name, value) in object {
            record = record.with_field(name, value);
        }
        Ok(record)
    }
}
