#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{Level, Subscriber, span};
use tracing_core::field::{Field, Visit};
use tracing_subscriber::registry;
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

/// One captured event or span, fields stringified by name.
#[derive(Debug, Clone)]
pub struct Captured {
    pub name: String,
    pub level: Level,
    pub fields: HashMap<String, String>,
}

impl Captured {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

#[derive(Default, Debug)]
pub struct CaptureStore {
    spans: Mutex<HashMap<span::Id, Captured>>,
    events: Mutex<Vec<Captured>>,
}

impl CaptureStore {
    pub fn events(&self) -> Vec<Captured> {
        self.events.lock().unwrap().clone()
    }

    pub fn span_named(&self, name: &str) -> Option<Captured> {
        self.spans.lock().unwrap().values().find(|s| s.name == name).cloned()
    }
}

struct MapVisitor<'a> {
    map: &'a mut HashMap<String, String>,
}

impl Visit for MapVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
        self.map.insert(field.name().to_string(), format!("{value:?}"));
    }
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_str(&mut self, field: &Field, value: &str) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
}

#[derive(Clone)]
pub struct CaptureLayer {
    store: Arc<CaptureStore>,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, _ctx: Context<'_, S>) {
        let meta = attrs.metadata();
        let mut fields = HashMap::new();
        attrs.record(&mut MapVisitor { map: &mut fields });
        let span = Captured { name: meta.name().to_string(), level: *meta.level(), fields };
        self.store.spans.lock().unwrap().insert(id.clone(), span);
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, _ctx: Context<'_, S>) {
        if let Some(span) = self.store.spans.lock().unwrap().get_mut(id) {
            values.record(&mut MapVisitor { map: &mut span.fields });
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut fields = HashMap::new();
        event.record(&mut MapVisitor { map: &mut fields });
        let captured = Captured { name: meta.name().to_string(), level: *meta.level(), fields };
        self.store.events.lock().unwrap().push(captured);
    }
}

/// Route this thread's spans and events into a fresh store until the guard drops.
pub fn install_capture() -> (Arc<CaptureStore>, tracing::subscriber::DefaultGuard) {
    use tracing_subscriber::prelude::*;
    let store = Arc::new(CaptureStore::default());
    let layer = CaptureLayer { store: store.clone() };
    let subscriber = registry::Registry::default().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);
    (store, guard)
}
