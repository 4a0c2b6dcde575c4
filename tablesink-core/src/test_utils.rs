//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::Result;
use crate::error::Error;
use crate::message::{MonitorMessage, Record, Status, TransportMessage};
use crate::metadata::{MetadataLookup, Processor, Route};
use crate::status::StatusPublisher;
use crate::storage::{Identifier, Storage};

pub(crate) fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

#[derive(Default)]
struct StorageState {
    /// table -> columns
    tables: HashMap<String, Vec<String>>,
    /// (table, row) in insert order
    rows: Vec<(String, Vec<(String, Option<String>)>)>,
    create_calls: usize,
    fail_create: bool,
    /// fail the insert once this many rows are committed
    fail_insert_after: Option<usize>,
}

/// Storage that keeps tables and rows in memory, with failure injection.
#[derive(Default)]
pub(crate) struct InMemoryStorage {
    state: Mutex<StorageState>,
}

impl InMemoryStorage {
    pub(crate) fn rows(&self, table: &str) -> Vec<Vec<(String, Option<String>)>> {
        self.state
            .lock()
            .rows
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub(crate) fn total_rows(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub(crate) fn columns(&self, table: &str) -> Option<Vec<String>> {
        self.state.lock().tables.get(table).cloned()
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    pub(crate) fn fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    pub(crate) fn fail_insert_after(&self, committed: Option<usize>) {
        self.state.lock().fail_insert_after = committed;
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_table_if_not_exists(
        &self,
        table: &Identifier,
        columns: &[Identifier],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        if state.fail_create {
            return Err(Error::Storage("injected create failure".into()));
        }
        state
            .tables
            .entry(table.raw().to_string())
            .or_insert_with(|| columns.iter().map(|c| c.raw().to_string()).collect());
        Ok(())
    }

    async fn insert_row(&self, table: &Identifier, row: &[(Identifier, Option<String>)]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.tables.contains_key(table.raw()) {
            return Err(Error::Storage(format!("relation {table} does not exist")));
        }
        if state.fail_insert_after.is_some_and(|n| state.rows.len() >= n) {
            return Err(Error::Storage("injected insert failure".into()));
        }
        let row = row
            .iter()
            .map(|(c, v)| (c.raw().to_string(), v.clone()))
            .collect();
        state.rows.push((table.raw().to_string(), row));
        Ok(())
    }
}

/// Status publisher that records everything it is asked to publish.
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    published: Mutex<Vec<MonitorMessage>>,
    flushes: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingPublisher {
    pub(crate) fn published(&self) -> Vec<MonitorMessage> {
        self.published.lock().clone()
    }

    pub(crate) fn statuses_for(&self, route_id: &str) -> Vec<Status> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.route_id == route_id)
            .map(|m| m.status)
            .collect()
    }

    pub(crate) fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub(crate) fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatusPublisher for RecordingPublisher {
    async fn publish(&self, message: &MonitorMessage) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Status("injected publish failure".into()));
        }
        self.published.lock().push(message.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Status("injected flush failure".into()));
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Settlement {
    Ack,
    Nak(Duration),
}

/// Transport message that records how it was settled.
pub(crate) struct RecordingMessage {
    payload: Vec<u8>,
    settlements: Mutex<Vec<Settlement>>,
}

impl RecordingMessage {
    pub(crate) fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            settlements: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn settlements(&self) -> Vec<Settlement> {
        self.settlements.lock().clone()
    }
}

#[async_trait]
impl TransportMessage for RecordingMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<()> {
        self.settlements.lock().push(Settlement::Ack);
        Ok(())
    }

    async fn nak_with_delay(&self, delay: Duration) -> Result<()> {
        self.settlements.lock().push(Settlement::Nak(delay));
        Ok(())
    }
}

/// Metadata lookup over fixed maps, counting backend calls.
#[derive(Default)]
pub(crate) struct InMemoryLookup {
    routes: HashMap<String, Route>,
    processors: HashMap<String, Processor>,
    unreachable: AtomicBool,
    calls: AtomicUsize,
}

impl InMemoryLookup {
    pub(crate) fn with_route(mut self, route_id: &str, processor_id: &str) -> Self {
        self.routes.insert(
            route_id.to_string(),
            Route {
                id: route_id.to_string(),
                processor_id: processor_id.to_string(),
            },
        );
        self
    }

    pub(crate) fn with_processor(mut self, processor_id: &str, properties: Option<Value>) -> Self {
        self.processors.insert(
            processor_id.to_string(),
            Processor {
                id: processor_id.to_string(),
                properties,
            },
        );
        self
    }

    pub(crate) fn unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Lookup("injected lookup failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataLookup for InMemoryLookup {
    async fn find_route_by_id(&self, id: &str) -> Result<Route> {
        self.check_reachable()?;
        self.routes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("route {id}")))
    }

    async fn find_processor_by_id(&self, id: &str) -> Result<Processor> {
        self.check_reachable()?;
        self.processors
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("processor {id}")))
    }
}
