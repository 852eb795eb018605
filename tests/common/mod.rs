//! Shared test doubles: a scripted SQL connection, an in-memory store, a
//! recording writer and a fake coordinator. Everything the dump engine
//! talks to, minus the network.

// Each test binary uses a different subset of these helpers
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use quarry::conn::{Connection, ConnectionProvider, ResultSet};
use quarry::error::{QuarryError, Result};
use quarry::safepoint::Coordinator;
use quarry::storage::ExternalStorage;
use quarry::task::{ColumnInfo, TableMeta};
use quarry::writer::Writer;

/// Build a result set from column `(name, type)` pairs and rows of
/// optional text values.
pub fn rs(columns: &[(&str, &str)], rows: &[&[Option<String>]]) -> ResultSet {
    ResultSet {
        columns: columns
            .iter()
            .map(|(name, type_name)| ColumnInfo::new(name, type_name))
            .collect(),
        rows: rows.iter().map(|row| row.to_vec()).collect(),
    }
}

/// Shorthand for a row of non-NULL values
pub fn row(values: &[&str]) -> Vec<Option<String>> {
    values.iter().map(|v| Some(v.to_string())).collect()
}

struct Rule {
    prefix: String,
    result: ResultSet,
    /// Fail this many calls with a connection error before succeeding
    fail_times: usize,
}

/// Prefix-matched query script shared by every connection of a provider.
/// Statements with no matching rule succeed with an empty result, so
/// session setup and lock statements need no scripting.
#[derive(Default)]
pub struct MockScript {
    rules: Mutex<Vec<Rule>>,
    statements: Mutex<Vec<String>>,
    connections_opened: Mutex<usize>,
}

impl MockScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Respond to queries starting with `prefix`. Later registrations take
    /// precedence, so a test can override part of a shared script.
    pub fn on(&self, prefix: &str, result: ResultSet) -> &Self {
        self.on_failing(prefix, 0, result)
    }

    pub fn on_failing(&self, prefix: &str, fail_times: usize, result: ResultSet) -> &Self {
        self.rules.lock().unwrap().insert(
            0,
            Rule {
                prefix: prefix.to_string(),
                result,
                fail_times,
            },
        );
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn count_statements(&self, prefix: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }

    pub fn connections_opened(&self) -> usize {
        *self.connections_opened.lock().unwrap()
    }
}

pub struct MockConn {
    script: Arc<MockScript>,
}

impl MockConn {
    fn run(&self, sql: &str) -> Result<ResultSet> {
        self.script
            .statements
            .lock()
            .unwrap()
            .push(sql.to_string());
        let mut rules = self.script.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if sql.starts_with(&rule.prefix) {
                if rule.fail_times > 0 {
                    rule.fail_times -= 1;
                    return Err(QuarryError::Sql(format!(
                        "injected connection failure on {:?}",
                        rule.prefix
                    )));
                }
                return Ok(rule.result.clone());
            }
        }
        Ok(ResultSet::default())
    }
}

#[async_trait]
impl Connection for MockConn {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.run(sql).map(|_| 0)
    }

    async fn query(&mut self, sql: &str) -> Result<ResultSet> {
        self.run(sql)
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct MockProvider {
    pub script: Arc<MockScript>,
}

impl MockProvider {
    pub fn new(script: Arc<MockScript>) -> Arc<Self> {
        Arc::new(Self { script })
    }
}

#[async_trait]
impl ConnectionProvider for MockProvider {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        *self.script.connections_opened.lock().unwrap() += 1;
        Ok(Box::new(MockConn {
            script: self.script.clone(),
        }))
    }
}

/// In-memory object store
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn object(&self, name: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(name)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ExternalStorage for MemoryStorage {
    async fn write_object(&self, name: &str, data: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }
}

/// What the writer was asked to produce, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterEvent {
    Database(String),
    Table(String, String),
    View(String, String),
    Data {
        database: String,
        table: String,
        chunk_index: usize,
        total_chunks: usize,
        row_count: usize,
    },
}

#[derive(Default)]
pub struct RecordingWriter {
    events: Mutex<Vec<WriterEvent>>,
}

impl RecordingWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<WriterEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Writer for RecordingWriter {
    async fn write_database_meta(&self, database: &str, _create_sql: &str) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(WriterEvent::Database(database.to_string()));
        Ok(())
    }

    async fn write_table_meta(
        &self,
        database: &str,
        table: &str,
        _create_sql: &str,
    ) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(WriterEvent::Table(database.to_string(), table.to_string()));
        Ok(())
    }

    async fn write_view_meta(
        &self,
        database: &str,
        view: &str,
        _create_table_sql: &str,
        _create_view_sql: &str,
    ) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(WriterEvent::View(database.to_string(), view.to_string()));
        Ok(())
    }

    async fn write_table_data(
        &self,
        meta: &TableMeta,
        rows: &ResultSet,
        chunk_index: usize,
        total_chunks: usize,
    ) -> Result<()> {
        self.events.lock().unwrap().push(WriterEvent::Data {
            database: meta.database.clone(),
            table: meta.table.clone(),
            chunk_index,
            total_chunks,
            row_count: rows.rows.len(),
        });
        Ok(())
    }
}

/// Coordinator that records heartbeats and can fail the first N calls
#[derive(Default)]
pub struct FakeCoordinator {
    calls: Mutex<Vec<(String, u64, u64)>>,
    fail_first: Mutex<usize>,
}

impl FakeCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(fail_first: usize) -> Arc<Self> {
        let coordinator = Self::default();
        *coordinator.fail_first.lock().unwrap() = fail_first;
        Arc::new(coordinator)
    }

    pub fn calls(&self) -> Vec<(String, u64, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn update_service_safe_point(
        &self,
        service_id: &str,
        ttl_secs: u64,
        safe_point: u64,
    ) -> Result<()> {
        {
            let mut fail = self.fail_first.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(QuarryError::Internal("injected coordinator failure".into()));
            }
        }
        self.calls
            .lock()
            .unwrap()
            .push((service_id.to_string(), ttl_secs, safe_point));
        Ok(())
    }
}
