//! In-memory reference backend.
//!
//! A small multi-version engine holding the fixture relation, so the harness
//! and every scenario can run without an external server. It follows
//! PostgreSQL's observable behaviour for the statements the harness issues:
//!
//! - Each row is a version chain stamped with its creating (`xmin`) and
//!   deleting (`xmax`) transaction. Rolled-back versions are removed.
//! - READ COMMITTED takes a snapshot per statement; REPEATABLE READ and
//!   SERIALIZABLE take one at the first data statement. READ UNCOMMITTED
//!   behaves as READ COMMITTED.
//! - A write to a row whose newest version belongs to an in-progress
//!   transaction waits for it. Afterwards READ COMMITTED writes on top of
//!   the newest committed version; snapshot levels fail with a
//!   serialization failure if that version is not the one they saw.
//! - SERIALIZABLE tracks reads and writes and aborts a transaction that
//!   has an rw-antidependency out to a concurrent committed transaction
//!   and one in from any concurrent transaction.
//!
//! ## Limitations
//!
//! - DDL is not transactional: `ensure_schema()` takes effect immediately.
//! - No garbage collection of dead versions or finished transactions.
//! - SSI tracks whole-relation scans, so any concurrent write to the
//!   relation conflicts with a scan (no false-negative, some false-positive).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::model::{Employee, EmployeeId, Value};
use crate::tx::{IsolationLevel, TxId};
use crate::{Error, ErrorKind, Result};
use super::{Backend, BackendCapabilities, ServerControl, Session};

/// SQLSTATE codes raised by the engine.
mod sqlstate {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const DATATYPE_MISMATCH: &str = "42804";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const ACTIVE_SQL_TRANSACTION: &str = "25001";
    pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";
}

const LOG_READY: &str = "LOG:  database system is ready to accept connections";
const LOG_SHUT_DOWN: &str = "LOG:  database system is shut down";

// ============================================================================
// MemoryBackend
// ============================================================================

/// In-process reference engine. Clones share the same database.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Engine>,
}

struct Engine {
    state: Mutex<EngineState>,
    /// Signalled whenever a transaction finishes or the server stops.
    finished: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Engine {
                state: Mutex::new(EngineState::new()),
                finished: Notify::new(),
            }),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Session = MemorySession;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<MemorySession> {
        let state = self.inner.state.lock();
        if !state.online {
            return Err(Error::Connection(
                "connection refused: the database system is not accepting connections".into(),
            ));
        }
        Ok(MemorySession {
            engine: Arc::clone(&self.inner),
            epoch: state.epoch,
            current: None,
            failed: false,
        })
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            read_uncommitted_is_read_committed: true,
            serializable_is_ssi: true,
            restartable: true,
        }
    }

    fn server_control(&self) -> Option<&dyn ServerControl> {
        Some(self)
    }
}

#[async_trait]
impl ServerControl for MemoryBackend {
    async fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if !state.online {
                return Ok(());
            }
            state.online = false;
            state.epoch += 1;
            let in_flight: Vec<TxId> = state
                .txns
                .iter()
                .filter(|(_, rec)| rec.status == TxStatus::Active)
                .map(|(id, _)| *id)
                .collect();
            for tx in &in_flight {
                state.abort(*tx);
            }
            state.waits_for.clear();
            state.log.push(LOG_SHUT_DOWN.to_owned());
            tracing::info!(aborted = in_flight.len(), "memory server stopped");
        }
        self.inner.finished.notify_waiters();
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.online {
            state.online = true;
            state.log.push(LOG_READY.to_owned());
            tracing::info!(epoch = state.epoch, "memory server started");
        }
        Ok(())
    }

    async fn logs(&self) -> Result<String> {
        Ok(self.inner.state.lock().log.join("\n"))
    }
}

// ============================================================================
// Engine state
// ============================================================================

#[derive(Debug, Clone)]
struct Version {
    xmin: TxId,
    xmax: Option<TxId>,
    name: String,
    salary: Option<f64>,
}

impl Version {
    fn to_employee(&self, id: EmployeeId) -> Employee {
        Employee::new(id, self.name.clone(), self.salary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    Committed(u64),
    Aborted,
}

#[derive(Debug)]
struct TxRecord {
    status: TxStatus,
    level: IsolationLevel,
    /// Commit sequence of the first snapshot taken, if any.
    snapshot: Option<u64>,
    /// Rows read by key (SERIALIZABLE only).
    reads: HashSet<EmployeeId>,
    /// Relation read by predicate (SERIALIZABLE only).
    scanned: bool,
    writes: HashSet<EmployeeId>,
}

impl TxRecord {
    fn new() -> Self {
        Self {
            status: TxStatus::Active,
            level: IsolationLevel::default(),
            snapshot: None,
            reads: HashSet::new(),
            scanned: false,
            writes: HashSet::new(),
        }
    }

    /// Did `self` read something `writer` wrote (rw-antidependency self → writer)?
    fn reads_from(&self, writer: &TxRecord) -> bool {
        (self.scanned && !writer.writes.is_empty())
            || self.reads.iter().any(|id| writer.writes.contains(id))
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    reader: TxId,
    high: u64,
}

#[derive(Debug, Clone, Copy)]
enum WriteOp {
    Set(f64),
    Add(f64),
    Delete,
}

enum Attempt {
    Done(u64),
    Blocked(TxId),
}

struct EngineState {
    online: bool,
    /// Bumped on every stop; sessions from an older epoch are dead.
    epoch: u64,
    /// `None` until the schema has been created.
    table: Option<BTreeMap<EmployeeId, Vec<Version>>>,
    next_row_id: i64,
    next_tx_id: u64,
    commit_seq: u64,
    txns: HashMap<TxId, TxRecord>,
    /// waiter → holder
    waits_for: HashMap<TxId, TxId>,
    log: Vec<String>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            online: true,
            epoch: 0,
            table: None,
            next_row_id: 1,
            next_tx_id: 1,
            commit_seq: 0,
            txns: HashMap::new(),
            waits_for: HashMap::new(),
            log: vec![LOG_READY.to_owned()],
        }
    }

    fn check_epoch(&self, epoch: u64) -> Result<()> {
        if self.online && self.epoch == epoch {
            Ok(())
        } else {
            Err(Error::Connection("server closed the connection unexpectedly".into()))
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    fn begin(&mut self) -> TxId {
        let tx = TxId(self.next_tx_id);
        self.next_tx_id += 1;
        self.txns.insert(tx, TxRecord::new());
        tx
    }

    fn record(&self, tx: TxId) -> Result<&TxRecord> {
        self.txns
            .get(&tx)
            .ok_or_else(|| Error::TxError(format!("unknown transaction {tx}")))
    }

    fn record_mut(&mut self, tx: TxId) -> Result<&mut TxRecord> {
        self.txns
            .get_mut(&tx)
            .ok_or_else(|| Error::TxError(format!("unknown transaction {tx}")))
    }

    fn set_level(&mut self, tx: TxId, level: IsolationLevel) -> Result<()> {
        let rec = self.record_mut(tx)?;
        if rec.snapshot.is_some() {
            return Err(Error::database(
                sqlstate::ACTIVE_SQL_TRANSACTION,
                "SET TRANSACTION ISOLATION LEVEL must be called before any query",
            ));
        }
        rec.level = level;
        Ok(())
    }

    fn commit(&mut self, tx: TxId) -> Result<()> {
        if let Err(err) = self.check_serializable(tx) {
            self.abort(tx);
            return Err(err);
        }
        self.commit_seq += 1;
        let seq = self.commit_seq;
        self.record_mut(tx)?.status = TxStatus::Committed(seq);
        self.waits_for.remove(&tx);
        Ok(())
    }

    fn abort(&mut self, tx: TxId) {
        if let Some(table) = self.table.as_mut() {
            for chain in table.values_mut() {
                chain.retain(|v| v.xmin != tx);
                for v in chain.iter_mut() {
                    if v.xmax == Some(tx) {
                        v.xmax = None;
                    }
                }
            }
            table.retain(|_, chain| !chain.is_empty());
        }
        if let Some(rec) = self.txns.get_mut(&tx) {
            rec.status = TxStatus::Aborted;
        }
        self.waits_for.remove(&tx);
    }

    // ========================================================================
    // Visibility
    // ========================================================================

    fn committed_at(&self, tx: TxId) -> Option<u64> {
        match self.txns.get(&tx)?.status {
            TxStatus::Committed(seq) => Some(seq),
            _ => None,
        }
    }

    fn is_active(&self, tx: TxId) -> bool {
        self.txns.get(&tx).is_some_and(|rec| rec.status == TxStatus::Active)
    }

    /// Are `tx`'s effects part of `snap`?
    fn sees(&self, snap: Snapshot, tx: TxId) -> bool {
        tx == snap.reader || self.committed_at(tx).is_some_and(|seq| seq <= snap.high)
    }

    fn visible(&self, snap: Snapshot, v: &Version) -> bool {
        self.sees(snap, v.xmin) && !v.xmax.is_some_and(|x| self.sees(snap, x))
    }

    fn statement_snapshot(&mut self, tx: TxId) -> Result<Snapshot> {
        let current = self.commit_seq;
        let rec = self.record_mut(tx)?;
        let first = *rec.snapshot.get_or_insert(current);
        let high = if rec.level.uses_transaction_snapshot() { first } else { current };
        Ok(Snapshot { reader: tx, high })
    }

    fn table(&self) -> Result<&BTreeMap<EmployeeId, Vec<Version>>> {
        self.table.as_ref().ok_or_else(undefined_table)
    }

    fn table_mut(&mut self) -> Result<&mut BTreeMap<EmployeeId, Vec<Version>>> {
        self.table.as_mut().ok_or_else(undefined_table)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn track_read(&mut self, tx: TxId, id: EmployeeId) -> Result<()> {
        let rec = self.record_mut(tx)?;
        if rec.level == IsolationLevel::Serializable {
            rec.reads.insert(id);
        }
        Ok(())
    }

    fn track_scan(&mut self, tx: TxId) -> Result<()> {
        let rec = self.record_mut(tx)?;
        if rec.level == IsolationLevel::Serializable {
            rec.scanned = true;
        }
        Ok(())
    }

    fn fetch(&mut self, tx: TxId, id: EmployeeId) -> Result<Option<Employee>> {
        let snap = self.statement_snapshot(tx)?;
        self.track_read(tx, id)?;
        let row = self
            .table()?
            .get(&id)
            .and_then(|chain| chain.iter().rev().find(|v| self.visible(snap, v)))
            .map(|v| v.to_employee(id));
        Ok(row)
    }

    fn scan(&mut self, tx: TxId) -> Result<Vec<Employee>> {
        let snap = self.statement_snapshot(tx)?;
        self.track_scan(tx)?;
        let rows = self
            .table()?
            .iter()
            .filter_map(|(id, chain)| {
                chain
                    .iter()
                    .rev()
                    .find(|v| self.visible(snap, v))
                    .map(|v| v.to_employee(*id))
            })
            .collect();
        Ok(rows)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    fn insert(&mut self, tx: TxId, name: &str, salary: &Value) -> Result<EmployeeId> {
        self.statement_snapshot(tx)?;
        let salary = coerce_salary(salary)?;
        let id = EmployeeId(self.next_row_id);
        self.table_mut()?.insert(
            id,
            vec![Version { xmin: tx, xmax: None, name: name.to_owned(), salary }],
        );
        self.next_row_id += 1;
        self.record_mut(tx)?.writes.insert(id);
        self.check_serializable(tx)?;
        Ok(id)
    }

    fn try_write(&mut self, tx: TxId, id: EmployeeId, op: WriteOp) -> Result<Attempt> {
        self.waits_for.remove(&tx);
        let snap = self.statement_snapshot(tx)?;
        let level = self.record(tx)?.level;
        self.track_read(tx, id)?;

        let Some(chain) = self.table()?.get(&id) else {
            return Ok(Attempt::Done(0));
        };
        let Some(seen) = chain.iter().rposition(|v| self.visible(snap, v)) else {
            return Ok(Attempt::Done(0));
        };
        let newest_idx = chain.len() - 1;
        let newest = chain[newest_idx].clone();

        if let Some(holder) = self.holder(tx, &newest) {
            self.wait_on(tx, holder)?;
            return Ok(Attempt::Blocked(holder));
        }

        let deleted = newest.xmax.is_some_and(|x| x != tx);
        if seen != newest_idx || deleted {
            if level.uses_transaction_snapshot() {
                let what = if deleted { "delete" } else { "update" };
                return Err(Error::database(
                    sqlstate::SERIALIZATION_FAILURE,
                    format!("could not serialize access due to concurrent {what}"),
                ));
            }
            if deleted {
                return Ok(Attempt::Done(0));
            }
        }

        let chain = self
            .table_mut()?
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("employee {id}")))?;
        chain[newest_idx].xmax = Some(tx);
        let salary = match op {
            WriteOp::Delete => None,
            WriteOp::Set(salary) => Some(Some(salary)),
            WriteOp::Add(delta) => Some(newest.salary.map(|s| s + delta)),
        };
        if let Some(salary) = salary {
            chain.push(Version { xmin: tx, xmax: None, name: newest.name, salary });
        }
        self.record_mut(tx)?.writes.insert(id);
        self.check_serializable(tx)?;
        Ok(Attempt::Done(1))
    }

    /// In-progress transaction (other than `tx`) holding `v`.
    fn holder(&self, tx: TxId, v: &Version) -> Option<TxId> {
        let other_active = |x: TxId| x != tx && self.is_active(x);
        if other_active(v.xmin) {
            return Some(v.xmin);
        }
        v.xmax.filter(|x| other_active(*x))
    }

    fn wait_on(&mut self, tx: TxId, holder: TxId) -> Result<()> {
        let mut cursor = holder;
        for _ in 0..=self.waits_for.len() {
            match self.waits_for.get(&cursor) {
                Some(next) if *next == tx => {
                    return Err(Error::database(
                        sqlstate::DEADLOCK_DETECTED,
                        format!("deadlock detected: {tx} waits for {holder}, which waits for {tx}"),
                    ));
                }
                Some(next) => cursor = *next,
                None => break,
            }
        }
        self.waits_for.insert(tx, holder);
        Ok(())
    }

    // ========================================================================
    // Serializable snapshot isolation
    // ========================================================================

    fn check_serializable(&self, tx: TxId) -> Result<()> {
        let Some(me) = self.txns.get(&tx) else {
            return Ok(());
        };
        if me.level != IsolationLevel::Serializable {
            return Ok(());
        }
        let since = me.snapshot.unwrap_or(self.commit_seq);
        let mut out_to_committed = false;
        let mut in_edge = false;
        for (other_id, other) in &self.txns {
            if *other_id == tx || other.level != IsolationLevel::Serializable {
                continue;
            }
            let committed = match other.status {
                TxStatus::Active => false,
                TxStatus::Committed(seq) if seq > since => true,
                _ => continue,
            };
            if committed && me.reads_from(other) {
                out_to_committed = true;
            }
            if other.reads_from(me) {
                in_edge = true;
            }
        }
        if out_to_committed && in_edge {
            return Err(Error::database(
                sqlstate::SERIALIZATION_FAILURE,
                "could not serialize access due to read/write dependencies among transactions",
            ));
        }
        Ok(())
    }
}

fn undefined_table() -> Error {
    Error::database(sqlstate::UNDEFINED_TABLE, "relation \"employee\" does not exist")
}

fn coerce_salary(value: &Value) -> Result<Option<f64>> {
    if value.is_null() {
        return Ok(None);
    }
    value.as_float().map(Some).ok_or_else(|| {
        Error::database(
            sqlstate::DATATYPE_MISMATCH,
            format!(
                "column \"salary\" is of type double precision but expression is of type {}",
                value.type_name()
            ),
        )
    })
}

// ============================================================================
// MemorySession
// ============================================================================

/// One connection to a `MemoryBackend`.
pub struct MemorySession {
    engine: Arc<Engine>,
    epoch: u64,
    current: Option<TxId>,
    /// A statement failed; the transaction is aborted until rollback.
    failed: bool,
}

impl MemorySession {
    /// Run `op` inside the current transaction, opening one if needed.
    fn with_tx<R>(&mut self, op: impl FnOnce(&mut EngineState, TxId) -> Result<R>) -> Result<R> {
        let mut state = self.engine.state.lock();
        state.check_epoch(self.epoch)?;
        if self.failed {
            return Err(Error::database(
                sqlstate::IN_FAILED_SQL_TRANSACTION,
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        let tx = match self.current {
            Some(tx) => tx,
            None => {
                let tx = state.begin();
                self.current = Some(tx);
                tx
            }
        };
        let result = op(&mut state, tx);
        if let Err(err) = &result {
            if err.kind() != ErrorKind::Connection {
                tracing::debug!(%tx, error = %err, "statement failed, aborting transaction");
                self.failed = true;
                state.abort(tx);
                drop(state);
                self.engine.finished.notify_waiters();
            }
        }
        result
    }

    async fn write(&mut self, id: EmployeeId, op: WriteOp) -> Result<u64> {
        loop {
            let engine = Arc::clone(&self.engine);
            // Registered before the attempt so a commit in between is not missed.
            let finished = engine.finished.notified();
            match self.with_tx(|state, tx| state.try_write(tx, id, op))? {
                Attempt::Done(rows) => return Ok(rows),
                Attempt::Blocked(holder) => {
                    tracing::debug!(%id, %holder, "row locked, waiting");
                    finished.await;
                }
            }
        }
    }

    /// End the transaction: commit if `commit` and it has not failed.
    fn finish(&mut self, commit: bool) -> Result<()> {
        let Some(tx) = self.current.take() else {
            return Ok(());
        };
        let failed = std::mem::take(&mut self.failed);
        let result = {
            let mut state = self.engine.state.lock();
            state.check_epoch(self.epoch)?;
            if commit && !failed {
                state.commit(tx)
            } else {
                if commit {
                    tracing::warn!(%tx, "commit of an aborted transaction, rolled back instead");
                }
                state.abort(tx);
                Ok(())
            }
        };
        self.engine.finished.notify_waiters();
        result
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if let Some(tx) = self.current.take() {
            let mut state = self.engine.state.lock();
            if state.check_epoch(self.epoch).is_ok() && state.is_active(tx) {
                state.abort(tx);
                drop(state);
                self.engine.finished.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn show_isolation(&mut self) -> Result<IsolationLevel> {
        self.with_tx(|state, tx| Ok(state.record(tx)?.level))
    }

    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        self.with_tx(|state, tx| state.set_level(tx, level))
    }

    async fn commit(&mut self) -> Result<()> {
        self.finish(true)
    }

    async fn rollback(&mut self) -> Result<()> {
        self.finish(false)
    }

    async fn ensure_schema(&mut self) -> Result<()> {
        self.with_tx(|state, _| {
            state.table.get_or_insert_with(BTreeMap::new);
            Ok(())
        })
    }

    async fn insert_employee(&mut self, name: &str, salary: Value) -> Result<EmployeeId> {
        self.with_tx(|state, tx| state.insert(tx, name, &salary))
    }

    async fn fetch(&mut self, id: EmployeeId) -> Result<Option<Employee>> {
        self.with_tx(|state, tx| state.fetch(tx, id))
    }

    async fn find_by_name(&mut self, name: &str) -> Result<Option<Employee>> {
        self.with_tx(|state, tx| Ok(state.scan(tx)?.into_iter().find(|e| e.name == name)))
    }

    async fn set_salary(&mut self, id: EmployeeId, salary: f64) -> Result<u64> {
        self.write(id, WriteOp::Set(salary)).await
    }

    async fn raise_salary(&mut self, id: EmployeeId, delta: f64) -> Result<u64> {
        self.write(id, WriteOp::Add(delta)).await
    }

    async fn total_salary(&mut self) -> Result<Option<f64>> {
        self.with_tx(|state, tx| {
            let salaries: Vec<f64> = state.scan(tx)?.into_iter().filter_map(|e| e.salary).collect();
            Ok((!salaries.is_empty()).then(|| salaries.iter().sum()))
        })
    }

    async fn employees(&mut self) -> Result<Vec<Employee>> {
        self.with_tx(|state, tx| state.scan(tx))
    }

    async fn delete_all(&mut self) -> Result<u64> {
        let ids: Vec<EmployeeId> = self
            .with_tx(|state, tx| state.scan(tx))?
            .into_iter()
            .map(|e| e.id)
            .collect();
        let mut deleted = 0;
        for id in ids {
            deleted += self.write(id, WriteOp::Delete).await?;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn backend_with_schema() -> MemoryBackend {
        let backend = MemoryBackend::new();
        let mut s = backend.connect().await.unwrap();
        s.ensure_schema().await.unwrap();
        s.commit().await.unwrap();
        backend
    }

    async fn seeded(salary: f64) -> (MemoryBackend, EmployeeId) {
        let backend = backend_with_schema().await;
        let mut s = backend.connect().await.unwrap();
        let id = s.insert_employee("John Smith", Value::Float(salary)).await.unwrap();
        s.commit().await.unwrap();
        (backend, id)
    }

    #[tokio::test]
    async fn test_statements_fail_before_schema() {
        let backend = MemoryBackend::new();
        let mut s = backend.connect().await.unwrap();
        let err = s.employees().await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("42P01"));
    }

    #[tokio::test]
    async fn test_uncommitted_insert_is_private() {
        let backend = backend_with_schema().await;
        let mut writer = backend.connect().await.unwrap();
        let mut reader = backend.connect().await.unwrap();

        let id = writer.insert_employee("Beth Lee", Value::Float(3500.0)).await.unwrap();
        assert!(reader.fetch(id).await.unwrap().is_none());
        assert_eq!(writer.salary_of(id).await.unwrap(), 3500.0);

        writer.commit().await.unwrap();
        assert_eq!(reader.salary_of(id).await.unwrap(), 3500.0);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes_but_not_serial() {
        let backend = backend_with_schema().await;
        let mut s = backend.connect().await.unwrap();
        let first = s.insert_employee("Beth Lee", Value::Float(3500.0)).await.unwrap();
        s.rollback().await.unwrap();
        assert!(s.employees().await.unwrap().is_empty());
        let second = s.insert_employee("Beth Lee", Value::Float(3500.0)).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_mistyped_salary_is_rejected() {
        let backend = backend_with_schema().await;
        let mut s = backend.connect().await.unwrap();
        let date = chrono::NaiveDate::from_ymd_opt(2024, 12, 20).unwrap();
        let err = s.insert_employee("Mary Castle", Value::Date(date)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataException);
        assert_eq!(err.sqlstate(), Some("42804"));
    }

    #[tokio::test]
    async fn test_null_salary_is_stored_and_skipped_by_sum() {
        let backend = backend_with_schema().await;
        let mut s = backend.connect().await.unwrap();
        assert_eq!(s.total_salary().await.unwrap(), None);

        let blank = s.insert_employee("Nora Null", Value::Null).await.unwrap();
        assert_eq!(s.total_salary().await.unwrap(), None);
        let err = s.salary_of(blank).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        assert_eq!(s.raise_salary(blank, 500.0).await.unwrap(), 1);
        assert_eq!(s.fetch(blank).await.unwrap().unwrap().salary, None);

        s.insert_employee("Ten Tens", Value::Float(10.0)).await.unwrap();
        assert_eq!(s.total_salary().await.unwrap(), Some(10.0));
        s.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_transaction_rejects_statements_until_rollback() {
        let backend = backend_with_schema().await;
        let mut s = backend.connect().await.unwrap();
        s.insert_employee("Bob Fox", Value::Float(2750.0)).await.unwrap();
        s.insert_employee("Alan Rock", Value::Text("lots".into())).await.unwrap_err();

        let err = s.employees().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransactionState);
        assert_eq!(err.sqlstate(), Some("25P02"));

        s.rollback().await.unwrap();
        assert!(s.employees().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_of_failed_transaction_rolls_back() {
        let backend = backend_with_schema().await;
        let mut s = backend.connect().await.unwrap();
        s.insert_employee("Bob Fox", Value::Float(2750.0)).await.unwrap();
        s.insert_employee("Alan Rock", Value::Bool(true)).await.unwrap_err();
        s.commit().await.unwrap();
        assert!(s.employees().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_isolation_after_query_fails() {
        let (backend, id) = seeded(3000.0).await;
        let mut s = backend.connect().await.unwrap();
        assert_eq!(s.show_isolation().await.unwrap(), IsolationLevel::ReadCommitted);
        s.set_isolation(IsolationLevel::Serializable).await.unwrap();
        assert_eq!(s.show_isolation().await.unwrap(), IsolationLevel::Serializable);
        s.fetch(id).await.unwrap();
        let err = s.set_isolation(IsolationLevel::RepeatableRead).await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("25001"));
    }

    #[tokio::test]
    async fn test_repeatable_read_keeps_first_snapshot() {
        let (backend, id) = seeded(3000.0).await;
        let mut reader = backend.connect().await.unwrap();
        reader.set_isolation(IsolationLevel::RepeatableRead).await.unwrap();
        assert_eq!(reader.salary_of(id).await.unwrap(), 3000.0);

        let mut writer = backend.connect().await.unwrap();
        writer.set_salary(id, 4000.0).await.unwrap();
        writer.commit().await.unwrap();

        assert_eq!(reader.salary_of(id).await.unwrap(), 3000.0);
        reader.commit().await.unwrap();
        assert_eq!(reader.salary_of(id).await.unwrap(), 4000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_waits_for_row_holder() {
        let (backend, id) = seeded(4000.0).await;
        let mut first = backend.connect().await.unwrap();
        let mut second = backend.connect().await.unwrap();

        first.raise_salary(id, 100.0).await.unwrap();
        let hold = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            first.commit().await.unwrap();
        };
        let blocked = async {
            let rows = second.raise_salary(id, 10.0).await.unwrap();
            second.commit().await.unwrap();
            rows
        };
        let ((), rows) = tokio::join!(hold, blocked);
        assert_eq!(rows, 1);

        let mut check = backend.connect().await.unwrap();
        assert_eq!(check.salary_of(id).await.unwrap(), 4110.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeatable_read_writer_fails_after_concurrent_commit() {
        let (backend, id) = seeded(4000.0).await;
        let mut first = backend.connect().await.unwrap();
        let mut second = backend.connect().await.unwrap();
        second.set_isolation(IsolationLevel::RepeatableRead).await.unwrap();
        second.fetch(id).await.unwrap();

        first.set_salary(id, 4800.0).await.unwrap();
        let hold = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            first.commit().await.unwrap();
        };
        let ((), result) = tokio::join!(hold, second.set_salary(id, 4400.0));
        assert!(result.unwrap_err().is_serialization_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlock_is_detected() {
        let backend = backend_with_schema().await;
        let mut setup = backend.connect().await.unwrap();
        let a = setup.insert_employee("Amanda Lang", Value::Float(4000.0)).await.unwrap();
        let b = setup.insert_employee("August Morse", Value::Float(4000.0)).await.unwrap();
        setup.commit().await.unwrap();

        let mut s1 = backend.connect().await.unwrap();
        let mut s2 = backend.connect().await.unwrap();
        s1.set_salary(a, 1.0).await.unwrap();
        s2.set_salary(b, 2.0).await.unwrap();

        let first = async {
            let rows = s1.set_salary(b, 1.0).await;
            if rows.is_ok() {
                s1.commit().await.unwrap();
            }
            rows
        };
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            s2.set_salary(a, 2.0).await
        };
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap_err().kind(), ErrorKind::Deadlock);
    }

    #[tokio::test]
    async fn test_stop_cuts_sessions_and_keeps_committed_rows() {
        let (backend, id) = seeded(3000.0).await;
        let mut in_flight = backend.connect().await.unwrap();
        in_flight.insert_employee("Paul Port", Value::Float(1.0)).await.unwrap();

        let control = backend.server_control().unwrap();
        let seen = control.log_count("ready to accept connections").await.unwrap();
        control.stop().await.unwrap();

        assert_eq!(in_flight.employees().await.unwrap_err().kind(), ErrorKind::Connection);
        assert_eq!(backend.connect().await.err().unwrap().kind(), ErrorKind::Connection);

        control.start().await.unwrap();
        control
            .wait_for_log("ready to accept connections", seen, Duration::from_secs(1))
            .await
            .unwrap();

        let mut s = backend.connect().await.unwrap();
        let rows = s.employees().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_log_times_out() {
        let backend = MemoryBackend::new();
        let control = backend.server_control().unwrap();
        let seen = control.log_count("ready to accept connections").await.unwrap();
        let err = control
            .wait_for_log("ready to accept connections", seen, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
