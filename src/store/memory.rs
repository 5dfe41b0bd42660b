//! In-process backend used for development and tests.
//!
//! A transaction works on a private copy of the tables taken at `BEGIN` and
//! publishes it on `COMMIT`; savepoints are further copies. Only one transaction
//! writes at a time: `BEGIN` holds the write gate until the transaction ends.
//! Statements outside a transaction behave as autocommit and are atomic.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::model::{
    Element, ElementId, ElementPatch, InsertElement, NewProject, Page, PageId, Project, ProjectId,
    ProjectUpdate, User, UserId,
};
use crate::store::{Connection, ConnectionSource, StoreError, StoreResult, TxStatement};

#[derive(Debug, Clone, Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    projects: BTreeMap<ProjectId, Project>,
    pages: BTreeMap<PageId, Page>,
    elements: BTreeMap<ElementId, Element>,
}

/// Ids are never reused, even when the inserting transaction rolls back
#[derive(Debug)]
struct Sequences {
    project: AtomicI64,
    page: AtomicI64,
    element: AtomicI64,
}

impl Default for Sequences {
    fn default() -> Self {
        Self {
            project: AtomicI64::new(1),
            page: AtomicI64::new(1),
            element: AtomicI64::new(1),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    deadlocks: u32,
    fail_delete_after: Option<usize>,
    statement_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    gate: Arc<tokio::sync::Mutex<()>>,
    sequences: Sequences,
    faults: Mutex<Faults>,
    control_log: Mutex<Vec<TxStatement>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableCounts {
    pub projects: usize,
    pub pages: usize,
    pub elements: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` element writes with a deadlock error
    pub fn inject_deadlocks(&self, times: u32) {
        self.shared.faults.lock().deadlocks = times;
    }

    /// Make the next element delete fail after removing `rows` rows
    pub fn fail_delete_after(&self, rows: usize) {
        self.shared.faults.lock().fail_delete_after = Some(rows);
    }

    /// Sleep before every data statement
    pub fn set_statement_delay(&self, delay: Option<Duration>) {
        self.shared.faults.lock().statement_delay = delay;
    }

    pub fn clear_faults(&self) {
        *self.shared.faults.lock() = Faults::default();
    }

    /// Committed row counts
    pub fn counts(&self) -> TableCounts {
        let tables = self.shared.tables.lock();
        TableCounts {
            projects: tables.projects.len(),
            pages: tables.pages.len(),
            elements: tables.elements.len(),
        }
    }

    /// Transaction control statements issued so far, across all connections
    pub fn control_log(&self) -> Vec<TxStatement> {
        self.shared.control_log.lock().clone()
    }

    /// Store a committed element row without any reference checks
    pub fn insert_unchecked(&self, mut element: Element) -> ElementId {
        if element.id <= 0 {
            element.id = self.shared.sequences.element.fetch_add(1, Ordering::SeqCst);
        } else {
            self.shared
                .sequences
                .element
                .fetch_max(element.id + 1, Ordering::SeqCst);
        }
        let id = element.id;
        self.shared.tables.lock().elements.insert(id, element);
        id
    }
}

#[async_trait::async_trait]
impl ConnectionSource for MemoryStore {
    type Conn = MemoryConnection;

    async fn acquire(&self) -> StoreResult<MemoryConnection> {
        Ok(MemoryConnection {
            shared: self.shared.clone(),
            tx: None,
        })
    }
}

#[derive(Debug)]
struct OpenTx {
    _gate: OwnedMutexGuard<()>,
    working: Tables,
    savepoints: Vec<(String, Tables)>,
}

impl OpenTx {
    fn savepoint_position(&self, name: &str) -> StoreResult<usize> {
        self.savepoints
            .iter()
            .rposition(|(sp, _)| sp == name)
            .ok_or_else(|| StoreError::Internal(format!("savepoint {} does not exist", name)))
    }
}

/// Dropping a connection with an open transaction discards its work
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
    tx: Option<OpenTx>,
}

impl MemoryConnection {
    async fn pause(&self) {
        let delay = self.shared.faults.lock().statement_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_deadlock(&self) -> StoreResult<()> {
        let mut faults = self.shared.faults.lock();
        if faults.deadlocks > 0 {
            faults.deadlocks -= 1;
            return Err(StoreError::Deadlock(
                "deadlock detected (injected)".to_string(),
            ));
        }
        Ok(())
    }

    async fn read<R>(&mut self, f: impl FnOnce(&Tables) -> R) -> StoreResult<R> {
        self.pause().await;
        Ok(match &self.tx {
            Some(tx) => f(&tx.working),
            None => f(&self.shared.tables.lock()),
        })
    }

    async fn write<R>(&mut self, f: impl FnOnce(&mut Tables) -> StoreResult<R>) -> StoreResult<R> {
        self.pause().await;
        if let Some(tx) = &mut self.tx {
            return f(&mut tx.working);
        }

        let _gate = self.shared.gate.lock().await;
        let mut tables = self.shared.tables.lock();
        let mut scratch = tables.clone();
        let result = f(&mut scratch)?;
        *tables = scratch;
        Ok(result)
    }
}

fn check_parent(tables: &Tables, parent_id: Option<ElementId>) -> StoreResult<()> {
    match parent_id {
        Some(parent) if !tables.elements.contains_key(&parent) => Err(StoreError::Constraint(
            format!("parent element {} does not exist", parent),
        )),
        _ => Ok(()),
    }
}

/// Rows left behind that still point at a deleted element
fn check_dangling_children(tables: &Tables, removed: &HashSet<ElementId>) -> StoreResult<()> {
    let dangling = tables
        .elements
        .values()
        .find(|e| e.parent_id.is_some_and(|p| removed.contains(&p)));
    match dangling {
        Some(child) => Err(StoreError::Constraint(format!(
            "element {} still references deleted parent {:?}",
            child.id, child.parent_id
        ))),
        None => Ok(()),
    }
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    async fn execute_control(&mut self, statement: &TxStatement) -> StoreResult<()> {
        self.shared.control_log.lock().push(statement.clone());

        match statement {
            TxStatement::Begin(_) => {
                if self.tx.is_some() {
                    return Err(StoreError::Internal(
                        "a transaction is already in progress".to_string(),
                    ));
                }
                let gate = self.shared.gate.clone().lock_owned().await;
                let working = self.shared.tables.lock().clone();
                self.tx = Some(OpenTx {
                    _gate: gate,
                    working,
                    savepoints: Vec::new(),
                });
            }
            TxStatement::Commit => match self.tx.take() {
                Some(tx) => *self.shared.tables.lock() = tx.working,
                None => log::warn!("COMMIT without a transaction in progress"),
            },
            TxStatement::Rollback => {
                if self.tx.take().is_none() {
                    log::warn!("ROLLBACK without a transaction in progress");
                }
            }
            TxStatement::Savepoint(name) => {
                let tx = self.tx.as_mut().ok_or_else(|| {
                    StoreError::Internal("SAVEPOINT outside a transaction".to_string())
                })?;
                let copy = tx.working.clone();
                tx.savepoints.push((name.clone(), copy));
            }
            TxStatement::ReleaseSavepoint(name) => {
                let tx = self.tx.as_mut().ok_or_else(|| {
                    StoreError::Internal("RELEASE outside a transaction".to_string())
                })?;
                let position = tx.savepoint_position(name)?;
                tx.savepoints.truncate(position);
            }
            TxStatement::RollbackToSavepoint(name) => {
                let tx = self.tx.as_mut().ok_or_else(|| {
                    StoreError::Internal("ROLLBACK TO outside a transaction".to_string())
                })?;
                let position = tx.savepoint_position(name)?;
                tx.working = tx.savepoints[position].1.clone();
                tx.savepoints.truncate(position + 1);
            }
        }
        Ok(())
    }

    async fn upsert_user(&mut self, user: &User) -> StoreResult<()> {
        let user = user.clone();
        self.write(move |t| {
            t.users.insert(user.id.clone(), user);
            Ok(())
        })
        .await
    }

    async fn insert_project(&mut self, owner_id: &str, project: &NewProject) -> StoreResult<Project> {
        let id = self.shared.sequences.project.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let row = Project {
            id,
            owner_id: owner_id.to_string(),
            name: project.name.clone(),
            description: project.description.clone(),
            created_at: now,
            updated_at: now,
        };
        self.write(move |t| {
            if !t.users.contains_key(&row.owner_id) {
                return Err(StoreError::Constraint(format!(
                    "owner {} does not exist",
                    row.owner_id
                )));
            }
            t.projects.insert(row.id, row.clone());
            Ok(row)
        })
        .await
    }

    async fn get_project(&mut self, id: ProjectId) -> StoreResult<Option<Project>> {
        self.read(|t| t.projects.get(&id).cloned()).await
    }

    async fn list_projects(&mut self, owner_id: &str) -> StoreResult<Vec<Project>> {
        self.read(|t| {
            let mut projects: Vec<Project> = t
                .projects
                .values()
                .filter(|p| p.owner_id == owner_id)
                .cloned()
                .collect();
            projects.sort_by_key(|p| (p.created_at, p.id));
            projects
        })
        .await
    }

    async fn update_project(
        &mut self,
        id: ProjectId,
        update: &ProjectUpdate,
    ) -> StoreResult<Option<Project>> {
        let update = update.clone();
        self.write(move |t| {
            let Some(project) = t.projects.get_mut(&id) else {
                return Ok(None);
            };
            if let Some(name) = update.name {
                project.name = name;
            }
            if let Some(description) = update.description {
                project.description = description;
            }
            project.updated_at = Utc::now();
            Ok(Some(project.clone()))
        })
        .await
    }

    async fn delete_project_row(&mut self, id: ProjectId) -> StoreResult<bool> {
        self.write(move |t| {
            if t.projects.remove(&id).is_none() {
                return Ok(false);
            }
            let pages: HashSet<PageId> = t
                .pages
                .values()
                .filter(|p| p.project_id == id)
                .map(|p| p.id)
                .collect();
            t.pages.retain(|_, p| p.project_id != id);
            t.elements.retain(|_, e| !pages.contains(&e.page_id));
            Ok(true)
        })
        .await
    }

    async fn insert_page(
        &mut self,
        project_id: ProjectId,
        name: &str,
        slug: &str,
        order: i32,
    ) -> StoreResult<Page> {
        let row = Page {
            id: self.shared.sequences.page.fetch_add(1, Ordering::SeqCst),
            project_id,
            name: name.to_string(),
            slug: slug.to_string(),
            order,
            created_at: Utc::now(),
        };
        self.write(move |t| {
            if !t.projects.contains_key(&project_id) {
                return Err(StoreError::Constraint(format!(
                    "project {} does not exist",
                    project_id
                )));
            }
            if t
                .pages
                .values()
                .any(|p| p.project_id == project_id && p.slug == row.slug)
            {
                return Err(StoreError::Constraint(format!(
                    "slug '{}' already used in project {}",
                    row.slug, project_id
                )));
            }
            t.pages.insert(row.id, row.clone());
            Ok(row)
        })
        .await
    }

    async fn get_page(&mut self, id: PageId) -> StoreResult<Option<Page>> {
        self.read(|t| t.pages.get(&id).cloned()).await
    }

    async fn list_pages(&mut self, project_id: ProjectId) -> StoreResult<Vec<Page>> {
        self.read(|t| {
            let mut pages: Vec<Page> = t
                .pages
                .values()
                .filter(|p| p.project_id == project_id)
                .cloned()
                .collect();
            pages.sort_by_key(|p| (p.order, p.id));
            pages
        })
        .await
    }

    async fn delete_page_rows(&mut self, page_ids: &[PageId]) -> StoreResult<u64> {
        let targets: HashSet<PageId> = page_ids.iter().copied().collect();
        self.write(move |t| {
            let before = t.pages.len();
            t.pages.retain(|id, _| !targets.contains(id));
            t.elements.retain(|_, e| !targets.contains(&e.page_id));
            Ok((before - t.pages.len()) as u64)
        })
        .await
    }

    async fn insert_element(&mut self, element: &InsertElement) -> StoreResult<Element> {
        self.take_deadlock()?;
        let now = Utc::now();
        let row = Element {
            id: self.shared.sequences.element.fetch_add(1, Ordering::SeqCst),
            page_id: element.page_id,
            parent_id: element.parent_id,
            order: element.order,
            element_type: element.element_type.clone(),
            content: element.content.clone(),
            styles: element.styles.clone(),
            attributes: element.attributes.clone(),
            created_at: now,
            updated_at: now,
        };
        self.write(move |t| {
            if !t.pages.contains_key(&row.page_id) {
                return Err(StoreError::Constraint(format!(
                    "page {} does not exist",
                    row.page_id
                )));
            }
            check_parent(t, row.parent_id)?;
            t.elements.insert(row.id, row.clone());
            Ok(row)
        })
        .await
    }

    async fn get_element(&mut self, id: ElementId) -> StoreResult<Option<Element>> {
        self.read(|t| t.elements.get(&id).cloned()).await
    }

    async fn list_elements(&mut self, page_ids: &[PageId]) -> StoreResult<Vec<Element>> {
        let pages: HashSet<PageId> = page_ids.iter().copied().collect();
        self.read(move |t| {
            let mut elements: Vec<Element> = t
                .elements
                .values()
                .filter(|e| pages.contains(&e.page_id))
                .cloned()
                .collect();
            elements.sort_by_key(|e| (e.page_id, e.order, e.id));
            elements
        })
        .await
    }

    async fn update_element(
        &mut self,
        id: ElementId,
        patch: &ElementPatch,
    ) -> StoreResult<Option<Element>> {
        self.take_deadlock()?;
        let patch = patch.clone();
        self.write(move |t| {
            if let Some(parent_id) = patch.parent_id {
                check_parent(t, parent_id)?;
            }
            let Some(element) = t.elements.get_mut(&id) else {
                return Ok(None);
            };
            patch.apply_to(element);
            element.updated_at = Utc::now();
            Ok(Some(element.clone()))
        })
        .await
    }

    async fn delete_elements(&mut self, ids: &[ElementId]) -> StoreResult<u64> {
        self.take_deadlock()?;
        let fail_after = self.shared.faults.lock().fail_delete_after.take();
        let ids = ids.to_vec();
        self.write(move |t| {
            let mut removed = HashSet::new();
            for id in ids {
                if fail_after.is_some_and(|limit| removed.len() >= limit) {
                    return Err(StoreError::Internal(format!(
                        "connection lost after deleting {} rows (injected)",
                        removed.len()
                    )));
                }
                if t.elements.remove(&id).is_some() {
                    removed.insert(id);
                }
            }
            check_dangling_children(t, &removed)?;
            Ok(removed.len() as u64)
        })
        .await
    }

    async fn delete_elements_on_pages(&mut self, page_ids: &[PageId]) -> StoreResult<u64> {
        let pages: HashSet<PageId> = page_ids.iter().copied().collect();
        self.write(move |t| {
            let before = t.elements.len();
            t.elements.retain(|_, e| !pages.contains(&e.page_id));
            Ok((before - t.elements.len()) as u64)
        })
        .await
    }

    async fn max_sibling_order(
        &mut self,
        page_id: PageId,
        parent_id: Option<ElementId>,
    ) -> StoreResult<Option<i32>> {
        self.read(move |t| {
            t.elements
                .values()
                .filter(|e| e.page_id == page_id && e.parent_id == parent_id)
                .map(|e| e.order)
                .max()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IsolationLevel;

    async fn seeded() -> (MemoryStore, MemoryConnection, PageId) {
        let store = MemoryStore::new();
        let mut conn = store.acquire().await.unwrap();
        conn.upsert_user(&User {
            id: "u1".into(),
            email: None,
            name: None,
        })
        .await
        .unwrap();
        let project = conn
            .insert_project("u1", &NewProject {
                name: "Site".into(),
                description: None,
            })
            .await
            .unwrap();
        let page = conn.insert_page(project.id, "Home", "home", 0).await.unwrap();
        (store, conn, page.id)
    }

    fn element(page_id: PageId, parent_id: Option<ElementId>) -> InsertElement {
        InsertElement {
            page_id,
            parent_id,
            order: 0,
            element_type: "div".into(),
            content: None,
            styles: Default::default(),
            attributes: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_rollback_to_savepoint_keeps_earlier_work() {
        let (store, mut conn, page_id) = seeded().await;

        conn.execute_control(&TxStatement::Begin(IsolationLevel::ReadCommitted))
            .await
            .unwrap();
        conn.insert_element(&element(page_id, None)).await.unwrap();
        conn.execute_control(&TxStatement::Savepoint("sp_1_inner".into()))
            .await
            .unwrap();
        conn.insert_element(&element(page_id, None)).await.unwrap();
        conn.execute_control(&TxStatement::RollbackToSavepoint("sp_1_inner".into()))
            .await
            .unwrap();
        assert_eq!(conn.list_elements(&[page_id]).await.unwrap().len(), 1);

        // Uncommitted rows are invisible to the store
        assert_eq!(store.counts().elements, 0);

        conn.execute_control(&TxStatement::Commit).await.unwrap();
        assert_eq!(store.counts().elements, 1);
    }

    #[tokio::test]
    async fn test_failed_autocommit_statement_changes_nothing() {
        let (store, mut conn, page_id) = seeded().await;
        let root = conn.insert_element(&element(page_id, None)).await.unwrap();
        let child = conn
            .insert_element(&element(page_id, Some(root.id)))
            .await
            .unwrap();

        store.fail_delete_after(1);
        let err = conn.delete_elements(&[child.id, root.id]).await.unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)));
        assert_eq!(store.counts().elements, 2);
    }

    #[tokio::test]
    async fn test_deleting_a_parent_alone_violates_reference() {
        let (_store, mut conn, page_id) = seeded().await;
        let root = conn.insert_element(&element(page_id, None)).await.unwrap();
        conn.insert_element(&element(page_id, Some(root.id)))
            .await
            .unwrap();

        let err = conn.delete_elements(&[root.id]).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_duplicate_slug_is_a_constraint_violation() {
        let (_store, mut conn, page_id) = seeded().await;
        let page = conn.get_page(page_id).await.unwrap().unwrap();
        let err = conn
            .insert_page(page.project_id, "Home again", "home", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_dropped_connection_discards_open_transaction() {
        let (store, _conn, page_id) = seeded().await;
        {
            let mut conn = store.acquire().await.unwrap();
            conn.execute_control(&TxStatement::Begin(IsolationLevel::ReadCommitted))
                .await
                .unwrap();
            conn.insert_element(&element(page_id, None)).await.unwrap();
        }
        assert_eq!(store.counts().elements, 0);

        // The write gate was released with the connection
        let mut conn = store.acquire().await.unwrap();
        conn.insert_element(&element(page_id, None)).await.unwrap();
        assert_eq!(store.counts().elements, 1);
    }
}
