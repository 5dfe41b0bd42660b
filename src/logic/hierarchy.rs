//! Element trees: CRUD plus the bulk operations over whole subtrees, pages and
//! projects.
//!
//! [`TreeOps`] runs against a caller-supplied [`Session`], so several operations
//! can share one transaction. [`HierarchyStore`] acquires a fresh session per
//! call for callers that don't need that.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::logic::access;
use crate::logic::tree::PageTree;
use crate::model::{
    is_valid_slug, Element, ElementId, ElementNode, ElementPatch, ElementUpdate, InsertElement,
    NewElement, NewPage, NewProject, Page, PageId, ParentRef, Project, ProjectId, ProjectUpdate,
    User,
};
use crate::store::{
    Connection, ConnectionSource, Session, StoreError, StoreResult, TransactionManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyLimits {
    /// Deepest level a subtree delete or tree read will walk, the root being level 0
    pub max_tree_depth: usize,
    /// Most items accepted by one batch create or update
    pub max_batch_size: usize,
}

impl Default for HierarchyLimits {
    fn default() -> Self {
        Self {
            max_tree_depth: 100,
            max_batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateSummary {
    pub project_id: ProjectId,
    pub pages: usize,
    pub elements: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteProjectSummary {
    pub project_id: ProjectId,
    pub pages: u64,
    pub elements: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    MissingParent,
    CrossPageParent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanElement {
    pub element_id: ElementId,
    pub page_id: PageId,
    pub parent_id: ElementId,
    pub reason: OrphanReason,
}

/// Read-only findings for one project. Nothing is repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub project_id: ProjectId,
    pub project_exists: bool,
    pub page_count: usize,
    pub element_count: usize,
    pub orphans: Vec<OrphanElement>,
    pub cycles: Vec<ElementId>,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.project_exists && self.orphans.is_empty() && self.cycles.is_empty()
    }
}

fn require_element_type(element_type: &str) -> StoreResult<String> {
    let trimmed = element_type.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation(
            "element type must not be empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

fn require_name(what: &str, name: &str) -> StoreResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation(format!("{} name must not be empty", what)));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TreeOps {
    tx: TransactionManager,
    limits: HierarchyLimits,
}

impl TreeOps {
    pub fn new(tx: TransactionManager, limits: HierarchyLimits) -> Self {
        Self { tx, limits }
    }

    pub fn tx(&self) -> TransactionManager {
        self.tx
    }

    pub fn limits(&self) -> HierarchyLimits {
        self.limits
    }

    fn check_batch_size(&self, size: usize) -> StoreResult<()> {
        if size > self.limits.max_batch_size {
            return Err(StoreError::BatchTooLarge {
                size,
                limit: self.limits.max_batch_size,
            });
        }
        Ok(())
    }

    // ---- projects ----

    pub async fn create_project<C: Connection>(
        self,
        session: &mut Session<C>,
        owner: User,
        project: NewProject,
    ) -> StoreResult<Project> {
        let project = NewProject {
            name: require_name("project", &project.name)?,
            description: project.description,
        };
        self.tx
            .with_transaction(session, "create_project", move |s| {
                Box::pin(async move {
                    s.upsert_user(&owner).await?;
                    let created = s.insert_project(&owner.id, &project).await?;
                    log::info!("Created project {} for '{}'", created.id, owner.id);
                    Ok(created)
                })
            })
            .await
    }

    pub async fn get_project<C: Connection>(
        self,
        session: &mut Session<C>,
        project_id: ProjectId,
    ) -> StoreResult<Project> {
        session
            .get_project(project_id)
            .await?
            .ok_or_else(|| StoreError::not_found("project", project_id))
    }

    pub async fn list_projects<C: Connection>(
        self,
        session: &mut Session<C>,
        owner_id: &str,
    ) -> StoreResult<Vec<Project>> {
        session.list_projects(owner_id).await
    }

    pub async fn update_project<C: Connection>(
        self,
        session: &mut Session<C>,
        project_id: ProjectId,
        mut update: ProjectUpdate,
    ) -> StoreResult<Project> {
        if let Some(name) = &update.name {
            update.name = Some(require_name("project", name)?);
        }
        session
            .update_project(project_id, &update)
            .await?
            .ok_or_else(|| StoreError::not_found("project", project_id))
    }

    /// Remove a project with all of its pages and elements, retrying on deadlock
    pub async fn delete_project<C: Connection>(
        self,
        session: &mut Session<C>,
        project_id: ProjectId,
    ) -> StoreResult<DeleteProjectSummary> {
        let retry = self.tx.deadlock_retry();
        self.tx
            .with_retryable_transaction(session, "delete_project", retry, move |s| {
                Box::pin(self.delete_project_in(s, project_id))
            })
            .await
    }

    async fn delete_project_in<C: Connection>(
        self,
        s: &mut Session<C>,
        project_id: ProjectId,
    ) -> StoreResult<DeleteProjectSummary> {
        if s.get_project(project_id).await?.is_none() {
            return Err(StoreError::not_found("project", project_id));
        }
        let page_ids: Vec<PageId> = s
            .list_pages(project_id)
            .await?
            .iter()
            .map(|p| p.id)
            .collect();

        let elements = s.delete_elements_on_pages(&page_ids).await?;
        let pages = s.delete_page_rows(&page_ids).await?;
        s.delete_project_row(project_id).await?;

        log::info!(
            "Deleted project {} ({} pages, {} elements)",
            project_id,
            pages,
            elements
        );
        Ok(DeleteProjectSummary {
            project_id,
            pages,
            elements,
        })
    }

    /// Copy a project, its pages and every element tree under fresh ids.
    /// `name` defaults to the source name with a " (copy)" suffix.
    pub async fn duplicate_project<C: Connection>(
        self,
        session: &mut Session<C>,
        project_id: ProjectId,
        name: Option<String>,
    ) -> StoreResult<DuplicateSummary> {
        let name = name.map(|n| require_name("project", &n)).transpose()?;
        let retry = self.tx.deadlock_retry();
        self.tx
            .with_retryable_transaction(session, "duplicate_project", retry, move |s| {
                Box::pin(self.duplicate_project_in(s, project_id, name.clone()))
            })
            .await
    }

    async fn duplicate_project_in<C: Connection>(
        self,
        s: &mut Session<C>,
        project_id: ProjectId,
        name: Option<String>,
    ) -> StoreResult<DuplicateSummary> {
        let source = s
            .get_project(project_id)
            .await?
            .ok_or_else(|| StoreError::not_found("project", project_id))?;

        let copy = s
            .insert_project(
                &source.owner_id,
                &NewProject {
                    name: name.unwrap_or_else(|| format!("{} (copy)", source.name)),
                    description: source.description.clone(),
                },
            )
            .await?;

        let pages = s.list_pages(project_id).await?;
        let mut page_map: HashMap<PageId, PageId> = HashMap::with_capacity(pages.len());
        for page in &pages {
            let new_page = s
                .insert_page(copy.id, &page.name, &page.slug, page.order)
                .await?;
            page_map.insert(page.id, new_page.id);
        }

        let page_ids: Vec<PageId> = pages.iter().map(|p| p.id).collect();
        let tree = PageTree::new(s.list_elements(&page_ids).await?);
        let ordered = tree.copy_order()?;

        let mut id_map: HashMap<Option<ElementId>, Option<ElementId>> = HashMap::from([(None, None)]);
        for element in ordered {
            let parent_id = *id_map.get(&element.parent_id).ok_or_else(|| {
                StoreError::Integrity(format!(
                    "element {} copied before its parent {:?}",
                    element.id, element.parent_id
                ))
            })?;
            let page_id = *page_map.get(&element.page_id).ok_or_else(|| {
                StoreError::Integrity(format!(
                    "element {} belongs to unknown page {}",
                    element.id, element.page_id
                ))
            })?;
            let inserted = s
                .insert_element(&InsertElement::copy_of(element, page_id, parent_id))
                .await?;
            id_map.insert(Some(element.id), Some(inserted.id));
        }

        let summary = DuplicateSummary {
            project_id: copy.id,
            pages: page_map.len(),
            elements: id_map.len() - 1,
        };
        log::info!(
            "Duplicated project {} into {} ({} pages, {} elements)",
            project_id,
            copy.id,
            summary.pages,
            summary.elements
        );
        Ok(summary)
    }

    pub async fn check_integrity<C: Connection>(
        self,
        session: &mut Session<C>,
        project_id: ProjectId,
    ) -> StoreResult<IntegrityReport> {
        let mut report = IntegrityReport {
            project_id,
            project_exists: false,
            page_count: 0,
            element_count: 0,
            orphans: Vec::new(),
            cycles: Vec::new(),
        };
        if session.get_project(project_id).await?.is_none() {
            return Ok(report);
        }
        report.project_exists = true;

        let page_ids: Vec<PageId> = session
            .list_pages(project_id)
            .await?
            .iter()
            .map(|p| p.id)
            .collect();
        let elements = session.list_elements(&page_ids).await?;
        report.page_count = page_ids.len();
        report.element_count = elements.len();

        let pages_by_id: HashMap<ElementId, PageId> =
            elements.iter().map(|e| (e.id, e.page_id)).collect();
        for element in &elements {
            let Some(parent_id) = element.parent_id else {
                continue;
            };
            let reason = match pages_by_id.get(&parent_id) {
                None => OrphanReason::MissingParent,
                Some(&page_id) if page_id != element.page_id => OrphanReason::CrossPageParent,
                Some(_) => continue,
            };
            report.orphans.push(OrphanElement {
                element_id: element.id,
                page_id: element.page_id,
                parent_id,
                reason,
            });
        }
        report.cycles = PageTree::new(elements).cycle_members();

        if !report.is_consistent() {
            log::warn!(
                "Project {} failed integrity check: {} orphan(s), {} element(s) on cycles",
                project_id,
                report.orphans.len(),
                report.cycles.len()
            );
        }
        Ok(report)
    }

    // ---- pages ----

    pub async fn create_page<C: Connection>(
        self,
        session: &mut Session<C>,
        project_id: ProjectId,
        page: NewPage,
    ) -> StoreResult<Page> {
        let name = require_name("page", &page.name)?;
        let slug = page.resolved_slug();
        if !is_valid_slug(&slug) {
            return Err(StoreError::Validation(format!(
                "slug '{}' must be lowercase letters, digits and dashes",
                slug
            )));
        }

        self.tx
            .with_transaction(session, "create_page", move |s| {
                Box::pin(async move {
                    if s.get_project(project_id).await?.is_none() {
                        return Err(StoreError::not_found("project", project_id));
                    }
                    let order = match page.order {
                        Some(order) => order,
                        None => s
                            .list_pages(project_id)
                            .await?
                            .iter()
                            .map(|p| p.order)
                            .max()
                            .map_or(0, |max| max.saturating_add(1)),
                    };
                    s.insert_page(project_id, &name, &slug, order).await
                })
            })
            .await
    }

    pub async fn get_page<C: Connection>(
        self,
        session: &mut Session<C>,
        page_id: PageId,
    ) -> StoreResult<Page> {
        session
            .get_page(page_id)
            .await?
            .ok_or_else(|| StoreError::not_found("page", page_id))
    }

    pub async fn list_pages<C: Connection>(
        self,
        session: &mut Session<C>,
        project_id: ProjectId,
    ) -> StoreResult<Vec<Page>> {
        self.get_project(session, project_id).await?;
        session.list_pages(project_id).await
    }

    /// Delete a page and all of its elements, returning the element count
    pub async fn delete_page<C: Connection>(
        self,
        session: &mut Session<C>,
        page_id: PageId,
    ) -> StoreResult<u64> {
        self.tx
            .with_transaction(session, "delete_page", move |s| {
                Box::pin(async move {
                    if s.get_page(page_id).await?.is_none() {
                        return Err(StoreError::not_found("page", page_id));
                    }
                    let elements = s.delete_elements_on_pages(&[page_id]).await?;
                    s.delete_page_rows(&[page_id]).await?;
                    log::info!("Deleted page {} ({} elements)", page_id, elements);
                    Ok(elements)
                })
            })
            .await
    }

    // ---- elements ----

    pub async fn get_element<C: Connection>(
        self,
        session: &mut Session<C>,
        element_id: ElementId,
    ) -> StoreResult<Element> {
        session
            .get_element(element_id)
            .await?
            .ok_or_else(|| StoreError::not_found("element", element_id))
    }

    pub async fn list_elements<C: Connection>(
        self,
        session: &mut Session<C>,
        page_id: PageId,
    ) -> StoreResult<Vec<Element>> {
        self.get_page(session, page_id).await?;
        session.list_elements(&[page_id]).await
    }

    /// The page's element forest, siblings ordered by `(order, id)`
    pub async fn page_tree<C: Connection>(
        self,
        session: &mut Session<C>,
        page_id: PageId,
    ) -> StoreResult<Vec<ElementNode>> {
        let elements = self.list_elements(session, page_id).await?;
        PageTree::new(elements).ordered_forest(self.limits.max_tree_depth)
    }

    pub async fn create_element<C: Connection>(
        self,
        session: &mut Session<C>,
        page_id: PageId,
        element: NewElement,
    ) -> StoreResult<Element> {
        if matches!(element.parent, Some(ParentRef::BatchIndex(_))) {
            return Err(StoreError::Validation(
                "a batch index parent is only valid inside a batch".to_string(),
            ));
        }
        self.batch_create(session, page_id, vec![element])
            .await?
            .pop()
            .ok_or_else(|| StoreError::Internal("insert returned no row".to_string()))
    }

    /// Insert every element or none. Parents may be existing elements or earlier
    /// entries of the same batch.
    pub async fn batch_create<C: Connection>(
        self,
        session: &mut Session<C>,
        page_id: PageId,
        elements: Vec<NewElement>,
    ) -> StoreResult<Vec<Element>> {
        self.check_batch_size(elements.len())?;
        if elements.is_empty() {
            return Ok(Vec::new());
        }
        self.tx
            .with_transaction(session, "batch_create", move |s| {
                Box::pin(self.batch_create_in(s, page_id, elements))
            })
            .await
    }

    async fn batch_create_in<C: Connection>(
        self,
        s: &mut Session<C>,
        page_id: PageId,
        elements: Vec<NewElement>,
    ) -> StoreResult<Vec<Element>> {
        if s.get_page(page_id).await?.is_none() {
            return Err(StoreError::not_found("page", page_id));
        }

        let mut verified_parents: HashSet<ElementId> = HashSet::new();
        let mut next_order: HashMap<Option<ElementId>, i32> = HashMap::new();
        let mut created: Vec<Element> = Vec::with_capacity(elements.len());

        for (index, item) in elements.into_iter().enumerate() {
            let element_type = require_element_type(&item.element_type)?;

            let parent_id = match item.parent {
                None => None,
                Some(ParentRef::BatchIndex(earlier)) => match created.get(earlier) {
                    Some(parent) if earlier < index => Some(parent.id),
                    _ => {
                        return Err(StoreError::Validation(format!(
                            "entry {} references batch index {}, which is not an earlier entry",
                            index, earlier
                        )))
                    }
                },
                Some(ParentRef::Element(parent_id)) => {
                    if verified_parents.insert(parent_id) {
                        Self::check_parent(s, page_id, parent_id).await?;
                    }
                    Some(parent_id)
                }
            };

            let next = match next_order.get(&parent_id) {
                Some(&next) => next,
                None => s
                    .max_sibling_order(page_id, parent_id)
                    .await?
                    .map_or(0, |max| max.saturating_add(1)),
            };
            let order = item.order.unwrap_or(next);
            next_order.insert(parent_id, next.max(order.saturating_add(1)));

            let row = s
                .insert_element(&InsertElement {
                    page_id,
                    parent_id,
                    order,
                    element_type,
                    content: item.content,
                    styles: item.styles,
                    attributes: item.attributes,
                })
                .await?;
            created.push(row);
        }

        log::debug!("Created {} element(s) on page {}", created.len(), page_id);
        Ok(created)
    }

    async fn check_parent<C: Connection>(
        s: &mut Session<C>,
        page_id: PageId,
        parent_id: ElementId,
    ) -> StoreResult<()> {
        match s.get_element(parent_id).await? {
            Some(parent) if parent.page_id == page_id => Ok(()),
            Some(parent) => Err(StoreError::Validation(format!(
                "parent element {} is on page {}, not page {}",
                parent_id, parent.page_id, page_id
            ))),
            None => Err(StoreError::Validation(format!(
                "parent element {} does not exist",
                parent_id
            ))),
        }
    }

    pub async fn update_element<C: Connection>(
        self,
        session: &mut Session<C>,
        element_id: ElementId,
        patch: ElementPatch,
    ) -> StoreResult<Element> {
        self.tx
            .with_transaction(session, "update_element", move |s| {
                Box::pin(async move {
                    let update = ElementUpdate {
                        id: element_id,
                        patch,
                    };
                    self.batch_update_in(s, vec![update]).await?;
                    self.get_element(s, element_id).await
                })
            })
            .await
    }

    /// Apply partial updates atomically and return how many distinct elements changed
    pub async fn batch_update<C: Connection>(
        self,
        session: &mut Session<C>,
        updates: Vec<ElementUpdate>,
    ) -> StoreResult<usize> {
        self.check_batch_size(updates.len())?;
        if updates.is_empty() {
            return Ok(0);
        }
        self.tx
            .with_transaction(session, "batch_update", move |s| {
                Box::pin(self.batch_update_in(s, updates))
            })
            .await
    }

    async fn batch_update_in<C: Connection>(
        self,
        s: &mut Session<C>,
        updates: Vec<ElementUpdate>,
    ) -> StoreResult<usize> {
        let mut pages = BTreeSet::new();
        for update in &updates {
            let element = s
                .get_element(update.id)
                .await?
                .ok_or_else(|| StoreError::not_found("element", update.id))?;
            pages.insert(element.page_id);
        }
        let page_ids: Vec<PageId> = pages.into_iter().collect();
        let mut tree = PageTree::new(s.list_elements(&page_ids).await?);

        // Moves are checked in order against the snapshot as it evolves
        for update in &updates {
            if let Some(element_type) = &update.patch.element_type {
                require_element_type(element_type)?;
            }
            let Some(new_parent) = update.patch.parent_id else {
                continue;
            };
            if let Some(parent_id) = new_parent {
                let page_id = tree
                    .get(update.id)
                    .map(|e| e.page_id)
                    .ok_or_else(|| StoreError::not_found("element", update.id))?;
                match tree.get(parent_id) {
                    Some(parent) if parent.page_id == page_id => {}
                    _ => Self::check_parent(s, page_id, parent_id).await?,
                }
                if tree.is_ancestor_or_self(update.id, parent_id) {
                    return Err(StoreError::Constraint(format!(
                        "moving element {} under {} would create a cycle",
                        update.id, parent_id
                    )));
                }
            }
            tree.set_parent(update.id, new_parent);
        }

        // Every target exists at this point, so an empty patch still counts
        let mut affected = HashSet::new();
        for update in &updates {
            if !update.patch.is_empty() {
                s.update_element(update.id, &update.patch)
                    .await?
                    .ok_or_else(|| StoreError::not_found("element", update.id))?;
            }
            affected.insert(update.id);
        }
        Ok(affected.len())
    }

    /// Delete an element and all of its descendants, returning the count
    pub async fn delete_subtree<C: Connection>(
        self,
        session: &mut Session<C>,
        element_id: ElementId,
    ) -> StoreResult<u64> {
        self.tx
            .with_transaction(session, "delete_subtree", move |s| {
                Box::pin(self.delete_subtree_in(s, element_id))
            })
            .await
    }

    async fn delete_subtree_in<C: Connection>(
        self,
        s: &mut Session<C>,
        element_id: ElementId,
    ) -> StoreResult<u64> {
        let root = self.get_element(s, element_id).await?;
        let tree = PageTree::new(s.list_elements(&[root.page_id]).await?);
        let ids = tree.collect_subtree(element_id, self.limits.max_tree_depth)?;

        let deleted = s.delete_elements(&ids).await?;
        log::info!(
            "Deleted subtree of element {} on page {} ({} elements)",
            element_id,
            root.page_id,
            deleted
        );
        Ok(deleted)
    }

    /// Delete every element on a page, keeping the page
    pub async fn delete_page_elements<C: Connection>(
        self,
        session: &mut Session<C>,
        page_id: PageId,
    ) -> StoreResult<u64> {
        self.tx
            .with_transaction(session, "delete_page_elements", move |s| {
                Box::pin(async move {
                    if s.get_page(page_id).await?.is_none() {
                        return Err(StoreError::not_found("page", page_id));
                    }
                    s.delete_elements_on_pages(&[page_id]).await
                })
            })
            .await
    }
}

/// [`TreeOps`] bound to a connection source, one session per call
#[derive(Debug, Clone)]
pub struct HierarchyStore<S> {
    source: S,
    ops: TreeOps,
}

impl<S: ConnectionSource> HierarchyStore<S> {
    pub fn new(source: S, tx: TransactionManager, limits: HierarchyLimits) -> Self {
        Self {
            source,
            ops: TreeOps::new(tx, limits),
        }
    }

    pub fn ops(&self) -> TreeOps {
        self.ops
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn session(&self) -> StoreResult<Session<S::Conn>> {
        Ok(Session::new(self.source.acquire().await?))
    }

    pub async fn authorize_project(&self, actor: &str, project_id: ProjectId) -> StoreResult<Project> {
        let mut session = self.session().await?;
        access::authorize_project(&mut session, actor, project_id).await
    }

    pub async fn authorize_page(&self, actor: &str, page_id: PageId) -> StoreResult<Page> {
        let mut session = self.session().await?;
        access::authorize_page(&mut session, actor, page_id).await
    }

    pub async fn authorize_element(&self, actor: &str, element_id: ElementId) -> StoreResult<Element> {
        let mut session = self.session().await?;
        access::authorize_element(&mut session, actor, element_id).await
    }

    pub async fn create_project(&self, owner: User, project: NewProject) -> StoreResult<Project> {
        let mut session = self.session().await?;
        self.ops.create_project(&mut session, owner, project).await
    }

    pub async fn get_project(&self, project_id: ProjectId) -> StoreResult<Project> {
        let mut session = self.session().await?;
        self.ops.get_project(&mut session, project_id).await
    }

    pub async fn list_projects(&self, owner_id: &str) -> StoreResult<Vec<Project>> {
        let mut session = self.session().await?;
        self.ops.list_projects(&mut session, owner_id).await
    }

    pub async fn update_project(
        &self,
        project_id: ProjectId,
        update: ProjectUpdate,
    ) -> StoreResult<Project> {
        let mut session = self.session().await?;
        self.ops.update_project(&mut session, project_id, update).await
    }

    pub async fn delete_project(&self, project_id: ProjectId) -> StoreResult<DeleteProjectSummary> {
        let mut session = self.session().await?;
        self.ops.delete_project(&mut session, project_id).await
    }

    pub async fn duplicate_project(
        &self,
        project_id: ProjectId,
        name: Option<String>,
    ) -> StoreResult<DuplicateSummary> {
        let mut session = self.session().await?;
        self.ops.duplicate_project(&mut session, project_id, name).await
    }

    pub async fn check_integrity(&self, project_id: ProjectId) -> StoreResult<IntegrityReport> {
        let mut session = self.session().await?;
        self.ops.check_integrity(&mut session, project_id).await
    }

    pub async fn create_page(&self, project_id: ProjectId, page: NewPage) -> StoreResult<Page> {
        let mut session = self.session().await?;
        self.ops.create_page(&mut session, project_id, page).await
    }

    pub async fn get_page(&self, page_id: PageId) -> StoreResult<Page> {
        let mut session = self.session().await?;
        self.ops.get_page(&mut session, page_id).await
    }

    pub async fn list_pages(&self, project_id: ProjectId) -> StoreResult<Vec<Page>> {
        let mut session = self.session().await?;
        self.ops.list_pages(&mut session, project_id).await
    }

    pub async fn delete_page(&self, page_id: PageId) -> StoreResult<u64> {
        let mut session = self.session().await?;
        self.ops.delete_page(&mut session, page_id).await
    }

    pub async fn create_element(&self, page_id: PageId, element: NewElement) -> StoreResult<Element> {
        let mut session = self.session().await?;
        self.ops.create_element(&mut session, page_id, element).await
    }

    pub async fn get_element(&self, element_id: ElementId) -> StoreResult<Element> {
        let mut session = self.session().await?;
        self.ops.get_element(&mut session, element_id).await
    }

    pub async fn list_elements(&self, page_id: PageId) -> StoreResult<Vec<Element>> {
        let mut session = self.session().await?;
        self.ops.list_elements(&mut session, page_id).await
    }

    pub async fn page_tree(&self, page_id: PageId) -> StoreResult<Vec<ElementNode>> {
        let mut session = self.session().await?;
        self.ops.page_tree(&mut session, page_id).await
    }

    pub async fn update_element(
        &self,
        element_id: ElementId,
        patch: ElementPatch,
    ) -> StoreResult<Element> {
        let mut session = self.session().await?;
        self.ops.update_element(&mut session, element_id, patch).await
    }

    pub async fn delete_subtree(&self, element_id: ElementId) -> StoreResult<u64> {
        let mut session = self.session().await?;
        self.ops.delete_subtree(&mut session, element_id).await
    }

    pub async fn batch_create(
        &self,
        page_id: PageId,
        elements: Vec<NewElement>,
    ) -> StoreResult<Vec<Element>> {
        let mut session = self.session().await?;
        self.ops.batch_create(&mut session, page_id, elements).await
    }

    pub async fn batch_update(&self, updates: Vec<ElementUpdate>) -> StoreResult<usize> {
        let mut session = self.session().await?;
        self.ops.batch_update(&mut session, updates).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ErrorKind, MemoryStore};

    fn owner() -> User {
        User {
            id: "owner".to_string(),
            email: None,
            name: None,
        }
    }

    async fn store_with_page() -> (HierarchyStore<MemoryStore>, MemoryStore, Project, Page) {
        let memory = MemoryStore::new();
        let store = HierarchyStore::new(
            memory.clone(),
            TransactionManager::default(),
            HierarchyLimits {
                max_tree_depth: 5,
                max_batch_size: 10,
            },
        );
        let project = store
            .create_project(
                owner(),
                NewProject {
                    name: "Site".to_string(),
                    description: None,
                },
            )
            .await
            .unwrap();
        let page = store
            .create_page(project.id, NewPage::new("Home"))
            .await
            .unwrap();
        (store, memory, project, page)
    }

    #[tokio::test]
    async fn test_batch_create_resolves_batch_parents_and_appends() {
        let (store, _memory, _project, page) = store_with_page().await;
        let existing = store
            .create_element(page.id, NewElement::new("section").with_order(7))
            .await
            .unwrap();

        let created = store
            .batch_create(
                page.id,
                vec![
                    NewElement::new("div"),
                    NewElement::new("p").with_parent(ParentRef::BatchIndex(0)),
                    NewElement::new("p").with_parent(ParentRef::BatchIndex(0)),
                    NewElement::new("span").with_parent(ParentRef::Element(existing.id)),
                ],
            )
            .await
            .unwrap();

        assert_eq!(created[0].order, 8);
        assert_eq!(created[1].parent_id, Some(created[0].id));
        assert_eq!((created[1].order, created[2].order), (0, 1));
        assert_eq!(created[3].parent_id, Some(existing.id));
    }

    #[tokio::test]
    async fn test_batch_create_is_all_or_nothing() {
        let (store, memory, _project, page) = store_with_page().await;
        let err = store
            .batch_create(
                page.id,
                vec![
                    NewElement::new("div"),
                    NewElement::new("p").with_parent(ParentRef::BatchIndex(5)),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(memory.counts().elements, 0);
    }

    #[tokio::test]
    async fn test_batch_ceiling() {
        let (store, _memory, _project, page) = store_with_page().await;
        let items = (0..11).map(|_| NewElement::new("div")).collect();
        assert!(matches!(
            store.batch_create(page.id, items).await,
            Err(StoreError::BatchTooLarge { size: 11, limit: 10 })
        ));
    }

    #[tokio::test]
    async fn test_batch_update_rejects_cycles_and_counts_distinct_ids() {
        let (store, memory, _project, page) = store_with_page().await;
        let created = store
            .batch_create(
                page.id,
                vec![
                    NewElement::new("div"),
                    NewElement::new("div").with_parent(ParentRef::BatchIndex(0)),
                ],
            )
            .await
            .unwrap();
        let (a, b) = (created[0].id, created[1].id);

        let err = store
            .batch_update(vec![ElementUpdate {
                id: a,
                patch: ElementPatch::move_to(Some(b)),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));

        let changed = store
            .batch_update(vec![
                ElementUpdate {
                    id: b,
                    patch: ElementPatch::content("hello"),
                },
                ElementUpdate {
                    id: b,
                    patch: ElementPatch::move_to(None),
                },
                ElementUpdate {
                    id: a,
                    patch: ElementPatch::default(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(changed, 2);

        let b_row = store.get_element(b).await.unwrap();
        assert_eq!(b_row.parent_id, None);
        assert_eq!(b_row.content.as_deref(), Some("hello"));
        assert_eq!(memory.counts().elements, 2);
    }

    #[tokio::test]
    async fn test_batch_update_counts_targets_with_empty_patches() {
        let (store, _memory, _project, page) = store_with_page().await;
        let a = store
            .create_element(page.id, NewElement::new("div"))
            .await
            .unwrap();
        let b = store
            .create_element(page.id, NewElement::new("p"))
            .await
            .unwrap();

        let changed = store
            .batch_update(vec![
                ElementUpdate {
                    id: a.id,
                    patch: ElementPatch::default(),
                },
                ElementUpdate {
                    id: b.id,
                    patch: ElementPatch::move_to(None),
                },
            ])
            .await
            .unwrap();
        assert_eq!(changed, 2);

        let err = store
            .batch_update(vec![
                ElementUpdate {
                    id: a.id,
                    patch: ElementPatch::default(),
                },
                ElementUpdate {
                    id: a.id + 1000,
                    patch: ElementPatch::default(),
                },
            ])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_move_to_other_page_is_rejected() {
        let (store, _memory, project, page) = store_with_page().await;
        let other = store
            .create_page(project.id, NewPage::new("About"))
            .await
            .unwrap();
        let a = store
            .create_element(page.id, NewElement::new("div"))
            .await
            .unwrap();
        let b = store
            .create_element(other.id, NewElement::new("div"))
            .await
            .unwrap();

        let err = store
            .update_element(a.id, ElementPatch::move_to(Some(b.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_subtree_respects_depth_ceiling() {
        let (store, memory, _project, page) = store_with_page().await;
        // Depths 0..=6 under a ceiling of 5
        let chain: Vec<NewElement> = (0..7)
            .map(|i| {
                let element = NewElement::new("div");
                if i == 0 {
                    element
                } else {
                    element.with_parent(ParentRef::BatchIndex(i - 1))
                }
            })
            .collect();
        let created = store.batch_create(page.id, chain).await.unwrap();

        assert!(matches!(
            store.delete_subtree(created[0].id).await,
            Err(StoreError::DepthExceeded { limit: 5 })
        ));
        assert_eq!(memory.counts().elements, 7);

        assert_eq!(store.delete_subtree(created[1].id).await.unwrap(), 6);
        assert_eq!(memory.counts().elements, 1);
    }

    #[tokio::test]
    async fn test_create_page_derives_slug_and_order() {
        let (store, _memory, project, page) = store_with_page().await;
        assert_eq!(page.slug, "home");
        assert_eq!(page.order, 0);

        let about = store
            .create_page(project.id, NewPage::new("About Us"))
            .await
            .unwrap();
        assert_eq!(about.slug, "about-us");
        assert_eq!(about.order, 1);

        let err = store
            .create_page(project.id, NewPage::new("Bad").with_slug("Not Valid"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_integrity_report_flags_orphans_and_cycles() {
        let (store, memory, project, page) = store_with_page().await;
        let root = store
            .create_element(page.id, NewElement::new("div"))
            .await
            .unwrap();

        let mut orphan = root.clone();
        orphan.id = 0;
        orphan.parent_id = Some(9_999);
        let orphan_id = memory.insert_unchecked(orphan);

        let mut looped = root.clone();
        looped.id = 0;
        let looped_id = memory.insert_unchecked(looped.clone());
        looped.id = looped_id;
        looped.parent_id = Some(looped_id);
        memory.insert_unchecked(looped);

        let report = store.check_integrity(project.id).await.unwrap();
        assert!(report.project_exists);
        assert_eq!(report.element_count, 3);
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].element_id, orphan_id);
        assert_eq!(report.orphans[0].reason, OrphanReason::MissingParent);
        assert_eq!(report.cycles, vec![looped_id]);
        assert!(!report.is_consistent());

        let missing = store.check_integrity(project.id + 100).await.unwrap();
        assert!(!missing.project_exists);
    }

    #[tokio::test]
    async fn test_delete_project_removes_everything() {
        let (store, memory, project, page) = store_with_page().await;
        store
            .batch_create(
                page.id,
                vec![
                    NewElement::new("div"),
                    NewElement::new("p").with_parent(ParentRef::BatchIndex(0)),
                ],
            )
            .await
            .unwrap();

        let summary = store.delete_project(project.id).await.unwrap();
        assert_eq!(summary.pages, 1);
        assert_eq!(summary.elements, 2);
        assert_eq!(memory.counts().projects, 0);
        assert!(matches!(
            store.get_project(project.id).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
