use crate::model::{
    Element, ElementId, ElementPatch, InsertElement, NewProject, Page, PageId, Project, ProjectId,
    ProjectUpdate, User,
};
use crate::store::{StoreResult, TxStatement};

/// One database connection. Statements run inside whatever transaction the
/// owning [`Session`](crate::store::Session) has opened on it.
#[async_trait::async_trait]
pub trait Connection: Send + 'static {
    /// Issue BEGIN/COMMIT/ROLLBACK/SAVEPOINT statements
    async fn execute_control(&mut self, statement: &TxStatement) -> StoreResult<()>;

    async fn upsert_user(&mut self, user: &User) -> StoreResult<()>;

    async fn insert_project(&mut self, owner_id: &str, project: &NewProject) -> StoreResult<Project>;
    async fn get_project(&mut self, id: ProjectId) -> StoreResult<Option<Project>>;
    /// Projects of one owner, oldest first
    async fn list_projects(&mut self, owner_id: &str) -> StoreResult<Vec<Project>>;
    async fn update_project(
        &mut self,
        id: ProjectId,
        update: &ProjectUpdate,
    ) -> StoreResult<Option<Project>>;
    async fn delete_project_row(&mut self, id: ProjectId) -> StoreResult<bool>;

    async fn insert_page(
        &mut self,
        project_id: ProjectId,
        name: &str,
        slug: &str,
        order: i32,
    ) -> StoreResult<Page>;
    async fn get_page(&mut self, id: PageId) -> StoreResult<Option<Page>>;
    /// Pages of a project ordered by `(order, id)`
    async fn list_pages(&mut self, project_id: ProjectId) -> StoreResult<Vec<Page>>;
    async fn delete_page_rows(&mut self, page_ids: &[PageId]) -> StoreResult<u64>;

    async fn insert_element(&mut self, element: &InsertElement) -> StoreResult<Element>;
    async fn get_element(&mut self, id: ElementId) -> StoreResult<Option<Element>>;
    /// Every element on the given pages, ordered by `(page_id, order, id)`
    async fn list_elements(&mut self, page_ids: &[PageId]) -> StoreResult<Vec<Element>>;
    async fn update_element(
        &mut self,
        id: ElementId,
        patch: &ElementPatch,
    ) -> StoreResult<Option<Element>>;
    /// Delete a set of elements with a single statement
    async fn delete_elements(&mut self, ids: &[ElementId]) -> StoreResult<u64>;
    async fn delete_elements_on_pages(&mut self, page_ids: &[PageId]) -> StoreResult<u64>;
    /// Highest `order` among the children of `parent_id` (roots when `None`)
    async fn max_sibling_order(
        &mut self,
        page_id: PageId,
        parent_id: Option<ElementId>,
    ) -> StoreResult<Option<i32>>;
}

/// Hands out connections, one per logical operation
#[async_trait::async_trait]
pub trait ConnectionSource: Clone + Send + Sync + 'static {
    type Conn: Connection;

    async fn acquire(&self) -> StoreResult<Self::Conn>;
}
