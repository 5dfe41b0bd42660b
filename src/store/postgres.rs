use anyhow::Context;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Executor, PgConnection, PgPool, Postgres, QueryBuilder, Row};

use crate::model::{
    Element, ElementId, ElementPatch, InsertElement, NewProject, Page, PageId, Project, ProjectId,
    ProjectUpdate, PropertyMap, User,
};
use crate::store::{Connection, ConnectionSource, StoreError, StoreResult, TxStatement};

const PROJECT_COLUMNS: &str = "id, owner_id, name, description, created_at, updated_at";
const PAGE_COLUMNS: &str = "id, project_id, name, slug, sort_order, created_at";
const ELEMENT_COLUMNS: &str = "id, page_id, parent_id, sort_order, element_type, content, styles, attributes, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl ConnectionSource for PostgresStore {
    type Conn = PostgresConnection;

    async fn acquire(&self) -> StoreResult<PostgresConnection> {
        let conn = self.pool.acquire().await?;
        Ok(PostgresConnection {
            conn: Some(conn),
            in_transaction: false,
        })
    }
}

/// A pooled connection. If it is dropped while a transaction is still open the
/// socket is detached from the pool and closed, so the server rolls back.
#[derive(Debug)]
pub struct PostgresConnection {
    conn: Option<PoolConnection<Postgres>>,
    in_transaction: bool,
}

impl PostgresConnection {
    fn db(&mut self) -> StoreResult<&mut PgConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| StoreError::Internal("connection already released".to_string()))
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Some(conn) = self.conn.take() {
                log::warn!("Connection dropped inside a transaction, closing it");
                drop(conn.detach());
            }
        }
    }
}

fn project_from_row(row: &PgRow) -> Result<Project, sqlx::Error> {
    Ok(Project {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn page_from_row(row: &PgRow) -> Result<Page, sqlx::Error> {
    Ok(Page {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        order: row.try_get("sort_order")?,
        created_at: row.try_get("created_at")?,
    })
}

fn element_from_row(row: &PgRow) -> Result<Element, sqlx::Error> {
    let styles: Json<PropertyMap> = row.try_get("styles")?;
    let attributes: Json<PropertyMap> = row.try_get("attributes")?;
    Ok(Element {
        id: row.try_get("id")?,
        page_id: row.try_get("page_id")?,
        parent_id: row.try_get("parent_id")?,
        order: row.try_get("sort_order")?,
        element_type: row.try_get("element_type")?,
        content: row.try_get("content")?,
        styles: styles.0,
        attributes: attributes.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait::async_trait]
impl Connection for PostgresConnection {
    async fn execute_control(&mut self, statement: &TxStatement) -> StoreResult<()> {
        let sql = statement.to_sql();
        let result = self.db()?.execute(sql.as_str()).await;
        match statement {
            TxStatement::Begin(_) => self.in_transaction = result.is_ok(),
            TxStatement::Commit | TxStatement::Rollback => self.in_transaction = false,
            _ => {}
        }
        result?;
        Ok(())
    }

    async fn upsert_user(&mut self, user: &User) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                email = COALESCE(EXCLUDED.email, users.email),
                name = COALESCE(EXCLUDED.name, users.name)
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.name)
        .execute(self.db()?)
        .await?;
        Ok(())
    }

    async fn insert_project(&mut self, owner_id: &str, project: &NewProject) -> StoreResult<Project> {
        let sql = format!(
            "INSERT INTO projects (owner_id, name, description) VALUES ($1, $2, $3) RETURNING {}",
            PROJECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(owner_id)
            .bind(&project.name)
            .bind(&project.description)
            .fetch_one(self.db()?)
            .await?;
        Ok(project_from_row(&row)?)
    }

    async fn get_project(&mut self, id: ProjectId) -> StoreResult<Option<Project>> {
        let sql = format!("SELECT {} FROM projects WHERE id = $1", PROJECT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.db()?).await?;
        Ok(row.as_ref().map(project_from_row).transpose()?)
    }

    async fn list_projects(&mut self, owner_id: &str) -> StoreResult<Vec<Project>> {
        let sql = format!(
            "SELECT {} FROM projects WHERE owner_id = $1 ORDER BY created_at, id",
            PROJECT_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(owner_id).fetch_all(self.db()?).await?;
        Ok(rows
            .iter()
            .map(project_from_row)
            .collect::<Result<_, _>>()?)
    }

    async fn update_project(
        &mut self,
        id: ProjectId,
        update: &ProjectUpdate,
    ) -> StoreResult<Option<Project>> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE projects SET updated_at = NOW()");
        if let Some(name) = &update.name {
            qb.push(", name = ").push_bind(name.clone());
        }
        if let Some(description) = &update.description {
            qb.push(", description = ").push_bind(description.clone());
        }
        qb.push(" WHERE id = ")
            .push_bind(id)
            .push(" RETURNING ")
            .push(PROJECT_COLUMNS);

        let row = qb.build().fetch_optional(self.db()?).await?;
        Ok(row.as_ref().map(project_from_row).transpose()?)
    }

    async fn delete_project_row(&mut self, id: ProjectId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(self.db()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_page(
        &mut self,
        project_id: ProjectId,
        name: &str,
        slug: &str,
        order: i32,
    ) -> StoreResult<Page> {
        let sql = format!(
            "INSERT INTO pages (project_id, name, slug, sort_order) VALUES ($1, $2, $3, $4) RETURNING {}",
            PAGE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(project_id)
            .bind(name)
            .bind(slug)
            .bind(order)
            .fetch_one(self.db()?)
            .await?;
        Ok(page_from_row(&row)?)
    }

    async fn get_page(&mut self, id: PageId) -> StoreResult<Option<Page>> {
        let sql = format!("SELECT {} FROM pages WHERE id = $1", PAGE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.db()?).await?;
        Ok(row.as_ref().map(page_from_row).transpose()?)
    }

    async fn list_pages(&mut self, project_id: ProjectId) -> StoreResult<Vec<Page>> {
        let sql = format!(
            "SELECT {} FROM pages WHERE project_id = $1 ORDER BY sort_order, id",
            PAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(project_id)
            .fetch_all(self.db()?)
            .await?;
        Ok(rows.iter().map(page_from_row).collect::<Result<_, _>>()?)
    }

    async fn delete_page_rows(&mut self, page_ids: &[PageId]) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM pages WHERE id = ANY($1)")
            .bind(page_ids)
            .execute(self.db()?)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_element(&mut self, element: &InsertElement) -> StoreResult<Element> {
        let sql = format!(
            r#"
            INSERT INTO elements (page_id, parent_id, sort_order, element_type, content, styles, attributes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            ELEMENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(element.page_id)
            .bind(element.parent_id)
            .bind(element.order)
            .bind(&element.element_type)
            .bind(&element.content)
            .bind(Json(&element.styles))
            .bind(Json(&element.attributes))
            .fetch_one(self.db()?)
            .await?;
        Ok(element_from_row(&row)?)
    }

    async fn get_element(&mut self, id: ElementId) -> StoreResult<Option<Element>> {
        let sql = format!("SELECT {} FROM elements WHERE id = $1", ELEMENT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.db()?).await?;
        Ok(row.as_ref().map(element_from_row).transpose()?)
    }

    async fn list_elements(&mut self, page_ids: &[PageId]) -> StoreResult<Vec<Element>> {
        let sql = format!(
            "SELECT {} FROM elements WHERE page_id = ANY($1) ORDER BY page_id, sort_order, id",
            ELEMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(page_ids)
            .fetch_all(self.db()?)
            .await?;
        Ok(rows
            .iter()
            .map(element_from_row)
            .collect::<Result<_, _>>()?)
    }

    async fn update_element(
        &mut self,
        id: ElementId,
        patch: &ElementPatch,
    ) -> StoreResult<Option<Element>> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE elements SET updated_at = NOW()");
        if let Some(parent_id) = patch.parent_id {
            qb.push(", parent_id = ").push_bind(parent_id);
        }
        if let Some(order) = patch.order {
            qb.push(", sort_order = ").push_bind(order);
        }
        if let Some(element_type) = &patch.element_type {
            qb.push(", element_type = ").push_bind(element_type.clone());
        }
        if let Some(content) = &patch.content {
            qb.push(", content = ").push_bind(content.clone());
        }
        if let Some(styles) = &patch.styles {
            qb.push(", styles = ").push_bind(Json(styles.clone()));
        }
        if let Some(attributes) = &patch.attributes {
            qb.push(", attributes = ").push_bind(Json(attributes.clone()));
        }
        qb.push(" WHERE id = ")
            .push_bind(id)
            .push(" RETURNING ")
            .push(ELEMENT_COLUMNS);

        let row = qb.build().fetch_optional(self.db()?).await?;
        Ok(row.as_ref().map(element_from_row).transpose()?)
    }

    async fn delete_elements(&mut self, ids: &[ElementId]) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM elements WHERE id = ANY($1)")
            .bind(ids)
            .execute(self.db()?)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_elements_on_pages(&mut self, page_ids: &[PageId]) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM elements WHERE page_id = ANY($1)")
            .bind(page_ids)
            .execute(self.db()?)
            .await?;
        Ok(result.rows_affected())
    }

    async fn max_sibling_order(
        &mut self,
        page_id: PageId,
        parent_id: Option<ElementId>,
    ) -> StoreResult<Option<i32>> {
        let row = sqlx::query(
            "SELECT MAX(sort_order) AS max_order FROM elements WHERE page_id = $1 AND parent_id IS NOT DISTINCT FROM $2",
        )
        .bind(page_id)
        .bind(parent_id)
        .fetch_one(self.db()?)
        .await?;
        Ok(row.try_get("max_order")?)
    }
}
