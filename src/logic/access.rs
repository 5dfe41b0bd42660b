use crate::model::{Element, ElementId, Page, PageId, Project, ProjectId};
use crate::store::{Connection, Session, StoreError, StoreResult};

/// The project, if it exists and `actor` owns it
pub async fn authorize_project<C: Connection>(
    session: &mut Session<C>,
    actor: &str,
    project_id: ProjectId,
) -> StoreResult<Project> {
    let project = session
        .get_project(project_id)
        .await?
        .ok_or_else(|| StoreError::not_found("project", project_id))?;

    if !project.is_owned_by(actor) {
        log::warn!(
            "User '{}' denied access to project {} owned by '{}'",
            actor,
            project_id,
            project.owner_id
        );
        return Err(StoreError::Forbidden {
            actor: actor.to_string(),
            project_id,
        });
    }
    Ok(project)
}

pub async fn authorize_page<C: Connection>(
    session: &mut Session<C>,
    actor: &str,
    page_id: PageId,
) -> StoreResult<Page> {
    let page = session
        .get_page(page_id)
        .await?
        .ok_or_else(|| StoreError::not_found("page", page_id))?;
    authorize_project(session, actor, page.project_id).await?;
    Ok(page)
}

pub async fn authorize_element<C: Connection>(
    session: &mut Session<C>,
    actor: &str,
    element_id: ElementId,
) -> StoreResult<Element> {
    let element = session
        .get_element(element_id)
        .await?
        .ok_or_else(|| StoreError::not_found("element", element_id))?;
    authorize_page(session, actor, element.page_id).await?;
    Ok(element)
}
