//! Applies agent commands to element trees.
//!
//! Every command goes through the same pipeline: normalize into an
//! [`ElementAction`], authorize against the owning project, resolve image
//! directives, then apply through [`TreeOps`] inside a transaction bounded by the
//! operation timeout. Network calls for directives happen before the
//! transaction opens.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::logic::access;
use crate::logic::directive::{contains_directive, DirectiveResolver};
use crate::logic::hierarchy::{HierarchyStore, TreeOps};
use crate::logic::layout::creation_styles;
use crate::model::{
    ActionError, ActionKind, Element, ElementAction, ElementChanges, ElementId, ElementPatch,
    NewElement, PageId, ParentRef, PropertyMap, UserContext,
};
use crate::resilience::ExternalError;
use crate::store::{Connection, ConnectionSource, ErrorKind, Session, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct ActionContext {
    pub user: UserContext,
    /// Page used by commands that don't name one
    pub page_id: Option<PageId>,
}

impl ActionContext {
    pub fn new(user: UserContext, page_id: Option<PageId>) -> Self {
        Self { user, page_id }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Created { element: Element },
    Updated { element: Element },
    Deleted { element_id: ElementId, count: u64 },
    PageCleared { page_id: PageId, count: u64 },
    Selected { element: Element },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Invalid(#[from] ActionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("image generation failed: {0}")]
    Generation(#[from] ExternalError),

    #[error("command {index} failed: {source}")]
    Command {
        index: usize,
        #[source]
        source: Box<DispatchError>,
    },
}

impl DispatchError {
    fn at(index: usize, source: DispatchError) -> Self {
        DispatchError::Command {
            index,
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Invalid(_) => ErrorKind::Validation,
            DispatchError::Store(e) => e.kind(),
            DispatchError::Generation(e) => match e.root() {
                ExternalError::Network(_)
                | ExternalError::Timeout(_)
                | ExternalError::CircuitOpen(_) => ErrorKind::Transient,
                ExternalError::Status { status, .. } if *status == 429 || *status >= 500 => {
                    ErrorKind::Transient
                }
                _ => ErrorKind::Terminal,
            },
            DispatchError::Command { source, .. } => source.kind(),
        }
    }
}

/// A command that passed validation and authorization, directives resolved
#[derive(Debug, Clone)]
enum PreparedAction {
    Create { page_id: PageId, element: NewElement },
    Update { element_id: ElementId, changes: ElementChanges },
    Delete { element_id: ElementId },
    ClearPage { page_id: PageId },
    Select { element_id: ElementId },
    SetStyle { element_id: ElementId, property: String, value: Value },
    SetContent { element_id: ElementId, content: String },
}

/// Overlay `changes` on `current`; a null value removes the key
fn merge_properties(mut current: PropertyMap, changes: PropertyMap) -> PropertyMap {
    for (key, value) in changes {
        if value.is_null() {
            current.remove(&key);
        } else {
            current.insert(key, value);
        }
    }
    current
}

fn missing_page(kind: ActionKind) -> DispatchError {
    DispatchError::Invalid(ActionError::InvalidPayload {
        kind,
        reason: "no page id in the command or its context".to_string(),
    })
}

async fn apply<C: Connection>(
    ops: TreeOps,
    s: &mut Session<C>,
    action: PreparedAction,
) -> StoreResult<ActionOutcome> {
    match action {
        PreparedAction::Create { page_id, element } => {
            let element = ops.create_element(s, page_id, element).await?;
            Ok(ActionOutcome::Created { element })
        }
        PreparedAction::Update {
            element_id,
            changes,
        } => {
            let current = ops.get_element(s, element_id).await?;
            let patch = ElementPatch {
                parent_id: changes.parent_id,
                order: changes.order,
                element_type: changes.element_type,
                content: changes.content,
                styles: changes
                    .styles
                    .map(|styles| merge_properties(current.styles.clone(), styles)),
                attributes: changes
                    .attributes
                    .map(|attributes| merge_properties(current.attributes.clone(), attributes)),
            };
            let element = ops.update_element(s, element_id, patch).await?;
            Ok(ActionOutcome::Updated { element })
        }
        PreparedAction::Delete { element_id } => {
            let count = ops.delete_subtree(s, element_id).await?;
            Ok(ActionOutcome::Deleted { element_id, count })
        }
        PreparedAction::ClearPage { page_id } => {
            let count = ops.delete_page_elements(s, page_id).await?;
            Ok(ActionOutcome::PageCleared { page_id, count })
        }
        PreparedAction::Select { element_id } => {
            let element = ops.get_element(s, element_id).await?;
            Ok(ActionOutcome::Selected { element })
        }
        PreparedAction::SetStyle {
            element_id,
            property,
            value,
        } => {
            let current = ops.get_element(s, element_id).await?;
            let styles = merge_properties(current.styles, PropertyMap::from_iter([(property, value)]));
            let patch = ElementPatch {
                styles: Some(styles),
                ..Default::default()
            };
            let element = ops.update_element(s, element_id, patch).await?;
            Ok(ActionOutcome::Updated { element })
        }
        PreparedAction::SetContent {
            element_id,
            content,
        } => {
            let element = ops
                .update_element(s, element_id, ElementPatch::content(content))
                .await?;
            Ok(ActionOutcome::Updated { element })
        }
    }
}

#[derive(Clone)]
pub struct ActionDispatcher<S> {
    store: HierarchyStore<S>,
    resolver: DirectiveResolver,
    timeout: Duration,
}

impl<S: ConnectionSource> ActionDispatcher<S> {
    pub fn new(store: HierarchyStore<S>, resolver: DirectiveResolver, timeout: Duration) -> Self {
        Self {
            store,
            resolver,
            timeout,
        }
    }

    pub fn store(&self) -> &HierarchyStore<S> {
        &self.store
    }

    /// Normalize and apply one raw command in its own transaction
    pub async fn execute_action(
        &self,
        command: &Value,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, DispatchError> {
        let action = ElementAction::parse(command)?;
        self.run(action, ctx).await
    }

    /// Apply one already-normalized command in its own transaction
    pub async fn run(
        &self,
        action: ElementAction,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, DispatchError> {
        let kind = action.kind();
        let mut session = self.store.session().await?;
        let prepared = self.prepare(&mut session, action, ctx).await?;

        let ops = self.store.ops();
        let outcome = ops
            .tx()
            .with_transaction_timeout(&mut session, kind.as_str(), self.timeout, move |s| {
                Box::pin(apply(ops, s, prepared))
            })
            .await?;

        log::info!("User '{}' applied {}", ctx.user.user_id, kind);
        Ok(outcome)
    }

    /// Validate, authorize and resolve every command, then apply them in order
    /// inside one transaction with a savepoint per command. Either all commands
    /// take effect or none do.
    pub async fn execute_actions(
        &self,
        commands: &[Value],
        ctx: &ActionContext,
    ) -> Result<Vec<ActionOutcome>, DispatchError> {
        let actions = commands
            .iter()
            .enumerate()
            .map(|(index, raw)| ElementAction::parse(raw).map_err(|e| DispatchError::at(index, e.into())))
            .collect::<Result<Vec<_>, _>>()?;
        if actions.is_empty() {
            return Ok(Vec::new());
        }

        let mut session = self.store.session().await?;
        let mut prepared = Vec::with_capacity(actions.len());
        for (index, action) in actions.into_iter().enumerate() {
            let ready = self
                .prepare(&mut session, action, ctx)
                .await
                .map_err(|e| DispatchError::at(index, e))?;
            prepared.push(ready);
        }

        let ops = self.store.ops();
        let failed_at = Arc::new(AtomicUsize::new(usize::MAX));
        let marker = failed_at.clone();
        let count = prepared.len();

        let result = ops
            .tx()
            .with_transaction_timeout(&mut session, "execute_actions", self.timeout, move |s| {
                Box::pin(async move {
                    let mut outcomes = Vec::with_capacity(prepared.len());
                    for (index, action) in prepared.into_iter().enumerate() {
                        let name = format!("action_{}", index);
                        let applied = ops
                            .tx()
                            .with_transaction(s, &name, move |s| Box::pin(apply(ops, s, action)))
                            .await;
                        match applied {
                            Ok(outcome) => outcomes.push(outcome),
                            Err(e) => {
                                marker.store(index, Ordering::SeqCst);
                                return Err(e);
                            }
                        }
                    }
                    Ok(outcomes)
                })
            })
            .await;

        match result {
            Ok(outcomes) => {
                log::info!("User '{}' applied {} command(s)", ctx.user.user_id, count);
                Ok(outcomes)
            }
            Err(e) => match failed_at.load(Ordering::SeqCst) {
                usize::MAX => Err(e.into()),
                index => {
                    log::warn!("Command {} of {} failed, nothing applied: {}", index, count, e);
                    Err(DispatchError::at(index, e.into()))
                }
            },
        }
    }

    async fn prepare<C: Connection>(
        &self,
        session: &mut Session<C>,
        action: ElementAction,
        ctx: &ActionContext,
    ) -> Result<PreparedAction, DispatchError> {
        let actor = ctx.user.user_id.as_str();
        let kind = action.kind();
        if let Some(element_id) = action.target_element() {
            access::authorize_element(session, actor, element_id).await?;
        }

        let prepared = match action {
            ElementAction::CreateElement(create) => {
                let page_id = match (create.page_id.or(ctx.page_id), create.parent_id) {
                    (Some(page_id), _) => page_id,
                    (None, Some(parent_id)) => {
                        access::authorize_element(session, actor, parent_id)
                            .await?
                            .page_id
                    }
                    (None, None) => return Err(missing_page(kind)),
                };
                access::authorize_page(session, actor, page_id).await?;

                let caller_styles = self.resolver.resolve_map(create.styles).await?;
                let element = NewElement {
                    styles: creation_styles(&create.element_type, &caller_styles, create.position),
                    element_type: create.element_type,
                    parent: create.parent_id.map(ParentRef::Element),
                    order: create.order,
                    content: self.resolver.resolve_optional(create.content).await?,
                    attributes: self.resolver.resolve_map(create.attributes).await?,
                };
                PreparedAction::Create { page_id, element }
            }
            ElementAction::UpdateElement {
                element_id,
                mut changes,
            } => {
                if let Some(Some(content)) = changes.content.as_ref() {
                    let resolved = self.resolver.resolve(content).await?;
                    changes.content = Some(Some(resolved));
                }
                if let Some(styles) = changes.styles.take() {
                    changes.styles = Some(self.resolver.resolve_map(styles).await?);
                }
                if let Some(attributes) = changes.attributes.take() {
                    changes.attributes = Some(self.resolver.resolve_map(attributes).await?);
                }
                PreparedAction::Update {
                    element_id,
                    changes,
                }
            }
            ElementAction::DeleteElement { element_id } => PreparedAction::Delete { element_id },
            ElementAction::DeletePageElements { page_id } => {
                let page_id = page_id.or(ctx.page_id).ok_or_else(|| missing_page(kind))?;
                access::authorize_page(session, actor, page_id).await?;
                PreparedAction::ClearPage { page_id }
            }
            ElementAction::SelectElement { element_id } => PreparedAction::Select { element_id },
            ElementAction::SetStyle {
                element_id,
                property,
                value,
            } => {
                let value = match value {
                    Value::String(text) if contains_directive(&text) => {
                        Value::String(self.resolver.resolve(&text).await?)
                    }
                    other => other,
                };
                PreparedAction::SetStyle {
                    element_id,
                    property,
                    value,
                }
            }
            ElementAction::SetContent {
                element_id,
                content,
            } => PreparedAction::SetContent {
                element_id,
                content: self.resolver.resolve(&content).await?,
            },
        };
        Ok(prepared)
    }
}
