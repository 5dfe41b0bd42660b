//! Agent mutation commands.
//!
//! Commands arrive as loosely shaped JSON (`{ "type": ..., "data": ... }`, with
//! synonyms, quoted ids and accidental wrapping). [`ElementAction::parse`] is the
//! single place where all accepted spellings are mapped onto the closed
//! [`ElementAction`] enum; everything downstream matches on the enum.

use crate::model::{CanvasPosition, ElementId, LenientId, PageId, PropertyMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const TYPE_KEYS: [&str; 3] = ["type", "actionType", "action_type"];
const PAYLOAD_KEYS: [&str; 3] = ["data", "payload", "params"];
const CHANGE_KEYS: [&str; 3] = ["updates", "changes", "properties"];
const MAX_ENVELOPE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("command must be a JSON object")]
    NotAnObject,

    #[error("command has no action type")]
    MissingType,

    #[error("unrecognized action type '{0}'")]
    UnknownType(String),

    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: ActionKind, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    CreateElement,
    UpdateElement,
    DeleteElement,
    DeletePageElements,
    SelectElement,
    SetStyle,
    SetContent,
}

/// Accepted spellings per action, already case-folded with `-`, `_` and spaces removed
const ALIASES: &[(ActionKind, &[&str])] = &[
    (
        ActionKind::CreateElement,
        &[
            "createelement",
            "addelement",
            "insertelement",
            "newelement",
            "create",
            "add",
            "insert",
            "createcomponent",
            "addcomponent",
        ],
    ),
    (
        ActionKind::UpdateElement,
        &[
            "updateelement",
            "modifyelement",
            "editelement",
            "changeelement",
            "update",
            "modify",
            "edit",
            "updatecomponent",
        ],
    ),
    (
        ActionKind::DeleteElement,
        &[
            "deleteelement",
            "removeelement",
            "delete",
            "remove",
            "deletecomponent",
            "removecomponent",
        ],
    ),
    (
        ActionKind::DeletePageElements,
        &[
            "deletepageelements",
            "deleteallelements",
            "removeallelements",
            "clearallelements",
            "clearpage",
            "clearall",
            "clearcanvas",
            "deleteall",
        ],
    ),
    (
        ActionKind::SelectElement,
        &["selectelement", "select", "focuselement", "highlightelement"],
    ),
    (
        ActionKind::SetStyle,
        &[
            "setstyle",
            "setstyleproperty",
            "updatestyle",
            "changestyle",
            "style",
        ],
    ),
    (
        ActionKind::SetContent,
        &[
            "setcontent",
            "updatecontent",
            "changecontent",
            "editcontent",
            "settext",
            "updatetext",
            "changetext",
        ],
    ),
];

impl ActionKind {
    pub fn from_alias(raw: &str) -> Option<Self> {
        let folded: String = raw
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        ALIASES
            .iter()
            .find(|(_, names)| names.contains(&folded.as_str()))
            .map(|(kind, _)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateElement => "createElement",
            ActionKind::UpdateElement => "updateElement",
            ActionKind::DeleteElement => "deleteElement",
            ActionKind::DeletePageElements => "deletePageElements",
            ActionKind::SelectElement => "selectElement",
            ActionKind::SetStyle => "setStyle",
            ActionKind::SetContent => "setContent",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateElementAction {
    pub page_id: Option<PageId>,
    pub parent_id: Option<ElementId>,
    pub element_type: String,
    pub content: Option<String>,
    pub styles: PropertyMap,
    pub attributes: PropertyMap,
    pub order: Option<i32>,
    pub position: Option<CanvasPosition>,
}

/// Requested changes of an update command. Style and attribute maps are merged
/// into the element's current maps rather than replacing them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementChanges {
    pub parent_id: Option<Option<ElementId>>,
    pub order: Option<i32>,
    pub element_type: Option<String>,
    pub content: Option<Option<String>>,
    pub styles: Option<PropertyMap>,
    pub attributes: Option<PropertyMap>,
}

impl ElementChanges {
    pub fn is_empty(&self) -> bool {
        *self == ElementChanges::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementAction {
    CreateElement(CreateElementAction),
    UpdateElement {
        element_id: ElementId,
        changes: ElementChanges,
    },
    DeleteElement {
        element_id: ElementId,
    },
    DeletePageElements {
        page_id: Option<PageId>,
    },
    SelectElement {
        element_id: ElementId,
    },
    SetStyle {
        element_id: ElementId,
        property: String,
        value: Value,
    },
    SetContent {
        element_id: ElementId,
        content: String,
    },
}

impl ElementAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            ElementAction::CreateElement(_) => ActionKind::CreateElement,
            ElementAction::UpdateElement { .. } => ActionKind::UpdateElement,
            ElementAction::DeleteElement { .. } => ActionKind::DeleteElement,
            ElementAction::DeletePageElements { .. } => ActionKind::DeletePageElements,
            ElementAction::SelectElement { .. } => ActionKind::SelectElement,
            ElementAction::SetStyle { .. } => ActionKind::SetStyle,
            ElementAction::SetContent { .. } => ActionKind::SetContent,
        }
    }

    /// Element the command targets, if it targets an existing one
    pub fn target_element(&self) -> Option<ElementId> {
        match self {
            ElementAction::UpdateElement { element_id, .. }
            | ElementAction::DeleteElement { element_id }
            | ElementAction::SelectElement { element_id }
            | ElementAction::SetStyle { element_id, .. }
            | ElementAction::SetContent { element_id, .. } => Some(*element_id),
            ElementAction::CreateElement(_) | ElementAction::DeletePageElements { .. } => None,
        }
    }

    /// Normalize one externally produced command.
    pub fn parse(raw: &Value) -> Result<Self, ActionError> {
        let command = unwrap_envelope(raw);
        let object = command.as_object().ok_or(ActionError::NotAnObject)?;

        let type_name = TYPE_KEYS
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .or_else(|| object.get("action").and_then(Value::as_str))
            .ok_or(ActionError::MissingType)?;
        let kind = ActionKind::from_alias(type_name)
            .ok_or_else(|| ActionError::UnknownType(type_name.to_string()))?;

        let payload = extract_payload(kind, object)?;
        Self::from_payload(kind, payload)
    }

    fn from_payload(kind: ActionKind, payload: PropertyMap) -> Result<Self, ActionError> {
        let invalid = |e: serde_json::Error| ActionError::InvalidPayload {
            kind,
            reason: e.to_string(),
        };

        match kind {
            ActionKind::CreateElement => {
                let data: CreatePayload =
                    serde_json::from_value(Value::Object(payload)).map_err(invalid)?;
                data.into_action()
            }
            ActionKind::UpdateElement => {
                let payload = hoist_changes(payload);
                let data: UpdatePayload =
                    serde_json::from_value(Value::Object(payload)).map_err(invalid)?;
                let changes = data.changes()?;
                if changes.is_empty() {
                    return Err(ActionError::InvalidPayload {
                        kind,
                        reason: "no fields to update".to_string(),
                    });
                }
                Ok(ElementAction::UpdateElement {
                    element_id: data.element_id.into(),
                    changes,
                })
            }
            ActionKind::DeleteElement => {
                let data: TargetPayload =
                    serde_json::from_value(Value::Object(payload)).map_err(invalid)?;
                Ok(ElementAction::DeleteElement {
                    element_id: data.element_id.into(),
                })
            }
            ActionKind::SelectElement => {
                let data: TargetPayload =
                    serde_json::from_value(Value::Object(payload)).map_err(invalid)?;
                Ok(ElementAction::SelectElement {
                    element_id: data.element_id.into(),
                })
            }
            ActionKind::DeletePageElements => {
                let data: PagePayload =
                    serde_json::from_value(Value::Object(payload)).map_err(invalid)?;
                Ok(ElementAction::DeletePageElements {
                    page_id: data.page_id.map(i64::from),
                })
            }
            ActionKind::SetStyle => {
                let data: StylePayload =
                    serde_json::from_value(Value::Object(payload)).map_err(invalid)?;
                data.into_action()
            }
            ActionKind::SetContent => {
                let data: ContentPayload =
                    serde_json::from_value(Value::Object(payload)).map_err(invalid)?;
                let content = match data.content.as_ref() {
                    Some(value) => text_of(kind, value)?,
                    None => None,
                };
                let content = content.ok_or_else(|| ActionError::InvalidPayload {
                    kind,
                    reason: "missing field `content`".to_string(),
                })?;
                Ok(ElementAction::SetContent {
                    element_id: data.element_id.into(),
                    content,
                })
            }
        }
    }
}

fn unwrap_envelope(raw: &Value) -> &Value {
    let mut current = raw;
    for _ in 0..MAX_ENVELOPE_DEPTH {
        match current.get("action") {
            Some(inner @ Value::Object(_)) => current = inner,
            _ => break,
        }
    }
    current
}

fn extract_payload(
    kind: ActionKind,
    object: &serde_json::Map<String, Value>,
) -> Result<PropertyMap, ActionError> {
    let explicit = PAYLOAD_KEYS.iter().find_map(|key| object.get(*key));

    let mut payload = match explicit {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => {
                return Err(ActionError::InvalidPayload {
                    kind,
                    reason: "payload string is not a JSON object".to_string(),
                })
            }
        },
        Some(Value::Null) => PropertyMap::new(),
        Some(other) => {
            return Err(ActionError::InvalidPayload {
                kind,
                reason: format!("payload must be an object, got {}", json_type(other)),
            })
        }
        None => {
            let mut inline = object.clone();
            for key in TYPE_KEYS.iter().chain(std::iter::once(&"action")) {
                inline.remove(*key);
            }
            inline
        }
    };

    // {"data": {"data": {...}}}
    for _ in 0..MAX_ENVELOPE_DEPTH {
        if payload.len() != 1 {
            break;
        }
        match payload.get("data") {
            Some(Value::Object(inner)) => payload = inner.clone(),
            _ => break,
        }
    }

    Ok(payload)
}

/// Lift `{"updates": {...}}` style nesting to the top level of an update payload.
fn hoist_changes(mut payload: PropertyMap) -> PropertyMap {
    for key in CHANGE_KEYS {
        if let Some(Value::Object(nested)) = payload.remove(key) {
            for (field, value) in nested {
                payload.entry(field).or_insert(value);
            }
        }
    }
    payload
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Scalars become text and `null` means no text. Arrays and objects are rejected.
fn text_of(kind: ActionKind, value: &Value) -> Result<Option<String>, ActionError> {
    match value {
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Null => Ok(None),
        other => Err(ActionError::InvalidPayload {
            kind,
            reason: format!("`content` must be text, got {}", json_type(other)),
        }),
    }
}

/// `font-size` -> `fontSize`; already camel-cased names are left alone.
pub fn camel_case_property(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.trim().chars() {
        if ch == '-' || ch == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn camel_case_keys(map: PropertyMap) -> PropertyMap {
    map.into_iter()
        .map(|(key, value)| (camel_case_property(&key), value))
        .collect()
}

fn coordinates(
    x: Option<f64>,
    y: Option<f64>,
    position: Option<&Value>,
) -> Option<CanvasPosition> {
    let nested = position.and_then(Value::as_object);
    let x = x.or_else(|| nested.and_then(|p| p.get("x")).and_then(Value::as_f64));
    let y = y.or_else(|| nested.and_then(|p| p.get("y")).and_then(Value::as_f64));
    match (x, y) {
        (None, None) => None,
        (x, y) => Some(CanvasPosition {
            x: x.unwrap_or(0.0),
            y: y.unwrap_or(0.0),
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePayload {
    #[serde(
        default,
        alias = "element_type",
        alias = "type",
        alias = "tag",
        alias = "component"
    )]
    element_type: Option<String>,
    #[serde(default, alias = "page_id")]
    page_id: Option<LenientId>,
    #[serde(default, alias = "parent_id", alias = "parent")]
    parent_id: Option<LenientId>,
    #[serde(default, alias = "text", alias = "label")]
    content: Option<Value>,
    #[serde(default, alias = "style")]
    styles: Option<PropertyMap>,
    #[serde(default, alias = "attrs", alias = "props")]
    attributes: Option<PropertyMap>,
    #[serde(default, alias = "index")]
    order: Option<i32>,
    #[serde(default)]
    x: Option<f64>,
    #[serde(default)]
    y: Option<f64>,
    #[serde(default)]
    position: Option<Value>,
}

impl CreatePayload {
    fn into_action(self) -> Result<ElementAction, ActionError> {
        let element_type = self
            .element_type
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ActionError::InvalidPayload {
                kind: ActionKind::CreateElement,
                reason: "missing field `elementType`".to_string(),
            })?;

        Ok(ElementAction::CreateElement(CreateElementAction {
            page_id: self.page_id.map(i64::from),
            parent_id: self.parent_id.map(i64::from),
            element_type,
            content: match self.content.as_ref() {
                Some(value) => text_of(ActionKind::CreateElement, value)?,
                None => None,
            },
            styles: camel_case_keys(self.styles.unwrap_or_default()),
            attributes: self.attributes.unwrap_or_default(),
            order: self.order,
            position: coordinates(self.x, self.y, self.position.as_ref()),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePayload {
    #[serde(alias = "element_id", alias = "id", alias = "elementID")]
    element_id: LenientId,
    #[serde(
        default,
        alias = "parent_id",
        deserialize_with = "crate::model::double_option"
    )]
    parent_id: Option<Option<LenientId>>,
    #[serde(default, alias = "index")]
    order: Option<i32>,
    #[serde(default, alias = "element_type", alias = "type")]
    element_type: Option<String>,
    #[serde(
        default,
        alias = "text",
        deserialize_with = "crate::model::double_option"
    )]
    content: Option<Option<Value>>,
    #[serde(default, alias = "style")]
    styles: Option<PropertyMap>,
    #[serde(default, alias = "attrs", alias = "props")]
    attributes: Option<PropertyMap>,
}

impl UpdatePayload {
    fn changes(&self) -> Result<ElementChanges, ActionError> {
        let content = match &self.content {
            Some(Some(value)) => Some(text_of(ActionKind::UpdateElement, value)?),
            Some(None) => Some(None),
            None => None,
        };
        Ok(ElementChanges {
            parent_id: self.parent_id.map(|p| p.map(i64::from)),
            order: self.order,
            element_type: self.element_type.as_ref().map(|t| t.trim().to_lowercase()),
            content,
            styles: self.styles.clone().map(camel_case_keys),
            attributes: self.attributes.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetPayload {
    #[serde(alias = "element_id", alias = "id", alias = "elementID")]
    element_id: LenientId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PagePayload {
    #[serde(default, alias = "page_id", alias = "id")]
    page_id: Option<LenientId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StylePayload {
    #[serde(alias = "element_id", alias = "id", alias = "elementID")]
    element_id: LenientId,
    #[serde(
        default,
        alias = "prop",
        alias = "key",
        alias = "name",
        alias = "styleProperty",
        alias = "style_property"
    )]
    property: Option<String>,
    #[serde(default, alias = "styleValue", alias = "style_value")]
    value: Option<Value>,
    #[serde(default, alias = "style")]
    styles: Option<PropertyMap>,
}

impl StylePayload {
    fn into_action(self) -> Result<ElementAction, ActionError> {
        let invalid = |reason: &str| ActionError::InvalidPayload {
            kind: ActionKind::SetStyle,
            reason: reason.to_string(),
        };

        let (property, value) = match (self.property, self.value, self.styles) {
            (Some(property), Some(value), _) => (property, value),
            (None, None, Some(styles)) if styles.len() == 1 => {
                let mut entries = styles.into_iter();
                match entries.next() {
                    Some(entry) => entry,
                    None => return Err(invalid("empty style map")),
                }
            }
            (None, None, Some(_)) => {
                return Err(invalid(
                    "setStyle changes exactly one property; use updateElement for several",
                ))
            }
            (Some(_), None, _) => return Err(invalid("missing field `value`")),
            _ => return Err(invalid("missing field `property`")),
        };

        let property = camel_case_property(&property);
        if property.is_empty() {
            return Err(invalid("style property name is empty"));
        }

        Ok(ElementAction::SetStyle {
            element_id: self.element_id.into(),
            property,
            value,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentPayload {
    #[serde(alias = "element_id", alias = "id", alias = "elementID")]
    element_id: LenientId,
    #[serde(default, alias = "text", alias = "value")]
    content: Option<Value>,
}
