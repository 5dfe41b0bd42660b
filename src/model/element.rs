use crate::model::{ElementId, PageId, PropertyMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub page_id: PageId,
    pub parent_id: Option<ElementId>,
    pub order: i32,
    pub element_type: String,
    pub content: Option<String>,
    #[serde(default)]
    pub styles: PropertyMap,
    #[serde(default)]
    pub attributes: PropertyMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Element {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Sibling sort key: `order` first, `id` as tie-break
    pub fn sibling_key(&self) -> (i32, ElementId) {
        (self.order, self.id)
    }
}

/// How a batch-created element names its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentRef {
    /// An element that already exists on the page
    Element(ElementId),
    /// An earlier entry of the same batch, by position
    BatchIndex(usize),
}

/// Input for creating an element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewElement {
    pub element_type: String,
    #[serde(default)]
    pub parent: Option<ParentRef>,
    #[serde(default)]
    pub order: Option<i32>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub styles: PropertyMap,
    #[serde(default)]
    pub attributes: PropertyMap,
}

impl NewElement {
    pub fn new(element_type: impl Into<String>) -> Self {
        Self {
            element_type: element_type.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }
}

/// Fully resolved row handed to a backend for insertion
#[derive(Debug, Clone, PartialEq)]
pub struct InsertElement {
    pub page_id: PageId,
    pub parent_id: Option<ElementId>,
    pub order: i32,
    pub element_type: String,
    pub content: Option<String>,
    pub styles: PropertyMap,
    pub attributes: PropertyMap,
}

impl InsertElement {
    /// Copy of an existing element onto another page under a remapped parent
    pub fn copy_of(element: &Element, page_id: PageId, parent_id: Option<ElementId>) -> Self {
        Self {
            page_id,
            parent_id,
            order: element.order,
            element_type: element.element_type.clone(),
            content: element.content.clone(),
            styles: element.styles.clone(),
            attributes: element.attributes.clone(),
        }
    }
}

/// Partial update: only `Some` fields change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementPatch {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "crate::model::double_option"
    )]
    pub parent_id: Option<Option<ElementId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "crate::model::double_option"
    )]
    pub content: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub styles: Option<PropertyMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<PropertyMap>,
}

impl ElementPatch {
    pub fn is_empty(&self) -> bool {
        self.parent_id.is_none()
            && self.order.is_none()
            && self.element_type.is_none()
            && self.content.is_none()
            && self.styles.is_none()
            && self.attributes.is_none()
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(Some(content.into())),
            ..Default::default()
        }
    }

    pub fn move_to(parent_id: Option<ElementId>) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Default::default()
        }
    }

    pub fn apply_to(&self, element: &mut Element) {
        if let Some(parent_id) = self.parent_id {
            element.parent_id = parent_id;
        }
        if let Some(order) = self.order {
            element.order = order;
        }
        if let Some(element_type) = &self.element_type {
            element.element_type = element_type.clone();
        }
        if let Some(content) = &self.content {
            element.content = content.clone();
        }
        if let Some(styles) = &self.styles {
            element.styles = styles.clone();
        }
        if let Some(attributes) = &self.attributes {
            element.attributes = attributes.clone();
        }
    }
}

/// One entry of a batch update request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementUpdate {
    pub id: ElementId,
    #[serde(flatten)]
    pub patch: ElementPatch,
}

/// Element with its children, siblings ordered by `(order, id)`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementNode {
    #[serde(flatten)]
    pub element: Element,
    pub children: Vec<ElementNode>,
}

/// Explicit canvas coordinates supplied by a caller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanvasPosition {
    pub x: f64,
    pub y: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_distinguishes_null_from_missing() {
        let patch: ElementPatch = serde_json::from_str(r#"{"parent_id": null}"#).unwrap();
        assert_eq!(patch.parent_id, Some(None));
        assert_eq!(patch.content, None);

        let patch: ElementPatch = serde_json::from_str(r#"{"content": "Hi"}"#).unwrap();
        assert_eq!(patch.parent_id, None);
        assert_eq!(patch.content, Some(Some("Hi".to_string())));

        let empty: ElementPatch = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_parent_ref_json_shape() {
        let parent: ParentRef = serde_json::from_str(r#"{"batch_index": 2}"#).unwrap();
        assert_eq!(parent, ParentRef::BatchIndex(2));
        let parent: ParentRef = serde_json::from_str(r#"{"element": 17}"#).unwrap();
        assert_eq!(parent, ParentRef::Element(17));
    }

    #[test]
    fn test_batch_update_entry_flattens_patch() {
        let update: ElementUpdate =
            serde_json::from_str(r#"{"id": 3, "order": 5, "content": null}"#).unwrap();
        assert_eq!(update.id, 3);
        assert_eq!(update.patch.order, Some(5));
        assert_eq!(update.patch.content, Some(None));
    }
}
