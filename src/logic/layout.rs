use serde_json::{json, Value};

use crate::model::{CanvasPosition, PropertyMap};

/// Type-specific style defaults, keyed by lowercase element type
fn type_defaults(element_type: &str) -> Vec<(&'static str, &'static str)> {
    match element_type.to_ascii_lowercase().as_str() {
        "heading" | "h1" => vec![("fontSize", "32px"), ("fontWeight", "bold"), ("margin", "0 0 16px")],
        "h2" => vec![("fontSize", "24px"), ("fontWeight", "bold"), ("margin", "0 0 12px")],
        "h3" | "h4" | "h5" | "h6" => vec![("fontSize", "18px"), ("fontWeight", "bold")],
        "text" | "paragraph" | "p" | "span" => vec![("fontSize", "16px"), ("lineHeight", "1.5")],
        "button" => vec![
            ("width", "auto"),
            ("display", "inline-block"),
            ("padding", "8px 16px"),
            ("cursor", "pointer"),
        ],
        "image" | "img" => vec![("height", "auto"), ("maxWidth", "100%"), ("display", "block")],
        "section" | "container" | "div" => vec![("padding", "16px"), ("boxSizing", "border-box")],
        "row" => vec![("display", "flex"), ("flexDirection", "row"), ("gap", "16px")],
        "column" => vec![("display", "flex"), ("flexDirection", "column"), ("gap", "8px")],
        "input" => vec![("padding", "8px"), ("border", "1px solid #ccc")],
        _ => Vec::new(),
    }
}

/// Styles for a newly created element.
///
/// Flow layout first, then type defaults, then the caller's styles. Only explicit
/// canvas coordinates produce absolute positioning; a caller asking for
/// `absolute` without them gets `relative`.
pub fn creation_styles(
    element_type: &str,
    caller: &PropertyMap,
    position: Option<CanvasPosition>,
) -> PropertyMap {
    let mut styles = PropertyMap::new();
    styles.insert("position".to_string(), json!("relative"));
    styles.insert("width".to_string(), json!("100%"));
    for (key, value) in type_defaults(element_type) {
        styles.insert(key.to_string(), json!(value));
    }
    for (key, value) in caller {
        styles.insert(key.clone(), value.clone());
    }

    match position {
        Some(CanvasPosition { x, y }) => {
            styles.insert("position".to_string(), json!("absolute"));
            styles.insert("left".to_string(), json!(format!("{}px", x)));
            styles.insert("top".to_string(), json!(format!("{}px", y)));
        }
        None => {
            if styles.get("position").and_then(Value::as_str) == Some("absolute") {
                log::debug!("Demoting absolute position without coordinates to relative");
                styles.insert("position".to_string(), json!("relative"));
            }
        }
    }
    styles
}
