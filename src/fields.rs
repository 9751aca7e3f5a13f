//! The catalogs of replicated field names.
//!
//! These lists are the single source of truth: the encoder, the decoder,
//! and the incremental differ all iterate them and nothing else
//! enumerates field names. Adding a field here is all it takes to
//! replicate it.

/// Base fields present on every element record.
pub const SYNC_FIELDS: &[&str] = &[
    "id",
    "type",
    "x",
    "y",
    "width",
    "height",
    "rotation",
    "isLocked",
    "isVisible",
    "sortOrder",
];

/// Style fields; replicated under [`STYLE_PREFIX`]-ed names so each is
/// its own register.
pub const STYLE_FIELDS: &[&str] = &[
    "strokeColor",
    "fillColor",
    "strokeWidth",
    "opacity",
    "strokeStyle",
    "roughness",
    "fontSize",
    "fontFamily",
];

/// Prefix under which style fields appear in a record.
pub const STYLE_PREFIX: &str = "style.";

/// Fields shared by the connector variants.
const CONNECTOR_FIELDS: &[&str] = &[
    "points",
    "lineType",
    "curvature",
    "startBinding",
    "endBinding",
];

const ARROW_FIELDS: &[&str] = &[
    "points",
    "lineType",
    "curvature",
    "startBinding",
    "endBinding",
    "startArrowhead",
    "endArrowhead",
];

const FREEDRAW_FIELDS: &[&str] = &["points", "pressures", "isComplete"];

const TEXT_FIELDS: &[&str] = &["text", "containerId", "textAlign", "verticalAlign"];

const IMAGE_FIELDS: &[&str] = &[
    "src",
    "naturalWidth",
    "naturalHeight",
    "scaleMode",
    "crop",
    "alt",
];

const RECTANGLE_FIELDS: &[&str] = &["cornerRadius"];

/// Fields added by a specific element type (by its wire name).
pub fn kind_fields(type_name: &str) -> &'static [&'static str] {
    match type_name {
        "rectangle" => RECTANGLE_FIELDS,
        "line" => CONNECTOR_FIELDS,
        "arrow" => ARROW_FIELDS,
        "freedraw" => FREEDRAW_FIELDS,
        "text" => TEXT_FIELDS,
        "image" => IMAGE_FIELDS,
        _ => &[],
    }
}

/// Fields always shared between this element's record and the common
/// containers (`boundElements`, `groupIds`).
pub const STRUCTURAL_FIELDS: &[&str] = &["boundElements", "groupIds"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_catalog_overlap() {
        for field in STYLE_FIELDS {
            assert!(!SYNC_FIELDS.contains(field));
        }
        for type_name in ["rectangle", "line", "arrow", "freedraw", "text", "image"] {
            for field in kind_fields(type_name) {
                assert!(!SYNC_FIELDS.contains(field), "{} clashes", field);
                assert!(!STRUCTURAL_FIELDS.contains(field), "{} clashes", field);
            }
        }
    }

    #[test]
    fn unknown_types_have_no_extra_fields() {
        assert!(kind_fields("ellipse").is_empty());
        assert!(kind_fields("diamond").is_empty());
        assert!(kind_fields("polygon").is_empty());
    }
}
