use easel_crdt::SortKey;
use serde::{Deserialize, Serialize};

/// A point in world coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
}

impl Point {
    /// Creates a point.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A camera over the canvas: screen offset plus zoom.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    /// Horizontal screen offset.
    pub x: f64,
    /// Vertical screen offset.
    pub y: f64,
    /// Zoom factor.
    pub scale: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale: 1.0,
        }
    }
}

/// Visual styling shared by every element variant. Each field replicates
/// as its own register under a `style.` prefixed name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Style {
    /// Stroke color, css-style.
    pub stroke_color: String,
    /// Fill color, css-style; `"transparent"` means unfilled.
    pub fill_color: String,
    /// Stroke width in world units.
    pub stroke_width: f64,
    /// Opacity in `[0, 1]`.
    pub opacity: f64,
    /// `"solid"`, `"dashed"` or `"dotted"`.
    pub stroke_style: String,
    /// Hand-drawn jitter amount.
    pub roughness: f64,
    /// Font size for text content.
    pub font_size: f64,
    /// Font family for text content.
    pub font_family: String,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            stroke_color: "#1e1e1e".to_owned(),
            fill_color: "transparent".to_owned(),
            stroke_width: 2.0,
            opacity: 1.0,
            stroke_style: "solid".to_owned(),
            roughness: 1.0,
            font_size: 20.0,
            font_family: "Virgil".to_owned(),
        }
    }
}

/// Attachment of a connector endpoint to another element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    /// Id of the element the endpoint is bound to.
    pub element_id: String,
    /// Position along the target's perimeter, in `[-1, 1]`.
    pub focus: f64,
    /// Distance kept from the target's outline.
    pub gap: f64,
}

/// Crop window of an image, in natural-size pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Crop {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Window width.
    pub width: f64,
    /// Window height.
    pub height: f64,
}

/// Geometry shared by the line and arrow variants.
///
/// `points` is a flat `[x0, y0, x1, y1, ...]` list in element-local
/// coordinates; its length is even and at least 4.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectorShape {
    /// Flat point list relative to the element position.
    pub points: Vec<f64>,
    /// `"straight"`, `"elbow"` or `"curved"`.
    pub line_type: String,
    /// Curvature amount for curved connectors.
    pub curvature: Option<f64>,
    /// Binding of the first point.
    pub start_binding: Option<Binding>,
    /// Binding of the last point.
    pub end_binding: Option<Binding>,
}

/// The per-variant payload of an element.
#[derive(Clone, Debug, PartialEq)]
pub enum ElementKind {
    /// An axis-aligned rectangle.
    Rectangle {
        /// Corner rounding radius.
        corner_radius: f64,
    },
    /// An ellipse filling the element box.
    Ellipse,
    /// A diamond filling the element box.
    Diamond,
    /// A polyline.
    Line(ConnectorShape),
    /// A polyline with arrowheads.
    Arrow {
        /// The shared connector geometry.
        shape: ConnectorShape,
        /// Arrowhead at the first point.
        start_arrowhead: Option<String>,
        /// Arrowhead at the last point.
        end_arrowhead: Option<String>,
    },
    /// A freehand stroke.
    Freedraw {
        /// Flat point list; world-space while the stroke is still being
        /// drawn, element-local once complete.
        points: Vec<f64>,
        /// Optional per-point pen pressures.
        pressures: Option<Vec<f64>>,
        /// False while the stroke is still being drawn.
        is_complete: bool,
    },
    /// A text block.
    Text {
        /// The text content.
        text: String,
        /// Id of the shape the text lives inside, if any.
        container_id: Option<String>,
        /// `"left"`, `"center"` or `"right"`.
        text_align: String,
        /// `"top"`, `"middle"` or `"bottom"`.
        vertical_align: String,
    },
    /// A placed image.
    Image {
        /// Source location of the bitmap.
        src: String,
        /// Natural bitmap width in pixels.
        natural_width: f64,
        /// Natural bitmap height in pixels.
        natural_height: f64,
        /// `"fill"`, `"fit"` or `"stretch"`.
        scale_mode: String,
        /// Optional crop window.
        crop: Option<Crop>,
        /// Alternative text.
        alt: Option<String>,
    },
}

impl ElementKind {
    /// The wire name of the variant, stored in the record's `type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            ElementKind::Rectangle { .. } => "rectangle",
            ElementKind::Ellipse => "ellipse",
            ElementKind::Diamond => "diamond",
            ElementKind::Line(_) => "line",
            ElementKind::Arrow { .. } => "arrow",
            ElementKind::Freedraw { .. } => "freedraw",
            ElementKind::Text { .. } => "text",
            ElementKind::Image { .. } => "image",
        }
    }
}

/// One drawing primitive.
///
/// The id is assigned on creation and never changes; everything else is
/// mutable element state mirrored field-by-field into the shared
/// collection.
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    /// Session-unique identity.
    pub id: String,
    /// Left edge (or bounding-box origin for connectors).
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Box width.
    pub width: f64,
    /// Box height.
    pub height: f64,
    /// Rotation around the box center, radians.
    pub rotation: f64,
    /// Hidden elements are kept but not drawn.
    pub is_visible: bool,
    /// Locked elements ignore pointer interaction.
    pub is_locked: bool,
    /// Fractional ordering key; absent sorts to the tail.
    pub sort_order: Option<SortKey>,
    /// Visual styling.
    pub style: Style,
    /// Groups this element belongs to.
    pub group_ids: Option<Vec<String>>,
    /// Ids of connectors bound to this element.
    pub bound_elements: Option<Vec<String>>,
    /// The variant payload.
    pub kind: ElementKind,
}

impl Element {
    /// Creates an element with a fresh id and default geometry.
    pub fn new(kind: ElementKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            x: 0.0,
            y: 0.0,
            width: 100.0,
            height: 100.0,
            rotation: 0.0,
            is_visible: true,
            is_locked: false,
            sort_order: None,
            style: Style::default(),
            group_ids: None,
            bound_elements: None,
            kind,
        }
    }

    /// Positions and sizes the element.
    pub fn with_rect(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.x = x;
        self.y = y;
        self.width = width;
        self.height = height;
        self
    }

    /// Finishes an in-progress freehand stroke: translates its points
    /// from world space into element-local space, tightens the bounding
    /// box, and flags the stroke complete. A no-op for other variants
    /// and for strokes that are already complete.
    pub fn complete_freedraw(&mut self) {
        let ElementKind::Freedraw {
            points,
            is_complete,
            ..
        } = &mut self.kind
        else {
            return;
        };
        if *is_complete || points.len() < 2 {
            return;
        }
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for pair in points.chunks_exact(2) {
            min_x = min_x.min(pair[0]);
            max_x = max_x.max(pair[0]);
            min_y = min_y.min(pair[1]);
            max_y = max_y.max(pair[1]);
        }
        for pair in points.chunks_exact_mut(2) {
            pair[0] -= min_x;
            pair[1] -= min_y;
        }
        self.x = min_x;
        self.y = min_y;
        self.width = max_x - min_x;
        self.height = max_y - min_y;
        *is_complete = true;
    }

    /// The axis-aligned bounds of the element box.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        (self.x, self.y, self.width, self.height)
    }
}

/// Stable ordering used everywhere a projected element list is built:
/// two elements are ordered only when both carry a sort key; otherwise
/// they compare equal and a stable sort preserves the incoming order.
pub fn compare_sort_order(a: &Element, b: &Element) -> std::cmp::Ordering {
    match (&a.sort_order, &b.sort_order) {
        (Some(a), Some(b)) => a.cmp(b),
        _ => std::cmp::Ordering::Equal,
    }
}
