//! Translation between [`Element`] values and replicated records.
//!
//! Encoding flattens an element into scalar fields (`x`, `style.opacity`,
//! ...); structural data travels as JSON text inside a single register.
//! Decoding is total: it never panics on malformed input, defaults
//! missing base fields, drops unparseable structural atoms, and rejects
//! a record only when its `id`/`type` anchors are gone.

use crate::element::{Binding, ConnectorShape, Crop, Element, ElementKind, Style};
use crate::fields::{kind_fields, STRUCTURAL_FIELDS, STYLE_FIELDS, STYLE_PREFIX, SYNC_FIELDS};
use easel_crdt::{Txn, Value};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

fn json_atom<T: serde::Serialize>(value: &T) -> Option<Value> {
    match serde_json::to_string(value) {
        Ok(s) => Some(Value::String(s)),
        Err(err) => {
            tracing::debug!("failed to serialize structural atom: {}", err);
            None
        }
    }
}

fn json_field<T: DeserializeOwned>(record: &BTreeMap<String, Value>, name: &str) -> Option<T> {
    let raw = record.get(name)?.as_str()?;
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!("malformed {} atom: {}", name, err);
            None
        }
    }
}

fn str_field(record: &BTreeMap<String, Value>, name: &str) -> Option<String> {
    record.get(name).and_then(Value::as_str).map(str::to_owned)
}

fn num_field(record: &BTreeMap<String, Value>, name: &str, default: f64) -> f64 {
    record.get(name).and_then(Value::as_f64).unwrap_or(default)
}

fn bool_field(record: &BTreeMap<String, Value>, name: &str, default: bool) -> bool {
    record.get(name).and_then(Value::as_bool).unwrap_or(default)
}

/// The desired record value of one field, `None` meaning "unset".
fn field_value(element: &Element, field: &str) -> Option<Value> {
    match field {
        "id" => Some(Value::String(element.id.clone())),
        "type" => Some(Value::String(element.kind.type_name().to_owned())),
        "x" => Some(element.x.into()),
        "y" => Some(element.y.into()),
        "width" => Some(element.width.into()),
        "height" => Some(element.height.into()),
        "rotation" => Some(element.rotation.into()),
        "isLocked" => Some(element.is_locked.into()),
        "isVisible" => Some(element.is_visible.into()),
        "sortOrder" => element
            .sort_order
            .as_ref()
            .map(|key| Value::String(key.to_string())),
        "boundElements" => element.bound_elements.as_ref().and_then(json_atom),
        "groupIds" => element.group_ids.as_ref().and_then(json_atom),
        _ => kind_field_value(element, field),
    }
}

fn connector_field_value(shape: &ConnectorShape, field: &str) -> Option<Value> {
    match field {
        "points" => json_atom(&shape.points),
        "lineType" => Some(Value::String(shape.line_type.clone())),
        "curvature" => shape.curvature.map(Value::from),
        "startBinding" => shape.start_binding.as_ref().and_then(json_atom),
        "endBinding" => shape.end_binding.as_ref().and_then(json_atom),
        _ => None,
    }
}

fn kind_field_value(element: &Element, field: &str) -> Option<Value> {
    match &element.kind {
        ElementKind::Rectangle { corner_radius } => match field {
            "cornerRadius" => Some((*corner_radius).into()),
            _ => None,
        },
        ElementKind::Ellipse | ElementKind::Diamond => None,
        ElementKind::Line(shape) => connector_field_value(shape, field),
        ElementKind::Arrow {
            shape,
            start_arrowhead,
            end_arrowhead,
        } => match field {
            "startArrowhead" => start_arrowhead.clone().map(Value::String),
            "endArrowhead" => end_arrowhead.clone().map(Value::String),
            _ => connector_field_value(shape, field),
        },
        ElementKind::Freedraw {
            points,
            pressures,
            is_complete,
        } => match field {
            "points" => json_atom(points),
            "pressures" => pressures.as_ref().and_then(json_atom),
            "isComplete" => Some((*is_complete).into()),
            _ => None,
        },
        ElementKind::Text {
            text,
            container_id,
            text_align,
            vertical_align,
        } => match field {
            "text" => Some(Value::String(text.clone())),
            "containerId" => container_id.clone().map(Value::String),
            "textAlign" => Some(Value::String(text_align.clone())),
            "verticalAlign" => Some(Value::String(vertical_align.clone())),
            _ => None,
        },
        ElementKind::Image {
            src,
            natural_width,
            natural_height,
            scale_mode,
            crop,
            alt,
        } => match field {
            "src" => Some(Value::String(src.clone())),
            "naturalWidth" => Some((*natural_width).into()),
            "naturalHeight" => Some((*natural_height).into()),
            "scaleMode" => Some(Value::String(scale_mode.clone())),
            "crop" => crop.as_ref().and_then(json_atom),
            "alt" => alt.clone().map(Value::String),
            _ => None,
        },
    }
}

/// Walks every replicated field of an element in catalog order.
fn for_each_field(element: &Element, mut f: impl FnMut(&str, Option<Value>)) {
    for field in SYNC_FIELDS {
        f(field, field_value(element, field));
    }
    for field in STRUCTURAL_FIELDS {
        f(field, field_value(element, field));
    }
    let mut prefixed = String::with_capacity(32);
    for field in STYLE_FIELDS {
        prefixed.clear();
        prefixed.push_str(STYLE_PREFIX);
        prefixed.push_str(field);
        f(&prefixed, style_field_value(&element.style, field));
    }
    for field in kind_fields(element.kind.type_name()) {
        f(field, field_value(element, field));
    }
}

fn style_field_value(style: &Style, field: &str) -> Option<Value> {
    match field {
        "strokeColor" => Some(Value::String(style.stroke_color.clone())),
        "fillColor" => Some(Value::String(style.fill_color.clone())),
        "strokeWidth" => Some(style.stroke_width.into()),
        "opacity" => Some(style.opacity.into()),
        "strokeStyle" => Some(Value::String(style.stroke_style.clone())),
        "roughness" => Some(style.roughness.into()),
        "fontSize" => Some(style.font_size.into()),
        "fontFamily" => Some(Value::String(style.font_family.clone())),
        _ => None,
    }
}

/// Writes every known field of an element into its record, creating the
/// record first when needed.
///
/// Unset optional fields are simply not written, except the common
/// containers (`boundElements`, `groupIds`) whose contract is "present
/// but empty": those get an explicit null.
pub fn encode_element(txn: &mut Txn, element: &Element) {
    if !txn.contains(&element.id) {
        txn.put_record(&element.id);
    }
    for_each_field(element, |field, value| match value {
        Some(value) => txn.put_field(&element.id, field, value),
        None => {
            if STRUCTURAL_FIELDS.contains(&field) {
                txn.put_field(&element.id, field, Value::Null);
            }
        }
    });
}

/// Writes only the fields whose value differs from the record.
///
/// Scalars compare strictly; structural atoms compare by their JSON
/// serialization. Optional fields that went away are cleared with an
/// explicit null (this includes `groupIds`, symmetric with
/// `boundElements`, so a vanished group membership replicates).
pub fn incremental_update(txn: &mut Txn, element: &Element) {
    for_each_field(element, |field, desired| {
        let current = txn.field(&element.id, field);
        match desired {
            Some(value) => {
                if current.as_ref() != Some(&value) {
                    txn.put_field(&element.id, field, value);
                }
            }
            None => {
                if matches!(&current, Some(v) if !v.is_null()) {
                    txn.put_field(&element.id, field, Value::Null);
                }
            }
        }
    });
}

fn decode_connector(record: &BTreeMap<String, Value>) -> ConnectorShape {
    ConnectorShape {
        points: json_field(record, "points").unwrap_or_default(),
        line_type: str_field(record, "lineType").unwrap_or_else(|| "straight".to_owned()),
        curvature: record.get("curvature").and_then(Value::as_f64),
        start_binding: json_field::<Binding>(record, "startBinding"),
        end_binding: json_field::<Binding>(record, "endBinding"),
    }
}

fn decode_style(record: &BTreeMap<String, Value>) -> Style {
    let defaults = Style::default();
    let text = |name: &str, default: String| {
        record
            .get(&format!("{}{}", STYLE_PREFIX, name))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or(default)
    };
    let num = |name: &str, default: f64| {
        record
            .get(&format!("{}{}", STYLE_PREFIX, name))
            .and_then(Value::as_f64)
            .unwrap_or(default)
    };
    Style {
        stroke_color: text("strokeColor", defaults.stroke_color),
        fill_color: text("fillColor", defaults.fill_color),
        stroke_width: num("strokeWidth", defaults.stroke_width),
        opacity: num("opacity", defaults.opacity),
        stroke_style: text("strokeStyle", defaults.stroke_style),
        roughness: num("roughness", defaults.roughness),
        font_size: num("fontSize", defaults.font_size),
        font_family: text("fontFamily", defaults.font_family),
    }
}

/// Rebuilds an element from a record snapshot.
///
/// Returns `None` when the `id` or `type` anchor is missing or the type
/// is unknown; every other defect degrades to a default or a dropped
/// optional.
pub fn decode_element(record: &BTreeMap<String, Value>) -> Option<Element> {
    let id = str_field(record, "id")?;
    let type_name = str_field(record, "type")?;

    let kind = match type_name.as_str() {
        "rectangle" => ElementKind::Rectangle {
            corner_radius: num_field(record, "cornerRadius", 0.0),
        },
        "ellipse" => ElementKind::Ellipse,
        "diamond" => ElementKind::Diamond,
        "line" => ElementKind::Line(decode_connector(record)),
        "arrow" => ElementKind::Arrow {
            shape: decode_connector(record),
            start_arrowhead: str_field(record, "startArrowhead"),
            end_arrowhead: str_field(record, "endArrowhead"),
        },
        "freedraw" => ElementKind::Freedraw {
            points: json_field(record, "points").unwrap_or_default(),
            pressures: json_field(record, "pressures"),
            is_complete: bool_field(record, "isComplete", false),
        },
        "text" => ElementKind::Text {
            text: str_field(record, "text").unwrap_or_default(),
            container_id: str_field(record, "containerId"),
            text_align: str_field(record, "textAlign").unwrap_or_else(|| "left".to_owned()),
            vertical_align: str_field(record, "verticalAlign").unwrap_or_else(|| "top".to_owned()),
        },
        "image" => ElementKind::Image {
            src: str_field(record, "src").unwrap_or_default(),
            natural_width: num_field(record, "naturalWidth", 0.0),
            natural_height: num_field(record, "naturalHeight", 0.0),
            scale_mode: str_field(record, "scaleMode").unwrap_or_else(|| "fit".to_owned()),
            crop: json_field::<Crop>(record, "crop"),
            alt: str_field(record, "alt"),
        },
        other => {
            tracing::debug!("unknown element type {:?}", other);
            return None;
        }
    };

    Some(Element {
        id,
        x: num_field(record, "x", 0.0),
        y: num_field(record, "y", 0.0),
        width: num_field(record, "width", 100.0),
        height: num_field(record, "height", 100.0),
        rotation: num_field(record, "rotation", 0.0),
        is_visible: bool_field(record, "isVisible", true),
        is_locked: bool_field(record, "isLocked", false),
        sort_order: str_field(record, "sortOrder").and_then(|s| s.parse().ok()),
        style: decode_style(record),
        group_ids: json_field(record, "groupIds"),
        bound_elements: json_field(record, "boundElements"),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_crdt::{ActorId, Delta, Doc, Origin, SortKey};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn doc() -> Doc {
        Doc::with_actor(ActorId::new(1))
    }

    fn round_trip(element: &Element) -> Element {
        let doc = doc();
        doc.transact(Origin::LocalSync, |txn| encode_element(txn, element));
        decode_element(&doc.snapshot(&element.id).unwrap()).unwrap()
    }

    fn collect_deltas(doc: &Doc) -> Arc<Mutex<Vec<Delta>>> {
        let deltas = Arc::new(Mutex::new(Vec::new()));
        let sink = deltas.clone();
        doc.set_sink(move |delta| sink.lock().push(delta));
        deltas
    }

    #[test]
    fn rectangle_round_trip() {
        let mut e = Element::new(ElementKind::Rectangle { corner_radius: 8.0 })
            .with_rect(10.0, 20.0, 100.0, 50.0);
        e.style.fill_color = "#f00".to_owned();
        e.sort_order = Some(SortKey::half());
        e.bound_elements = Some(vec!["arrow-1".to_owned()]);
        assert_eq!(round_trip(&e), e);
    }

    #[test]
    fn arrow_round_trip_with_bindings() {
        let mut e = Element::new(ElementKind::Arrow {
            shape: ConnectorShape {
                points: vec![0.0, 0.0, 50.0, 25.0],
                line_type: "curved".to_owned(),
                curvature: Some(0.4),
                start_binding: Some(Binding {
                    element_id: "e9".to_owned(),
                    focus: 0.25,
                    gap: 4.0,
                }),
                end_binding: None,
            },
            start_arrowhead: None,
            end_arrowhead: Some("triangle".to_owned()),
        });
        e.group_ids = Some(vec!["g1".to_owned(), "g2".to_owned()]);
        assert_eq!(round_trip(&e), e);
    }

    #[test]
    fn freedraw_and_text_and_image_round_trip() {
        let freedraw = Element::new(ElementKind::Freedraw {
            points: vec![0.0, 0.0, 3.0, 4.0, 6.0, 2.0],
            pressures: Some(vec![0.1, 0.7, 1.0]),
            is_complete: true,
        });
        assert_eq!(round_trip(&freedraw), freedraw);

        let text = Element::new(ElementKind::Text {
            text: "hello".to_owned(),
            container_id: Some("rect-1".to_owned()),
            text_align: "center".to_owned(),
            vertical_align: "middle".to_owned(),
        });
        assert_eq!(round_trip(&text), text);

        let image = Element::new(ElementKind::Image {
            src: "blob:abc".to_owned(),
            natural_width: 640.0,
            natural_height: 480.0,
            scale_mode: "fill".to_owned(),
            crop: Some(Crop {
                x: 10.0,
                y: 10.0,
                width: 320.0,
                height: 240.0,
            }),
            alt: Some("a duck".to_owned()),
        });
        assert_eq!(round_trip(&image), image);
    }

    #[test]
    fn decode_rejects_missing_anchors() {
        let doc = doc();
        doc.transact(Origin::LocalSync, |txn| {
            txn.put_record("e1");
            txn.put_field("e1", "x", 5.0);
        });
        assert!(decode_element(&doc.snapshot("e1").unwrap()).is_none());
    }

    #[test]
    fn decode_survives_malformed_atoms() {
        let doc = doc();
        doc.transact(Origin::LocalSync, |txn| {
            txn.put_record("e1");
            txn.put_field("e1", "id", "e1");
            txn.put_field("e1", "type", "freedraw");
            txn.put_field("e1", "points", "not json [");
            txn.put_field("e1", "pressures", "{{{");
        });
        let element = decode_element(&doc.snapshot("e1").unwrap()).unwrap();
        match element.kind {
            ElementKind::Freedraw {
                points, pressures, ..
            } => {
                assert!(points.is_empty());
                assert!(pressures.is_none());
            }
            _ => unreachable!(),
        }
        // base fields fall back to their defaults
        assert_eq!(element.width, 100.0);
        assert!(element.is_visible);
    }

    #[test]
    fn repeated_encode_writes_nothing() {
        let doc = doc();
        let e = Element::new(ElementKind::Ellipse).with_rect(1.0, 2.0, 3.0, 4.0);
        doc.transact(Origin::LocalSync, |txn| encode_element(txn, &e));
        let deltas = collect_deltas(&doc);
        doc.transact(Origin::LocalSync, |txn| incremental_update(txn, &e));
        assert!(deltas.lock().is_empty(), "second encode must be a no-op");
    }

    #[test]
    fn incremental_update_touches_only_changed_fields() {
        let doc = doc();
        let mut e = Element::new(ElementKind::Ellipse).with_rect(1.0, 2.0, 3.0, 4.0);
        doc.transact(Origin::LocalSync, |txn| encode_element(txn, &e));
        let deltas = collect_deltas(&doc);
        e.x = 42.0;
        e.style.stroke_width = 6.0;
        doc.transact(Origin::LocalSync, |txn| incremental_update(txn, &e));
        let deltas = deltas.lock();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].len(), 2);
    }

    #[test]
    fn clears_group_ids_when_unset() {
        let doc = doc();
        let mut e = Element::new(ElementKind::Ellipse);
        e.group_ids = Some(vec!["g1".to_owned()]);
        doc.transact(Origin::LocalSync, |txn| encode_element(txn, &e));
        e.group_ids = None;
        doc.transact(Origin::LocalSync, |txn| incremental_update(txn, &e));
        let decoded = decode_element(&doc.snapshot(&e.id).unwrap()).unwrap();
        assert!(decoded.group_ids.is_none());
    }

    fn arb_style() -> impl Strategy<Value = Style> {
        (
            "[#a-f0-9]{4,7}",
            0.0f64..1.0,
            1.0f64..10.0,
            prop_oneof![Just("solid"), Just("dashed"), Just("dotted")],
        )
            .prop_map(|(color, opacity, width, stroke_style)| Style {
                stroke_color: color.clone(),
                fill_color: color,
                stroke_width: width,
                opacity,
                stroke_style: stroke_style.to_owned(),
                ..Style::default()
            })
    }

    fn arb_kind() -> impl Strategy<Value = ElementKind> {
        prop_oneof![
            (0.0f64..32.0).prop_map(|corner_radius| ElementKind::Rectangle { corner_radius }),
            Just(ElementKind::Ellipse),
            Just(ElementKind::Diamond),
            proptest::collection::vec((-100.0f64..100.0, -100.0f64..100.0), 2..5).prop_map(
                |pairs| {
                    ElementKind::Line(ConnectorShape {
                        points: pairs.into_iter().flat_map(|(x, y)| [x, y]).collect(),
                        line_type: "straight".to_owned(),
                        ..ConnectorShape::default()
                    })
                }
            ),
            (
                proptest::collection::vec(-50.0f64..50.0, 3..9),
                any::<bool>()
            )
                .prop_map(|(mut points, is_complete)| {
                    if points.len() % 2 == 1 {
                        points.pop();
                    }
                    ElementKind::Freedraw {
                        points,
                        pressures: None,
                        is_complete,
                    }
                }),
            "[a-z ]{0,16}".prop_map(|text| ElementKind::Text {
                text,
                container_id: None,
                text_align: "left".to_owned(),
                vertical_align: "top".to_owned(),
            }),
        ]
    }

    fn arb_element() -> impl Strategy<Value = Element> {
        (
            arb_kind(),
            arb_style(),
            -500.0f64..500.0,
            -500.0f64..500.0,
            1.0f64..400.0,
            1.0f64..400.0,
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(kind, style, x, y, width, height, visible, locked)| {
                let mut e = Element::new(kind).with_rect(x, y, width, height);
                e.style = style;
                e.is_visible = visible;
                e.is_locked = locked;
                e
            })
    }

    proptest! {
        // decode(encode(e)) == e up to default-field normalization; the
        // generator only produces normalized elements, so equality holds
        #[test]
        fn every_element_round_trips(e in arb_element()) {
            prop_assert_eq!(round_trip(&e), e);
        }

        // encoding twice never produces a second delta
        #[test]
        fn encode_is_idempotent(e in arb_element()) {
            let doc = doc();
            doc.transact(Origin::LocalSync, |txn| encode_element(txn, &e));
            let deltas = collect_deltas(&doc);
            doc.transact(Origin::LocalSync, |txn| incremental_update(txn, &e));
            prop_assert!(deltas.lock().is_empty());
        }
    }
}
