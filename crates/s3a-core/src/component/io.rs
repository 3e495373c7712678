//! Component import and export.
//!
//! Components are exchanged as a JSON array with one object per component:
//!
//! ```json
//! [{ "Instance ID": 0, "Vertices": "0 0,9 0,9 9,0 9;h0:3 3,5 3,5 5",
//!    "Image File": "board.png", "Class": "resistor" }]
//! ```
//!
//! Vertices are written as loops separated by `;`, each a comma-separated
//! list of `x y` pairs. A loop prefixed with `h<parent>:` is a hole inside
//! loop `<parent>`; an unprefixed loop is an outer boundary.

use std::path::Path;

use serde_json::{Map, Value};

use crate::component::{Component, ComponentError, FieldValue, InstanceId};
use crate::geometry::{self, ComplexXYVertices, GeometryError, Hierarchy, XYVertices};
use crate::types::{Dimensions, Point};

/// Column holding the instance ID.
pub const INSTANCE_ID: &str = "Instance ID";
/// Column holding the vertex string.
pub const VERTICES: &str = "Vertices";
/// Column holding the image file name.
pub const IMAGE_FILE: &str = "Image File";

/// Serialize vertices to the loop string format.
#[must_use]
pub fn vertices_to_string(vertices: &ComplexXYVertices) -> String {
    vertices
        .loops()
        .iter()
        .zip(vertices.hierarchy())
        .map(|(l, h)| {
            let points = l
                .points()
                .iter()
                .map(|p| format!("{} {}", p.x, p.y))
                .collect::<Vec<_>>()
                .join(",");
            match h.parent {
                Some(parent) if h.is_hole => format!("h{parent}:{points}"),
                _ => points,
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Parse the loop string format.
///
/// # Errors
///
/// Returns [`GeometryError::Malformed`] for unparsable text and the
/// hierarchy errors of [`ComplexXYVertices::with_hierarchy`] for bad hole
/// parents.
pub fn vertices_from_string(text: &str) -> Result<ComplexXYVertices, GeometryError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(ComplexXYVertices::default());
    }
    let mut loops = Vec::new();
    let mut hierarchy = Vec::new();
    for part in text.split(';') {
        let (entry, points) = match part.trim().strip_prefix('h') {
            Some(rest) => {
                let (parent, points) = rest
                    .split_once(':')
                    .ok_or_else(|| GeometryError::Malformed(format!("hole without parent: `{part}`")))?;
                let parent = parent
                    .parse()
                    .map_err(|_| GeometryError::Malformed(format!("bad hole parent `{parent}`")))?;
                (Hierarchy::hole_of(parent), points)
            }
            None => (Hierarchy::OUTER, part),
        };
        loops.push(parse_points(points)?);
        hierarchy.push(entry);
    }
    ComplexXYVertices::with_hierarchy(loops, hierarchy)
}

fn parse_points(text: &str) -> Result<XYVertices, GeometryError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(XYVertices::default());
    }
    text.split(',')
        .map(|pair| {
            let mut coords = pair.split_whitespace().map(str::parse::<f64>);
            match (coords.next(), coords.next(), coords.next()) {
                (Some(Ok(x)), Some(Ok(y)), None) if x.is_finite() && y.is_finite() => Ok(Point::new(x, y)),
                _ => Err(GeometryError::Malformed(format!("bad point `{pair}`"))),
            }
        })
        .collect()
}

/// One JSON object per component, in the given order.
#[must_use]
pub fn to_rows<'a>(components: impl IntoIterator<Item = &'a Component>) -> Vec<Value> {
    components
        .into_iter()
        .map(|c| {
            let mut row: Map<String, Value> = c
                .fields
                .iter()
                .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k.clone(), v)))
                .collect();
            row.insert(INSTANCE_ID.to_owned(), Value::from(c.id.0));
            row.insert(VERTICES.to_owned(), Value::from(vertices_to_string(&c.vertices)));
            row.insert(
                IMAGE_FILE.to_owned(),
                c.image_file.clone().map_or(Value::Null, Value::from),
            );
            Value::Object(row)
        })
        .collect()
}

/// Components read from rows, plus any whose vertices lie outside the
/// image.
#[derive(Debug, Clone, PartialEq)]
pub struct Imported {
    /// Components with their stored IDs.
    pub components: Vec<Component>,
    /// IDs whose vertices extend past the image dimensions given.
    pub out_of_bounds: Vec<InstanceId>,
}

/// Read components from rows.
///
/// With `dims`, vertex bounds are checked: offending IDs are logged and
/// returned, and the components are still imported.
///
/// # Errors
///
/// Returns [`ComponentError::InvalidRow`] for a row that is not an object,
/// lacks an integer ID or a vertex string, or has a field value that is not
/// a scalar.
pub fn from_rows(rows: &[Value], dims: Option<Dimensions>) -> Result<Imported, ComponentError> {
    let components = rows
        .iter()
        .enumerate()
        .map(|(row, value)| parse_row(row, value))
        .collect::<Result<Vec<_>, _>>()?;
    let out_of_bounds = dims.map_or_else(Vec::new, |dims| {
        geometry::check_vertices_bounds(components.iter().map(|c| (c.id, &c.vertices)), dims)
    });
    Ok(Imported {
        components,
        out_of_bounds,
    })
}

fn parse_row(row: usize, value: &Value) -> Result<Component, ComponentError> {
    let invalid = |message: String| ComponentError::InvalidRow { row, message };
    let object = value
        .as_object()
        .ok_or_else(|| invalid("expected an object".to_owned()))?;
    let id = object
        .get(INSTANCE_ID)
        .and_then(Value::as_i64)
        .and_then(|id| u64::try_from(id).ok())
        .ok_or_else(|| invalid(format!("`{INSTANCE_ID}` must be a non-negative 64-bit signed integer")))?;
    let vertices = object
        .get(VERTICES)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(format!("`{VERTICES}` must be a string")))?;
    let vertices = vertices_from_string(vertices).map_err(|e| invalid(e.to_string()))?;
    let image_file = match object.get(IMAGE_FILE) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => return Err(invalid(format!("`{IMAGE_FILE}` must be a string, got {other}"))),
    };
    let mut component = Component::new(vertices).with_id(InstanceId(id));
    component.image_file = image_file;
    for (name, value) in object {
        if [INSTANCE_ID, VERTICES, IMAGE_FILE].contains(&name.as_str()) || value.is_null() {
            continue;
        }
        let field: FieldValue = serde_json::from_value(value.clone())
            .map_err(|_| invalid(format!("field `{name}` must be a scalar")))?;
        component.fields.insert(name.clone(), field);
    }
    Ok(component)
}

/// Export components as a pretty JSON array.
///
/// # Errors
///
/// Returns [`ComponentError::Json`] if serialization fails.
pub fn to_json<'a>(components: impl IntoIterator<Item = &'a Component>) -> Result<String, ComponentError> {
    Ok(serde_json::to_string_pretty(&to_rows(components))?)
}

/// Import components from a JSON array.
///
/// # Errors
///
/// Returns [`ComponentError::Json`] for invalid JSON, otherwise as
/// [`from_rows`].
pub fn from_json(json: &str, dims: Option<Dimensions>) -> Result<Imported, ComponentError> {
    let rows: Vec<Value> = serde_json::from_str(json)?;
    from_rows(&rows, dims)
}

/// Export components to a file.
///
/// # Errors
///
/// Returns [`ComponentError::Io`] if the file cannot be written.
pub fn save_to_path<'a>(
    components: impl IntoIterator<Item = &'a Component>,
    path: &Path,
) -> Result<(), ComponentError> {
    let json = to_json(components)?;
    std::fs::write(path, json).map_err(|source| ComponentError::Io {
        path: path.to_owned(),
        source,
    })
}

/// Import components from a file.
///
/// # Errors
///
/// Returns [`ComponentError::Io`] if the file cannot be read, otherwise as
/// [`from_json`].
pub fn load_from_path(path: &Path, dims: Option<Dimensions>) -> Result<Imported, ComponentError> {
    let json = std::fs::read_to_string(path).map_err(|source| ComponentError::Io {
        path: path.to_owned(),
        source,
    })?;
    from_json(&json, dims)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn holed() -> ComplexXYVertices {
        ComplexXYVertices::with_hierarchy(
            vec![
                XYVertices::from_pairs([(0.0, 0.0), (9.0, 0.0), (9.0, 9.0), (0.0, 9.0)]),
                XYVertices::from_pairs([(3.0, 3.0), (5.0, 3.0), (5.0, 5.0)]),
            ],
            vec![Hierarchy::OUTER, Hierarchy::hole_of(0)],
        )
        .unwrap()
    }

    #[test]
    fn vertex_string_format() {
        assert_eq!(vertices_to_string(&holed()), "0 0,9 0,9 9,0 9;h0:3 3,5 3,5 5");
        assert_eq!(vertices_from_string("0 0,9 0,9 9,0 9;h0:3 3,5 3,5 5").unwrap(), holed());
        assert_eq!(
            vertices_from_string("1.5 2,3 4").unwrap().loops()[0].points()[0],
            Point::new(1.5, 2.0)
        );
    }

    #[test]
    fn malformed_vertex_strings_are_rejected() {
        for bad in ["1 2 3", "a b", "h:1 2", "hx:1 2", "h5:1 2", "1 nan"] {
            assert!(vertices_from_string(bad).is_err(), "{bad}");
        }
        assert!(vertices_from_string("  ").unwrap().is_empty());
    }

    #[test]
    fn rows_carry_fields_and_ids() {
        let c = Component::new(holed())
            .with_id(InstanceId(7))
            .with_image_file("board.png")
            .with_field("Class", "resistor")
            .with_field("Count", 3_i64);
        let rows = to_rows([&c]);
        assert_eq!(rows[0][INSTANCE_ID], 7);
        assert_eq!(rows[0]["Class"], "resistor");
        assert_eq!(rows[0][IMAGE_FILE], "board.png");
        let imported = from_rows(&rows, None).unwrap();
        assert_eq!(imported.components, vec![c]);
    }

    #[test]
    fn import_flags_out_of_bounds_components() {
        let json = r#"[
            {"Instance ID": 1, "Vertices": "0 0,5 0,5 5"},
            {"Instance ID": 2, "Vertices": "0 0,50 0,50 5", "Image File": null}
        ]"#;
        let imported = from_json(json, Some(Dimensions::new(20, 20))).unwrap();
        assert_eq!(imported.components.len(), 2);
        assert_eq!(imported.out_of_bounds, vec![InstanceId(2)]);
    }

    #[test]
    fn invalid_rows_name_the_row() {
        let json = r#"[{"Instance ID": 1, "Vertices": "0 0"}, {"Vertices": "0 0"}]"#;
        let err = from_json(json, None).unwrap_err();
        assert!(matches!(err, ComponentError::InvalidRow { row: 1, .. }));
        let nested = r#"[{"Instance ID": 1, "Vertices": "0 0", "Tags": [1, 2]}]"#;
        assert!(from_json(nested, None).is_err());
    }

    #[test]
    fn ids_beyond_the_signed_range_are_rejected() {
        for id in ["18446744073709551615", "9223372036854775808", "-1", "2.5"] {
            let json = format!(r#"[{{"Instance ID": {id}, "Vertices": "0 0,5 0,5 5"}}]"#);
            let err = from_json(&json, None).unwrap_err();
            assert!(matches!(err, ComponentError::InvalidRow { row: 0, .. }), "{id}");
        }
        let json = r#"[{"Instance ID": 9223372036854775807, "Vertices": "0 0,5 0,5 5"}]"#;
        let imported = from_json(json, None).unwrap();
        assert_eq!(imported.components[0].id, InstanceId(9_223_372_036_854_775_807));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("components.json");
        let components = vec![
            Component::new(holed()).with_id(InstanceId(0)),
            Component::new(holed().offset(1.0, 1.0)).with_id(InstanceId(4)),
        ];
        save_to_path(&components, &path).unwrap();
        let imported = load_from_path(&path, Some(Dimensions::new(100, 100))).unwrap();
        assert_eq!(imported.components, components);
        assert!(imported.out_of_bounds.is_empty());
    }
}
