//! Dotted field paths with `[n]` array indices, e.g. `spec.tags[0].name`.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Split a path into segments. Empty keys and malformed indices are errors.
pub fn parse(path: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if key.is_empty() && (segments.is_empty() || rest.is_empty()) {
            return Err(format!("invalid field path '{path}'"));
        }
        if !key.is_empty() {
            segments.push(Segment::Key(key.to_string()));
        }
        while !rest.is_empty() {
            let close = rest
                .find(']')
                .ok_or_else(|| format!("unclosed index in '{path}'"))?;
            let index = rest[1..close]
                .parse::<usize>()
                .map_err(|_| format!("bad index in '{path}'"))?;
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(format!("invalid field path '{path}'"));
            }
        }
    }
    Ok(segments)
}

/// Read the value at `path`. Missing keys, out-of-range indices and malformed
/// paths all read as `None`.
pub fn get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse(path).ok()?;
    let mut cur = value;
    for seg in &segments {
        cur = match (seg, cur) {
            (Segment::Key(k), Value::Object(map)) => map.get(k)?,
            (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Write `new` at `path`, creating intermediate objects and arrays.
///
/// An index may address an existing element or append one past the end;
/// anything further, or a path that runs through a scalar, is an error.
pub fn set(value: &mut Value, path: &str, new: Value) -> Result<(), String> {
    let segments = parse(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Err(format!("invalid field path '{path}'"));
    };
    let mut cur = value;
    for (i, seg) in parents.iter().enumerate() {
        let next_is_index = matches!(segments[i + 1], Segment::Index(_));
        cur = step(cur, seg, next_is_index, path)?;
    }
    match (last, cur) {
        (Segment::Key(k), Value::Object(map)) => {
            map.insert(k.clone(), new);
            Ok(())
        }
        (Segment::Key(k), slot @ Value::Null) => {
            let mut map = Map::new();
            map.insert(k.clone(), new);
            *slot = Value::Object(map);
            Ok(())
        }
        (Segment::Index(i), Value::Array(items)) => {
            if *i < items.len() {
                items[*i] = new;
                Ok(())
            } else if *i == items.len() {
                items.push(new);
                Ok(())
            } else {
                Err(format!("index {i} out of range in '{path}'"))
            }
        }
        (Segment::Index(0), slot @ Value::Null) => {
            *slot = Value::Array(vec![new]);
            Ok(())
        }
        _ => Err(format!("path '{path}' runs through a non-container value")),
    }
}

fn step<'a>(
    cur: &'a mut Value,
    seg: &Segment,
    next_is_index: bool,
    path: &str,
) -> Result<&'a mut Value, String> {
    let empty = || {
        if next_is_index {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        }
    };
    if cur.is_null() {
        *cur = match seg {
            Segment::Key(_) => Value::Object(Map::new()),
            Segment::Index(_) => Value::Array(Vec::new()),
        };
    }
    match (seg, cur) {
        (Segment::Key(k), Value::Object(map)) => Ok(map.entry(k.clone()).or_insert_with(empty)),
        (Segment::Index(i), Value::Array(items)) => {
            if *i == items.len() {
                items.push(empty());
            }
            items
                .get_mut(*i)
                .ok_or_else(|| format!("index {i} out of range in '{path}'"))
        }
        _ => Err(format!("path '{path}' runs through a non-container value")),
    }
}
