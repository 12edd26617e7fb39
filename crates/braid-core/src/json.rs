use serde_json::Value;

/// Look up a dot-notation path (e.g. `items[0].name`) inside a JSON value.
///
/// Returns `None` when any segment is missing. An empty path returns the
/// value itself.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = lookup_segment(current, segment)?;
    }
    Some(current)
}

/// Resolve one segment, which may carry any number of `[n]` indexes.
fn lookup_segment<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    let (key, mut rest) = match segment.find('[') {
        Some(pos) => (&segment[..pos], &segment[pos..]),
        None => (segment, ""),
    };

    let mut current = if key.is_empty() {
        value
    } else {
        value.get(key)?
    };

    while let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped.find(']')?;
        let idx: usize = stripped[..close].trim().parse().ok()?;
        current = current.get(idx)?;
        rest = &stripped[close + 1..];
    }

    Some(current)
}

/// Render a JSON value for interpolation into text: strings without quotes,
/// everything else as compact JSON.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
