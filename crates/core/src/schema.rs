//! Tool-name and JSON-Schema sanitization (C3).

use serde_json::{Map, Value};

const MAX_NAME_LEN: usize = 64;

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ':')
}

/// Lossy tool-name sanitizer. Space and `/` collapse to a single `_` (no
/// leading/trailing `_`); other disallowed characters are dropped; first
/// character forced to letter/`_`; truncated to 64; empty result -> `_tool`.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_collapse = false;
    for c in name.chars() {
        if c == ' ' || c == '/' {
            if !out.is_empty() {
                pending_collapse = true;
            }
        } else if is_allowed_char(c) {
            if pending_collapse {
                out.push('_');
                pending_collapse = false;
            }
            out.push(c);
        }
        // other characters are dropped silently
    }
    // a pending collapse with nothing following is a trailing separator: drop it
    match out.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        Some(_) => out.insert(0, '_'),
        None => {}
    }
    out.truncate(MAX_NAME_LEN);
    if out.is_empty() {
        "_tool".to_string()
    } else {
        out
    }
}

const SLASH_TOKEN: &str = "__slash__";
const SPACE_TOKEN: &str = "__space__";

/// Reversible variant for dialects requiring strict round-trip of tool
/// names: `/` -> `__slash__`, space -> `__space__`, truncate to 64, prepend
/// `_` if the first char isn't letter/`_`.
pub fn sanitize_tool_name_reversible(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '/' => out.push_str(SLASH_TOKEN),
            ' ' => out.push_str(SPACE_TOKEN),
            c => out.push(c),
        }
    }
    out.truncate(MAX_NAME_LEN);
    match out.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => out,
        Some(_) => {
            out.insert(0, '_');
            out
        }
        None => out,
    }
}

/// Inverse of [`sanitize_tool_name_reversible`] on the allowed input set.
pub fn decode_reversible_tool_name(encoded: &str) -> String {
    encoded.replace(SLASH_TOKEN, "/").replace(SPACE_TOKEN, " ")
}

/// Recursively sanitizes a JSON-Schema tool-parameters document per C3:
/// drops forbidden keys, `const` -> `enum`, inlines local `$ref`s, defaults
/// untyped nodes to `type: object`. `antigravity_target` additionally
/// renames `anyOf` -> `any_of` after all other passes, as that dialect
/// requires.
pub fn sanitize_schema(schema: &Value, antigravity_target: bool) -> Value {
    let defs = collect_defs(schema);
    let mut inlined = inline_refs(schema, &defs, 0);
    strip_and_normalize(&mut inlined);
    if antigravity_target {
        rename_any_of(&mut inlined);
    }
    inlined
}

const FORBIDDEN_KEYS: [&str; 5] = ["$schema", "$id", "default", "examples", "title"];
const MAX_REF_DEPTH: usize = 32;

fn collect_defs(schema: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(obj) = schema.as_object() {
        for key in ["$defs", "definitions"] {
            if let Some(Value::Object(map)) = obj.get(key) {
                for (k, v) in map {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
    }
    out
}

fn ref_target(reference: &str) -> Option<&str> {
    reference
        .strip_prefix("#/$defs/")
        .or_else(|| reference.strip_prefix("#/definitions/"))
}

fn inline_refs(node: &Value, defs: &Map<String, Value>, depth: usize) -> Value {
    if depth >= MAX_REF_DEPTH {
        return node.clone();
    }
    match node {
        Value::Object(obj) => {
            if let Some(Value::String(reference)) = obj.get("$ref") {
                if let Some(name) = ref_target(reference) {
                    if let Some(target) = defs.get(name) {
                        return inline_refs(target, defs, depth + 1);
                    }
                }
            }
            let mut new_obj = Map::new();
            for (k, v) in obj {
                if k == "$defs" || k == "definitions" {
                    continue;
                }
                new_obj.insert(k.clone(), inline_refs(v, defs, depth));
            }
            Value::Object(new_obj)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| inline_refs(v, defs, depth)).collect())
        }
        other => other.clone(),
    }
}

fn strip_and_normalize(node: &mut Value) {
    match node {
        Value::Object(obj) => {
            for key in FORBIDDEN_KEYS {
                obj.remove(key);
            }
            if let Some(const_val) = obj.remove("const") {
                obj.insert("enum".to_string(), Value::Array(vec![const_val]));
            }
            for v in obj.values_mut() {
                strip_and_normalize(v);
            }
            let has_type_shape = obj.contains_key("type")
                || obj.contains_key("anyOf")
                || obj.contains_key("oneOf")
                || obj.contains_key("allOf");
            if !has_type_shape {
                obj.insert("type".to_string(), Value::String("object".to_string()));
            }
        }
        Value::Array(items) => {
            for v in items {
                strip_and_normalize(v);
            }
        }
        _ => {}
    }
}

fn rename_any_of(node: &mut Value) {
    match node {
        Value::Object(obj) => {
            if let Some(v) = obj.remove("anyOf") {
                obj.insert("any_of".to_string(), v);
            }
            for v in obj.values_mut() {
                rename_any_of(v);
            }
        }
        Value::Array(items) => {
            for v in items {
                rename_any_of(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_name_collapses_space_and_slash() {
        assert_eq!(sanitize_tool_name("get weather/now"), "get_weather_now");
    }

    #[test]
    fn sanitize_name_is_idempotent() {
        let once = sanitize_tool_name("1 weird/name!!");
        let twice = sanitize_tool_name(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_name_empty_becomes_tool() {
        assert_eq!(sanitize_tool_name("!!!"), "_tool");
    }

    #[test]
    fn reversible_round_trips() {
        let name = "get_weather/now now";
        let encoded = sanitize_tool_name_reversible(name);
        assert_eq!(decode_reversible_tool_name(&encoded), name);
    }

    #[test]
    fn schema_inlines_ref_and_converts_const() {
        let schema = json!({
            "$defs": {"Loc": {"const": "NYC"}},
            "properties": {"location": {"$ref": "#/$defs/Loc"}}
        });
        let out = sanitize_schema(&schema, false);
        assert_eq!(out["properties"]["location"]["enum"], json!(["NYC"]));
        assert!(out.get("$defs").is_none());
    }

    #[test]
    fn schema_defaults_missing_type_to_object() {
        let schema = json!({"properties": {"a": {"type": "string"}}});
        let out = sanitize_schema(&schema, false);
        assert_eq!(out["type"], json!("object"));
    }

    #[test]
    fn antigravity_renames_any_of() {
        let schema = json!({"anyOf": [{"type": "string"}]});
        let out = sanitize_schema(&schema, true);
        assert!(out.get("anyOf").is_none());
        assert!(out.get("any_of").is_some());
    }
}
