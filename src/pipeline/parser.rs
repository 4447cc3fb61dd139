//! Pipeline document parsing: format inference, decode, YAML merge-key
//! expansion, environment preamble, and recursive interpolation.
//!
//! Grounded in `examples/original_source/agent/pipeline_parser.go`.

use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::env::{interpolate, Environment};
use crate::pipeline::value::PipelineValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

impl Format {
    fn label(self) -> &'static str {
        match self {
            Format::Yaml => "yaml",
            Format::Json => "json",
        }
    }
}

/// Options controlling a single `parse` call.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions<'a> {
    pub filename: Option<&'a str>,
    /// Skip the environment preamble and tree-walk interpolation entirely;
    /// return the decoded tree as-is.
    pub no_interpolation: bool,
}

/// Decode `bytes` as a pipeline document and interpolate it against `env`.
///
/// If `env` is `None`, the current process environment is snapshotted once
/// and used; if `Some`, the caller's environment is both read from and
/// written back into (an `env:` preamble block populates it).
pub fn parse(
    bytes: &[u8],
    opts: &ParseOptions,
    env: Option<&mut Environment>,
) -> Result<PipelineValue, PipelineError> {
    let mut owned_env;
    let env: &mut Environment = match env {
        Some(e) => e,
        None => {
            owned_env = Environment::from_current();
            &mut owned_env
        }
    };

    let format = infer_format(bytes, opts.filename)?;
    debug!(format = format.label(), filename = ?opts.filename, "inferred pipeline format");

    let mut tree = decode(bytes, format, opts.filename)?;
    expand_merge_keys(&mut tree);
    normalize_root(&mut tree);

    if opts.no_interpolation {
        return Ok(tree);
    }

    apply_env_preamble(&tree, env)?;
    interpolate_tree(&mut tree, env)?;

    Ok(tree)
}

fn infer_format(bytes: &[u8], filename: Option<&str>) -> Result<Format, PipelineError> {
    if let Some(name) = filename {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            return Ok(Format::Yaml);
        }
        if lower.ends_with(".json") {
            return Ok(Format::Json);
        }
    }

    match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') | Some(b'[') => Ok(Format::Json),
        Some(_) => Ok(Format::Yaml),
        None => Err(PipelineError::FormatUnknown {
            filename: filename.map(str::to_owned),
        }),
    }
}

fn decode(bytes: &[u8], format: Format, filename: Option<&str>) -> Result<PipelineValue, PipelineError> {
    match format {
        Format::Yaml => serde_yaml::from_slice(bytes).map_err(|e| PipelineError::Parse {
            format: "yaml",
            filename: filename.map(str::to_owned),
            message: strip_parser_noise(&e.to_string()),
        }),
        Format::Json => serde_json::from_slice(bytes).map_err(|e| PipelineError::Parse {
            format: "json",
            filename: filename.map(str::to_owned),
            message: strip_parser_noise(&e.to_string()),
        }),
    }
}

/// Trim noisy library-internal prefixes off decoder error messages, the way
/// the original strips `ghodss/yaml`'s "error converting YAML to JSON: yaml: "
/// wrapper before surfacing a message to the caller.
fn strip_parser_noise(message: &str) -> String {
    const PREFIXES: &[&str] = &["error converting YAML to JSON: yaml: "];
    let mut msg = message;
    for prefix in PREFIXES {
        if let Some(stripped) = msg.strip_prefix(prefix) {
            msg = stripped;
        }
    }
    msg.to_string()
}

/// A bare top-level sequence is sugar for `{ steps: <sequence> }`.
fn normalize_root(tree: &mut PipelineValue) {
    if matches!(tree, PipelineValue::Sequence(_)) {
        let PipelineValue::Sequence(seq) = std::mem::replace(tree, PipelineValue::Null) else {
            unreachable!()
        };
        let mut map = indexmap::IndexMap::new();
        map.insert("steps".to_string(), PipelineValue::Sequence(seq));
        *tree = PipelineValue::Mapping(map);
    }
}

/// Expand YAML 1.1 merge keys (`<<: *anchor` / `<<: [*a, *b]`) anywhere in the
/// tree. Anchors/aliases themselves are already resolved structurally by the
/// YAML loader before we ever see a `PipelineValue` — this only handles the
/// `<<` merge-key convention layered on top of them.
fn expand_merge_keys(value: &mut PipelineValue) {
    match value {
        PipelineValue::Mapping(map) => {
            for v in map.values_mut() {
                expand_merge_keys(v);
            }

            if let Some(merge_source) = map.shift_remove("<<") {
                let mut merged = indexmap::IndexMap::new();
                for source in flatten_merge_sources(merge_source) {
                    if let PipelineValue::Mapping(source_map) = source {
                        for (k, v) in source_map {
                            merged.insert(k, v);
                        }
                    }
                }
                for (k, v) in map.drain(..) {
                    merged.insert(k, v);
                }
                *map = merged;
            }
        }
        PipelineValue::Sequence(seq) => {
            for v in seq.iter_mut() {
                expand_merge_keys(v);
            }
        }
        _ => {}
    }
}

fn flatten_merge_sources(value: PipelineValue) -> Vec<PipelineValue> {
    match value {
        PipelineValue::Sequence(seq) => seq,
        other => vec![other],
    }
}

/// If the root mapping has an `env:` sub-mapping, populate `env` from it in
/// two passes: first every scalar is set verbatim (so siblings can reference
/// each other regardless of declaration order), then string values are
/// re-interpolated against the now-fully-populated environment and written
/// back.
fn apply_env_preamble(tree: &PipelineValue, env: &mut Environment) -> Result<(), PipelineError> {
    let Some(root) = tree.as_mapping() else {
        return Ok(());
    };
    let Some(PipelineValue::Mapping(env_block)) = root.get("env") else {
        return Ok(());
    };

    for (k, v) in env_block {
        let raw = match v {
            PipelineValue::String(s) => s.clone(),
            PipelineValue::Int(i) => i.to_string(),
            PipelineValue::Float(f) => f.to_string(),
            PipelineValue::Bool(b) => b.to_string(),
            PipelineValue::Null => String::new(),
            _ => continue,
        };
        env.set(k.clone(), raw);
    }

    for (k, v) in env_block {
        if let PipelineValue::String(s) = v {
            let interpolated = interpolate(env, s)?;
            env.set(k.clone(), interpolated);
        }
    }

    Ok(())
}

/// Post-order walk: interpolate string scalars, recurse into sequences and
/// mappings, and interpolate mapping keys (rebuilding the entry under its
/// new key, preserving position; if two keys collide after interpolation,
/// the later entry wins).
fn interpolate_tree(value: &mut PipelineValue, env: &Environment) -> Result<(), PipelineError> {
    match value {
        PipelineValue::String(s) => {
            *s = interpolate(env, s)?;
        }
        PipelineValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                interpolate_tree(item, env)?;
            }
        }
        PipelineValue::Mapping(map) => {
            let mut rebuilt = indexmap::IndexMap::with_capacity(map.len());
            for (k, mut v) in map.drain(..) {
                interpolate_tree(&mut v, env)?;
                let new_key = interpolate(env, &k)?;
                rebuilt.insert(new_key, v);
            }
            *map = rebuilt;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_json_from_extension() {
        assert_eq!(infer_format(b"{}", Some("pipeline.json")).unwrap(), Format::Json);
    }

    #[test]
    fn infers_yaml_from_extension() {
        assert_eq!(infer_format(b"steps: []", Some("pipeline.yaml")).unwrap(), Format::Yaml);
    }

    #[test]
    fn infers_json_from_leading_brace_without_extension() {
        assert_eq!(infer_format(b"  {\"steps\": []}", None).unwrap(), Format::Json);
    }

    #[test]
    fn infers_yaml_by_default() {
        assert_eq!(infer_format(b"steps:\n  - label: hi\n", None).unwrap(), Format::Yaml);
    }

    #[test]
    fn empty_input_is_format_unknown() {
        let err = infer_format(b"   \n", None).unwrap_err();
        assert!(matches!(err, PipelineError::FormatUnknown { .. }));
    }

    #[test]
    fn top_level_sequence_is_wrapped_in_steps() {
        let mut env = Environment::new();
        let value = parse(
            b"- label: a\n- label: b\n",
            &ParseOptions::default(),
            Some(&mut env),
        )
        .unwrap();
        let root = value.as_mapping().unwrap();
        assert!(root.contains_key("steps"));
        assert_eq!(root["steps"].as_sequence().unwrap().len(), 2);
    }

    #[test]
    fn env_preamble_populates_and_interpolates() {
        let mut env = Environment::new();
        let doc = b"env:\n  BASE: hello\n  GREETING: \"${BASE} world\"\nsteps:\n  - label: \"${GREETING}\"\n";
        let value = parse(doc, &ParseOptions::default(), Some(&mut env)).unwrap();
        assert_eq!(env.get("GREETING"), Some("hello world"));
        let steps = value.as_mapping().unwrap()["steps"].as_sequence().unwrap();
        let label = steps[0].as_mapping().unwrap()["label"].as_str().unwrap();
        assert_eq!(label, "hello world");
    }

    #[test]
    fn no_interpolation_mode_leaves_placeholders() {
        let mut env = Environment::new();
        let doc = b"steps:\n  - label: \"${UNSET}\"\n";
        let opts = ParseOptions {
            filename: None,
            no_interpolation: true,
        };
        let value = parse(doc, &opts, Some(&mut env)).unwrap();
        let steps = value.as_mapping().unwrap()["steps"].as_sequence().unwrap();
        let label = steps[0].as_mapping().unwrap()["label"].as_str().unwrap();
        assert_eq!(label, "${UNSET}");
    }

    #[test]
    fn strict_lookup_failure_aborts_parse() {
        let mut env = Environment::new();
        let doc = b"steps:\n  - label: \"${MISSING?}\"\n";
        let err = parse(doc, &ParseOptions::default(), Some(&mut env)).unwrap_err();
        assert!(matches!(err, PipelineError::VariableNotSet(name) if name == "MISSING"));
    }

    #[test]
    fn key_collision_after_interpolation_keeps_last_write() {
        let mut env = Environment::new();
        env.set("A", "same");
        env.set("B", "same");
        let doc = b"\"${A}\": first\n\"${B}\": second\n";
        let value = parse(doc, &ParseOptions::default(), Some(&mut env)).unwrap();
        let map = value.as_mapping().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["same"].as_str(), Some("second"));
    }

    #[test]
    fn merge_key_inherits_and_can_be_overridden() {
        let mut env = Environment::new();
        let doc = b"base: &base\n  retries: 1\n  queue: default\nsteps:\n  - <<: *base\n    queue: fast\n";
        let value = parse(doc, &ParseOptions::default(), Some(&mut env)).unwrap();
        let steps = value.as_mapping().unwrap()["steps"].as_sequence().unwrap();
        let step = steps[0].as_mapping().unwrap();
        assert_eq!(step["retries"], PipelineValue::Int(1));
        assert_eq!(step["queue"].as_str(), Some("fast"));
        assert!(!step.contains_key("<<"));
    }

    #[test]
    fn json_decode_error_strips_noise_prefix() {
        let err = decode(b"{not json", Format::Json, Some("p.json")).unwrap_err();
        match err {
            PipelineError::Parse { format, .. } => assert_eq!(format, "json"),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }
}
