//! Pattern matching against runtime values.

use cursive_ast::ast::{EnumPayloadPat, FieldPat, Lit, Pattern, PatternKind};
use cursive_ast::path::fold_ident;
use cursive_middle::value::{EnumPayload, Value};

use crate::machine::{ice, EvalResult};

/// A successful match's bindings, in source order.
pub type MatchBindings = Vec<(String, Value)>;

/// Tests `pattern` against `value`; `Some(bindings)` on a match.
pub fn match_pattern(pattern: &Pattern, value: &Value) -> EvalResult<Option<MatchBindings>> {
    let mut bindings = Vec::new();
    if match_into(pattern, value, &mut bindings)? {
        Ok(Some(bindings))
    } else {
        Ok(None)
    }
}

fn match_into(
    pattern: &Pattern,
    value: &Value,
    bindings: &mut MatchBindings,
) -> EvalResult<bool> {
    match &pattern.kind {
        PatternKind::Wildcard => Ok(true),
        PatternKind::Ident { name, .. } => {
            bindings.push((name.clone(), value.clone()));
            Ok(true)
        }
        PatternKind::Lit(lit) => Ok(lit_matches(lit, value)),
        PatternKind::Tuple(elems) => match value {
            Value::Tuple(values) if values.len() == elems.len() => {
                for (sub, v) in elems.iter().zip(values) {
                    if !match_into(sub, v, bindings)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        },
        PatternKind::Record { fields, .. } => match value {
            Value::Record(record) => match_fields(fields, &record.fields, bindings),
            _ => Ok(false),
        },
        PatternKind::Enum { path, payload } => match value {
            Value::Enum(enum_val) => {
                if enum_val.path != *path {
                    return Ok(false);
                }
                match (payload, &enum_val.payload) {
                    (None, _) => Ok(true),
                    (Some(EnumPayloadPat::Tuple(subs)), Some(EnumPayload::Tuple(vals)))
                        if subs.len() == vals.len() =>
                    {
                        for (sub, v) in subs.iter().zip(vals) {
                            if !match_into(sub, v, bindings)? {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                    (Some(EnumPayloadPat::Record(subs)), Some(EnumPayload::Record(vals))) => {
                        match_fields(subs, vals, bindings)
                    }
                    _ => Ok(false),
                }
            }
            _ => Ok(false),
        },
        PatternKind::Modal { state, fields, .. } => match value {
            Value::Modal(modal) => {
                if fold_ident(&modal.state) != fold_ident(state) {
                    return Ok(false);
                }
                match fields {
                    None => Ok(true),
                    Some(fields) => match &*modal.payload {
                        Value::Record(record) => match_fields(fields, &record.fields, bindings),
                        payload => Err(ice(format!("modal payload {}", payload))),
                    },
                }
            }
            _ => Ok(false),
        },
    }
}

fn match_fields(
    patterns: &[FieldPat],
    values: &[(String, Value)],
    bindings: &mut MatchBindings,
) -> EvalResult<bool> {
    for field in patterns {
        let folded = fold_ident(&field.name);
        let Some((_, value)) = values.iter().find(|(n, _)| fold_ident(n) == folded) else {
            return Ok(false);
        };
        match &field.pattern {
            Some(sub) => {
                if !match_into(sub, value, bindings)? {
                    return Ok(false);
                }
            }
            None => bindings.push((field.name.clone(), value.clone())),
        }
    }
    Ok(true)
}

fn lit_matches(lit: &Lit, value: &Value) -> bool {
    match (lit, value) {
        (Lit::Bool(a), Value::Bool(b)) => a == b,
        (Lit::Char(a), Value::Char(b)) => a == b,
        (Lit::Unit, Value::Unit) => true,
        (Lit::Int { negative, magnitude, .. }, Value::Int(i)) => {
            let negative = *negative && *magnitude != 0;
            i.negative == negative && i.magnitude == *magnitude
        }
        (Lit::Float { value: a, .. }, Value::Float(b)) => *a == b.value,
        (Lit::Str(bytes), Value::Str(s)) => *bytes == s.bytes,
        (Lit::Bytes(bytes), Value::Bytes(b)) => *bytes == b.bytes,
        _ => false,
    }
}

/// Irrefutable binding for `let` patterns; a refutable pattern that fails
/// to match is an upstream bug surfaced as an ICE.
pub fn bind_irrefutable(pattern: &Pattern, value: &Value) -> EvalResult<MatchBindings> {
    match match_pattern(pattern, value)? {
        Some(bindings) => Ok(bindings),
        None => Err(ice(format!("irrefutable pattern failed on {}", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_ast::path::Path;
    use cursive_middle::value::EnumVal;

    #[test]
    fn enum_payload_binds_positionally() {
        let value = Value::Enum(EnumVal {
            path: Path::from_segments(vec!["Option", "Some"]),
            payload: Some(EnumPayload::Tuple(vec![Value::i32(5)])),
        });
        let pattern = Pattern::new(PatternKind::Enum {
            path: Path::from_segments(vec!["Option", "Some"]),
            payload: Some(EnumPayloadPat::Tuple(vec![Pattern::new(PatternKind::Ident {
                name: "x".into(),
                by_move: false,
            })])),
        });
        let bindings = match_pattern(&pattern, &value).unwrap().expect("match");
        assert_eq!(bindings, vec![("x".to_string(), Value::i32(5))]);
    }

    #[test]
    fn wrong_variant_does_not_match() {
        let value = Value::Enum(EnumVal {
            path: Path::from_segments(vec!["Option", "None"]),
            payload: None,
        });
        let pattern = Pattern::new(PatternKind::Enum {
            path: Path::from_segments(vec!["Option", "Some"]),
            payload: None,
        });
        assert!(match_pattern(&pattern, &value).unwrap().is_none());
    }

    #[test]
    fn negative_zero_literal_matches_zero() {
        let pattern = Pattern::new(PatternKind::Lit(Lit::Int {
            negative: true,
            magnitude: 0,
            ty: None,
        }));
        assert!(match_pattern(&pattern, &Value::i32(0)).unwrap().is_some());
    }
}
