//! C3: env/arg resolver. Expands `${NAME}` / `${NAME:-default}` tokens in
//! every string scalar of a parsed YAML tree before the builder sees it.
//!
//! Grounded on `aqueducts-core::substitute_params`: a single compiled regex
//! walking the raw document, `run-args > process env > inline default >
//! unset-is-an-error` precedence, same as spec §4.3.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

use crate::error::{ConduitError, ErrorKind, Result};

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").unwrap());

/// Run-scoped argument map populated by `--args key=value` (CLI) or the
/// HTTP driver's `args` request field.
pub type RunArgs = HashMap<String, String>;

/// Expand every `${...}` token inside `value` using `args`, falling back to
/// the process environment, then an inline default, erroring if none apply.
pub fn resolve_string(value: &str, args: &RunArgs) -> Result<String> {
    let mut first_err: Option<ConduitError> = None;
    let resolved = TOKEN_RE
        .replace_all(value, |caps: &Captures| {
            let name = &caps[1];
            let default = caps.get(3).map(|m| m.as_str());
            if let Some(v) = args.get(name) {
                v.clone()
            } else if let Ok(v) = std::env::var(name) {
                v
            } else if let Some(d) = default {
                d.to_string()
            } else {
                if first_err.is_none() {
                    first_err = Some(ConduitError::new(
                        ErrorKind::ParseError,
                        format!("unresolved variable: {name}"),
                    ));
                }
                String::new()
            }
        })
        .into_owned();
    if let Some(err) = first_err {
        return Err(err);
    }
    Ok(resolved)
}

/// Walk a parsed YAML document, resolving every string scalar in place.
pub fn resolve_yaml(value: &serde_yaml::Value, args: &RunArgs) -> Result<serde_yaml::Value> {
    use serde_yaml::Value as Y;
    match value {
        Y::String(s) => Ok(Y::String(resolve_string(s, args)?)),
        Y::Sequence(seq) => {
            let mut out = Vec::with_capacity(seq.len());
            for v in seq {
                out.push(resolve_yaml(v, args)?);
            }
            Ok(Y::Sequence(out))
        }
        Y::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                out.insert(resolve_yaml(k, args)?, resolve_yaml(v, args)?);
            }
            Ok(Y::Mapping(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> RunArgs {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn args_take_precedence_over_default() {
        let resolved = resolve_string("n=${limit:-3}", &args(&[("limit", "7")])).unwrap();
        assert_eq!(resolved, "n=7");
    }

    #[test]
    fn falls_back_to_default_when_unset() {
        let resolved = resolve_string("n=${limit:-3}", &args(&[])).unwrap();
        assert_eq!(resolved, "n=3");
    }

    #[test]
    fn unresolved_without_default_is_an_error() {
        let err = resolve_string("${totally_missing}", &args(&[])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn resolving_an_already_resolved_tree_is_identity() {
        let doc: serde_yaml::Value = serde_yaml::from_str("id: conduit.Input\nn: 7\n").unwrap();
        let once = resolve_yaml(&doc, &args(&[])).unwrap();
        let twice = resolve_yaml(&once, &args(&[])).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn resolves_nested_mapping_and_sequence() {
        let doc: serde_yaml::Value =
            serde_yaml::from_str("id: conduit.Input\ndata:\n  - message: \"${greeting:-hi}\"\n").unwrap();
        let resolved = resolve_yaml(&doc, &args(&[])).unwrap();
        let as_str = serde_yaml::to_string(&resolved).unwrap();
        assert!(as_str.contains("hi"));
    }
}
