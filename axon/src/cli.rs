//! Argv remap parsing (spec §4.A init contract, §4.L, §6 CLI surface).
//!
//! Scans a process's arguments for `local:=remote` pairs. Special `__key:=value` pairs are
//! peeled off into [`SpecialArgs`]; everything else becomes a per-name remap. Arguments that
//! don't match the `:=` shape are left untouched in the residual argv, exactly as the original
//! source's remapping-table-from-argv behavior: unrecognized args are never an error here, they
//! are simply not remaps.

use crate::names::{Remappings, SpecialArgs};

/// Parsed result of scanning a node's argv for remap arguments.
pub struct ParsedArgs {
    pub remappings: Remappings,
    pub special: SpecialArgs,
    /// Arguments that were not `:=` pairs, in original order.
    pub residual: Vec<String>,
}

/// Parses `argv` (not including argv[0]) for `local:=remote` and `__key:=value` arguments.
pub fn parse_argv<I, S>(argv: I) -> ParsedArgs
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut remappings = Remappings::new();
    let mut special = SpecialArgs::default();
    let mut residual = Vec::new();

    for arg in argv {
        let arg = arg.as_ref();
        match arg.split_once(":=") {
            Some((local, remote)) if !local.is_empty() && !remote.is_empty() => {
                if !special.consume(local, remote) {
                    remappings.insert(local.to_string(), remote.to_string());
                }
            }
            _ => residual.push(arg.to_string()),
        }
    }

    ParsedArgs {
        remappings,
        special,
        residual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_remaps_and_special_args_and_residual() {
        let argv = ["foo:=bar", "~baz:=/qux", "__name:=talker", "__ns:=/a", "--verbose"];
        let parsed = parse_argv(argv);
        assert_eq!(parsed.special.name.as_deref(), Some("talker"));
        assert_eq!(parsed.special.namespace.as_deref(), Some("/a"));
        assert_eq!(parsed.remappings.lookup("foo"), Some("bar"));
        assert_eq!(parsed.remappings.lookup("~baz"), Some("/qux"));
        assert_eq!(parsed.residual, vec!["--verbose".to_string()]);
    }

    #[test]
    fn non_assignment_args_pass_through() {
        let argv = ["just_a_positional_arg", "key:="];
        let parsed = parse_argv(argv);
        assert!(parsed.remappings.iter().next().is_none());
        assert_eq!(parsed.residual.len(), 2);
    }
}
