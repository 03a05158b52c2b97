//! Env-dump parsing.
//!
//! Both strategies capture exported variables by running
//! `env > <file>` as the last thing the interpreter does. This module
//! turns such a dump back into [`Variables`]: host mode hands over the
//! file bytes directly, container mode hands over the tar stream the
//! runtime returns for a file download.
//!
//! `env` prints `KEY=VALUE` lines. Values may themselves contain `=`
//! and may span several lines; a line that does not start a new
//! `IDENT=` pair is treated as a continuation of the previous value.

use std::io::Read;

use crate::domain::Variables;

/// Parse a raw env dump, keeping only keys that match `filters`.
///
/// An empty filter list keeps everything. Insertion order follows the
/// dump.
pub fn parse_env_dump(data: &[u8], filters: &[String]) -> Variables {
    let text = String::from_utf8_lossy(data);
    let mut vars = Variables::new();
    let mut current: Option<(String, String)> = None;

    let mut lines: Vec<&str> = text.split('\n').collect();
    // A dump ends with a newline; the phantom empty element after it
    // is not a continuation line.
    if lines.last() == Some(&"") {
        lines.pop();
    }

    for line in lines {
        match split_pair(line) {
            Some((key, value)) => {
                if let Some((k, v)) = current.take() {
                    vars.insert(k, v);
                }
                current = Some((key.to_string(), value.to_string()));
            }
            None => {
                // Continuation of a multi-line value. Lines before the
                // first pair have nothing to belong to and are skipped.
                if let Some((_, v)) = current.as_mut() {
                    v.push('\n');
                    v.push_str(line);
                }
            }
        }
    }
    if let Some((k, v)) = current {
        vars.insert(k, v);
    }

    if filters.is_empty() {
        return vars;
    }
    vars.iter()
        .filter(|(k, _)| matches_filters(k, filters))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Parse an env dump wrapped in a tar stream containing the dump file
/// as its only entry.
pub fn parse_env_from_tar(data: &[u8], filters: &[String]) -> std::io::Result<Variables> {
    let mut archive = tar::Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        return Ok(parse_env_dump(&contents, filters));
    }
    Ok(Variables::new())
}

/// `true` when `key` starts with any of the configured prefixes.
pub fn matches_filters(key: &str, filters: &[String]) -> bool {
    filters.is_empty() || filters.iter().any(|prefix| key.starts_with(prefix.as_str()))
}

/// Split `IDENT=value`, rejecting lines whose left side is not a
/// plausible variable name.
fn split_pair(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let mut chars = key.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key, value))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const NO_FILTERS: &[String] = &[];

    fn filters(prefixes: &[&str]) -> Vec<String> {
        prefixes.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_simple_pairs_in_order() {
        let dump = b"FLOW_B=two\nFLOW_A=one\nPATH=/usr/bin\n";
        let vars = parse_env_dump(dump, NO_FILTERS);

        let entries: Vec<_> = vars.iter().collect();
        assert_eq!(
            entries,
            vec![("FLOW_B", "two"), ("FLOW_A", "one"), ("PATH", "/usr/bin")]
        );
    }

    #[test]
    fn value_may_contain_equals_signs() {
        let dump = b"LESSOPEN=| /usr/bin/lesspipe %s\nOPTS=a=1,b=2\n";
        let vars = parse_env_dump(dump, NO_FILTERS);
        assert_eq!(vars.get("OPTS"), Some("a=1,b=2"));
        assert_eq!(vars.get("LESSOPEN"), Some("| /usr/bin/lesspipe %s"));
    }

    #[test]
    fn multi_line_values_are_reassembled() {
        let dump = b"FUNC=() {  echo hi\n}\nAFTER=x\n";
        let vars = parse_env_dump(dump, NO_FILTERS);
        assert_eq!(vars.get("FUNC"), Some("() {  echo hi\n}"));
        assert_eq!(vars.get("AFTER"), Some("x"));
    }

    #[test]
    fn continuation_lines_with_non_identifier_left_side_attach() {
        // "12=3" and "-x=y" are not valid names, so they continue the
        // previous value.
        let dump = b"MULTI=first\n12=3\n-x=y\n";
        let vars = parse_env_dump(dump, NO_FILTERS);
        assert_eq!(vars.get("MULTI"), Some("first\n12=3\n-x=y"));
    }

    #[test]
    fn filters_keep_only_matching_prefixes() {
        let dump = b"FLOW_VVV=flowci\nHOME=/root\nFLOW_AAA=flow...\n";
        let vars = parse_env_dump(dump, &filters(&["FLOW_"]));

        let entries: Vec<_> = vars.iter().collect();
        assert_eq!(entries, vec![("FLOW_VVV", "flowci"), ("FLOW_AAA", "flow...")]);
    }

    #[test]
    fn empty_filter_list_keeps_everything() {
        let dump = b"A=1\nB=2\n";
        assert_eq!(parse_env_dump(dump, NO_FILTERS).len(), 2);
    }

    #[test]
    fn tar_wrapped_dump_is_unpacked_and_parsed() {
        // Build a single-entry tar the way the runtime returns file
        // downloads.
        let mut builder = tar::Builder::new(Vec::new());
        let body = b"FLOW_X=1\nOTHER=2\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, ".env", &body[..])
            .expect("append tar entry");
        let data = builder.into_inner().expect("finish tar");

        let vars = parse_env_from_tar(&data, &filters(&["FLOW_"])).expect("parse tar");
        let entries: Vec<_> = vars.iter().collect();
        assert_eq!(entries, vec![("FLOW_X", "1")]);
    }

    #[test]
    fn empty_tar_yields_empty_variables() {
        let builder = tar::Builder::new(Vec::new());
        let data = builder.into_inner().expect("finish tar");
        let vars = parse_env_from_tar(&data, NO_FILTERS).expect("parse tar");
        assert!(vars.is_empty());
    }
}
