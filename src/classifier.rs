//! Maps query text plus caller hints onto a [`WorkloadClass`].
//!
//! Classification is total and side-effect free. The keyword tables are plain
//! data so the rules can be reviewed and extended without touching the
//! matching logic.

use crate::workload::{QueryOptions, WorkloadClass};

/// Leading verbs that route a statement to the write pool.
pub const WRITE_VERBS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP", "REPLACE", "TRUNCATE", "MERGE",
];

/// Markers that always indicate an analytical query.
pub const ANALYTICS_MARKERS: &[&str] = &["SUM(", "AVG(", "WINDOW", "PARTITION BY"];

/// Aggregates that count as analytical only together with `GROUP BY`.
pub const GROUPED_AGGREGATES: &[&str] = &["COUNT(", "MIN(", "MAX(", "SUM(", "AVG("];

pub const MAINTENANCE_VERBS: &[&str] = &["VACUUM", "ANALYZE", "REINDEX"];

/// Resolves the workload class for `sql`.
///
/// Priority: explicit `query_type`, write verb prefix, analytics markers or
/// hint, maintenance verbs or hint, then `read`. With `read_only` set, a
/// statement without a write verb skips the keyword scan and goes to `read`
/// unless the analytics or background hint asks otherwise. A write verb
/// still wins; [`crate::manager::PoolManager::query`] rejects that pairing.
pub fn classify(sql: &str, hints: &QueryOptions) -> WorkloadClass {
    if let Some(class) = hints.query_type {
        return class;
    }

    let upper = collapse_whitespace(sql.trim_start()).to_ascii_uppercase();

    if starts_with_verb(&upper, WRITE_VERBS) {
        return WorkloadClass::Write;
    }
    if hints.read_only {
        return if hints.is_analytics {
            WorkloadClass::Analytics
        } else if hints.is_background {
            WorkloadClass::Background
        } else {
            WorkloadClass::Read
        };
    }
    if hints.is_analytics || is_analytical(&upper) {
        return WorkloadClass::Analytics;
    }
    if hints.is_background || contains_word(&upper, MAINTENANCE_VERBS) {
        return WorkloadClass::Background;
    }
    WorkloadClass::Read
}

fn starts_with_verb(upper: &str, verbs: &[&str]) -> bool {
    verbs.iter().any(|verb| {
        upper.starts_with(verb)
            && upper[verb.len()..]
                .chars()
                .next()
                .is_none_or(|c| !is_ident_char(c))
    })
}

fn is_analytical(upper: &str) -> bool {
    if ANALYTICS_MARKERS.iter().any(|m| contains_marker(upper, m)) {
        return true;
    }
    contains_marker(upper, "GROUP BY")
        && GROUPED_AGGREGATES.iter().any(|agg| contains_marker(upper, agg))
}

fn contains_word(upper: &str, words: &[&str]) -> bool {
    words.iter().any(|w| contains_marker(upper, w))
}

/// Substring match that refuses hits glued to a neighbouring identifier,
/// so `ANALYZED_AT` or `MY_SUM(` do not count. `normalized` has every
/// whitespace run collapsed to one space.
fn contains_marker(normalized: &str, marker: &str) -> bool {
    let mut from = 0;
    while let Some(pos) = normalized[from..].find(marker) {
        let start = from + pos;
        let end = start + marker.len();
        let before_ok = normalized[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !is_ident_char(c));
        let after_ok = marker.ends_with('(')
            || normalized[end..]
                .chars()
                .next()
                .is_none_or(|c| !is_ident_char(c));
        if before_ok && after_ok {
            return true;
        }
        from = start + 1;
    }
    false
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
