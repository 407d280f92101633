//! Turns a user question plus an introspected schema into a candidate
//! SELECT statement, and sanitizes the generator's raw output into either
//! exactly one single-line statement or nothing.

use std::fmt::Write as _;

use crate::external::ExternalSchema;

/// Sentinel the generator is instructed to emit when the question cannot be
/// answered from the listed tables.
pub const NOT_POSSIBLE: &str = "NOT_POSSIBLE";

/// Renders the schema as one `table: col, col, ...` line per table, in
/// table order.
pub fn schema_prompt(schema: &ExternalSchema) -> String {
    let mut out = String::new();
    for (table, columns) in schema {
        let _ = writeln!(out, "{table}: {}", columns.join(", "));
    }
    out
}

/// Prompt asking for a single-line SELECT over the given schema, or the
/// refusal sentinel. The contract here mirrors what `extract_candidate`
/// accepts; anything looser gets dropped on the floor.
pub fn build_query_prompt(question: &str, schema: &ExternalSchema) -> String {
    format!(
        "You translate questions into SQL for a PostgreSQL database.\n\
         Available tables and columns:\n{schema}\n\
         Rules:\n\
         - Output exactly one SELECT statement on a single line.\n\
         - Use only the tables and columns listed above.\n\
         - No markdown, no backticks, no explanation.\n\
         - If the question cannot be answered from these tables, output \
         exactly {NOT_POSSIBLE}.\n\n\
         Question: {question}",
        schema = schema_prompt(schema),
    )
}

/// Reduces the generator's raw output to a candidate statement.
///
/// Strips markdown fences and backticks, folds the text onto one line, and
/// drops a trailing semicolon. Returns None for the refusal sentinel or
/// anything that is not a lone SELECT. This is shape filtering only; the
/// schema guard does the real validation afterwards.
pub fn extract_candidate(raw: &str) -> Option<String> {
    let cleaned = raw.replace("```sql", "").replace("```", "").replace('`', "");
    let single_line = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let candidate = single_line.trim().trim_end_matches(';').trim().to_string();

    if candidate.is_empty() || candidate.contains(NOT_POSSIBLE) {
        return None;
    }
    if !candidate
        .get(..6)
        .map(|head| head.eq_ignore_ascii_case("select"))
        .unwrap_or(false)
    {
        return None;
    }
    Some(candidate)
}
