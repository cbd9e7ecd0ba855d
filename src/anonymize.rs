//! Compiles declarative per-column anonymization rules into one idempotent
//! SQL statement per table and applies them through a local client.
//!
//! Per table, a numbered-rows CTE orders all rows deterministically and a
//! single UPDATE sets every targeted column. The UPDATE only touches rows
//! whose value differs (`IS DISTINCT FROM`), so repeat application is a
//! no-op.

use std::sync::Arc;

use ahash::AHashMap;
use tracing::info;

use crate::config::Config;
use crate::db::AnonymizationRule;
use crate::error::BranchError;
use crate::resource::cmd::AdminRunner;

/// Row-index placeholder recognized inside templates.
pub const PLACEHOLDER: &str = "${i}";

/// Template type; governs SQL rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Text,
    Integer,
    Boolean,
    Null,
}

impl RuleKind {
    pub fn parse(s: &str) -> Result<Self, BranchError> {
        match s {
            "text" => Ok(Self::Text),
            "integer" => Ok(Self::Integer),
            "boolean" => Ok(Self::Boolean),
            "null" => Ok(Self::Null),
            other => Err(BranchError::Validation(format!(
                "unknown anonymization rule kind `{other}`"
            ))),
        }
    }
}

/// Builds the value expression for one rule. Splitting the template on the
/// placeholder yields literal segments that are concatenated with the row
/// number in template order; boolean and null templates ignore the row
/// number entirely.
fn value_expression(kind: RuleKind, template: &str) -> String {
    match kind {
        RuleKind::Null => "NULL".to_string(),
        RuleKind::Boolean => {
            let truthy = matches!(template.trim().to_ascii_lowercase().as_str(), "true" | "1");
            if truthy { "TRUE" } else { "FALSE" }.to_string()
        }
        RuleKind::Text => {
            if !template.contains(PLACEHOLDER) {
                return quote_literal(template);
            }
            let concat = concat_with_row_number(template, "numbered.n");
            if concat == "numbered.n" {
                "(numbered.n)::text".to_string()
            } else {
                concat
            }
        }
        RuleKind::Integer => {
            if !template.contains(PLACEHOLDER) {
                return format!("({})::integer", quote_literal(template));
            }
            let concat = concat_with_row_number(template, "numbered.n::text");
            format!("({concat})::integer")
        }
    }
}

/// Alternates quoted literal segments and the row-number reference in
/// template order. Empty segments (placeholder at either end) are skipped.
fn concat_with_row_number(template: &str, n_expr: &str) -> String {
    let segments: Vec<&str> = template.split(PLACEHOLDER).collect();
    let mut parts = Vec::new();
    for (i, seg) in segments.iter().enumerate() {
        if !seg.is_empty() {
            parts.push(quote_literal(seg));
        }
        if i + 1 < segments.len() {
            parts.push(n_expr.to_string());
        }
    }
    parts.join(" || ")
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Accepts plain SQL identifiers only; rules are data, not trusted SQL.
fn validate_identifier(name: &str) -> Result<(), BranchError> {
    if name.is_empty() {
        return Err(BranchError::Validation("empty identifier".to_string()));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(BranchError::Validation(format!(
            "invalid identifier `{name}`"
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BranchError::Validation(format!(
            "invalid identifier `{name}`"
        )));
    }
    Ok(())
}

/// Compiles all rules targeting one table into a single idempotent UPDATE.
///
/// Rows are ordered by the primary key when one is supplied, else by the
/// physical row id.
pub fn compile_table_update(
    table: &str,
    rules: &[AnonymizationRule],
    primary_key: Option<&str>,
) -> Result<String, BranchError> {
    validate_identifier(table)?;
    if rules.is_empty() {
        return Err(BranchError::Validation(format!(
            "no rules supplied for table `{table}`"
        )));
    }

    let order_col = primary_key.unwrap_or("ctid");
    if let Some(pk) = primary_key {
        validate_identifier(pk)?;
    }

    let mut sets = Vec::new();
    let mut guards = Vec::new();
    for rule in rules {
        validate_identifier(&rule.column_name)?;
        if rule.template.is_empty() && rule.kind != "null" {
            return Err(BranchError::Validation(format!(
                "empty template for {table}.{}",
                rule.column_name
            )));
        }
        let kind = RuleKind::parse(&rule.kind)?;
        let expr = value_expression(kind, &rule.template);
        sets.push(format!("{} = {expr}", rule.column_name));
        guards.push(format!("t.{} IS DISTINCT FROM {expr}", rule.column_name));
    }

    Ok(format!(
        "WITH numbered AS (\n\
         \x20   SELECT {order_col} AS row_id, row_number() OVER (ORDER BY {order_col}) AS n\n\
         \x20   FROM {table}\n\
         )\n\
         UPDATE {table} AS t\n\
         SET {}\n\
         FROM numbered\n\
         WHERE t.{order_col} = numbered.row_id\n\
         \x20 AND ({})",
        sets.join(",\n    "),
        guards.join("\n       OR ")
    ))
}

/// Groups rules by table, preserving the stored ordering inside each group.
pub fn group_by_table(rules: &[AnonymizationRule]) -> AHashMap<String, Vec<AnonymizationRule>> {
    let mut grouped: AHashMap<String, Vec<AnonymizationRule>> = AHashMap::new();
    for rule in rules {
        grouped
            .entry(rule.table_name.clone())
            .or_default()
            .push(rule.clone());
    }
    grouped
}

/// Applies compiled rules to a restored cluster through `psql`.
#[derive(Clone)]
pub struct Anonymizer {
    cfg: Arc<Config>,
    admin: AdminRunner,
}

impl Anonymizer {
    pub fn new(cfg: Arc<Config>, admin: AdminRunner) -> Self {
        Self { cfg, admin }
    }

    /// Runs one statement per table against the cluster on `port`. Failure
    /// blocks the restore from becoming ready but never deletes restored
    /// data; a later anonymization-only retry stays possible.
    pub async fn apply(
        &self,
        port: u16,
        rules: &[AnonymizationRule],
    ) -> Result<(), BranchError> {
        if rules.is_empty() {
            return Ok(());
        }

        let grouped = group_by_table(rules);
        let mut tables: Vec<&String> = grouped.keys().collect();
        tables.sort();

        let port_arg = port.to_string();
        for table in tables {
            let sql = compile_table_update(table, &grouped[table], None)?;
            self.admin
                .run(
                    &self.cfg.psql_bin,
                    &[
                        "-h",
                        "127.0.0.1",
                        "-p",
                        &port_arg,
                        "-U",
                        "postgres",
                        "-d",
                        &self.cfg.restore_database,
                        "-v",
                        "ON_ERROR_STOP=1",
                        "-c",
                        &sql,
                    ],
                )
                .await
                .map_err(|e| BranchError::Anonymization {
                    table: table.clone(),
                    detail: e.to_string(),
                })?;
            info!(table, port, "anonymization applied");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(table: &str, column: &str, template: &str, kind: &str) -> AnonymizationRule {
        AnonymizationRule {
            id: 0,
            table_name: table.to_string(),
            column_name: column.to_string(),
            template: template.to_string(),
            kind: kind.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn worked_example_compiles_to_one_update() {
        let rules = vec![
            rule("users", "email", "user_${i}@x.com", "text"),
            rule("users", "id", "${i}", "integer"),
        ];
        let sql = compile_table_update("users", &rules, None).unwrap();

        assert_eq!(sql.matches("UPDATE users").count(), 1);
        assert!(sql.contains("row_number() OVER (ORDER BY ctid)"));
        assert!(sql.contains("email = 'user_' || numbered.n || '@x.com'"));
        assert!(sql.contains("id = (numbered.n::text)::integer"));
        assert!(!sql.contains(PLACEHOLDER), "unexpanded placeholder:\n{sql}");
    }

    #[test]
    fn update_guards_with_is_distinct_from() {
        let rules = vec![rule("users", "email", "user_${i}@x.com", "text")];
        let sql = compile_table_update("users", &rules, None).unwrap();
        assert!(
            sql.contains("t.email IS DISTINCT FROM 'user_' || numbered.n || '@x.com'"),
            "missing idempotency guard:\n{sql}"
        );
    }

    #[test]
    fn expression_alternates_segments_in_template_order() {
        let expr = value_expression(RuleKind::Text, "a${i}b${i}c");
        assert_eq!(expr, "'a' || numbered.n || 'b' || numbered.n || 'c'");

        let leading = value_expression(RuleKind::Text, "${i}-suffix");
        assert_eq!(leading, "numbered.n || '-suffix'");
    }

    #[test]
    fn lone_placeholder_casts_per_kind() {
        assert_eq!(value_expression(RuleKind::Text, "${i}"), "(numbered.n)::text");
        assert_eq!(
            value_expression(RuleKind::Integer, "${i}"),
            "(numbered.n::text)::integer"
        );
    }

    #[test]
    fn boolean_and_null_ignore_row_number() {
        assert_eq!(value_expression(RuleKind::Boolean, "true"), "TRUE");
        assert_eq!(value_expression(RuleKind::Boolean, "${i}"), "FALSE");
        assert_eq!(value_expression(RuleKind::Null, "${i}"), "NULL");
    }

    #[test]
    fn literals_escape_single_quotes() {
        let expr = value_expression(RuleKind::Text, "O'Brien ${i}");
        assert_eq!(expr, "'O''Brien ' || numbered.n");
    }

    #[test]
    fn primary_key_overrides_physical_row_id() {
        let rules = vec![rule("users", "email", "e${i}", "text")];
        let sql = compile_table_update("users", &rules, Some("id")).unwrap();
        assert!(sql.contains("row_number() OVER (ORDER BY id)"));
        assert!(sql.contains("WHERE t.id = numbered.row_id"));
    }

    #[test]
    fn rejects_malformed_identifiers() {
        let rules = vec![rule("users; DROP TABLE x", "email", "e", "text")];
        assert!(compile_table_update("users; DROP TABLE x", &rules, None).is_err());

        let bad_col = vec![rule("users", "email'--", "e", "text")];
        assert!(compile_table_update("users", &bad_col, None).is_err());
    }

    #[test]
    fn rejects_empty_template_except_null() {
        let empty = vec![rule("users", "email", "", "text")];
        assert!(compile_table_update("users", &empty, None).is_err());

        let null_rule = vec![rule("users", "email", "", "null")];
        assert!(compile_table_update("users", &null_rule, None).is_ok());
    }
}
