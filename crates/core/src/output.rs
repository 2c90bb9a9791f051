//! Terminal rendering of run outcomes as colored JSON or tables.

use colored_json::ToColoredJson;
use serde::Serialize;
use tabled::builder::Builder;
use tabled::settings::Style;
use terminal_size::{Width as TWidth, terminal_size};
use textwrap::fill as tw_fill;

use crate::models::{NormalizedRecord, RunOutcome};

/// Per-cell wrap width derived from the terminal and the column count.
pub fn calc_cell_wrap_columns(columns: usize) -> usize {
    let term_cols = match terminal_size().map(|(w, _)| w) {
        Some(TWidth(n)) if n > 20 => n as usize,
        _ => 100usize,
    };
    (term_cols / columns.max(1)).saturating_sub(3).max(12)
}

pub fn print_pretty_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => match s.to_colored_json_auto() {
            Ok(cs) => println!("{cs}"),
            Err(_) => println!("{s}"),
        },
        Err(e) => eprintln!("failed to serialize results: {e}"),
    }
}

/// Render records as a table, one column per field in schema order.
pub fn render_records_table(records: &[NormalizedRecord]) -> String {
    let Some(first) = records.first() else {
        return "No results.".to_string();
    };
    let headers: Vec<String> = first.fields().map(|(name, _)| name.to_string()).collect();
    let wrap = calc_cell_wrap_columns(headers.len());

    let mut builder = Builder::default();
    builder.push_record(headers.clone());
    for record in records {
        builder.push_record(headers.iter().map(|h| {
            let cell = record.get(h).map(|v| v.display()).unwrap_or_default();
            if cell.chars().count() > wrap {
                tw_fill(&cell, wrap)
            } else {
                cell
            }
        }));
    }
    let mut table = builder.build();
    table.with(Style::rounded());
    table.to_string()
}

/// Print every run grouped by site. `NO_TABLE=1` switches to a plain list.
pub fn print_outcomes_table(outcomes: &[(String, RunOutcome)]) {
    let plain = std::env::var("NO_TABLE").ok().as_deref() == Some("1");
    for (site, outcome) in outcomes {
        println!("{site}:");
        match outcome {
            RunOutcome::Failure { error, stage } => println!("  failed during {stage}: {error}\n"),
            RunOutcome::Success { result_records } if plain => {
                if result_records.is_empty() {
                    println!("  No results.");
                }
                for r in result_records {
                    let title = r.text("title").unwrap_or("-");
                    let link = r.text("link").unwrap_or("-");
                    println!("  - {title} ({link})");
                }
                println!();
            }
            RunOutcome::Success { result_records } => {
                println!("{}\n", render_records_table(result_records));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldValue;
    use crate::orchestrator::RunState;

    fn record(title: &str) -> NormalizedRecord {
        let mut r = NormalizedRecord::new();
        r.set("title", FieldValue::Text(title.into()));
        r.set("rent", FieldValue::Integer(450));
        r
    }

    #[test]
    fn wrap_columns_has_minimum() {
        assert!(calc_cell_wrap_columns(50) >= 12);
        assert!(calc_cell_wrap_columns(0) >= 12);
    }

    #[test]
    fn table_has_headers_and_values() {
        let table = render_records_table(&[record("Room in Mitte")]);
        assert!(table.contains("title"));
        assert!(table.contains("rent"));
        assert!(table.contains("Room in Mitte"));
        assert!(table.contains("450"));
    }

    #[test]
    fn empty_table_says_no_results() {
        assert_eq!(render_records_table(&[]), "No results.");
    }

    #[test]
    fn printing_handles_failures_and_empty() {
        print_outcomes_table(&[
            (
                "a".into(),
                RunOutcome::Success {
                    result_records: vec![],
                },
            ),
            (
                "b".into(),
                RunOutcome::Failure {
                    error: "boom".into(),
                    stage: RunState::Fetching,
                },
            ),
        ]);
        print_pretty_json(&serde_json::json!({"count": 0}));
    }
}
