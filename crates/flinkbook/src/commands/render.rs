use comfy_table::{Cell, Color, Table};
use flinkbook_core::execution::ResultSnapshot;
use flinkbook_core::gateway::RowKind;
use flinkbook_core::runtime::RuntimeInfo;
use serde_json::Value;

/// Table of a snapshot's rows. Streaming results get a leading change-kind column.
pub fn result_table(snapshot: &ResultSnapshot) -> Table {
    let mut table = Table::new();
    let mut header = Vec::with_capacity(snapshot.columns.len() + 1);
    if snapshot.streaming {
        header.push(Cell::new("op").fg(Color::Green));
    }
    header.extend(
        snapshot
            .columns
            .iter()
            .map(|column| Cell::new(&column.name).fg(Color::Green)),
    );
    table.set_header(header);

    for row in &snapshot.rows {
        let mut cells = Vec::with_capacity(row.fields.len() + 1);
        if snapshot.streaming {
            cells.push(Cell::new(change_marker(row.kind)));
        }
        cells.extend(row.fields.iter().map(|field| Cell::new(field_text(field))));
        table.add_row(cells);
    }
    table
}

pub fn runtime_table(info: &RuntimeInfo) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("Property").fg(Color::Green),
        Cell::new("Value").fg(Color::Green),
    ]);
    let pid = info
        .process_id
        .map_or_else(|| "-".to_string(), |pid| pid.to_string());
    table.add_row(vec!["Process", pid.as_str()]);
    table.add_row(vec!["SQL Gateway", info.gateway_url.as_str()]);
    table.add_row(vec!["Web UI", info.web_ui_url.as_str()]);
    table.add_row(vec!["Memory".to_string(), format!("{} MB", info.memory_mb)]);
    table.add_row(vec!["Parallelism".to_string(), info.parallelism.to_string()]);
    table.add_row(vec!["Task slots".to_string(), info.task_slots.to_string()]);
    table
}

fn change_marker(kind: RowKind) -> &'static str {
    match kind {
        RowKind::Insert => "+I",
        RowKind::UpdateBefore => "-U",
        RowKind::UpdateAfter => "+U",
        RowKind::Delete => "-D",
    }
}

fn field_text(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flinkbook_core::execution::{ResultRows, StatementKey};
    use flinkbook_core::gateway::{Column, Row};
    use serde_json::json;

    fn snapshot(streaming: bool) -> ResultSnapshot {
        ResultSnapshot {
            key: StatementKey::from("cell-1"),
            columns: vec![
                Column {
                    name: "id".to_string(),
                    data_type: "INT".to_string(),
                    nullable: false,
                },
                Column {
                    name: "name".to_string(),
                    data_type: "STRING".to_string(),
                    nullable: true,
                },
            ],
            rows: ResultRows::from(vec![
                Row::insert(vec![json!(1), json!("alice")]),
                Row {
                    kind: RowKind::Delete,
                    fields: vec![json!(2), Value::Null],
                },
            ]),
            terminal: None,
            streaming,
            job_id: None,
        }
    }

    #[test]
    fn test_batch_table_has_only_result_columns() {
        let rendered = result_table(&snapshot(false)).to_string();
        assert!(rendered.contains("alice"));
        assert!(rendered.contains("NULL"));
        assert!(!rendered.contains("+I"));
    }

    #[test]
    fn test_streaming_table_marks_changes() {
        let rendered = result_table(&snapshot(true)).to_string();
        assert!(rendered.contains("op"));
        assert!(rendered.contains("+I"));
        assert!(rendered.contains("-D"));
    }

    #[test]
    fn test_strings_are_unquoted() {
        assert_eq!(field_text(&json!("x")), "x");
        assert_eq!(field_text(&json!(1.5)), "1.5");
        assert_eq!(field_text(&json!(true)), "true");
    }
}
