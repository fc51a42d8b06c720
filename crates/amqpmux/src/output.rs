use std::io::{IsTerminal, Write};

use amqpmux_frame::{FieldTable, FieldValue};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Two-column key/value table.
pub fn print_table(rows: &[(&str, String)]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["FIELD", "VALUE"]);
    for (key, value) in rows {
        table.add_row(vec![key.to_string(), value.clone()]);
    }
    println!("{table}");
}

pub fn print_pretty(title: &str, rows: &[(&str, String)]) {
    println!("{title}:");
    let width = rows.iter().map(|(key, _)| key.len()).max().unwrap_or(0) + 1;
    for (key, value) in rows {
        println!("  {:<width$} {value}", format!("{key}:"), width = width);
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// A server property rendered for display; `None` when absent.
pub fn property_text(properties: &FieldTable, key: &str) -> Option<String> {
    properties.get(key).map(field_text)
}

fn field_text(value: &FieldValue) -> String {
    match value {
        FieldValue::LongString(bytes) | FieldValue::Bytes(bytes) => {
            match std::str::from_utf8(bytes) {
                Ok(text) => text.to_string(),
                Err(_) => format!("<binary {} bytes>", bytes.len()),
            }
        }
        FieldValue::Bool(v) => v.to_string(),
        FieldValue::Table(table) => format!("<table {} entries>", table.len()),
        FieldValue::Array(items) => format!("<array {} items>", items.len()),
        FieldValue::Void => String::new(),
        other => format!("{other:?}"),
    }
}
