use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
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

/// One row of `list` output: a port link and the connection carrying it.
#[derive(Debug, Clone, Serialize)]
pub struct LinkRow {
    pub peer: String,
    pub local: String,
    pub remote: String,
}

pub fn print_links(rows: &[LinkRow], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for row in rows {
                println!(
                    "{}",
                    serde_json::to_string(row).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PEER", "LOCAL PORT", "REMOTE PORT"]);
            for row in rows {
                table.add_row(vec![
                    row.peer.clone(),
                    row.local.clone(),
                    row.remote.clone(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for row in rows {
                println!("{} -> {} @ {}", row.local, row.remote, row.peer);
            }
        }
    }
}
