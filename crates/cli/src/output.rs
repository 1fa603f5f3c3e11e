//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable tables and summaries
    #[default]
    Human,
    /// JSON format
    Json,
    /// Markdown tables
    Markdown,
    /// Comma-separated values
    Csv,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

/// Render rows in a tabular format; JSON is handled by the caller
pub fn render_rows(headers: &[&str], rows: &[Vec<String>], format: OutputFormat) -> String {
    match format {
        OutputFormat::Human | OutputFormat::Json => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(headers.to_vec());
            for row in rows {
                table.add_row(row.clone());
            }
            table.to_string()
        }
        OutputFormat::Markdown => {
            let line = |cells: Vec<String>| format!("| {} |", cells.join(" | "));
            let mut out = vec![
                line(headers.iter().map(|h| markdown_cell(h)).collect()),
                line(headers.iter().map(|_| "---".to_string()).collect()),
            ];
            out.extend(rows.iter().map(|row| line(row.iter().map(|c| markdown_cell(c)).collect())));
            out.join("\n")
        }
        OutputFormat::Csv => {
            let line = |cells: Vec<String>| cells.join(",");
            let mut out = vec![line(headers.iter().map(|h| csv_field(h)).collect())];
            out.extend(rows.iter().map(|row| line(row.iter().map(|c| csv_field(c)).collect())));
            out.join("\n")
        }
    }
}

fn markdown_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json(items);
        return;
    }
    if items.is_empty() && format == OutputFormat::Human {
        println!("No items found.");
        return;
    }
    let rows: Vec<Vec<String>> = items.iter().map(TableDisplay::row).collect();
    println!("{}", render_rows(&T::headers(), &rows, format));
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => print_error(&format!("cannot serialize output: {}", e)),
    }
}

/// Section heading for multi-part reports
pub fn print_section(title: &str, format: OutputFormat) {
    match format {
        OutputFormat::Human => println!("\n{}", title.bold().underline()),
        OutputFormat::Markdown => println!("\n## {}\n", title),
        OutputFormat::Csv => println!(),
        OutputFormat::Json => {}
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "!".yellow().bold(), message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue(), message);
}

/// Percentage with one decimal
pub fn percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Vec<String>> {
        vec![
            vec!["db-roundtrip".to_string(), "pass".to_string()],
            vec!["api, slow".to_string(), "fail: \"boom\" | x".to_string()],
        ]
    }

    #[test]
    fn test_markdown_escapes_pipes() {
        let out = render_rows(&["Test", "Verdict"], &rows(), OutputFormat::Markdown);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "| Test | Verdict |");
        assert_eq!(lines[1], "| --- | --- |");
        assert_eq!(lines[3], "| api, slow | fail: \"boom\" \\| x |");
    }

    #[test]
    fn test_csv_quotes_when_needed() {
        let out = render_rows(&["Test", "Verdict"], &rows(), OutputFormat::Csv);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "Test,Verdict");
        assert_eq!(lines[1], "db-roundtrip,pass");
        assert_eq!(lines[2], "\"api, slow\",\"fail: \"\"boom\"\" | x\"");
    }

    #[test]
    fn test_human_table_has_every_cell() {
        let out = render_rows(&["Test", "Verdict"], &rows(), OutputFormat::Human);
        assert!(out.contains("db-roundtrip"));
        assert!(out.contains("Verdict"));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0.1234), "12.3%");
        assert_eq!(percent(1.0), "100.0%");
    }
}
