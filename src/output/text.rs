//! Human-readable text output

use super::RoundSummary;
use crate::util::time::{format_latency, format_rate};

const HEADERS: [&str; 9] = [
    "Name",
    "Succ",
    "Fail",
    "Send Rate",
    "Max Latency",
    "Min Latency",
    "Avg Latency",
    "75%ile Latency",
    "Throughput",
];

/// One line of the results table
fn row(summary: &RoundSummary) -> Vec<String> {
    let stats = &summary.stats;
    let latency = |value: Option<f64>| value.map(format_latency).unwrap_or_else(|| "-".to_string());
    let rate = |value: Option<f64>| value.map(format_rate).unwrap_or_else(|| "-".to_string());
    let delay = stats.delay.as_ref();

    vec![
        summary.label.clone(),
        stats.succ.to_string(),
        stats.fail.to_string(),
        rate(stats.send_rate()),
        latency(delay.map(|d| d.max)),
        latency(delay.map(|d| d.min)),
        latency(stats.avg_delay()),
        latency(summary.latency_percentile(75.0)),
        rate(stats.throughput()),
    ]
}

/// Render the results table for a set of rounds
pub fn render_table(rounds: &[RoundSummary]) -> String {
    let rows: Vec<Vec<String>> = rounds.iter().map(row).collect();
    let mut widths: Vec<usize> = HEADERS.iter().map(|h| h.len()).collect();
    for cells in &rows {
        for (width, cell) in widths.iter_mut().zip(cells) {
            *width = (*width).max(cell.len());
        }
    }

    let rule: String = widths
        .iter()
        .map(|w| "-".repeat(w + 2))
        .collect::<Vec<_>>()
        .join("+");
    let rule = format!("+{}+", rule);
    let line = |cells: &[String]| {
        let inner: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!(" {:<width$} ", cell, width = *w))
            .collect();
        format!("|{}|", inner.join("|"))
    };

    let headers: Vec<String> = HEADERS.iter().map(|h| h.to_string()).collect();
    let mut out = Vec::with_capacity(rows.len() + 4);
    out.push(rule.clone());
    out.push(line(&headers));
    out.push(rule.clone());
    for cells in &rows {
        out.push(line(cells));
    }
    out.push(rule);
    out.join("\n")
}

/// Print the results of one round
pub fn print_round_results(summary: &RoundSummary) {
    println!();
    println!("Round {} ({})", summary.round_idx, summary.label);
    if let Some(ref error) = summary.error {
        println!("  FAILED: {}", error);
        if summary.per_worker.is_empty() {
            return;
        }
        println!("  Partial results from {} worker(s):", summary.per_worker.len());
    }
    println!("{}", render_table(std::slice::from_ref(summary)));
}

/// Print the summary of every round
pub fn print_summary(test_name: &str, rounds: &[RoundSummary]) {
    let failed = rounds.iter().filter(|r| !r.succeeded()).count();
    println!();
    println!("═══════════════════════════════════════════════════════════");
    println!("                    TEST SUMMARY: {}", test_name);
    println!("═══════════════════════════════════════════════════════════");
    println!("{}", render_table(rounds));
    if failed > 0 {
        println!("{} of {} round(s) failed", failed, rounds.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::fixtures::summary;
    use crate::stats::TxStats;

    #[test]
    fn test_table_layout() {
        let table = render_table(&[summary("open"), summary("query")]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[1].contains("75%ile Latency"));
        assert!(lines[3].starts_with("| open "));
        // every line has the same width
        assert!(lines.iter().all(|l| l.chars().count() == lines[0].chars().count()));
    }

    #[test]
    fn test_row_values() {
        let cells = row(&summary("open"));
        assert_eq!(cells[1], "2");
        assert_eq!(cells[2], "1");
        assert_eq!(cells[4], "1.50 s");
        assert_eq!(cells[5], "0.50 s");
        assert_eq!(cells[6], "1.00 s");
        // 3 tx created over 2 s
        assert_eq!(cells[3], "2 tps");
    }

    #[test]
    fn test_empty_round_uses_dashes() {
        let mut s = summary("none");
        s.stats = TxStats::null();
        let cells = row(&s);
        assert_eq!(cells[1], "0");
        assert!(cells[3..].iter().all(|c| c == "-"));
    }
}
