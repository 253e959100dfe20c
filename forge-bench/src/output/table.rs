//! Results table:
//! Contender | Size | Mean (ms) | p95 (ms) | Mkeys/s | vs std | CV% | Valid | Fallbacks

use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};

use crate::config::format_size;
use crate::harness::DataPoint;

fn right(text: impl ToString) -> Cell {
    Cell::new(text.to_string()).set_alignment(CellAlignment::Right)
}

pub fn build_table(data: &[DataPoint]) -> Table {
    let mut table = Table::new();
    table.set_header(
        [
            "Contender", "Size", "Mean (ms)", "p95 (ms)", "Mkeys/s", "vs std", "CV%", "Valid",
            "Fallbacks",
        ]
        .into_iter()
        .map(|h| Cell::new(h).add_attribute(Attribute::Bold)),
    );

    for dp in data {
        let Some(stats) = &dp.stats else {
            table.add_row(vec![
                Cell::new(&dp.contender),
                right(format_size(dp.size)),
                Cell::new(format!(
                    "failed: {}",
                    dp.error.as_deref().unwrap_or("unknown error")
                ))
                .fg(Color::Red),
            ]);
            continue;
        };

        let speedup = match dp.speedup_vs_std {
            Some(s) => {
                let color = if s >= 2.0 {
                    Color::Green
                } else if s >= 1.0 {
                    Color::Yellow
                } else {
                    Color::Red
                };
                right(format!("{s:.2}x")).fg(color)
            }
            None => right("-"),
        };
        let valid = match (dp.validated, dp.stable) {
            (true, true) => Cell::new("ok").fg(Color::Green),
            (true, false) => Cell::new("unstable").fg(Color::Yellow),
            (false, _) => Cell::new("MISMATCH").fg(Color::Red),
        };
        let fallbacks = dp
            .engine
            .as_ref()
            .map(|e| format!("{}/{}", e.lookback_fallbacks, e.lookback_stalls))
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(&dp.contender),
            right(format_size(dp.size)),
            right(format!("{:.3}", stats.mean)),
            right(format!("{:.3}", stats.p95)),
            right(format!("{:.1}", dp.mkeys_per_sec)),
            speedup,
            right(format!("{:.1}", stats.cv_percent)),
            valid,
            right(fallbacks),
        ]);
    }
    table
}

pub fn render_table(title: &str, data: &[DataPoint]) {
    if data.is_empty() {
        println!("No results to display.");
        return;
    }
    println!("\n=== {title} ===");
    let mut table = build_table(data);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    println!("{table}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_gen::Distribution;
    use crate::stats::Stats;

    fn point(contender: &str, stats: Option<Stats>, error: Option<&str>) -> DataPoint {
        DataPoint {
            contender: contender.to_string(),
            distribution: Distribution::Uniform,
            size: 1_000_000,
            mkeys_per_sec: 50.0,
            speedup_vs_std: stats.as_ref().map(|_| 1.5),
            stats,
            validated: error.is_none(),
            stable: error.is_none(),
            engine: None,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_table_rows() {
        let data = vec![
            point("onesweep", Some(Stats::from_samples(&[20.0, 20.0])), None),
            point("multipass4", None, Some("no compiled variant")),
        ];
        let rendered = build_table(&data).to_string();
        assert!(rendered.contains("onesweep"));
        assert!(rendered.contains("20.000"));
        assert!(rendered.contains("1.50x"));
        assert!(rendered.contains("1M"));
        assert!(rendered.contains("failed: no compiled variant"));
    }
}
