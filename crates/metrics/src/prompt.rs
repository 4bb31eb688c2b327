//! Plain-text rendering of a metrics summary, used as the analysis prompt.

use std::fmt;

use crate::normalizer::NormalizedMetrics;

impl NormalizedMetrics {
    /// Render the summary the analysis capability is asked to interpret.
    pub fn render_prompt(&self) -> String {
        Prompt(self).to_string()
    }
}

struct Prompt<'a>(&'a NormalizedMetrics);

impl fmt::Display for Prompt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metrics = self.0;
        let (start, end) = metrics
            .date_range
            .as_ref()
            .map(|r| (r.start.as_str(), r.end.as_str()))
            .unwrap_or(("N/A", "N/A"));

        writeln!(f, "Analyze the following ad campaign data:")?;
        writeln!(f)?;
        writeln!(f, "**Campaign Overview:**")?;
        writeln!(f, "- Total Ads/Rows: {}", metrics.total_rows)?;
        writeln!(f, "- Date Range: {start} to {end}")?;
        writeln!(f)?;
        writeln!(f, "**Performance Metrics:**")?;

        for (metric, summary) in &metrics.metrics {
            writeln!(f)?;
            writeln!(f, "{}:", metric.as_str().to_uppercase())?;
            writeln!(f, "  - Total: {}", thousands(summary.total))?;
            writeln!(f, "  - Average: {}", thousands(summary.average))?;
            writeln!(f, "  - Max: {}", thousands(summary.max))?;
            writeln!(f, "  - Min: {}", thousands(summary.min))?;
        }

        if let Some(top) = &metrics.top_entities {
            writeln!(f)?;
            writeln!(f, "**Top Performing Ads:** {}", top.join(", "))?;
        }
        Ok(())
    }
}

/// Two decimals with comma-grouped thousands (`1234567.891` → `1,234,567.89`).
fn thousands(value: f64) -> String {
    let formatted = format!("{:.2}", value.abs());
    let (int_part, frac_part) = formatted.split_once('.').unwrap_or((formatted.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value < 0.0 && formatted != "0.00" { "-" } else { "" };
    format!("{sign}{grouped}.{frac_part}")
}
