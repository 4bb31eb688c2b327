//! Exporter writing one Markdown document per job to a local directory.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use adsight_ai::{
    AccountSnapshot, AnalysisResults, ArtifactHandle, CapabilityError, ExportRequest, ExportSource,
    Exporter,
};
use adsight_core::JobRef;

/// Writes `{root}/{owner}/{kind}-{job id}.md`; the handle is the file path.
#[derive(Debug, Clone)]
pub struct FsExporter {
    root: PathBuf,
}

impl FsExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, request: &ExportRequest) -> PathBuf {
        let name = match request.job {
            JobRef::Analysis(id) => format!("analysis-{id}.md"),
            JobRef::Report(id) => format!("report-{id}.md"),
        };
        self.root.join(request.owner.to_string()).join(name)
    }
}

#[async_trait]
impl Exporter for FsExporter {
    async fn export(&self, request: &ExportRequest) -> Result<ArtifactHandle, CapabilityError> {
        let path = self.path_for(request);
        let document = render(request);

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| CapabilityError::unavailable(format!("cannot create {}: {e}", dir.display())))?;
        }
        tokio::fs::write(&path, document)
            .await
            .map_err(|e| CapabilityError::unavailable(format!("cannot write {}: {e}", path.display())))?;

        debug!(job = %request.job, path = %path.display(), "document exported");
        Ok(ArtifactHandle::new(path.to_string_lossy()))
    }
}

/// Render the Markdown body for an export request.
pub fn render(request: &ExportRequest) -> String {
    Document(request).to_string()
}

struct Document<'a>(&'a ExportRequest);

impl fmt::Display for Document<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.source {
            ExportSource::Analysis { results } => render_analysis(f, self.0.job, results),
            ExportSource::LiveAccount { snapshot } => render_snapshot(f, self.0.job, snapshot),
        }
    }
}

fn render_analysis(f: &mut fmt::Formatter<'_>, job: JobRef, results: &AnalysisResults) -> fmt::Result {
    writeln!(f, "# Campaign analysis\n\n_{job}_\n")?;

    let summary = &results.performance_summary;
    writeln!(f, "## Performance")?;
    if let Some(overview) = &summary.overview {
        writeln!(f, "\n{overview}")?;
    }
    bullets(f, &summary.highlights)?;
    if !summary.key_metrics.is_empty() {
        writeln!(f, "\n| metric | value |\n|---|---|")?;
        for (name, value) in &summary.key_metrics {
            writeln!(f, "| {name} | {value:.2} |")?;
        }
    }

    if !results.insights.is_empty() {
        writeln!(f, "\n## Insights")?;
        bullets(f, &results.insights)?;
    }

    let plan = &results.recommended_plan;
    writeln!(f, "\n## Recommended plan")?;
    for (label, value) in [
        ("Summary", &plan.summary),
        ("Objective", &plan.objective),
        ("Audience", &plan.target_audience),
        ("Budget", &plan.budget),
    ] {
        if let Some(value) = value {
            writeln!(f, "\n**{label}:** {value}")?;
        }
    }
    bullets(f, &plan.actions)?;

    if !results.content_plan.weeks.is_empty() {
        writeln!(f, "\n## Content plan")?;
        for week in &results.content_plan.weeks {
            writeln!(f, "\n### Week {}: {}", week.week, week.theme)?;
            bullets(f, &week.posts)?;
        }
    }

    if !results.captions.is_empty() {
        writeln!(f, "\n## Captions")?;
        for caption in &results.captions {
            let tags: Vec<String> = caption.hashtags.iter().map(|t| format!("#{}", t.trim_start_matches('#'))).collect();
            writeln!(f, "\n> {}\n\n{}", caption.caption, tags.join(" "))?;
        }
    }
    Ok(())
}

fn render_snapshot(f: &mut fmt::Formatter<'_>, job: JobRef, snapshot: &AccountSnapshot) -> fmt::Result {
    writeln!(
        f,
        "# Account report\n\n_{job}_\n\nPlatform: {}  \nAccount: {}  \nFetched: {}\n",
        snapshot.platform,
        snapshot.account_id,
        snapshot.fetched_at.to_rfc3339()
    )?;
    writeln!(
        f,
        "Total spend: {:.2}, impressions: {}, clicks: {}\n",
        snapshot.total_spend(),
        snapshot.total_impressions(),
        snapshot.total_clicks()
    )?;

    if snapshot.campaigns.is_empty() {
        return writeln!(f, "No campaigns.");
    }
    writeln!(f, "| campaign | status | spend | impressions | clicks | ctr |\n|---|---|---|---|---|---|")?;
    for c in &snapshot.campaigns {
        writeln!(
            f,
            "| {} | {} | {} | {} | {} | {} |",
            c.name,
            c.status.as_deref().unwrap_or("-"),
            opt(c.spend.map(|v| format!("{v:.2}"))),
            opt(c.impressions.map(|v| v.to_string())),
            opt(c.clicks.map(|v| v.to_string())),
            opt(c.ctr.map(|v| format!("{v:.2}%"))),
        )?;
    }
    Ok(())
}

fn bullets(f: &mut fmt::Formatter<'_>, items: &[String]) -> fmt::Result {
    if items.is_empty() {
        return Ok(());
    }
    writeln!(f)?;
    for item in items {
        writeln!(f, "- {item}")?;
    }
    Ok(())
}

fn opt(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}
