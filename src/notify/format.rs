use super::EventKind;
use crate::job::Job;
use crate::progress::render_bar;

/// One-line, human-readable description of a job event
pub fn summary(job: &Job, kind: EventKind) -> String {
    match kind {
        EventKind::Started => format!("⬇️ Downloading {}", job.source_url),
        EventKind::Progress => match &job.progress {
            Some(progress) => {
                let mut line = format!("{} {}", progress.stage, render_bar(progress.percent));
                if let Some(detail) = &progress.detail {
                    line.push_str(" · ");
                    line.push_str(detail);
                }
                line
            }
            None => "Working…".to_string(),
        },
        EventKind::Succeeded => match &job.result {
            Some(artifact) => {
                let name = artifact
                    .title
                    .as_deref()
                    .or_else(|| artifact.file_name())
                    .unwrap_or("media");
                format!("✅ Done: {} ({})", name, artifact.size)
            }
            None => "✅ Done".to_string(),
        },
        EventKind::Failed => {
            let reason = job
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error");
            if job.attempt_count > 1 {
                format!(
                    "❌ Failed after {} attempts: {}",
                    job.attempt_count, reason
                )
            } else {
                format!("❌ Failed: {}", reason)
            }
        }
        EventKind::Cancelled => "🚫 Cancelled".to_string(),
    }
}

/// Reply sent to the requester right after submission
pub fn queued_message(position: Option<usize>, active: u64, max_concurrency: usize) -> String {
    match position {
        Some(position) => format!(
            "⏳ Added to queue\n📊 Position: {}\n⚙️ Active: {}/{}",
            position, active, max_concurrency
        ),
        None => format!("⏳ Accepted\n⚙️ Active: {}/{}", active, max_concurrency),
    }
}
