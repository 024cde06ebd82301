//! CLI output formatting

use crate::{
    core::ExecutionStatus,
    execution::ExecutionEvent,
    persistence::ExecutionSummary,
};
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "x ");

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Skipped => style("SKIPPED").dim().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

fn status_icon(status: ExecutionStatus) -> Emoji<'static, 'static> {
    match status {
        ExecutionStatus::Succeeded => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        ExecutionStatus::Skipped => SKIP,
        ExecutionStatus::Cancelled => STOP,
        ExecutionStatus::Pending => INFO,
    }
}

fn short(run_id: &uuid::Uuid) -> String {
    run_id.to_string()[..8].to_string()
}

/// Format run summary for display
pub fn format_execution_summary(summary: &ExecutionSummary) -> String {
    format!(
        "{} {} - {} - {} {} - {} ({}/{} jobs succeeded)",
        status_icon(summary.status),
        style(summary.short_id()).dim(),
        style(&summary.pipeline_name).bold(),
        summary.event,
        style(&summary.git_ref).cyan(),
        format_status(summary.status),
        summary.succeeded_jobs,
        summary.total_jobs,
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::RunQueued {
            run_id,
            pipeline_name,
            group,
        } => match group {
            Some(group) => format!(
                "{} Queued {} ({}) in group {}",
                INFO,
                style(pipeline_name).bold(),
                style(short(run_id)).dim(),
                style(group).cyan()
            ),
            None => format!(
                "{} Queued {} ({})",
                INFO,
                style(pipeline_name).bold(),
                style(short(run_id)).dim()
            ),
        },
        ExecutionEvent::RunStarted {
            run_id,
            pipeline_name,
            git_ref,
        } => format!(
            "{} Starting {} ({}) for {}",
            ROCKET,
            style(pipeline_name).bold(),
            style(short(run_id)).dim(),
            style(git_ref).cyan()
        ),
        ExecutionEvent::RunCancelled { run_id, reason } => format!(
            "{} Run {} cancelled: {}",
            STOP,
            style(short(run_id)).dim(),
            style(reason).yellow()
        ),
        ExecutionEvent::RunFinished {
            run_id,
            pipeline_name,
            status,
        } => format!(
            "{} {} ({}) {}",
            status_icon(*status),
            style(pipeline_name).bold(),
            style(short(run_id)).dim(),
            format_status(*status)
        ),
        ExecutionEvent::JobStarted { job_id, .. } => {
            format!("{} job {}", SPINNER, style(job_id).cyan())
        }
        ExecutionEvent::JobSkipped { job_id, reason, .. } => format!(
            "{} job {} skipped: {}",
            SKIP,
            style(job_id).dim(),
            style(reason).dim()
        ),
        ExecutionEvent::JobFinished {
            job_id,
            status,
            reason,
            ..
        } => match reason {
            Some(reason) if *status != ExecutionStatus::Succeeded => format!(
                "{} job {} {}: {}",
                status_icon(*status),
                style(job_id).bold(),
                format_status(*status),
                style(reason).dim()
            ),
            _ => format!(
                "{} job {} {}",
                status_icon(*status),
                style(job_id).bold(),
                format_status(*status)
            ),
        },
        ExecutionEvent::StepStarted {
            job_id,
            step_id,
            name,
            ..
        } => format!(
            "  {} {}/{} {}",
            SPINNER,
            style(job_id).dim(),
            style(step_id).cyan(),
            style(name).dim()
        ),
        ExecutionEvent::StepOutputLine {
            step_id, line, ..
        } => format!("    {} {}", style(format!("{} |", step_id)).dim(), line),
        ExecutionEvent::StepOutput {
            job_id,
            step_id,
            output,
            ..
        } => format!(
            "  {} Output from {}/{}:\n{}",
            INFO,
            style(job_id).dim(),
            style(step_id).dim(),
            output
        ),
        ExecutionEvent::StepFinished {
            job_id,
            step_id,
            status,
            error,
            ..
        } => match error {
            Some(error) => format!(
                "  {} {}/{}: {}",
                status_icon(*status),
                style(job_id).dim(),
                style(step_id).red(),
                style(error).dim()
            ),
            None => format!(
                "  {} {}/{}",
                status_icon(*status),
                style(job_id).dim(),
                style(step_id).green()
            ),
        },
    }
}

/// Format a duration as `1h 2m 3s`
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
