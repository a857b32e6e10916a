//! Status Projector
//!
//! Pure projections of aggregated build summaries into the pipeline views
//! users see. Nothing here reads or writes storage.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use sluice_core::domain::build::BuildStatus;
use sluice_core::domain::pipeline::RunLockType;
use sluice_core::dto::pipeline::{
    BuildSummaryRow, PipelineSortType, PipelineStatusView, PipelineView,
};

fn millis(time: Option<DateTime<Utc>>) -> i64 {
    time.map_or(0, |t| t.timestamp_millis())
}

fn shown_status(status: Option<BuildStatus>) -> Option<BuildStatus> {
    status.map(BuildStatus::display_status)
}

fn build_count(row: &BuildSummaryRow) -> i64 {
    row.finish_count.unwrap_or(0) + row.running_count.unwrap_or(0)
}

fn is_locked(row: &BuildSummaryRow) -> bool {
    row.run_lock_type == Some(RunLockType::Lock)
}

/// Projects summary rows into pipeline views
///
/// Rows whose pipeline id is in `exclude` are dropped. `favorites` and
/// `permitted` set the collect and permission flags.
pub fn project(
    rows: &[BuildSummaryRow],
    favorites: &HashSet<String>,
    permitted: &HashSet<String>,
    exclude: &HashSet<String>,
) -> Vec<PipelineView> {
    rows.iter()
        .filter(|row| !exclude.contains(&row.pipeline_id))
        .map(|row| PipelineView {
            project_id: row.project_id.clone(),
            pipeline_id: row.pipeline_id.clone(),
            pipeline_name: row.pipeline_name.clone(),
            pipeline_desc: row.pipeline_desc.clone(),
            pipeline_version: row.version,
            task_count: row.task_count,
            build_count: build_count(row),
            lock: is_locked(row),
            can_manual_startup: row.can_manual_startup,
            latest_build_id: row.latest_build_id.clone(),
            latest_build_num: row.build_num,
            latest_build_status: shown_status(row.latest_status),
            latest_build_start_time: millis(row.latest_start_time),
            latest_build_end_time: millis(row.latest_end_time),
            latest_build_task_name: row.latest_task_name.clone(),
            latest_build_user_id: row.latest_start_user.clone().unwrap_or_default(),
            running_build_count: row.running_count.unwrap_or(0),
            has_permission: permitted.contains(&row.pipeline_id),
            has_collect: favorites.contains(&row.pipeline_id),
            creator: row.creator.clone(),
            create_time: millis(row.create_time),
            deployment_time: millis(row.update_time),
        })
        .collect()
}

/// Compact status of one pipeline
pub fn project_status(row: &BuildSummaryRow, favorite: bool) -> PipelineStatusView {
    PipelineStatusView {
        task_count: row.task_count,
        build_count: build_count(row),
        can_manual_startup: row.can_manual_startup,
        has_collect: favorite,
        lock: is_locked(row),
        latest_build_id: row.latest_build_id.clone(),
        latest_build_num: row.build_num,
        latest_build_status: shown_status(row.latest_status),
        latest_build_start_time: millis(row.latest_start_time),
        latest_build_end_time: millis(row.latest_end_time),
        latest_build_task_name: row.latest_task_name.clone(),
        running_build_count: row.running_count.unwrap_or(0),
    }
}

/// Sorts views: by name ascending, or newest first by time
pub fn sort_pipelines(views: &mut [PipelineView], sort: PipelineSortType) {
    match sort {
        PipelineSortType::Name => {
            views.sort_by_cached_key(|v| v.pipeline_name.to_lowercase());
        }
        PipelineSortType::CreateTime => views.sort_by(|a, b| b.create_time.cmp(&a.create_time)),
        PipelineSortType::UpdateTime => {
            views.sort_by(|a, b| b.deployment_time.cmp(&a.deployment_time))
        }
    }
}
