//! Tool table for the chat agent.
//!
//! Tools are identified by [`ToolId`]; the model's string names are only
//! resolved at the [`ToolRegistry`] boundary. Confirmation-required tools are
//! executed by the confirmation resolver once the user approves them.

mod error;
mod local_time;
mod registry;
mod schedule;
mod traits;
mod weather;

use std::collections::HashMap;
use std::sync::Arc;

pub use error::{Result, ToolError};
pub use local_time::LocalTimeTool;
pub use registry::{ToolDescriptor, ToolId, ToolRegistry, ToolRegistryBuilder};
pub use schedule::{
    CancelScheduledTaskTool, FireSpec, GetScheduledTasksTool, ScheduleTaskTool, ScheduledTask,
    TaskId, TaskScheduler, parse_when,
};
pub use traits::{ApprovalMode, Tool, ToolContext, ToolSpec};
pub use weather::WeatherTool;

/// Builds the registry with every built-in tool.
pub fn default_registry(
    scheduler: Arc<dyn TaskScheduler>,
    approval_overrides: &HashMap<ToolId, ApprovalMode>,
) -> Result<ToolRegistry> {
    ToolRegistry::builder()
        .register(ToolId::GetWeatherInformation, Arc::new(WeatherTool::new()))
        .register(ToolId::GetLocalTime, Arc::new(LocalTimeTool::new()))
        .register(
            ToolId::ScheduleTask,
            Arc::new(ScheduleTaskTool::new(scheduler.clone())),
        )
        .register(
            ToolId::GetScheduledTasks,
            Arc::new(GetScheduledTasksTool::new(scheduler.clone())),
        )
        .register(
            ToolId::CancelScheduledTask,
            Arc::new(CancelScheduledTaskTool::new(scheduler)),
        )
        .approval_overrides(approval_overrides)
        .build()
}
