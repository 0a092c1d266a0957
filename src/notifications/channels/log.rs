//! Channel that writes alarms to the tracing log

use async_trait::async_trait;

use super::{Channel, ChannelResult, DeliveryStatus};
use crate::notifications::{Alarm, AlarmKind};

#[derive(Debug, Default)]
pub struct LogChannel;

impl LogChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alarm: &Alarm) -> ChannelResult<DeliveryStatus> {
        let task_id = alarm.task_id.as_deref().unwrap_or("-");
        let swimlane_id = alarm.swimlane_id.as_deref().unwrap_or("-");
        match alarm.kind {
            AlarmKind::TaskStop | AlarmKind::TaskLog => tracing::error!(
                kind = %alarm.kind,
                task_id,
                swimlane_id,
                title = %alarm.title,
                "{}",
                alarm.message
            ),
            AlarmKind::TaskWarning | AlarmKind::NodeWarning => tracing::warn!(
                kind = %alarm.kind,
                task_id,
                swimlane_id,
                title = %alarm.title,
                "{}",
                alarm.message
            ),
        }
        Ok(DeliveryStatus::success("log"))
    }
}
