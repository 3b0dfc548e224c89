use super::{EventSink, OutboundEvent, ProtocolError, SessionHandler, LOAD_HISTORY};
use crate::db::models::ConversationSummary;
use chrono::{DateTime, Local, NaiveDate, TimeZone};
use serde::Serialize;
use tracing::{info, warn};

pub const TODAY_LABEL: &str = "Today";
const UNKNOWN_DATE_LABEL: &str = "Unknown date";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryGroup {
    pub title: String,
    pub chats: Vec<HistoryItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryItem {
    pub id: String,
    pub title: String,
    pub time: String,
}

/// Groups summaries by calendar day in `tz`, keeping their order. The group
/// for `today` is titled "Today"; others use dates like `Mon Mar 03 2025`.
pub fn group_by_day<Tz: TimeZone>(
    summaries: Vec<ConversationSummary>,
    tz: &Tz,
    today: NaiveDate,
) -> Vec<HistoryGroup>
where
    Tz::Offset: std::fmt::Display,
{
    let mut groups: Vec<HistoryGroup> = Vec::new();
    for summary in summaries {
        let (label, time) = match DateTime::parse_from_rfc3339(&summary.updated_at) {
            Ok(stamp) => {
                let local = stamp.with_timezone(tz);
                let day = local.date_naive();
                let label = if day == today {
                    TODAY_LABEL.to_string()
                } else {
                    day.format("%a %b %d %Y").to_string()
                };
                (label, local.format("%H:%M").to_string())
            }
            Err(e) => {
                warn!(chat_id = %summary.id, error = %e, "unreadable conversation timestamp");
                (UNKNOWN_DATE_LABEL.to_string(), String::new())
            }
        };

        let item = HistoryItem {
            id: summary.id,
            title: summary.title,
            time,
        };
        match groups.iter_mut().find(|g| g.title == label) {
            Some(group) => group.chats.push(item),
            None => groups.push(HistoryGroup {
                title: label,
                chats: vec![item],
            }),
        }
    }
    groups
}

fn local_groups(summaries: Vec<ConversationSummary>) -> Vec<HistoryGroup> {
    group_by_day(summaries, &Local, Local::now().date_naive())
}

impl SessionHandler {
    fn post_history(
        &self,
        view: &dyn EventSink,
        summaries: Vec<ConversationSummary>,
    ) -> Result<(), ProtocolError> {
        let groups = serde_json::to_value(local_groups(summaries))?;
        view.post(OutboundEvent::new(LOAD_HISTORY, groups));
        Ok(())
    }

    pub(super) fn load_history(&self, view: &dyn EventSink) -> Result<(), ProtocolError> {
        let summaries = self.db.list_conversations()?;
        self.post_history(view, summaries)
    }

    pub(super) fn search_history(
        &self,
        view: &dyn EventSink,
        query: &str,
    ) -> Result<(), ProtocolError> {
        let summaries = self.db.search_conversations(query)?;
        self.post_history(view, summaries)
    }

    pub(super) async fn clear_history(&self, view: &dyn EventSink) -> Result<(), ProtocolError> {
        let images = self.db.clear_all()?;
        info!(images = images.len(), "history cleared");
        self.attachments.delete_images(&images).await;
        self.post_history(view, Vec::new())
    }

    pub(super) async fn delete_history_item(
        &self,
        view: &dyn EventSink,
        chat_id: &str,
    ) -> Result<(), ProtocolError> {
        let images = self.db.delete_conversation(chat_id)?;
        info!(%chat_id, images = images.len(), "conversation deleted");
        self.attachments.delete_images(&images).await;
        self.load_history(view)
    }
}
