//! Conversation fan-out: turns new messages into per-participant
//! interrupt actions.
//!
//! The reconciler tails the global message stream with a timestamp cursor.
//! On the first pass it only positions the cursor at the newest existing
//! message, so a restart never replays history. Authors are never notified
//! of their own messages.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::store::{ActionQueue, ConversationStore, Message, MessageStore};

use super::dedup::BoundedDedup;

const FETCH_LIMIT: usize = 200;
const ACTOR: &str = "fanout";

pub struct FanoutReconciler {
    messages: Arc<dyn MessageStore>,
    conversations: Arc<dyn ConversationStore>,
    queue: Arc<dyn ActionQueue>,
    poll_interval: Duration,
    cursor: Option<DateTime<Utc>>,
    seen: BoundedDedup<Uuid>,
    bootstrapped: bool,
}

impl FanoutReconciler {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        conversations: Arc<dyn ConversationStore>,
        queue: Arc<dyn ActionQueue>,
        poll_interval: Duration,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            messages,
            conversations,
            queue,
            poll_interval,
            cursor: None,
            seen: BoundedDedup::new(dedup_capacity),
            bootstrapped: false,
        }
    }

    pub async fn run(mut self) {
        info!(interval = ?self.poll_interval, "fan-out reconciler started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.poll_once().await {
                warn!(error = %err, "fan-out poll failed");
            }
        }
    }

    /// One pass over the message stream.
    pub async fn poll_once(&mut self) -> Result<(), StoreError> {
        if !self.bootstrapped {
            self.cursor = self.messages.latest_message_at().await?;
            self.bootstrapped = true;
            debug!(cursor = ?self.cursor, "fan-out cursor bootstrapped");
            return Ok(());
        }

        let new = self.messages.list_new_messages(self.cursor, FETCH_LIMIT).await?;
        for message in new {
            // Advance even when the message is deduped or has no audience,
            // otherwise the cursor wedges on it forever.
            self.cursor = Some(message.created_at);
            if !self.seen.insert(message.message_id) {
                continue;
            }
            self.notify_participants(&message).await?;
        }
        Ok(())
    }

    async fn notify_participants(&mut self, message: &Message) -> Result<(), StoreError> {
        let participants = self
            .conversations
            .list_participants(message.conversation_id)
            .await?;
        let guidance = json!({
            "type": "new_message",
            "message_id": message.message_id,
            "conversation_id": message.conversation_id,
            "author_id": message.author_id,
            "role": message.role,
            "text": message.text,
            "created_at": message.created_at.to_rfc3339(),
        });

        // A participant can appear under several sessions; one interrupt
        // per (agent, session) pair per message.
        let mut targeted: BoundedDedup<(String, String)> =
            BoundedDedup::new(participants.len().max(1));
        for participant in participants {
            if participant.agent_id == message.author_id {
                continue;
            }
            let pair = (
                participant.agent_id.clone(),
                participant.session_id.clone(),
            );
            if !targeted.insert(pair) {
                continue;
            }
            crate::dispatch::commands::enqueue_interrupt(
                self.queue.as_ref(),
                ACTOR,
                Some(participant.agent_id.as_str()),
                Some(participant.session_id.as_str()),
                guidance.clone(),
            )
            .await?;
            debug!(
                message_id = %message.message_id,
                agent_id = %participant.agent_id,
                session_id = %participant.session_id,
                "new-message interrupt enqueued"
            );
        }
        Ok(())
    }
}
