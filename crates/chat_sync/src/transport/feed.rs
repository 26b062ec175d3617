use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use shared::{
    domain::MessageId,
    protocol::{MessagePayload, PageQuery},
};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::debug;

use super::{ChangeFeed, FeedChange, FeedQuery, FeedSubscription, RestClient};

const FEED_BUFFER: usize = 256;

/// Change feed that polls the newest history page and reports what changed
/// between polls. Only entries inside the polled window are compared and
/// remembered, so it never reports removals.
pub struct PollingChangeFeed {
    rest: Arc<dyn RestClient>,
    interval: Duration,
}

impl PollingChangeFeed {
    pub fn new(rest: Arc<dyn RestClient>, interval: Duration) -> Self {
        Self { rest, interval }
    }
}

impl ChangeFeed for PollingChangeFeed {
    fn subscribe(&self, query: FeedQuery) -> FeedSubscription {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let rest = Arc::clone(&self.rest);
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut seen: HashMap<MessageId, MessagePayload> = HashMap::new();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let page_query = PageQuery {
                limit: query.limit,
                before: None,
            };
            loop {
                ticker.tick().await;
                let page = match rest.fetch_messages(&query.conversation_id, &page_query).await {
                    Ok(page) => page,
                    Err(err) => {
                        debug!(
                            conversation_id = %query.conversation_id,
                            "feed: poll failed: {err}"
                        );
                        continue;
                    }
                };
                for change in diff_page(&mut seen, page.messages) {
                    if tx.send(change).await.is_err() {
                        return;
                    }
                }
            }
        });
        let abort = task.abort_handle();
        FeedSubscription::new(rx, move || abort.abort())
    }
}

fn diff_page(
    seen: &mut HashMap<MessageId, MessagePayload>,
    messages: Vec<MessagePayload>,
) -> Vec<FeedChange> {
    let window: HashSet<MessageId> = messages
        .iter()
        .map(|message| message.message_id.clone())
        .collect();
    seen.retain(|message_id, _| window.contains(message_id));

    let mut changes = Vec::new();
    for message in messages {
        match seen.get(&message.message_id) {
            Some(previous) if previous == &message => {}
            Some(_) => {
                seen.insert(message.message_id.clone(), message.clone());
                changes.push(FeedChange::Modified(message));
            }
            None => {
                seen.insert(message.message_id.clone(), message.clone());
                changes.push(FeedChange::Added(message));
            }
        }
    }
    changes
}
