//! Telegram-backed operator notifications.
//!
//! Two modes: a single configured operator recipient, and a broadcast to all
//! staff who opted in (enumerated from the operators table). Every delivery
//! failure is swallowed; the harvester never blocks on notifications.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::warn;

use tgharvest_engine::notify::Notify;
use tgharvest_store::Store;

pub struct TelegramNotifier {
    bot: Bot,
    operator_chat_id: Option<i64>,
    store: Arc<Store>,
}

impl TelegramNotifier {
    pub fn new(token: &str, operator_chat_id: Option<i64>, store: Arc<Store>) -> Self {
        Self {
            bot: Bot::new(token),
            operator_chat_id,
            store,
        }
    }

    async fn send(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.bot.send_message(ChatId(chat_id), text).await {
            warn!(chat_id, error = %e, "notify: send failed");
        }
    }
}

#[async_trait]
impl Notify for TelegramNotifier {
    async fn notify_operator(&self, text: &str) {
        let Some(chat_id) = self.operator_chat_id else {
            return;
        };
        self.send(chat_id, text).await;
    }

    async fn notify_staff(&self, text: &str) {
        let recipients = match self.store.list_notify_recipients() {
            Ok(recipients) => recipients,
            Err(e) => {
                warn!(error = %e, "notify: could not list staff recipients");
                return;
            }
        };
        for chat_id in recipients {
            self.send(chat_id, text).await;
        }
    }
}
