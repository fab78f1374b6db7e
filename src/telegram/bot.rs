//! Telegram long-poll dispatcher (spec §4.6, §4.7): authorization, command
//! and callback routing, image buffering, and the per-run delivery
//! pipeline, all driven off a `dptree` schema in the teacher's shape.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, MessageId, ParseMode, ThreadId};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::TelegramConfig;
use crate::executor::RunExecutor;
use crate::model::{telegram_route_from_thread_key, DeliveryMode, RunImage, ThreadKey};
use crate::service::{IngestMessageParams, RunProgressEvent, RunService};
use crate::store::Store;

use super::handlers::{self, CallbackAction, Command};
use super::messages::MessageFormatter;
use super::registry::BackgroundRunRegistry;
use super::retry_handler::RetryHandler;

const MESSAGE_LIMIT: usize = 3500;
const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;
const MAX_IMAGES_PER_BATCH: usize = 10;
const ALLOWED_IMAGE_MIME: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];

pub struct TelegramBot {
    bot: Bot,
    allowed_users: HashSet<i64>,
    service: Arc<RunService>,
    executor: Arc<RunExecutor>,
    store: Arc<Store>,
    formatter: MessageFormatter,
    registry: Arc<BackgroundRunRegistry>,
    retry: RetryHandler,
}

impl TelegramBot {
    pub fn new(
        config: &TelegramConfig,
        service: Arc<RunService>,
        executor: Arc<RunExecutor>,
        store: Arc<Store>,
    ) -> anyhow::Result<Arc<Self>> {
        let token = config
            .bot_token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("TELEGRAM_BOT_TOKEN is not set"))?;
        Ok(Arc::new(Self {
            bot: Bot::new(token),
            allowed_users: config.allowed_user_ids.iter().copied().collect(),
            service,
            executor,
            store,
            formatter: MessageFormatter::new(MESSAGE_LIMIT),
            registry: BackgroundRunRegistry::new(),
            retry: RetryHandler::new(),
        }))
    }

    /// Fail-closed: an empty allowlist authorizes nobody, not everybody.
    fn is_authorized(&self, user_id: i64) -> bool {
        self.allowed_users.contains(&user_id)
    }

    fn user_key(user_id: i64) -> String {
        format!("telegram:{user_id}")
    }

    fn thread_key_for(chat_id: ChatId, thread_id: Option<ThreadId>) -> ThreadKey {
        ThreadKey::telegram(chat_id.0, thread_id.map(|t| t.0 .0))
    }

    /// Runs the long-poll dispatch loop until `shutdown` fires, then aborts
    /// every in-flight background delivery and awaits settlement.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("telegram dispatcher starting");

        let message_branch = Update::filter_message().endpoint({
            let bot = self.clone();
            move |update: Update, msg: Message| {
                let bot = bot.clone();
                async move {
                    if let Err(e) = bot.handle_message(update.id.0 as i64, msg).await {
                        error!(err = %e, "telegram message handling failed");
                    }
                    respond(())
                }
            }
        });

        let callback_branch = Update::filter_callback_query().endpoint({
            let bot = self.clone();
            move |query: CallbackQuery| {
                let bot = bot.clone();
                async move {
                    if let Err(e) = bot.handle_callback(query).await {
                        error!(err = %e, "telegram callback handling failed");
                    }
                    respond(())
                }
            }
        });

        let schema = dptree::entry().branch(message_branch).branch(callback_branch);
        let mut dispatcher = Dispatcher::builder(self.bot.clone(), schema).build();
        let shutdown_token = dispatcher.shutdown_token();

        let dispatch_handle = tokio::spawn(async move { dispatcher.dispatch().await });

        let _ = shutdown.changed().await;
        if let Ok(awaiting) = shutdown_token.shutdown() {
            awaiting.await;
        }
        let _ = dispatch_handle.await;

        self.registry.abort_all_and_wait().await;
        info!("telegram dispatcher stopped");
    }

    async fn handle_message(&self, update_id: i64, msg: Message) -> anyhow::Result<()> {
        let Some(user) = msg.from.as_ref() else {
            return Ok(());
        };
        let user_id = user.id.0 as i64;
        if !self.is_authorized(user_id) {
            self.send_text(msg.chat.id, msg.thread_id, "You are not authorized to use this bot.")
                .await?;
            return Ok(());
        }

        if msg.photo().is_some() || msg.document().is_some() {
            return self.handle_image(update_id, &msg, user_id).await;
        }

        let Some(text) = msg.text() else {
            return Ok(());
        };

        if let Some(command) = Command::parse(text) {
            return self.handle_command(command, &msg, user_id).await;
        }

        self.handle_text(text, &msg, user_id).await
    }

    async fn handle_command(&self, command: Command, msg: &Message, user_id: i64) -> anyhow::Result<()> {
        let thread_key = Self::thread_key_for(msg.chat.id, msg.thread_id);
        match command {
            Command::Start => {
                self.send_text(
                    msg.chat.id,
                    msg.thread_id,
                    "Welcome. Send a message to start a run, or use /help for the command list.",
                )
                .await
            }
            Command::Help => {
                self.send_text(
                    msg.chat.id,
                    msg.thread_id,
                    "/settings - model, thinking, auth, delete session\n\
                     /cancel - cancel the active run on this thread\n\
                     /new - start a fresh session\n\
                     /delete - delete this thread's session\n\
                     /share - share this thread's session\n\
                     /model - choose a model\n\
                     /thinking - choose a thinking level\n\
                     /auth - authentication providers\n\
                     /steer <text> - interrupt the active run with new instructions",
                )
                .await
            }
            Command::Settings => {
                self.send_keyboard(msg.chat.id, msg.thread_id, "Settings:", handlers::settings_keyboard())
                    .await
            }
            Command::Model => {
                self.send_keyboard(msg.chat.id, msg.thread_id, "Choose a model:", handlers::model_keyboard())
                    .await
            }
            Command::Thinking => {
                self.send_keyboard(
                    msg.chat.id,
                    msg.thread_id,
                    "Choose a thinking level:",
                    handlers::thinking_keyboard(),
                )
                .await
            }
            Command::Auth => {
                self.send_text(
                    msg.chat.id,
                    msg.thread_id,
                    "Authentication provider management is not available.",
                )
                .await
            }
            Command::Cancel => {
                let cancelled = self.executor.cancel_thread_run(&thread_key).await?;
                self.registry.abort_thread(&thread_key);
                self.send_text(
                    msg.chat.id,
                    msg.thread_id,
                    if cancelled { "Cancelled the active run." } else { "Nothing to cancel." },
                )
                .await
            }
            Command::New => {
                self.executor.reset_thread_session(&thread_key).await?;
                self.send_text(msg.chat.id, msg.thread_id, "Started a fresh session.").await
            }
            Command::Delete => {
                self.send_keyboard(
                    msg.chat.id,
                    msg.thread_id,
                    "Delete this thread's session? This cannot be undone.",
                    handlers::delete_confirm_keyboard(),
                )
                .await
            }
            Command::Share => match self.executor.share_thread_session(&thread_key).await {
                Ok(share) => {
                    self.send_text(
                        msg.chat.id,
                        msg.thread_id,
                        &format!("Gist: {}\nShare: {}", share.gist_url, share.share_url),
                    )
                    .await
                }
                Err(e) => self.send_text(msg.chat.id, msg.thread_id, &format!("Unable to share: {e}")).await,
            },
            Command::Steer(text) => {
                if text.is_empty() {
                    return self.send_text(msg.chat.id, msg.thread_id, "Usage: /steer <text>").await;
                }
                self.ingest_and_deliver(thread_key, user_id, text, DeliveryMode::Steer).await
            }
        }
    }

    /// Plain text (no leading command): steers an in-flight run if one is
    /// currently registered for this thread, otherwise queues a follow-up.
    async fn handle_text(&self, text: &str, msg: &Message, user_id: i64) -> anyhow::Result<()> {
        let thread_key = Self::thread_key_for(msg.chat.id, msg.thread_id);
        let delivery_mode = if self.executor.get_thread_runtime_state(&thread_key).await.is_some() {
            DeliveryMode::Steer
        } else {
            DeliveryMode::FollowUp
        };
        self.ingest_and_deliver(thread_key, user_id, text.to_string(), delivery_mode).await
    }

    async fn ingest_and_deliver(
        &self,
        thread_key: ThreadKey,
        user_id: i64,
        text: String,
        delivery_mode: DeliveryMode,
    ) -> anyhow::Result<()> {
        let result = self
            .service
            .ingest_message(IngestMessageParams {
                source: "telegram".to_string(),
                thread_key: thread_key.clone(),
                user_key: Some(Self::user_key(user_id)),
                text,
                delivery_mode,
                idempotency_key: None,
            })
            .await?;

        if !result.deduplicated {
            self.start_delivery(result.run.run_id, thread_key).await;
        }
        Ok(())
    }

    async fn handle_image(&self, update_id: i64, msg: &Message, user_id: i64) -> anyhow::Result<()> {
        let thread_key = Self::thread_key_for(msg.chat.id, msg.thread_id);
        let mut images = Vec::new();

        if let Some(sizes) = msg.photo() {
            if let Some(largest) = sizes.last() {
                images.push(self.download_image(&largest.file.id, largest.file.size as u64, "image/jpeg", None).await?);
            }
        } else if let Some(doc) = msg.document() {
            let mime = doc
                .mime_type
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string());
            if !ALLOWED_IMAGE_MIME.contains(&mime.as_str()) {
                self.send_text(msg.chat.id, msg.thread_id, &format!("Unsupported image type: {mime}"))
                    .await?;
                return Ok(());
            }
            images.push(
                self.download_image(&doc.file.id, doc.file.size as u64, &mime, doc.file_name.clone())
                    .await?,
            );
        }

        if images.len() > MAX_IMAGES_PER_BATCH {
            self.send_text(
                msg.chat.id,
                msg.thread_id,
                &format!("Too many images in one message (max {MAX_IMAGES_PER_BATCH})."),
            )
            .await?;
            return Ok(());
        }

        let media_group_id = msg.media_group_id();
        let result = self
            .store
            .buffer_telegram_images(&thread_key, &Self::user_key(user_id), update_id, media_group_id, images)
            .await?;

        info!(
            thread_key = %thread_key,
            inserted = result.inserted_count,
            bytes = result.total_bytes,
            "buffered telegram images"
        );
        Ok(())
    }

    async fn download_image(
        &self,
        file_id: &str,
        size: u64,
        mime_type: &str,
        filename: Option<String>,
    ) -> anyhow::Result<RunImage> {
        if !ALLOWED_IMAGE_MIME.contains(&mime_type) {
            anyhow::bail!("unsupported image mime type {mime_type}");
        }
        if size > MAX_IMAGE_BYTES {
            anyhow::bail!("image exceeds the {MAX_IMAGE_BYTES}-byte cap");
        }

        let file = self.bot.get_file(file_id).await?;
        let mut buf = Vec::new();
        self.bot.download_file(&file.path, &mut buf).await?;
        if buf.len() as u64 > MAX_IMAGE_BYTES {
            anyhow::bail!("image exceeds the {MAX_IMAGE_BYTES}-byte cap");
        }

        Ok(RunImage {
            mime_type: mime_type.to_string(),
            bytes: buf,
            filename,
        })
    }

    async fn handle_callback(&self, query: CallbackQuery) -> anyhow::Result<()> {
        let user_id = query.from.id.0 as i64;
        if !self.is_authorized(user_id) {
            self.bot.answer_callback_query(query.id).await?;
            return Ok(());
        }

        let Some(message) = query.regular_message() else {
            self.bot.answer_callback_query(query.id).await?;
            return Ok(());
        };
        let chat_id = message.chat.id;
        let thread_id = message.thread_id;
        let thread_key = Self::thread_key_for(chat_id, thread_id);
        let data = query.data.clone().unwrap_or_default();

        self.bot.answer_callback_query(query.id).await?;

        match CallbackAction::parse(&data) {
            CallbackAction::Settings(action) => match action.as_str() {
                "model" => self.send_keyboard(chat_id, thread_id, "Choose a model:", handlers::model_keyboard()).await?,
                "thinking" => {
                    self.send_keyboard(chat_id, thread_id, "Choose a thinking level:", handlers::thinking_keyboard())
                        .await?
                }
                "auth" => {
                    self.send_text(chat_id, thread_id, "Authentication provider management is not available.")
                        .await?
                }
                "del:confirm" => {
                    self.send_keyboard(
                        chat_id,
                        thread_id,
                        "Delete this thread's session? This cannot be undone.",
                        handlers::delete_confirm_keyboard(),
                    )
                    .await?
                }
                "del:yes" => {
                    self.executor.reset_thread_session(&thread_key).await?;
                    self.send_text(chat_id, thread_id, "Session deleted.").await?
                }
                "del:no" => self.send_text(chat_id, thread_id, "Cancelled.").await?,
                _ => {
                    self.send_keyboard(chat_id, thread_id, "Settings:", handlers::settings_keyboard())
                        .await?
                }
            },
            CallbackAction::Auth(_) => {
                self.send_text(chat_id, thread_id, "Authentication provider management is not available.")
                    .await?
            }
            CallbackAction::Model { provider, model_id } => {
                match self.executor.set_thread_model(&thread_key, &provider, &model_id).await {
                    Ok(_) => {
                        self.send_text(chat_id, thread_id, &format!("Model set to {provider}/{model_id}.")).await?
                    }
                    Err(e) => self.send_text(chat_id, thread_id, &format!("Unable to set model: {e}")).await?,
                }
            }
            CallbackAction::Thinking(level) => match self.executor.set_thread_thinking_level(&thread_key, &level).await {
                Ok(_) => self.send_text(chat_id, thread_id, &format!("Thinking level set to {level}.")).await?,
                Err(e) => self.send_text(chat_id, thread_id, &format!("Unable to set thinking level: {e}")).await?,
            },
            CallbackAction::Unknown => {
                self.send_keyboard(chat_id, thread_id, "Settings:", handlers::settings_keyboard())
                    .await?
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Delivery pipeline (spec §4.6)
    // -----------------------------------------------------------------

    /// Registers a background delivery task for `run_id`: an initial
    /// progress message, rate-limited in-place edits, then a terminal
    /// render once the run settles.
    async fn start_delivery(&self, run_id: String, thread_key: ThreadKey) {
        let Some(route) = telegram_route_from_thread_key(&thread_key) else {
            warn!(%thread_key, "cannot deliver: not a telegram thread");
            return;
        };
        let chat_id = ChatId(route.chat_id);
        let thread_id = route.message_thread_id.map(|t| ThreadId(MessageId(t)));

        let progress_id = match self.send_text(chat_id, thread_id, "\u{23f3} working...").await {
            Ok(id) => id,
            Err(e) => {
                error!(err = %e, "failed to send initial progress message");
                return;
            }
        };

        let bot = self.bot.clone();
        let formatter_limit = MESSAGE_LIMIT;
        let retry = RetryHandler::new();
        let mut progress = self.service.subscribe_run_progress(&run_id);

        self.registry.register(run_id, thread_key, move |mut abort_rx| async move {
            let formatter = MessageFormatter::new(formatter_limit);
            let mut last_edit = tokio::time::Instant::now() - Duration::from_secs(5);

            loop {
                tokio::select! {
                    _ = abort_rx.changed() => {
                        if *abort_rx.borrow() {
                            return;
                        }
                    }
                    event = progress.recv() => {
                        let Some(event) = event else { return };
                        match event {
                            RunProgressEvent::Started { .. } => {
                                let elapsed = last_edit.elapsed();
                                if elapsed >= Duration::from_millis(1200) {
                                    last_edit = tokio::time::Instant::now();
                                    let text = MessageFormatter::escape_markdown_v2("\u{23f3} running...");
                                    let _ = retry
                                        .execute(|| {
                                            bot.edit_message_text(chat_id, progress_id, text.clone())
                                                .parse_mode(ParseMode::MarkdownV2)
                                                .send()
                                        })
                                        .await;
                                }
                            }
                            RunProgressEvent::Succeeded { output, .. } => {
                                deliver_terminal_success(&bot, &retry, &formatter, chat_id, thread_id, progress_id, &output)
                                    .await;
                                return;
                            }
                            RunProgressEvent::Failed { error_message, .. } => {
                                let text = MessageFormatter::escape_markdown_v2(&formatter.render_failure(&error_message));
                                let _ = retry
                                    .execute(|| {
                                        bot.edit_message_text(chat_id, progress_id, text.clone())
                                            .parse_mode(ParseMode::MarkdownV2)
                                            .send()
                                    })
                                    .await;
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn send_text(&self, chat_id: ChatId, thread_id: Option<ThreadId>, text: &str) -> anyhow::Result<MessageId> {
        let bot = self.bot.clone();
        let text = text.to_string();
        let result = self
            .retry
            .execute(move || {
                let mut req = bot.send_message(chat_id, text.clone());
                if let Some(t) = thread_id {
                    req = req.message_thread_id(t);
                }
                req.send()
            })
            .await?;
        Ok(result.map(|m| m.id).unwrap_or(MessageId(0)))
    }

    async fn send_keyboard(
        &self,
        chat_id: ChatId,
        thread_id: Option<ThreadId>,
        text: &str,
        keyboard: teloxide::types::InlineKeyboardMarkup,
    ) -> anyhow::Result<()> {
        let bot = self.bot.clone();
        let text = text.to_string();
        self.retry
            .execute(move || {
                let mut req = bot.send_message(chat_id, text.clone()).reply_markup(keyboard.clone());
                if let Some(t) = thread_id {
                    req = req.message_thread_id(t);
                }
                req.send()
            })
            .await?;
        Ok(())
    }
}

async fn deliver_terminal_success(
    bot: &Bot,
    retry: &RetryHandler,
    formatter: &MessageFormatter,
    chat_id: ChatId,
    thread_id: Option<ThreadId>,
    progress_id: MessageId,
    output: &serde_json::Value,
) {
    let text = output.get("text").and_then(|v| v.as_str()).unwrap_or("");

    if text.is_empty() {
        let body = MessageFormatter::escape_markdown_v2(&formatter.render_success_empty());
        let _ = retry
            .execute(|| {
                bot.edit_message_text(chat_id, progress_id, body.clone())
                    .parse_mode(ParseMode::MarkdownV2)
                    .send()
            })
            .await;
        return;
    }

    let rendered = formatter.render_success(text);
    let mut chunks = rendered.chunks.into_iter();

    if let Some(first) = chunks.next() {
        let first = MessageFormatter::escape_markdown_v2(&first);
        let _ = retry
            .execute(|| {
                bot.edit_message_text(chat_id, progress_id, first.clone())
                    .parse_mode(ParseMode::MarkdownV2)
                    .send()
            })
            .await;
    } else {
        let body = MessageFormatter::escape_markdown_v2(&formatter.render_success_empty());
        let _ = retry
            .execute(|| {
                bot.edit_message_text(chat_id, progress_id, body.clone())
                    .parse_mode(ParseMode::MarkdownV2)
                    .send()
            })
            .await;
    }

    for chunk in chunks {
        let chunk = MessageFormatter::escape_markdown_v2(&chunk);
        let _ = retry
            .execute(|| {
                let mut req = bot
                    .send_message(chat_id, chunk.clone())
                    .parse_mode(ParseMode::MarkdownV2);
                if let Some(t) = thread_id {
                    req = req.message_thread_id(t);
                }
                req.send()
            })
            .await;
    }

    for attachment in rendered.attachments {
        let _ = retry
            .execute(|| {
                let file = InputFile::memory(attachment.content.clone().into_bytes())
                    .file_name(attachment.filename.clone());
                let mut req = bot.send_document(chat_id, file);
                if let Some(t) = thread_id {
                    req = req.message_thread_id(t);
                }
                req.send()
            })
            .await;
    }
}
