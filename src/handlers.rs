//! Update routing. The dptree schema turns teloxide updates into the plain
//! values the gate, the ledger and the command layer work with.

use crate::admission::{parse_confirm_data, AdmissionGate};
use crate::ai::{self, respond_or, Responder, Tone};
use crate::commands::{self, Caller, Invocation, ReplyTarget};
use crate::moderation::{
    parse_toggle_data, settings_keyboard, InboundMessage, Ledger, NewMember, CLOSE_SETTINGS,
};
use crate::platform::{ChatPlatform, SendOptions};
use crate::status::StatusBoard;
use crate::texts;
use anyhow::{Context, Result};
use regex::Regex;
use std::sync::Arc;
use teloxide::{
    dispatching::UpdateHandler,
    dptree,
    prelude::*,
    types::{CallbackQuery, ChatId, ChatJoinRequest, Message, MessageEntityKind, MessageId, UserId},
};
use tracing::{debug, info, warn};

pub struct App {
    pub gate: Arc<AdmissionGate>,
    pub ledger: Arc<Ledger>,
    pub responder: Arc<dyn Responder>,
    pub platform: Arc<dyn ChatPlatform>,
    pub board: Arc<StatusBoard>,
    pub bot_username: String,
    mention: Regex,
}

/// A text (or captioned) message after conversion.
#[derive(Debug, Clone)]
pub struct IncomingText {
    pub chat_id: ChatId,
    pub is_private: bool,
    pub message_id: MessageId,
    pub from: Caller,
    pub text: String,
    pub has_link: bool,
    pub reply: Option<ReplyTarget>,
}

impl IncomingText {
    fn inbound(&self) -> InboundMessage {
        InboundMessage {
            chat_id: self.chat_id,
            message_id: self.message_id,
            from: self.from.id,
            first_name: self.from.first_name.clone(),
            has_link: self.has_link,
        }
    }
}

impl App {
    pub fn new(
        gate: Arc<AdmissionGate>,
        ledger: Arc<Ledger>,
        responder: Arc<dyn Responder>,
        platform: Arc<dyn ChatPlatform>,
        board: Arc<StatusBoard>,
        bot_username: &str,
    ) -> Result<Self> {
        let mention = Regex::new(&format!(
            r"(?i)@(?:{}|apex)\b",
            regex::escape(bot_username)
        ))
        .context("mention pattern")?;
        Ok(Self {
            gate,
            ledger,
            responder,
            platform,
            board,
            bot_username: bot_username.to_string(),
            mention,
        })
    }

    /// The question left after removing mentions of the bot, if the text
    /// mentions it and anything remains.
    pub fn strip_mention(&self, text: &str) -> Option<String> {
        if !self.mention.is_match(text) {
            return None;
        }
        let rest = self.mention.replace_all(text, "");
        let rest = rest.split_whitespace().collect::<Vec<_>>().join(" ");
        (!rest.is_empty()).then_some(rest)
    }

    async fn ai_reply(&self, m: &IncomingText, prompt: &str, tone: Tone, fallback: &str) {
        let _ = self.platform.send_typing(m.chat_id).await;
        info!(
            "ai request ({:?}) from {} in {}: {}",
            tone,
            m.from.id,
            m.chat_id,
            prompt.chars().take(80).collect::<String>()
        );
        let text = respond_or(&*self.responder, prompt, tone, fallback).await;
        let _ = self
            .platform
            .send_message(m.chat_id, &text, SendOptions::default().reply_to(m.message_id))
            .await;
    }

    pub async fn handle_text(&self, m: IncomingText) {
        if m.text.starts_with('/') {
            if let Some(cmd) = commands::parse_command(
                &m.text,
                &self.bot_username,
                self.ledger.cfg.default_mute_secs,
            ) {
                let inv = Invocation {
                    chat_id: m.chat_id,
                    is_group: !m.is_private,
                    message_id: m.message_id,
                    caller: m.from.clone(),
                    reply: m.reply.clone(),
                };
                let outcome = commands::execute(&self.ledger, &self.bot_username, &inv, cmd).await;
                debug!("command in {} -> {:?}", m.chat_id, outcome);
                return;
            }
            if m.is_private {
                return;
            }
        }

        if m.is_private {
            if !m.text.trim().is_empty() {
                self.ai_reply(&m, &m.text, Tone::Private, texts::GENERIC_FAILURE)
                    .await;
            }
            return;
        }

        let inbound = m.inbound();
        if self.ledger.check_slow_mode(&inbound).await {
            return;
        }
        if self.ledger.check_banned_content(&inbound).await {
            return;
        }
        if self.ledger.check_flood_control(&inbound).await {
            return;
        }

        if let Some(prompt) = self.strip_mention(&m.text) {
            self.ai_reply(&m, &prompt, Tone::Group, ai::REPLY_FAILED).await;
        }
    }

    pub async fn handle_new_members(&self, chat: ChatId, members: &[NewMember]) {
        let sent = self.ledger.welcome(chat, members).await;
        debug!("welcomed {} of {} new members in {}", sent, members.len(), chat);
    }

    /// Every query is answered exactly once, before any slower work.
    pub async fn handle_callback(
        &self,
        callback_id: &str,
        caller: UserId,
        data: Option<&str>,
        origin: Option<(ChatId, MessageId)>,
    ) {
        let Some(data) = data else {
            let _ = self.platform.answer_callback(callback_id, None).await;
            return;
        };

        if let Some(owner) = parse_confirm_data(data) {
            let _ = self.platform.answer_callback(callback_id, None).await;
            let outcome = self.gate.confirm(caller, owner, origin).await;
            info!("confirm by {} for {}: {:?}", caller, owner, outcome);
            return;
        }

        if let Some((setting, chat)) = parse_toggle_data(data) {
            let Some(settings) = self.ledger.toggle_setting(chat, caller, setting).await else {
                let _ = self
                    .platform
                    .answer_callback(callback_id, Some(texts::NO_PERMISSION))
                    .await;
                return;
            };
            let _ = self.platform.answer_callback(callback_id, None).await;
            if let Some((origin_chat, mid)) = origin {
                let opts = SendOptions::html().with_keyboard(settings_keyboard(chat, &settings));
                let _ = self
                    .platform
                    .edit_message(origin_chat, mid, texts::SETTINGS_TITLE, opts)
                    .await;
            }
            return;
        }

        if data == CLOSE_SETTINGS {
            let Some((chat, mid)) = origin else {
                let _ = self.platform.answer_callback(callback_id, None).await;
                return;
            };
            if !self.ledger.is_admin(chat, caller).await {
                let _ = self
                    .platform
                    .answer_callback(callback_id, Some(texts::NO_PERMISSION))
                    .await;
                return;
            }
            let _ = self.platform.answer_callback(callback_id, None).await;
            let _ = self
                .platform
                .edit_message(chat, mid, texts::SETTINGS_CLOSED, SendOptions::html())
                .await;
            return;
        }

        warn!("dropping callback with unknown payload {:?} from {}", data, caller);
        let _ = self.platform.answer_callback(callback_id, None).await;
    }
}

fn has_link(msg: &Message) -> bool {
    msg.entities()
        .into_iter()
        .chain(msg.caption_entities())
        .flatten()
        .any(|e| matches!(e.kind, MessageEntityKind::Url | MessageEntityKind::TextLink { .. }))
}

fn incoming_text(msg: &Message) -> Option<IncomingText> {
    let from = msg.from.as_ref()?;
    let text = msg.text().or_else(|| msg.caption())?;
    let reply = msg.reply_to_message().map(|r| ReplyTarget {
        message_id: r.id,
        user: r.from.as_ref().map(|u| (u.id, u.first_name.clone())),
    });
    Some(IncomingText {
        chat_id: msg.chat.id,
        is_private: msg.chat.is_private(),
        message_id: msg.id,
        from: Caller {
            id: from.id,
            first_name: from.first_name.clone(),
            username: from.username.clone(),
        },
        text: text.to_string(),
        has_link: has_link(msg),
        reply,
    })
}

async fn on_message(app: Arc<App>, msg: Message) -> Result<()> {
    if !app.board.is_running() {
        return Ok(());
    }
    app.board.record_update();

    if let Some(users) = msg.new_chat_members() {
        let members: Vec<NewMember> = users
            .iter()
            .map(|u| NewMember {
                id: u.id,
                first_name: u.first_name.clone(),
                is_bot: u.is_bot,
            })
            .collect();
        app.handle_new_members(msg.chat.id, &members).await;
        return Ok(());
    }

    if let Some(m) = incoming_text(&msg) {
        app.handle_text(m).await;
    }
    Ok(())
}

async fn on_callback(app: Arc<App>, q: CallbackQuery) -> Result<()> {
    if !app.board.is_running() {
        return Ok(());
    }
    app.board.record_update();

    let origin = q.message.as_ref().map(|m| (m.chat().id, m.id()));
    app.handle_callback(&q.id, q.from.id, q.data.as_deref(), origin)
        .await;
    Ok(())
}

async fn on_join_request(app: Arc<App>, req: ChatJoinRequest) -> Result<()> {
    if !app.board.is_running() {
        return Ok(());
    }
    app.board.record_update();

    let outcome = app
        .gate
        .on_join_request(req.from.id, &req.from.first_name, req.chat.id, req.user_chat_id)
        .await;
    debug!("join request {} -> {:?}", req.from.id, outcome);
    Ok(())
}

pub fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry()
        .branch(Update::filter_message().endpoint(on_message))
        .branch(Update::filter_callback_query().endpoint(on_callback))
        .branch(Update::filter_chat_join_request().endpoint(on_join_request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::confirm_data;
    use crate::ai::StubResponder;
    use crate::clock::testing::ManualClock;
    use crate::config::{AdmissionConfig, ModerationConfig};
    use crate::moderation::{toggle_data, LedgerStores, Setting};
    use crate::platform::{private_chat, testing::Call, testing::FakePlatform};
    use crate::scheduler::testing::ManualScheduler;
    use crate::store::MemoryTable;

    const GROUP: ChatId = ChatId(-100_300);
    const ADMIN: UserId = UserId(1);
    const BOB: UserId = UserId(42);
    const BOT: &str = "ApexGuardBot";

    struct Rig {
        app: App,
        platform: Arc<FakePlatform>,
        clock: Arc<ManualClock>,
    }

    fn rig() -> Rig {
        let platform = Arc::new(FakePlatform::new());
        platform.set_admins(GROUP, vec![ADMIN]);
        let scheduler = Arc::new(ManualScheduler::default());
        let clock = Arc::new(ManualClock::new());
        let responder: Arc<dyn Responder> = Arc::new(StubResponder);

        let gate = AdmissionGate::new(
            &AdmissionConfig {
                required_channel: "@apex_channel".into(),
                required_channel_id: None,
                join_timeout_secs: 300,
            },
            platform.clone(),
            scheduler.clone(),
            clock.clone(),
            MemoryTable::shared(),
        )
        .unwrap();
        let ledger = Ledger::new(
            ModerationConfig::default(),
            platform.clone(),
            responder.clone(),
            clock.clone(),
            scheduler,
            LedgerStores::in_memory(),
        );
        let app = App::new(
            Arc::new(gate),
            Arc::new(ledger),
            responder,
            platform.clone(),
            Arc::new(StatusBoard::new(BOT, "apex_channel", 300)),
            BOT,
        )
        .unwrap();
        Rig {
            app,
            platform,
            clock,
        }
    }

    fn text(chat: ChatId, from: UserId, id: i32, body: &str) -> IncomingText {
        IncomingText {
            chat_id: chat,
            is_private: chat.0 > 0,
            message_id: MessageId(id),
            from: Caller {
                id: from,
                first_name: "Bob".into(),
                username: None,
            },
            text: body.into(),
            has_link: body.contains("http"),
            reply: None,
        }
    }

    fn answers(p: &FakePlatform) -> Vec<Option<String>> {
        p.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AnswerCallback { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn mentions_are_stripped() {
        let r = rig();
        assert_eq!(
            r.app.strip_mention("@ApexGuardBot what is the plan?").as_deref(),
            Some("what is the plan?")
        );
        assert_eq!(
            r.app.strip_mention("hey @APEX tell me").as_deref(),
            Some("hey tell me")
        );
        assert_eq!(r.app.strip_mention("@apex"), None);
        assert_eq!(r.app.strip_mention("@apexfan hello"), None);
        assert_eq!(r.app.strip_mention("no mention here"), None);
    }

    #[tokio::test]
    async fn private_text_gets_ai_reply_with_typing() {
        let r = rig();
        let dm = private_chat(BOB);
        r.app.handle_text(text(dm, BOB, 1, "who are you?")).await;

        let calls = r.platform.actions();
        assert_eq!(calls[0], Call::Typing { chat: dm });
        assert_eq!(r.platform.sent_texts(dm), vec![ai::OFFLINE_PRIVATE]);
    }

    #[tokio::test]
    async fn group_mention_gets_group_reply() {
        let r = rig();
        r.app
            .handle_text(text(GROUP, BOB, 1, "@ApexGuardBot status report"))
            .await;
        assert_eq!(r.platform.sent_texts(GROUP), vec![ai::OFFLINE_GROUP]);
    }

    #[tokio::test]
    async fn plain_group_chatter_is_ignored() {
        let r = rig();
        r.app.handle_text(text(GROUP, BOB, 1, "good morning")).await;
        assert!(r.platform.actions().is_empty());
    }

    #[tokio::test]
    async fn link_stops_the_pipeline() {
        let r = rig();
        r.app
            .handle_text(text(GROUP, BOB, 9, "@apex look http://spam.example"))
            .await;

        assert!(r.platform.calls().contains(&Call::Delete {
            chat: GROUP,
            message: MessageId(9)
        }));
        // no ai reply after the deletion
        assert_eq!(r.platform.count(|c| matches!(c, Call::Typing { .. })), 0);
    }

    #[tokio::test]
    async fn commands_are_routed() {
        let r = rig();
        r.app.handle_text(text(GROUP, BOB, 1, "/rules")).await;
        assert_eq!(r.platform.sent_texts(GROUP), vec![texts::RULES]);

        r.platform.clear_calls();
        r.app.handle_text(text(GROUP, BOB, 2, "/help@OtherBot")).await;
        assert!(r.platform.sent_texts(GROUP).is_empty());
    }

    #[tokio::test]
    async fn flooding_through_the_pipeline_mutes() {
        let r = rig();
        for i in 0..6 {
            r.app.handle_text(text(GROUP, BOB, i, "spam")).await;
        }
        assert_eq!(r.platform.count(|c| matches!(c, Call::Restrict { .. })), 1);
        assert_eq!(r.app.ledger.warning_count(GROUP, BOB), 1);

        // the window was reset and time moved on: no second mute
        r.clock.advance_secs(10);
        r.app.handle_text(text(GROUP, BOB, 7, "calm now")).await;
        assert_eq!(r.platform.count(|c| matches!(c, Call::Restrict { .. })), 1);
    }

    #[tokio::test]
    async fn confirm_button_reaches_the_gate() {
        let r = rig();
        r.app
            .gate
            .on_join_request(BOB, "Bob", GROUP, private_chat(BOB))
            .await;
        r.platform.clear_calls();

        let data = confirm_data(BOB);
        r.app
            .handle_callback("cb1", BOB, Some(&data), Some((private_chat(BOB), MessageId(3))))
            .await;

        assert_eq!(answers(&r.platform), vec![None]);
        // not yet in the channel: the panel is edited with the failure text
        assert!(r.platform.calls().iter().any(|c| matches!(
            c,
            Call::Edit { message, text, .. } if *message == MessageId(3) && text.contains("VERIFICATION FAILED")
        )));
        assert!(r.app.gate.pending(BOB).is_some());
    }

    #[tokio::test]
    async fn toggle_by_non_admin_is_refused_without_edit() {
        let r = rig();
        let data = toggle_data(Setting::Welcome, GROUP);
        r.app
            .handle_callback("cb2", BOB, Some(&data), Some((GROUP, MessageId(8))))
            .await;

        assert_eq!(answers(&r.platform), vec![Some(texts::NO_PERMISSION.to_string())]);
        assert_eq!(r.platform.count(|c| matches!(c, Call::Edit { .. })), 0);
        assert!(r.app.ledger.settings(GROUP).welcome_enabled);
    }

    #[tokio::test]
    async fn toggle_by_admin_rerenders_panel() {
        let r = rig();
        let data = toggle_data(Setting::Welcome, GROUP);
        r.app
            .handle_callback("cb3", ADMIN, Some(&data), Some((GROUP, MessageId(8))))
            .await;

        assert_eq!(answers(&r.platform), vec![None]);
        assert!(!r.app.ledger.settings(GROUP).welcome_enabled);
        assert!(r.platform.calls().contains(&Call::Edit {
            chat: GROUP,
            message: MessageId(8),
            text: texts::SETTINGS_TITLE.to_string()
        }));
    }

    #[tokio::test]
    async fn close_and_unknown_payloads_are_answered_once() {
        let r = rig();
        r.app
            .handle_callback("cb4", ADMIN, Some(CLOSE_SETTINGS), Some((GROUP, MessageId(8))))
            .await;
        r.app
            .handle_callback("cb5", BOB, Some("toggle_setting_nope"), None)
            .await;
        r.app.handle_callback("cb6", BOB, None, None).await;

        assert_eq!(answers(&r.platform), vec![None, None, None]);
        assert!(r.platform.calls().contains(&Call::Edit {
            chat: GROUP,
            message: MessageId(8),
            text: texts::SETTINGS_CLOSED.to_string()
        }));
    }
}
