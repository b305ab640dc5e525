//! Warnings, flood control, banned content, slow mode and per-chat settings.
//!
//! All time windows are pruned lazily, when the entry is next touched.

use crate::ai::{self, respond_or, Responder, Tone};
use crate::clock::Clock;
use crate::config::{ContentType, ModerationConfig};
use crate::error::PlatformResult;
use crate::platform::{ChatPlatform, SendOptions};
use crate::scheduler::Scheduler;
use crate::store::{MemoryTable, SharedTable};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, UserId};
use tracing::{debug, info, warn};

pub const TOGGLE_PREFIX: &str = "toggle_setting_";
pub const CLOSE_SETTINGS: &str = "close_settings";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarningRecord {
    pub count: usize,
    pub timestamps: Vec<DateTime<Utc>>,
}

impl WarningRecord {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        self.timestamps.retain(|t| *t > cutoff);
        self.count = self.timestamps.len();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FloodWindow {
    pub timestamps: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSettings {
    pub banned_content_types: Vec<ContentType>,
    pub slow_mode: bool,
    pub welcome_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    Links,
    SlowMode,
    Welcome,
}

impl Setting {
    pub fn key(self) -> &'static str {
        match self {
            Setting::Links => "url",
            Setting::SlowMode => "slow_mode",
            Setting::Welcome => "welcome_msg",
        }
    }

    fn from_key(s: &str) -> Option<Self> {
        match s {
            "url" => Some(Setting::Links),
            "slow_mode" => Some(Setting::SlowMode),
            "welcome_msg" => Some(Setting::Welcome),
            _ => None,
        }
    }
}

pub fn toggle_data(setting: Setting, chat: ChatId) -> String {
    format!("{}{}_{}", TOGGLE_PREFIX, setting.key(), chat.0)
}

/// `toggle_setting_<key>_<chat_id>`; the key itself may contain underscores.
pub fn parse_toggle_data(data: &str) -> Option<(Setting, ChatId)> {
    let rest = data.strip_prefix(TOGGLE_PREFIX)?;
    let (key, chat) = rest.rsplit_once('_')?;
    let setting = Setting::from_key(key)?;
    let chat = chat.parse::<i64>().ok()?;
    Some((setting, ChatId(chat)))
}

pub fn settings_keyboard(chat: ChatId, s: &ChatSettings) -> InlineKeyboardMarkup {
    let links = if s.banned_content_types.contains(&ContentType::Url) {
        "❌ Blocked"
    } else {
        "✅ Allowed"
    };
    let slow = if s.slow_mode { "✅ On" } else { "❌ Off" };
    let welcome = if s.welcome_enabled { "✅ On" } else { "❌ Off" };

    InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(
            format!("🔗 Links: {links}"),
            toggle_data(Setting::Links, chat),
        )],
        vec![InlineKeyboardButton::callback(
            format!("⏱ Slow Mode: {slow}"),
            toggle_data(Setting::SlowMode, chat),
        )],
        vec![InlineKeyboardButton::callback(
            format!("📢 Welcome Messages: {welcome}"),
            toggle_data(Setting::Welcome, chat),
        )],
        vec![InlineKeyboardButton::callback("Close", CLOSE_SETTINGS)],
    ])
}

/// The parts of a group message the ledger looks at.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub from: UserId,
    pub first_name: String,
    pub has_link: bool,
}

#[derive(Debug, Clone)]
pub struct NewMember {
    pub id: UserId,
    pub first_name: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningOutcome {
    Warned { count: usize, max: usize },
    Banned,
    /// Limit reached but the ban call failed; the record is kept.
    BanFailed { count: usize },
}

/// "1 minute", "2 hours", "3 days".
pub fn format_duration(secs: i64) -> String {
    let plural = |n: i64, unit: &str| format!("{n} {unit}{}", if n > 1 { "s" } else { "" });
    if secs >= 86400 {
        plural(secs / 86400, "day")
    } else if secs >= 3600 {
        plural(secs / 3600, "hour")
    } else {
        plural((secs / 60).max(1), "minute")
    }
}

/// Per-chat administrator ids, fetched on first use and refreshed
/// periodically from `main`.
#[derive(Default)]
pub struct AdminCache {
    admins: DashMap<ChatId, HashSet<UserId>>,
}

impl AdminCache {
    pub async fn refresh(&self, platform: &dyn ChatPlatform, chat: ChatId) -> PlatformResult<()> {
        let ids = platform.administrators(chat).await?;
        self.admins.insert(chat, ids.into_iter().collect());
        Ok(())
    }

    pub async fn is_admin(&self, platform: &dyn ChatPlatform, chat: ChatId, user: UserId) -> bool {
        if !self.admins.contains_key(&chat) {
            if let Err(e) = self.refresh(platform, chat).await {
                warn!("refresh_admins failed for {}: {}", chat, e);
                return false;
            }
        }
        self.admins
            .get(&chat)
            .map(|set| set.contains(&user))
            .unwrap_or(false)
    }

    pub fn chats(&self) -> Vec<ChatId> {
        self.admins.iter().map(|e| *e.key()).collect()
    }
}

pub struct LedgerStores {
    pub warnings: SharedTable<(ChatId, UserId), WarningRecord>,
    pub floods: SharedTable<(ChatId, UserId), FloodWindow>,
    pub settings: SharedTable<ChatId, ChatSettings>,
    pub last_message: SharedTable<(ChatId, UserId), DateTime<Utc>>,
}

impl LedgerStores {
    pub fn in_memory() -> Self {
        Self {
            warnings: MemoryTable::shared(),
            floods: MemoryTable::shared(),
            settings: MemoryTable::shared(),
            last_message: MemoryTable::shared(),
        }
    }
}

pub struct Ledger {
    pub(crate) platform: Arc<dyn ChatPlatform>,
    pub(crate) responder: Arc<dyn Responder>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    pub(crate) cfg: ModerationConfig,
    stores: LedgerStores,
    admins: AdminCache,
}

impl Ledger {
    pub fn new(
        cfg: ModerationConfig,
        platform: Arc<dyn ChatPlatform>,
        responder: Arc<dyn Responder>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        stores: LedgerStores,
    ) -> Self {
        Self {
            platform,
            responder,
            clock,
            scheduler,
            cfg,
            stores,
            admins: AdminCache::default(),
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn is_admin(&self, chat: ChatId, user: UserId) -> bool {
        self.admins.is_admin(&*self.platform, chat, user).await
    }

    pub async fn refresh_admins(&self) {
        for chat in self.admins.chats() {
            if let Err(e) = self.admins.refresh(&*self.platform, chat).await {
                warn!("refresh_admins failed for {}: {}", chat, e);
            }
        }
    }

    pub fn settings(&self, chat: ChatId) -> ChatSettings {
        self.stores
            .settings
            .get(&chat)
            .unwrap_or_else(|| ChatSettings {
                banned_content_types: self.cfg.banned_content_types.clone(),
                slow_mode: false,
                welcome_enabled: true,
            })
    }

    /// Flips one setting. `None` when the caller is not an admin of `chat`.
    pub async fn toggle_setting(
        &self,
        chat: ChatId,
        caller: UserId,
        setting: Setting,
    ) -> Option<ChatSettings> {
        if !self.is_admin(chat, caller).await {
            return None;
        }
        let mut s = self.settings(chat);
        match setting {
            Setting::Links => {
                if s.banned_content_types.contains(&ContentType::Url) {
                    s.banned_content_types.retain(|c| *c != ContentType::Url);
                } else {
                    s.banned_content_types.push(ContentType::Url);
                }
            }
            Setting::SlowMode => s.slow_mode = !s.slow_mode,
            Setting::Welcome => s.welcome_enabled = !s.welcome_enabled,
        }
        info!("admin {} toggled {} in chat {}: {:?}", caller, setting.key(), chat, s);
        self.stores.settings.put(chat, s.clone());
        Some(s)
    }

    fn warning_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(self.cfg.warning_expire_hours)
    }

    /// Live (unexpired) warnings.
    pub fn warning_count(&self, chat: ChatId, user: UserId) -> usize {
        let key = (chat, user);
        let Some(mut rec) = self.stores.warnings.get(&key) else {
            return 0;
        };
        rec.prune(self.warning_cutoff(self.now()));
        let count = rec.count;
        self.stores.warnings.put(key, rec);
        count
    }

    /// Drops entries whose windows have fully expired. Returns how many.
    pub fn sweep(&self) -> usize {
        let now = self.now();
        let cutoff = self.warning_cutoff(now);
        let window = Duration::seconds(self.cfg.flood_time_window_secs);
        let interval = Duration::seconds(self.cfg.slow_mode_interval_secs);

        let warnings = self.stores.warnings.prune(&mut |_, rec| {
            rec.prune(cutoff);
            rec.count > 0
        });
        let floods = self.stores.floods.prune(&mut |_, f| {
            f.timestamps.retain(|t| now - *t <= window);
            !f.timestamps.is_empty()
        });
        let marks = self
            .stores
            .last_message
            .prune(&mut |_, last| now - *last < interval);

        let dropped = warnings + floods + marks;
        if dropped > 0 {
            debug!(
                "swept {} stale entries ({} warnings, {} flood windows, {} slow mode marks left)",
                dropped,
                self.stores.warnings.len(),
                self.stores.floods.len(),
                self.stores.last_message.len()
            );
        }
        dropped
    }

    pub async fn issue_warning(
        &self,
        chat: ChatId,
        user: UserId,
        name: &str,
        reason: &str,
    ) -> WarningOutcome {
        let now = self.now();
        let key = (chat, user);
        let max = self.cfg.max_warnings;

        let mut rec = self.stores.warnings.get(&key).unwrap_or_default();
        rec.prune(self.warning_cutoff(now));
        rec.timestamps.push(now);
        rec.count = rec.timestamps.len();
        let count = rec.count;
        self.stores.warnings.put(key, rec);

        if count >= max {
            if self.platform.ban_member(chat, user).await.is_err() {
                return WarningOutcome::BanFailed { count };
            }
            self.stores.warnings.put(key, WarningRecord::default());

            let fallback = format!("⛔️ {name} has been banned after receiving {max} warnings.");
            let text = respond_or(
                &*self.responder,
                &ai::banned_prompt(name, "behavior after multiple warnings"),
                Tone::Banned,
                fallback,
            )
            .await;
            let _ = self
                .platform
                .send_message(chat, &text, SendOptions::default())
                .await;
            info!("banned user {} from chat {} after {} warnings", user, chat, max);
            return WarningOutcome::Banned;
        }

        let fraction = format!("{count}/{max}");
        let fallback = format!("⚠️ {name} has been warned for {reason}.\nWarning: {fraction}");
        let mut text = respond_or(
            &*self.responder,
            &ai::warning_prompt(name, reason),
            Tone::Warning,
            fallback,
        )
        .await;
        if !text.contains(&fraction) {
            text.push_str(&format!("\nWarning: {fraction}"));
        }
        let _ = self
            .platform
            .send_message(chat, &text, SendOptions::default())
            .await;
        info!("warned user {} in chat {} ({}), count {}", user, chat, reason, count);
        WarningOutcome::Warned { count, max }
    }

    /// Returns true when the sender got muted for flooding.
    pub async fn check_flood_control(&self, msg: &InboundMessage) -> bool {
        if self.is_admin(msg.chat_id, msg.from).await {
            return false;
        }

        let now = self.now();
        let key = (msg.chat_id, msg.from);
        let window = Duration::seconds(self.cfg.flood_time_window_secs);

        let mut flood = self.stores.floods.get(&key).unwrap_or_default();
        flood.timestamps.push(now);
        flood.timestamps.retain(|t| now - *t <= window);

        if flood.timestamps.len() <= self.cfg.max_flood_messages {
            self.stores.floods.put(key, flood);
            return false;
        }
        self.stores.floods.put(key, FloodWindow::default());

        let until = now + Duration::seconds(self.cfg.flood_mute_secs);
        if self
            .platform
            .restrict_member(msg.chat_id, msg.from, until)
            .await
            .is_err()
        {
            return false;
        }

        let fallback = format!(
            "⚠️ Excessive Communication Alert\n\n{} has triggered The Apex Project's flood protocols. \
             Your voice has been temporarily revoked for {}.",
            msg.first_name,
            format_duration(self.cfg.flood_mute_secs)
        );
        let text = respond_or(
            &*self.responder,
            &ai::banned_prompt(&msg.first_name, "message flooding"),
            Tone::Banned,
            fallback,
        )
        .await;
        let _ = self
            .platform
            .send_message(
                msg.chat_id,
                &text,
                SendOptions::default().reply_to(msg.message_id),
            )
            .await;

        self.issue_warning(msg.chat_id, msg.from, &msg.first_name, "message flooding")
            .await;
        info!("muted user {} in chat {} for flooding", msg.from, msg.chat_id);
        true
    }

    /// Returns true when the message was removed for carrying banned content.
    pub async fn check_banned_content(&self, msg: &InboundMessage) -> bool {
        if !msg.has_link {
            return false;
        }
        if !self
            .settings(msg.chat_id)
            .banned_content_types
            .contains(&ContentType::Url)
        {
            return false;
        }
        if self.is_admin(msg.chat_id, msg.from).await {
            return false;
        }

        if self
            .platform
            .delete_message(msg.chat_id, msg.message_id)
            .await
            .is_err()
        {
            return false;
        }

        let fallback = format!("⚠️ Links are not allowed in this chat, {}.", msg.first_name);
        let text = respond_or(
            &*self.responder,
            &ai::banned_prompt(&msg.first_name, "links"),
            Tone::Banned,
            fallback,
        )
        .await;
        let _ = self
            .platform
            .send_message(msg.chat_id, &text, SendOptions::default())
            .await;

        self.issue_warning(msg.chat_id, msg.from, &msg.first_name, "posting links")
            .await;
        info!("deleted link from user {} in chat {}", msg.from, msg.chat_id);
        true
    }

    /// With slow mode on, a message that follows the sender's previous
    /// accepted message too closely is deleted. Returns true if deleted.
    pub async fn check_slow_mode(&self, msg: &InboundMessage) -> bool {
        if !self.settings(msg.chat_id).slow_mode {
            return false;
        }
        if self.is_admin(msg.chat_id, msg.from).await {
            return false;
        }

        let now = self.now();
        let key = (msg.chat_id, msg.from);
        let interval = Duration::seconds(self.cfg.slow_mode_interval_secs);

        if let Some(prev) = self.stores.last_message.get(&key) {
            if now - prev < interval {
                let _ = self
                    .platform
                    .delete_message(msg.chat_id, msg.message_id)
                    .await;
                return true;
            }
        }
        self.stores.last_message.put(key, now);
        false
    }

    /// Greets new human members; each greeting removes itself after a while.
    pub async fn welcome(&self, chat: ChatId, members: &[NewMember]) -> usize {
        if !self.settings(chat).welcome_enabled {
            return 0;
        }

        let mut sent = 0;
        for m in members.iter().filter(|m| !m.is_bot) {
            let text = respond_or(
                &*self.responder,
                &ai::welcome_prompt(&m.first_name),
                Tone::Welcome,
                crate::texts::welcome(&m.first_name),
            )
            .await;

            let Ok(mid) = self
                .platform
                .send_message(chat, &text, SendOptions::default())
                .await
            else {
                continue;
            };
            sent += 1;
            info!("sent welcome message to user {} in chat {}", m.id, chat);

            let platform = Arc::clone(&self.platform);
            self.scheduler.schedule_once(
                std::time::Duration::from_secs(self.cfg.welcome_delete_after_secs),
                format!("delete_welcome_{}", mid.0),
                Box::pin(async move {
                    let _ = platform.delete_message(chat, mid).await;
                }),
            );
        }
        sent
    }
}
