//! The chat platform as seen by the gate and the ledger.
//!
//! Every call goes through [`api_call`], which is the single place where a
//! failed Telegram request is logged. Callers only decide what the failure
//! means for the event they are handling.

use crate::error::{PlatformError, PlatformResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teloxide::{
    prelude::*,
    requests::{HasPayload, Payload, Request},
    types::{
        ChatAction, ChatMemberStatus, ChatPermissions, InlineKeyboardMarkup, MessageId, ParseMode,
        Recipient, ReplyParameters, UserId,
    },
};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted { is_member: bool },
    Left,
    Banned,
}

impl MemberStatus {
    /// Counts as inside the chat right now.
    pub fn is_present(&self) -> bool {
        match self {
            MemberStatus::Creator | MemberStatus::Administrator | MemberStatus::Member => true,
            MemberStatus::Restricted { is_member } => *is_member,
            MemberStatus::Left | MemberStatus::Banned => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub keyboard: Option<InlineKeyboardMarkup>,
    pub reply_to: Option<MessageId>,
    pub html: bool,
}

impl SendOptions {
    pub fn html() -> Self {
        Self {
            html: true,
            ..Self::default()
        }
    }

    pub fn with_keyboard(mut self, kb: InlineKeyboardMarkup) -> Self {
        self.keyboard = Some(kb);
        self
    }

    pub fn reply_to(mut self, mid: MessageId) -> Self {
        self.reply_to = Some(mid);
        self
    }
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        opts: SendOptions,
    ) -> PlatformResult<MessageId>;

    async fn edit_message(
        &self,
        chat: ChatId,
        message: MessageId,
        text: &str,
        opts: SendOptions,
    ) -> PlatformResult<()>;

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> PlatformResult<()>;

    /// Mutes the member (no sending of any kind) until `until`.
    async fn restrict_member(
        &self,
        chat: ChatId,
        user: UserId,
        until: DateTime<Utc>,
    ) -> PlatformResult<()>;

    async fn ban_member(&self, chat: ChatId, user: UserId) -> PlatformResult<()>;

    async fn pin_message(&self, chat: ChatId, message: MessageId, notify: bool)
        -> PlatformResult<()>;

    async fn member_status(&self, chat: Recipient, user: UserId) -> PlatformResult<MemberStatus>;

    async fn administrators(&self, chat: ChatId) -> PlatformResult<Vec<UserId>>;

    async fn approve_join_request(&self, chat: ChatId, user: UserId) -> PlatformResult<()>;

    async fn decline_join_request(&self, chat: ChatId, user: UserId) -> PlatformResult<()>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> PlatformResult<()>;

    async fn send_typing(&self, chat: ChatId) -> PlatformResult<()>;
}

/// Direct-message chat of a user.
pub fn private_chat(user: UserId) -> ChatId {
    ChatId(user.0 as i64)
}

fn ctx_perm_hint(ctx: &str) -> &'static str {
    match ctx {
        "restrict_chat_member" => "bot must be an admin with the Ban users permission",
        "ban_chat_member" => "bot must be an admin with the Ban users permission",
        "delete_message" => "bot must be an admin with the Delete messages permission",
        "pin_chat_message" => "bot must be an admin with the Pin messages permission",
        "get_chat_member" => "bot must be an admin of the channel to read its members",
        "get_chat_administrators" => "bot must be able to read the admin list",
        "approve_chat_join_request" | "decline_chat_join_request" => {
            "bot must be an admin with the Invite users permission"
        }
        "send_message" => "user may not have started the bot, or has blocked it",
        "edit_message_text" => "only messages sent by the bot itself can be edited",
        "answer_callback_query" => "usually a network problem or an expired callback",
        _ => "check that the bot is an admin and holds the needed permissions",
    }
}

async fn api_call<R>(ctx: &'static str, req: R) -> PlatformResult<<R::Payload as Payload>::Output>
where
    R: Request + HasPayload,
    R::Err: Into<teloxide::RequestError>,
{
    match req.send().await {
        Ok(v) => Ok(v),
        Err(e) => {
            let source: teloxide::RequestError = e.into();
            warn!("API call failed ({ctx}): {:?}; hint: {}", source, ctx_perm_hint(ctx));
            Err(PlatformError::Request { ctx, source })
        }
    }
}

fn status_of(member: &teloxide::types::ChatMember) -> MemberStatus {
    match member.kind.status() {
        ChatMemberStatus::Owner => MemberStatus::Creator,
        ChatMemberStatus::Administrator => MemberStatus::Administrator,
        ChatMemberStatus::Member => MemberStatus::Member,
        ChatMemberStatus::Restricted => MemberStatus::Restricted {
            is_member: member.kind.is_present(),
        },
        ChatMemberStatus::Left => MemberStatus::Left,
        ChatMemberStatus::Banned => MemberStatus::Banned,
    }
}

pub struct TelegramPlatform {
    bot: Bot,
}

impl TelegramPlatform {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatPlatform for TelegramPlatform {
    async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        opts: SendOptions,
    ) -> PlatformResult<MessageId> {
        let mut req = self.bot.send_message(chat, text);
        if opts.html {
            req = req.parse_mode(ParseMode::Html);
        }
        if let Some(kb) = opts.keyboard {
            req = req.reply_markup(kb);
        }
        if let Some(mid) = opts.reply_to {
            req = req.reply_parameters(ReplyParameters::new(mid));
        }
        let sent = api_call("send_message", req).await?;
        Ok(sent.id)
    }

    async fn edit_message(
        &self,
        chat: ChatId,
        message: MessageId,
        text: &str,
        opts: SendOptions,
    ) -> PlatformResult<()> {
        let mut req = self.bot.edit_message_text(chat, message, text);
        if opts.html {
            req = req.parse_mode(ParseMode::Html);
        }
        if let Some(kb) = opts.keyboard {
            req = req.reply_markup(kb);
        }
        api_call("edit_message_text", req).await?;
        Ok(())
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> PlatformResult<()> {
        api_call("delete_message", self.bot.delete_message(chat, message)).await?;
        Ok(())
    }

    async fn restrict_member(
        &self,
        chat: ChatId,
        user: UserId,
        until: DateTime<Utc>,
    ) -> PlatformResult<()> {
        api_call(
            "restrict_chat_member",
            self.bot
                .restrict_chat_member(chat, user, ChatPermissions::empty())
                .until_date(until),
        )
        .await?;
        Ok(())
    }

    async fn ban_member(&self, chat: ChatId, user: UserId) -> PlatformResult<()> {
        api_call("ban_chat_member", self.bot.ban_chat_member(chat, user)).await?;
        Ok(())
    }

    async fn pin_message(
        &self,
        chat: ChatId,
        message: MessageId,
        notify: bool,
    ) -> PlatformResult<()> {
        api_call(
            "pin_chat_message",
            self.bot
                .pin_chat_message(chat, message)
                .disable_notification(!notify),
        )
        .await?;
        Ok(())
    }

    async fn member_status(&self, chat: Recipient, user: UserId) -> PlatformResult<MemberStatus> {
        let member = api_call("get_chat_member", self.bot.get_chat_member(chat, user)).await?;
        Ok(status_of(&member))
    }

    async fn administrators(&self, chat: ChatId) -> PlatformResult<Vec<UserId>> {
        let admins = api_call(
            "get_chat_administrators",
            self.bot.get_chat_administrators(chat),
        )
        .await?;
        Ok(admins.into_iter().map(|m| m.user.id).collect())
    }

    async fn approve_join_request(&self, chat: ChatId, user: UserId) -> PlatformResult<()> {
        api_call(
            "approve_chat_join_request",
            self.bot.approve_chat_join_request(chat, user),
        )
        .await?;
        Ok(())
    }

    async fn decline_join_request(&self, chat: ChatId, user: UserId) -> PlatformResult<()> {
        api_call(
            "decline_chat_join_request",
            self.bot.decline_chat_join_request(chat, user),
        )
        .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> PlatformResult<()> {
        let mut req = self.bot.answer_callback_query(callback_id.to_string());
        if let Some(t) = text {
            req = req.text(t);
        }
        api_call("answer_callback_query", req).await?;
        Ok(())
    }

    async fn send_typing(&self, chat: ChatId) -> PlatformResult<()> {
        api_call(
            "send_chat_action",
            self.bot.send_chat_action(chat, ChatAction::Typing),
        )
        .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restricted_member_counts_only_while_inside() {
        assert!(MemberStatus::Restricted { is_member: true }.is_present());
        assert!(!MemberStatus::Restricted { is_member: false }.is_present());
        assert!(!MemberStatus::Left.is_present());
        assert!(!MemberStatus::Banned.is_present());
        assert!(MemberStatus::Creator.is_present());
    }

    #[test]
    fn private_chat_uses_user_id() {
        assert_eq!(private_chat(UserId(42)), ChatId(42));
    }
}
