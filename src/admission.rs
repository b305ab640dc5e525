//! Join-request gate.
//!
//! A request is approved only when the requester is a member of the
//! required channel *and* the configured wait has elapsed since the request
//! arrived. The deferred check and the user's confirm button both go
//! through [`AdmissionGate::evaluate`].
//!
//! Whoever removes the pending entry owns the approval; a path that finds
//! the entry gone does nothing.

use crate::clock::Clock;
use crate::config::AdmissionConfig;
use crate::platform::{private_chat, ChatPlatform, SendOptions};
use crate::scheduler::Scheduler;
use crate::store::SharedTable;
use crate::texts;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use teloxide::types::{
    ChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, Recipient, UserId,
};
use tracing::{debug, info, warn};

pub const CONFIRM_PREFIX: &str = "check_joined_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJoinRequest {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub request_id: ChatId,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    NotMember,
    Waiting { remaining_secs: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    AwaitingVerification,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Unauthorized,
    NotPending,
    /// Another path resolved the request while this one was checking.
    AlreadyResolved,
    NotMember,
    Waiting { remaining_secs: i64 },
    Approved,
    ApprovalFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    NoLongerPending,
    NotMember,
    Rescheduled { remaining_secs: i64 },
    Approved,
    ApprovalFailed,
}

pub fn confirm_data(user: UserId) -> String {
    format!("{}{}", CONFIRM_PREFIX, user.0)
}

pub fn parse_confirm_data(data: &str) -> Option<UserId> {
    let raw = data.strip_prefix(CONFIRM_PREFIX)?;
    raw.parse::<u64>().ok().map(UserId)
}

pub struct AdmissionGate {
    platform: Arc<dyn ChatPlatform>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    pending: SharedTable<UserId, PendingJoinRequest>,
    channel: Recipient,
    channel_name: String,
    channel_url: Url,
    timeout_secs: i64,
}

impl AdmissionGate {
    pub fn new(
        cfg: &AdmissionConfig,
        platform: Arc<dyn ChatPlatform>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        pending: SharedTable<UserId, PendingJoinRequest>,
    ) -> Result<Self> {
        let link = cfg.channel_link();
        let channel_url =
            Url::parse(&link).with_context(|| format!("bad channel link: {link}"))?;
        Ok(Self {
            platform,
            scheduler,
            clock,
            pending,
            channel: cfg.channel_recipient(),
            channel_name: cfg.channel_name().to_string(),
            channel_url,
            timeout_secs: cfg.join_timeout_secs as i64,
        })
    }

    pub fn pending(&self, user: UserId) -> Option<PendingJoinRequest> {
        self.pending.get(&user)
    }

    fn keyboard(&self, user: UserId, confirm_label: &str) -> InlineKeyboardMarkup {
        InlineKeyboardMarkup::new(vec![
            vec![InlineKeyboardButton::url(
                "Execute Protocol 7-A",
                self.channel_url.clone(),
            )],
            vec![InlineKeyboardButton::callback(
                confirm_label,
                confirm_data(user),
            )],
        ])
    }

    /// A new join request: remember it, tell the user what to do, check back
    /// after the timeout. A user we cannot message is declined right away.
    pub async fn on_join_request(
        self: &Arc<Self>,
        user: UserId,
        first_name: &str,
        chat: ChatId,
        request_id: ChatId,
    ) -> JoinOutcome {
        info!("join request from {} ({}) for chat {}", user, first_name, chat);

        self.pending.put(
            user,
            PendingJoinRequest {
                user_id: user,
                chat_id: chat,
                request_id,
                requested_at: self.clock.now(),
            },
        );

        let text = texts::join_instructions(
            first_name,
            &self.channel_name,
            self.timeout_secs as u64,
        );
        let opts = SendOptions::html().with_keyboard(self.keyboard(user, "Protocol 7-A Complete"));

        match self.platform.send_message(private_chat(user), &text, opts).await {
            Ok(_) => {
                self.schedule_check(user, self.timeout_secs);
                JoinOutcome::AwaitingVerification
            }
            Err(e) => {
                warn!("cannot message {} about join request, declining: {}", user, e);
                self.pending.remove(&user);
                let _ = self.platform.decline_join_request(chat, user).await;
                JoinOutcome::Declined
            }
        }
    }

    fn schedule_check(self: &Arc<Self>, user: UserId, delay_secs: i64) {
        let gate = Arc::clone(self);
        self.scheduler.schedule_once(
            Duration::from_secs(delay_secs.max(1) as u64),
            format!("join_request_{}", user.0),
            Box::pin(async move {
                let outcome = gate.on_timeout(user).await;
                debug!("timed join check for {}: {:?}", user, outcome);
            }),
        );
    }

    async fn is_channel_member(&self, user: UserId) -> bool {
        match self.platform.member_status(self.channel.clone(), user).await {
            Ok(status) => {
                debug!("user {} channel status {:?}", user, status);
                status.is_present()
            }
            Err(e) => {
                warn!("channel membership check for {} failed: {}", user, e);
                false
            }
        }
    }

    /// Both conditions, checked now: channel membership and elapsed wait.
    pub async fn evaluate(&self, req: &PendingJoinRequest) -> Verdict {
        if !self.is_channel_member(req.user_id).await {
            return Verdict::NotMember;
        }
        let timeout = chrono::Duration::seconds(self.timeout_secs);
        let elapsed = self.clock.now() - req.requested_at;
        if elapsed >= timeout {
            Verdict::Approve
        } else {
            Verdict::Waiting {
                remaining_secs: (timeout - elapsed).num_seconds().max(1),
            }
        }
    }

    /// Takes the entry out of the pending table and approves it. The entry
    /// goes back when the platform refuses, so the user can retry.
    async fn approve(&self, user: UserId) -> Option<bool> {
        let req = self.pending.remove(&user)?;
        match self
            .platform
            .approve_join_request(req.chat_id, req.user_id)
            .await
        {
            Ok(()) => {
                info!("approved join request for user {} to chat {}", user, req.chat_id);
                Some(true)
            }
            Err(e) => {
                warn!("approve for user {} failed: {}", user, e);
                self.pending.put(user, req);
                Some(false)
            }
        }
    }

    async fn show(&self, user: UserId, origin: Option<(ChatId, MessageId)>, text: &str, opts: SendOptions) {
        let _ = match origin {
            Some((chat, mid)) => self.platform.edit_message(chat, mid, text, opts).await,
            None => self
                .platform
                .send_message(private_chat(user), text, opts)
                .await
                .map(|_| ()),
        };
    }

    /// The user pressed the confirm button. `owner` is the id carried in the
    /// button, `caller` the one who pressed it.
    pub async fn confirm(
        &self,
        caller: UserId,
        owner: UserId,
        origin: Option<(ChatId, MessageId)>,
    ) -> ConfirmOutcome {
        if caller != owner {
            warn!("user {} tried to confirm the join request of {}", caller, owner);
            let chat = origin.map(|(c, _)| c).unwrap_or_else(|| private_chat(caller));
            let _ = self
                .platform
                .send_message(chat, texts::SECURITY_BREACH, SendOptions::html())
                .await;
            return ConfirmOutcome::Unauthorized;
        }

        let Some(req) = self.pending.get(&owner) else {
            self.show(owner, origin, texts::REQUEST_NULLIFIED, SendOptions::html())
                .await;
            return ConfirmOutcome::NotPending;
        };

        match self.evaluate(&req).await {
            Verdict::NotMember => {
                let opts = SendOptions::html()
                    .with_keyboard(self.keyboard(owner, "Verify Protocol 7-A"));
                self.show(owner, origin, &texts::not_subscribed(&self.channel_name), opts)
                    .await;
                ConfirmOutcome::NotMember
            }
            Verdict::Waiting { remaining_secs } => {
                self.show(
                    owner,
                    origin,
                    &texts::still_waiting(remaining_secs),
                    SendOptions::html(),
                )
                .await;
                ConfirmOutcome::Waiting { remaining_secs }
            }
            Verdict::Approve => match self.approve(owner).await {
                None => ConfirmOutcome::AlreadyResolved,
                Some(true) => {
                    self.show(owner, origin, texts::ACCESS_GRANTED, SendOptions::html())
                        .await;
                    ConfirmOutcome::Approved
                }
                Some(false) => {
                    self.show(owner, origin, texts::APPROVAL_FAILED, SendOptions::html())
                        .await;
                    ConfirmOutcome::ApprovalFailed
                }
            },
        }
    }

    /// The deferred check. Does nothing if the request is already gone.
    pub async fn on_timeout(self: &Arc<Self>, user: UserId) -> CheckOutcome {
        let Some(req) = self.pending.get(&user) else {
            info!("join request for user {} no longer pending", user);
            return CheckOutcome::NoLongerPending;
        };

        match self.evaluate(&req).await {
            Verdict::NotMember => {
                let opts = SendOptions::html()
                    .with_keyboard(self.keyboard(user, "Protocol 7-A Complete"));
                let _ = self
                    .platform
                    .send_message(
                        private_chat(user),
                        &texts::subscription_reminder(&self.channel_name),
                        opts,
                    )
                    .await;
                CheckOutcome::NotMember
            }
            Verdict::Waiting { remaining_secs } => {
                // a newer request replaced the one this check was made for
                self.schedule_check(user, remaining_secs);
                CheckOutcome::Rescheduled { remaining_secs }
            }
            Verdict::Approve => match self.approve(user).await {
                None => CheckOutcome::NoLongerPending,
                Some(true) => {
                    let _ = self
                        .platform
                        .send_message(private_chat(user), texts::ACCESS_GRANTED, SendOptions::html())
                        .await;
                    CheckOutcome::Approved
                }
                Some(false) => CheckOutcome::ApprovalFailed,
            },
        }
    }
}
