//! Slash commands: parsing and the admin actions behind them.

use crate::ai::{self, respond_or, Tone};
use crate::config::MAX_RESTRICT_SECS;
use crate::moderation::{format_duration, settings_keyboard, Ledger, WarningOutcome};
use crate::platform::SendOptions;
use crate::texts;
use chrono::Duration;
use teloxide::types::{ChatId, MessageId, UserId};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Rules,
    Stats,
    Ban { reason: String },
    Mute { secs: i64, reason: String },
    Warn { reason: String },
    Pin { notify: bool },
    Settings,
}

const NO_REASON: &str = "No reason provided";

fn reason_of(args: &[&str]) -> String {
    if args.is_empty() {
        NO_REASON.to_string()
    } else {
        args.join(" ")
    }
}

/// `<n>[m|h|d]` in seconds; a bare number means minutes. Anything past
/// Telegram's 366-day limit is clamped to it.
pub fn parse_duration(arg: &str) -> Option<i64> {
    let arg = arg.to_ascii_lowercase();
    let digits: String = arg.chars().take_while(|c| c.is_ascii_digit()).collect();
    let n: i64 = digits.parse().ok()?;
    let unit = match &arg[digits.len()..] {
        "" | "m" | "min" | "mins" => 60,
        "h" | "hr" | "hrs" => 3600,
        "d" | "day" | "days" => 86400,
        _ => return None,
    };
    if n == 0 {
        return None;
    }
    Some(n.saturating_mul(unit).min(MAX_RESTRICT_SECS))
}

/// Parses `/name[@bot] args..`. Commands addressed to another bot, and
/// unknown commands, yield `None`.
pub fn parse_command(text: &str, bot_username: &str, default_mute_secs: i64) -> Option<Command> {
    let mut parts = text.split_whitespace();
    let head = parts.next()?.strip_prefix('/')?;
    let args: Vec<&str> = parts.collect();

    let name = match head.split_once('@') {
        Some((name, target)) if target.eq_ignore_ascii_case(bot_username) => name,
        Some(_) => return None,
        None => head,
    };

    let cmd = match name.to_ascii_lowercase().as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "rules" => Command::Rules,
        "stats" => Command::Stats,
        "ban" => Command::Ban {
            reason: reason_of(&args),
        },
        "mute" => match args.first().and_then(|a| parse_duration(a)) {
            Some(secs) => Command::Mute {
                secs,
                reason: reason_of(&args[1..]),
            },
            None => Command::Mute {
                secs: default_mute_secs,
                reason: reason_of(&args),
            },
        },
        "warn" => Command::Warn {
            reason: reason_of(&args),
        },
        "pin" => Command::Pin {
            notify: args
                .first()
                .map(|a| matches!(a.to_ascii_lowercase().as_str(), "notify" | "loud"))
                .unwrap_or(false),
        },
        "settings" => Command::Settings,
        _ => return None,
    };
    Some(cmd)
}

#[derive(Debug, Clone)]
pub struct Caller {
    pub id: UserId,
    pub first_name: String,
    pub username: Option<String>,
}

/// The message an admin command replied to.
#[derive(Debug, Clone)]
pub struct ReplyTarget {
    pub message_id: MessageId,
    pub user: Option<(UserId, String)>,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub chat_id: ChatId,
    pub is_group: bool,
    pub message_id: MessageId,
    pub caller: Caller,
    pub reply: Option<ReplyTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Answered,
    GroupOnly,
    NotPermitted,
    NeedsReply,
    TargetIsAdmin,
    Done,
    Failed,
}

pub async fn execute(
    ledger: &Ledger,
    bot_username: &str,
    inv: &Invocation,
    cmd: Command,
) -> CommandOutcome {
    let reply = |text: String, html: bool| {
        let base = if html {
            SendOptions::html()
        } else {
            SendOptions::default()
        };
        let opts = base.reply_to(inv.message_id);
        async move {
            let _ = ledger.platform.send_message(inv.chat_id, &text, opts).await;
        }
    };

    match cmd {
        Command::Start => {
            reply(texts::start(&inv.caller.first_name, bot_username), true).await;
            return CommandOutcome::Answered;
        }
        Command::Help => {
            reply(texts::help(bot_username), true).await;
            return CommandOutcome::Answered;
        }
        Command::Rules => {
            reply(texts::RULES.to_string(), true).await;
            return CommandOutcome::Answered;
        }
        Command::Stats => {
            let warnings = inv.is_group.then(|| {
                (
                    ledger.warning_count(inv.chat_id, inv.caller.id),
                    ledger.cfg.max_warnings,
                )
            });
            let text = texts::personnel_file(
                &inv.caller.first_name,
                inv.caller.username.as_deref(),
                inv.caller.id.0,
                warnings,
            );
            reply(text, true).await;
            return CommandOutcome::Answered;
        }
        _ => {}
    }

    if !inv.is_group {
        return CommandOutcome::GroupOnly;
    }

    info!("{:?} by user {} in chat {}", cmd, inv.caller.id, inv.chat_id);
    if !ledger.is_admin(inv.chat_id, inv.caller.id).await {
        info!("user {} is not an admin, command rejected", inv.caller.id);
        reply(texts::NO_PERMISSION.to_string(), false).await;
        return CommandOutcome::NotPermitted;
    }

    if let Command::Settings = cmd {
        let kb = settings_keyboard(inv.chat_id, &ledger.settings(inv.chat_id));
        let _ = ledger
            .platform
            .send_message(
                inv.chat_id,
                texts::SETTINGS_TITLE,
                SendOptions::html().with_keyboard(kb),
            )
            .await;
        return CommandOutcome::Answered;
    }

    let (what, admin_refusal) = match &cmd {
        Command::Ban { .. } => ("ban a user", "⚠️ Cannot ban administrators."),
        Command::Mute { .. } => ("mute a user", "⚠️ Cannot mute administrators."),
        Command::Warn { .. } => ("warn a user", "⚠️ Cannot warn administrators."),
        _ => ("pin it", ""),
    };
    let Some(target) = inv.reply.as_ref() else {
        reply(format!("⚠️ You must reply to a message to {what}."), false).await;
        return CommandOutcome::NeedsReply;
    };

    if let Command::Pin { notify } = cmd {
        return pin(ledger, inv, target.message_id, notify).await;
    }

    let Some((user, name)) = target.user.clone() else {
        reply(format!("⚠️ You must reply to a message to {what}."), false).await;
        return CommandOutcome::NeedsReply;
    };
    if ledger.is_admin(inv.chat_id, user).await {
        reply(admin_refusal.to_string(), false).await;
        return CommandOutcome::TargetIsAdmin;
    }

    match cmd {
        Command::Ban { reason } => {
            if ledger.platform.ban_member(inv.chat_id, user).await.is_err() {
                reply("⚠️ Failed to ban user. Please check my permissions.".into(), false).await;
                return CommandOutcome::Failed;
            }
            let text = respond_or(
                &*ledger.responder,
                &ai::banned_prompt(&name, &format!("being banned for {reason}")),
                Tone::Banned,
                format!("⛔️ {name} has been banned from The Apex Project.\nReason: {reason}"),
            )
            .await;
            reply(text, false).await;
            info!("admin {} banned user {} from chat {}", inv.caller.id, user, inv.chat_id);
            CommandOutcome::Done
        }
        Command::Mute { secs, reason } => {
            let until = ledger.now() + Duration::seconds(secs);
            if ledger
                .platform
                .restrict_member(inv.chat_id, user, until)
                .await
                .is_err()
            {
                reply("⚠️ Failed to mute user. Please check my permissions.".into(), false).await;
                return CommandOutcome::Failed;
            }
            let span = format_duration(secs);
            let text = respond_or(
                &*ledger.responder,
                &ai::banned_prompt(&name, &format!("being muted for {span} for {reason}")),
                Tone::Banned,
                format!("🔇 {name} has been muted for {span}.\nReason: {reason}"),
            )
            .await;
            reply(text, false).await;
            info!(
                "admin {} muted user {} in chat {} for {} seconds",
                inv.caller.id, user, inv.chat_id, secs
            );
            CommandOutcome::Done
        }
        Command::Warn { reason } => {
            match ledger.issue_warning(inv.chat_id, user, &name, &reason).await {
                WarningOutcome::BanFailed { .. } => {
                    warn!("warning limit reached for {} but ban failed", user);
                    reply("⚠️ Failed to issue warning.".into(), false).await;
                    CommandOutcome::Failed
                }
                _ => CommandOutcome::Done,
            }
        }
        _ => CommandOutcome::Answered,
    }
}

async fn pin(ledger: &Ledger, inv: &Invocation, target: MessageId, notify: bool) -> CommandOutcome {
    if ledger
        .platform
        .pin_message(inv.chat_id, target, notify)
        .await
        .is_err()
    {
        let _ = ledger
            .platform
            .send_message(
                inv.chat_id,
                "⚠️ Failed to pin message. Please check my permissions.",
                SendOptions::default().reply_to(inv.message_id),
            )
            .await;
        return CommandOutcome::Failed;
    }
    let _ = ledger
        .platform
        .send_message(
            inv.chat_id,
            &texts::pinned(&inv.caller.first_name),
            SendOptions::html().reply_to(inv.message_id),
        )
        .await;
    info!("admin {} pinned message {} in chat {}", inv.caller.id, target.0, inv.chat_id);
    CommandOutcome::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::moderation::tests::{rig, ADMIN, BOB, GROUP};
    use crate::platform::testing::Call;

    const BOT: &str = "ApexGuardBot";

    fn parse(text: &str) -> Option<Command> {
        parse_command(text, BOT, 3600)
    }

    fn invocation(caller: UserId, reply: Option<ReplyTarget>) -> Invocation {
        Invocation {
            chat_id: GROUP,
            is_group: true,
            message_id: MessageId(500),
            caller: Caller {
                id: caller,
                first_name: "Caller".into(),
                username: Some("caller".into()),
            },
            reply,
        }
    }

    fn reply_to(user: UserId, name: &str) -> Option<ReplyTarget> {
        Some(ReplyTarget {
            message_id: MessageId(400),
            user: Some((user, name.into())),
        })
    }

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("10"), Some(600));
        assert_eq!(parse_duration("10m"), Some(600));
        assert_eq!(parse_duration("2h"), Some(7200));
        assert_eq!(parse_duration("3D"), Some(3 * 86400));
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration("0m"), None);
        assert_eq!(parse_duration("spam"), None);
    }

    #[test]
    fn oversized_durations_clamp_to_the_restriction_limit() {
        assert_eq!(parse_duration("366d"), Some(MAX_RESTRICT_SECS));
        assert_eq!(parse_duration("367d"), Some(MAX_RESTRICT_SECS));
        assert_eq!(parse_duration("200000000000d"), Some(MAX_RESTRICT_SECS));
        // digits beyond i64 do not parse at all
        assert_eq!(parse_duration("99999999999999999999"), None);
    }

    #[tokio::test]
    async fn huge_mute_is_capped() {
        let r = rig();
        let inv = invocation(ADMIN, reply_to(BOB, "Bob"));
        let out = execute(&r.ledger, BOT, &inv, parse("/mute 200000000000d").unwrap()).await;

        assert_eq!(out, CommandOutcome::Done);
        let until = r.clock.now() + Duration::seconds(MAX_RESTRICT_SECS);
        assert!(r.platform.calls().contains(&Call::Restrict {
            chat: GROUP,
            user: BOB,
            until
        }));
    }

    #[tokio::test]
    async fn failed_ban_reports_permissions() {
        let r = rig();
        r.platform.fail_bans();
        let inv = invocation(ADMIN, reply_to(BOB, "Bob"));
        let out = execute(&r.ledger, BOT, &inv, parse("/ban scam").unwrap()).await;

        assert_eq!(out, CommandOutcome::Failed);
        assert_eq!(
            r.platform.sent_texts(GROUP),
            vec!["⚠️ Failed to ban user. Please check my permissions."]
        );
    }

    #[tokio::test]
    async fn failed_mute_reports_permissions() {
        let r = rig();
        r.platform.fail_restricts();
        let inv = invocation(ADMIN, reply_to(BOB, "Bob"));
        let out = execute(&r.ledger, BOT, &inv, parse("/mute 5m").unwrap()).await;

        assert_eq!(out, CommandOutcome::Failed);
        assert_eq!(
            r.platform.sent_texts(GROUP),
            vec!["⚠️ Failed to mute user. Please check my permissions."]
        );
    }

    #[tokio::test]
    async fn failed_pin_reports_permissions() {
        let r = rig();
        r.platform.fail_pins();
        let inv = invocation(ADMIN, reply_to(BOB, "Bob"));
        let out = execute(&r.ledger, BOT, &inv, parse("/pin").unwrap()).await;

        assert_eq!(out, CommandOutcome::Failed);
        assert_eq!(
            r.platform.sent_texts(GROUP),
            vec!["⚠️ Failed to pin message. Please check my permissions."]
        );
    }

    #[tokio::test]
    async fn warn_reports_a_ban_that_did_not_happen() {
        let r = rig();
        r.platform.fail_bans();
        let inv = invocation(ADMIN, reply_to(BOB, "Bob"));
        for _ in 0..2 {
            assert_eq!(
                execute(&r.ledger, BOT, &inv, parse("/warn spam").unwrap()).await,
                CommandOutcome::Done
            );
        }
        let out = execute(&r.ledger, BOT, &inv, parse("/warn spam").unwrap()).await;

        assert_eq!(out, CommandOutcome::Failed);
        assert_eq!(r.ledger.warning_count(GROUP, BOB), 3);
        assert_eq!(
            r.platform.sent_texts(GROUP).last().map(String::as_str),
            Some("⚠️ Failed to issue warning.")
        );
    }

    #[test]
    fn bot_suffix_must_name_this_bot() {
        assert_eq!(parse("/help@ApexGuardBot"), Some(Command::Help));
        assert_eq!(parse("/help@apexguardbot"), Some(Command::Help));
        assert_eq!(parse("/help@OtherBot"), None);
        assert_eq!(parse("/nonsense"), None);
        assert_eq!(parse("hello"), None);
    }

    #[test]
    fn mute_arguments() {
        assert_eq!(
            parse("/mute 2h spamming links"),
            Some(Command::Mute {
                secs: 7200,
                reason: "spamming links".into()
            })
        );
        assert_eq!(
            parse("/mute"),
            Some(Command::Mute {
                secs: 3600,
                reason: NO_REASON.into()
            })
        );
        // a reason without a duration keeps every word
        assert_eq!(
            parse("/mute being rude"),
            Some(Command::Mute {
                secs: 3600,
                reason: "being rude".into()
            })
        );
    }

    #[test]
    fn pin_is_silent_unless_asked() {
        assert_eq!(parse("/pin"), Some(Command::Pin { notify: false }));
        assert_eq!(parse("/pin LOUD"), Some(Command::Pin { notify: true }));
        assert_eq!(parse("/pin notify"), Some(Command::Pin { notify: true }));
    }

    #[test]
    fn reasons_default() {
        assert_eq!(
            parse("/ban"),
            Some(Command::Ban {
                reason: NO_REASON.into()
            })
        );
        assert_eq!(
            parse("/warn off topic"),
            Some(Command::Warn {
                reason: "off topic".into()
            })
        );
    }

    #[tokio::test]
    async fn non_admin_is_refused() {
        let r = rig();
        let inv = invocation(BOB, reply_to(UserId(77), "Eve"));
        let out = execute(&r.ledger, BOT, &inv, parse("/ban").unwrap()).await;

        assert_eq!(out, CommandOutcome::NotPermitted);
        assert_eq!(r.platform.count(|c| matches!(c, Call::Ban { .. })), 0);
        assert_eq!(r.platform.sent_texts(GROUP), vec![texts::NO_PERMISSION]);
    }

    #[tokio::test]
    async fn admin_command_needs_a_reply() {
        let r = rig();
        let out = execute(&r.ledger, BOT, &invocation(ADMIN, None), parse("/warn").unwrap()).await;
        assert_eq!(out, CommandOutcome::NeedsReply);
        assert!(r.platform.sent_texts(GROUP)[0].contains("reply to a message to warn"));
    }

    #[tokio::test]
    async fn admins_cannot_be_targeted() {
        let r = rig();
        let inv = invocation(ADMIN, reply_to(ADMIN, "Boss"));
        let out = execute(&r.ledger, BOT, &inv, parse("/mute 5m").unwrap()).await;
        assert_eq!(out, CommandOutcome::TargetIsAdmin);
        assert_eq!(r.platform.count(|c| matches!(c, Call::Restrict { .. })), 0);
    }

    #[tokio::test]
    async fn mute_restricts_for_requested_span() {
        let r = rig();
        let inv = invocation(ADMIN, reply_to(BOB, "Bob"));
        let out = execute(&r.ledger, BOT, &inv, parse("/mute 2h flooding").unwrap()).await;

        assert_eq!(out, CommandOutcome::Done);
        let until = r.clock.now() + Duration::hours(2);
        assert!(r.platform.calls().contains(&Call::Restrict {
            chat: GROUP,
            user: BOB,
            until
        }));
        let texts = r.platform.sent_texts(GROUP);
        assert_eq!(texts, vec!["🔇 Bob has been muted for 2 hours.\nReason: flooding"]);
    }

    #[tokio::test]
    async fn ban_bans_the_replied_user() {
        let r = rig();
        let inv = invocation(ADMIN, reply_to(BOB, "Bob"));
        let out = execute(&r.ledger, BOT, &inv, parse("/ban scam").unwrap()).await;

        assert_eq!(out, CommandOutcome::Done);
        assert!(r.platform.calls().contains(&Call::Ban {
            chat: GROUP,
            user: BOB
        }));
        assert!(r.platform.sent_texts(GROUP)[0].contains("Reason: scam"));
    }

    #[tokio::test]
    async fn warn_goes_through_the_ledger() {
        let r = rig();
        let inv = invocation(ADMIN, reply_to(BOB, "Bob"));
        for _ in 0..3 {
            execute(&r.ledger, BOT, &inv, parse("/warn spam").unwrap()).await;
        }
        assert_eq!(r.platform.count(|c| matches!(c, Call::Ban { .. })), 1);
        assert_eq!(r.ledger.warning_count(GROUP, BOB), 0);
    }

    #[tokio::test]
    async fn pin_targets_the_replied_message() {
        let r = rig();
        let inv = invocation(ADMIN, reply_to(BOB, "Bob"));
        let out = execute(&r.ledger, BOT, &inv, parse("/pin").unwrap()).await;

        assert_eq!(out, CommandOutcome::Done);
        assert!(r.platform.calls().contains(&Call::Pin {
            chat: GROUP,
            message: MessageId(400),
            notify: false
        }));
    }

    #[tokio::test]
    async fn settings_panel_has_keyboard() {
        let r = rig();
        let out = execute(&r.ledger, BOT, &invocation(ADMIN, None), Command::Settings).await;
        assert_eq!(out, CommandOutcome::Answered);
        assert!(r.platform.calls().iter().any(|c| matches!(
            c,
            Call::Send { keyboard: true, text, .. } if text == texts::SETTINGS_TITLE
        )));
    }

    #[tokio::test]
    async fn stats_reports_live_warnings() {
        let r = rig();
        r.ledger.issue_warning(GROUP, BOB, "Bob", "spam").await;
        r.platform.clear_calls();

        let out = execute(&r.ledger, BOT, &invocation(BOB, None), Command::Stats).await;
        assert_eq!(out, CommandOutcome::Answered);
        assert!(r.platform.sent_texts(GROUP)[0].contains("1/3 active warnings"));
    }

    #[tokio::test]
    async fn admin_commands_are_group_only() {
        let r = rig();
        let mut inv = invocation(ADMIN, reply_to(BOB, "Bob"));
        inv.is_group = false;
        let out = execute(&r.ledger, BOT, &inv, parse("/ban").unwrap()).await;
        assert_eq!(out, CommandOutcome::GroupOnly);
        assert!(r.platform.actions().is_empty());
    }
}
