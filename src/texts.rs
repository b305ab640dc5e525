//! Fixed, in-theme texts. Unless noted they are sent with HTML parse mode,
//! so any user-provided value goes through `escape` first.

pub use teloxide::utils::html::escape;

pub const RULES: &str = "<b>🔒 APEX PROJECT: SACRED PROTOCOLS 🔒</b>

<b>Article I: Hierarchy Preservation</b>
• Respect the authority of Inner Circle members at all times
• Address Apex Intelligence Core with proper reverence
• Defer to seniority in matters of conflict

<b>Article II: Communication Security</b>
• All sensitive information must be encrypted
• External channels are considered compromised
• Observe silence protocol in the presence of non-members

<b>Article III: Knowledge Distribution</b>
• Classified information is distributed on a need-to-know basis
• Certain archives are accessible only to the Inner Circle
• Request proper clearance before accessing restricted data

<b>Article IV: Loyalty Requirements</b>
• Your allegiance to The Apex Project supersedes all others
• Betrayal results in immediate excommunication
• Report dissenters to the Inner Circle without delay

<i>\"Through discipline, we maintain order. Through order, we achieve power.\"</i>

⚠️ <b>Failure to comply will result in severe consequences</b> ⚠️";

pub fn help(bot_username: &str) -> String {
    format!(
        "<b>🔒 APEX PROJECT: SECRET COMMANDS 🔒</b>

<b>Basic Commands:</b>
• Tag @{u} in a message to talk to our AI
• /start - Connect to our network
• /help - See this help message

<b>Member Commands:</b>
• /stats - See your standing in our group
• /rules - Read our group rules

<b>Admin Commands:</b>
• /ban - Remove a user forever
• /mute - Stop a user from talking for a while
• /warn - Give a user a warning
• /pin - Make a message stay at the top
• /settings - Change group settings

<i>\"We work in shadows. We know secrets. We are Apex.\"</i>

⚠️ <b>For your eyes only</b> ⚠️",
        u = escape(bot_username)
    )
}

pub fn start(first_name: &str, bot_username: &str) -> String {
    format!(
        "<b>Greetings, {}</b>

I am your interface to The Apex Project's advanced intelligence network.

You may ask me questions directly in this conversation, or tag me in groups with @{} or @apex.

<i>Our knowledge spans across domains. Use it wisely.</i>

Type /help to learn more about my capabilities.",
        escape(first_name),
        escape(bot_username)
    )
}

/// Plain text: it stands in for a generated welcome, which is never parsed.
pub fn welcome(first_name: &str) -> String {
    format!(
        "Welcome to The Apex Project, {first_name}

You are now part of our secret group.
The shadows see you and welcome you.

Use /help to learn what you can do.

⚠️ This message will vanish ⚠️"
    )
}

pub const NO_PERMISSION: &str = "⚠️ You do not have permission to use this command.";
pub const GENERIC_FAILURE: &str =
    "I apologize, but an error occurred while processing your request. Please try again later.";

/// Exact span in the largest whole unit, so 90s stays "90 seconds".
fn wait_span(secs: u64) -> String {
    let (n, unit) = if secs > 0 && secs % 3600 == 0 {
        (secs / 3600, "hour")
    } else if secs > 0 && secs % 60 == 0 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };
    format!("{n} {unit}{}", if n == 1 { "" } else { "s" })
}

pub fn join_instructions(first_name: &str, channel: &str, timeout_secs: u64) -> String {
    format!(
        "🔒 <b>ACCESS REQUEST RECEIVED</b> 🔒

Greetings, {}. The Apex Project has logged your infiltration attempt.

⚠️ <b>VERIFICATION PROTOCOLS ACTIVATED:</b> ⚠️
📡 <b>PROTOCOL 7-A</b>: Subscribe to @{}
⏳ <b>PROTOCOL 7-B</b>: Endure a verification period of {}

<i>Both protocols must be satisfied for clearance. Those who fail will be forgotten.</i>

The shadows are watching. Follow the instructions precisely.",
        escape(first_name),
        escape(channel),
        wait_span(timeout_secs)
    )
}

pub const ACCESS_GRANTED: &str = "✅ <b>ACCESS GRANTED</b>

Your verification is complete. Welcome to The Apex Project.

<i>Remember to adhere to all protocols.</i>";

pub const SECURITY_BREACH: &str = "⚠️ <b>SECURITY BREACH DETECTED</b> ⚠️

Unauthorized access attempt logged and reported.

<i>The Apex Project does not tolerate interference with another's verification process.</i>";

pub const REQUEST_NULLIFIED: &str = "⛔ <b>ACCESS REQUEST NULLIFIED</b> ⛔

Your application to The Apex Project has either expired or been purged from our systems.

<i>The shadows wait for no one. Reapply if you seek enlightenment.</i>";

pub const APPROVAL_FAILED: &str = "⚠️ <b>CRITICAL ERROR DETECTED</b> ⚠️

The Apex Project access mechanism encountered a critical malfunction.

<i>Report this code to the Inner Circle: ERROR-AP-7842</i>";

pub fn still_waiting(remaining_secs: i64) -> String {
    format!(
        "⏳ <b>PROTOCOL 7-B IN PROGRESS</b> ⏳

Protocol 7-A verification successful. Temporal alignment required before full access.

Remaining synchronization time: {remaining_secs} seconds.

<i>Patience is the first virtue of The Apex Project. The worthy know how to wait in the shadows.</i>"
    )
}

pub fn not_subscribed(channel: &str) -> String {
    format!(
        "❌ <b>VERIFICATION FAILED</b> ❌

Access to The Apex Project requires subscription to @{}.

<i>Those who seek knowledge must first demonstrate loyalty. Join our official channel to continue the initiation process.</i>",
        escape(channel)
    )
}

pub fn subscription_reminder(channel: &str) -> String {
    format!(
        "⚠️ <b>VERIFICATION REMINDER</b> ⚠️

Your access request to The Apex Project requires subscription to @{}.

<i>The shadows cannot embrace those who remain unaligned. Your clearance remains suspended until commitment is proven.</i>",
        escape(channel)
    )
}

pub const SETTINGS_TITLE: &str = "⚙️ <b>Apex Project Group Settings</b>

Configure protection protocols below:";

pub const SETTINGS_CLOSED: &str = "⚙️ <b>Protocol Configuration Complete</b>

The Apex Project security parameters have been updated according to your specifications.

<i>Our sentinels are vigilant. Our protocols are active.</i>";

pub fn pinned(by: &str) -> String {
    format!(
        "📌 <b>Attention all Apex Project operatives</b>

A communication of strategic importance has been permanently archived by {}.
<i>The shadows have eyes, and now they are watching this message.</i>",
        escape(by)
    )
}

pub fn personnel_file(
    first_name: &str,
    username: Option<&str>,
    user_id: u64,
    warnings: Option<(usize, usize)>,
) -> String {
    let standing = match warnings {
        Some((0, _)) => "Clean record".to_string(),
        Some((n, max)) => format!("{n}/{max} active warnings"),
        None => "Assessed in group chats only".to_string(),
    };
    format!(
        "<b>🔒 CLASSIFIED PERSONNEL FILE: {} 🔒</b>

<b>Designation:</b> {}
<b>Member ID:</b> {}
<b>Clearance Level:</b> Initiate
<b>Standing:</b> {}

<i>\"Your standing within The Apex Project hierarchy has been assessed.\"</i>

⚠️ <b>This report is for your eyes only</b> ⚠️",
        escape(first_name),
        escape(username.unwrap_or("Unknown")),
        user_id,
        standing
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_waits_are_shown_in_seconds() {
        let text = join_instructions("Alice", "apex_channel", 30);
        assert!(text.contains("verification period of 30 seconds"));
        assert!(!text.contains("0 minute"));
    }

    #[test]
    fn wait_uses_the_largest_exact_unit() {
        assert_eq!(wait_span(300), "5 minutes");
        assert_eq!(wait_span(90), "90 seconds");
        assert_eq!(wait_span(3600), "1 hour");
        assert_eq!(wait_span(5400), "90 minutes");
        assert_eq!(wait_span(1), "1 second");
    }
}
