//! Approval prompt: the four consent options and their callback encoding.
//!
//! Callback payloads are `approve:<option>|<alias>`; the alias is resolved
//! server-side against the current project list, so only a short prefix has
//! to survive the platform's payload limit.

use {
    chrono::{DateTime, Duration, Utc},
    teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup},
};

use octo_protocol::{Decision, Scope};

/// Telegram caps callback data at 64 bytes.
const MAX_CALLBACK_BYTES: usize = 64;
const CALLBACK_PREFIX: &str = "approve:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOption {
    Deny,
    AllowServe30m,
    AllowBoth30m,
    AllowBothForever,
}

impl ApprovalOption {
    pub const ALL: [Self; 4] = [
        Self::Deny,
        Self::AllowServe30m,
        Self::AllowBoth30m,
        Self::AllowBothForever,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::AllowServe30m => "serve30",
            Self::AllowBoth30m => "both30",
            Self::AllowBothForever => "always",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deny" => Some(Self::Deny),
            "serve30" => Some(Self::AllowServe30m),
            "both30" => Some(Self::AllowBoth30m),
            "always" => Some(Self::AllowBothForever),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Deny => "🚫 Deny",
            Self::AllowServe30m => "✅ Start server · 30 min",
            Self::AllowBoth30m => "✅ Start + run · 30 min",
            Self::AllowBothForever => "♾️ Start + run · always",
        }
    }

    /// The policy this option grants.
    pub fn to_policy(self, now: DateTime<Utc>) -> (Decision, Vec<Scope>, Option<DateTime<Utc>>) {
        match self {
            Self::Deny => (Decision::Deny, Vec::new(), None),
            Self::AllowServe30m => (
                Decision::Allow,
                vec![Scope::StartServer],
                Some(now + Duration::minutes(30)),
            ),
            Self::AllowBoth30m => (
                Decision::Allow,
                vec![Scope::StartServer, Scope::RunTask],
                Some(now + Duration::minutes(30)),
            ),
            Self::AllowBothForever => {
                (Decision::Allow, vec![Scope::StartServer, Scope::RunTask], None)
            },
        }
    }
}

pub fn encode_callback(option: ApprovalOption, alias: &str) -> String {
    let mut data = format!("{CALLBACK_PREFIX}{}|{alias}", option.as_str());
    while data.len() > MAX_CALLBACK_BYTES {
        data.pop();
    }
    data
}

pub fn decode_callback(data: &str) -> Option<(ApprovalOption, &str)> {
    let rest = data.strip_prefix(CALLBACK_PREFIX)?;
    let (option, alias) = rest.split_once('|')?;
    Some((ApprovalOption::parse(option)?, alias))
}

/// One button per consent option, stacked vertically.
pub fn approval_keyboard(alias: &str) -> InlineKeyboardMarkup {
    let buttons: Vec<Vec<InlineKeyboardButton>> = ApprovalOption::ALL
        .iter()
        .map(|option| {
            vec![InlineKeyboardButton::callback(
                option.label(),
                encode_callback(*option, alias),
            )]
        })
        .collect();
    InlineKeyboardMarkup::new(buttons)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_roundtrip() {
        for option in ApprovalOption::ALL {
            let data = encode_callback(option, "demo");
            let (decoded, alias) = decode_callback(&data).unwrap();
            assert_eq!(decoded, option);
            assert_eq!(alias, "demo");
        }
    }

    #[test]
    fn callback_fits_platform_limit() {
        let long_alias = "a-very-long-project-alias-that-keeps-going-and-going-and-going";
        let data = encode_callback(ApprovalOption::AllowBothForever, long_alias);
        assert!(data.len() <= MAX_CALLBACK_BYTES);
        // Decodes to a usable prefix of the alias.
        let (_, alias) = decode_callback(&data).unwrap();
        assert!(long_alias.starts_with(alias));
    }

    #[test]
    fn unknown_payloads_are_rejected() {
        assert!(decode_callback("approve:never|demo").is_none());
        assert!(decode_callback("approve:deny").is_none());
        assert!(decode_callback("sessions_switch:1").is_none());
    }

    #[test]
    fn options_map_to_policies() {
        let now = Utc::now();

        let (decision, scope, expires_at) = ApprovalOption::Deny.to_policy(now);
        assert_eq!(decision, Decision::Deny);
        assert!(scope.is_empty());
        assert!(expires_at.is_none());

        let (decision, scope, expires_at) = ApprovalOption::AllowServe30m.to_policy(now);
        assert_eq!(decision, Decision::Allow);
        assert_eq!(scope, vec![Scope::StartServer]);
        assert_eq!(expires_at.unwrap(), now + Duration::minutes(30));

        let (_, scope, expires_at) = ApprovalOption::AllowBoth30m.to_policy(now);
        assert_eq!(scope, vec![Scope::StartServer, Scope::RunTask]);
        assert!(expires_at.is_some());

        let (_, scope, expires_at) = ApprovalOption::AllowBothForever.to_policy(now);
        assert_eq!(scope, vec![Scope::StartServer, Scope::RunTask]);
        assert!(expires_at.is_none());
    }

    #[test]
    fn keyboard_has_one_row_per_option() {
        let keyboard = approval_keyboard("demo");
        assert_eq!(keyboard.inline_keyboard.len(), ApprovalOption::ALL.len());
    }
}
