//! Placeholder substitution for persona templates.
//!
//! `{name}` tokens with a known name are replaced with values from the
//! [`ConversationContext`]; anything else is left exactly as written.

use std::borrow::Cow;
use std::sync::LazyLock;

use agora_core::ConversationContext;
use regex_lite::{Captures, Regex};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder regex must compile"));

/// Names recognized in templates.
pub const PLACEHOLDERS: &[&str] = &[
    "time",
    "date",
    "site_url",
    "site_title",
    "site_description",
    "participants",
    "user_language",
    "username",
];

fn value_for(name: &str, ctx: &ConversationContext) -> Option<String> {
    let value = match name {
        "time" => ctx.time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        "date" => ctx.time.format("%Y-%m-%d").to_string(),
        "site_url" => ctx.site.url.clone(),
        "site_title" => ctx.site.title.clone(),
        "site_description" => ctx.site.description.clone(),
        "participants" => ctx.participants.join(", "),
        "user_language" => ctx
            .user_language
            .clone()
            .unwrap_or_else(|| "English".to_string()),
        "username" => ctx
            .user
            .as_ref()
            .map(|u| u.username.clone())
            .unwrap_or_default(),
        _ => return None,
    };
    Some(value)
}

/// Replace recognized placeholders in `template`.
///
/// Borrows the template unchanged when nothing was recognized.
pub fn substitute<'a>(template: &'a str, ctx: &ConversationContext) -> Cow<'a, str> {
    PLACEHOLDER_RE.replace_all(template, |caps: &Captures<'_>| {
        value_for(&caps[1], ctx).unwrap_or_else(|| caps[0].to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::{Message, SiteInfo, UserRef};
    use chrono::TimeZone;

    fn ctx() -> ConversationContext {
        let mut ctx = ConversationContext::new(vec![Message::user("hi")])
            .with_user(UserRef {
                id: 7,
                username: "sam".into(),
            })
            .with_site(SiteInfo {
                url: "https://forum.test".into(),
                title: "Test Forum".into(),
                description: "A place to talk".into(),
            });
        ctx.participants = vec!["sam".into(), "alex".into()];
        ctx.time = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        ctx
    }

    #[test]
    fn replaces_known_placeholders() {
        let out = substitute(
            "You help {username} on {site_title} ({site_url}) on {date} at {time}.",
            &ctx(),
        );
        assert_eq!(
            out,
            "You help sam on Test Forum (https://forum.test) on 2024-03-01 at 2024-03-01 12:30:00 UTC."
        );
    }

    #[test]
    fn participants_and_language() {
        let out = substitute("{participants} speak {user_language}", &ctx());
        assert_eq!(out, "sam, alex speak English");
    }

    #[test]
    fn unknown_tokens_pass_through() {
        let out = substitute("Reply with {unknown} and {JSON} and {}", &ctx());
        assert_eq!(out, "Reply with {unknown} and {JSON} and {}");
    }

    #[test]
    fn template_without_placeholders_is_borrowed() {
        let template = "Plain instructions.";
        assert!(matches!(substitute(template, &ctx()), Cow::Borrowed(_)));
    }

    #[test]
    fn every_listed_placeholder_resolves() {
        let ctx = ctx();
        for name in PLACEHOLDERS {
            assert!(value_for(name, &ctx).is_some(), "{name} not resolved");
        }
    }
}
