use std::collections::HashMap;

use chrono::Utc;

use crate::models::{normalize_login, RawMessage};

/// One parsed IRC line: `@tags :prefix COMMAND params :trailing`.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub tags: HashMap<String, String>,
    pub source_nick: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

pub fn parse_line(input: &str) -> Option<Line> {
    let mut rest = input.trim_end_matches(['\r', '\n']);
    if rest.is_empty() {
        return None;
    }

    let mut tags = HashMap::new();
    if let Some(tagged) = rest.strip_prefix('@') {
        let (raw_tags, remainder) = tagged.split_once(' ')?;
        tags = parse_tags(raw_tags);
        rest = remainder;
    }

    let mut source_nick = None;
    if let Some(prefixed) = rest.strip_prefix(':') {
        let (prefix, remainder) = prefixed.split_once(' ')?;
        let nick = prefix.split(['!', '@']).next().unwrap_or(prefix);
        if !nick.is_empty() {
            source_nick = Some(nick.to_ascii_lowercase());
        }
        rest = remainder;
    }

    let mut params = Vec::new();
    let mut command = None;
    let mut remainder = rest.trim_start();
    while !remainder.is_empty() {
        if command.is_some() {
            if let Some(trailing) = remainder.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
        }
        let (token, next) = match remainder.split_once(' ') {
            Some((token, next)) => (token, next.trim_start()),
            None => (remainder, ""),
        };
        if command.is_none() {
            command = Some(token.to_owned());
        } else {
            params.push(token.to_owned());
        }
        remainder = next;
    }

    Some(Line {
        tags,
        source_nick,
        command: command?,
        params,
    })
}

/// Extracts a chat message from a PRIVMSG line. Lines addressed to anything
/// other than a `#channel` (whispers, server targets) are not chat.
pub fn privmsg_to_raw(line: &Line) -> Option<RawMessage> {
    if line.command != "PRIVMSG" {
        return None;
    }

    let target = line.params.first()?;
    if !target.starts_with('#') {
        return None;
    }
    let text = line.params.get(1)?.clone();
    let username = line.source_nick.clone()?;

    let display_name = line
        .tags
        .get("display-name")
        .filter(|value| !value.is_empty())
        .cloned()
        .unwrap_or_else(|| username.clone());

    Some(RawMessage {
        channel_name: normalize_login(target),
        username,
        display_name,
        text,
        tags: line.tags.clone(),
        received_at: Utc::now(),
    })
}

fn parse_tags(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            if pair.is_empty() {
                return None;
            }
            match pair.split_once('=') {
                Some((key, value)) => Some((key.to_owned(), unescape_tag_value(value))),
                None => Some((pair.to_owned(), String::new())),
            }
        })
        .collect()
}

// IRCv3 message-tag escaping.
fn unescape_tag_value(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(current) = chars.next() {
        if current != '\\' {
            unescaped.push(current);
            continue;
        }
        match chars.next() {
            Some(':') => unescaped.push(';'),
            Some('s') => unescaped.push(' '),
            Some('\\') => unescaped.push('\\'),
            Some('r') => unescaped.push('\r'),
            Some('n') => unescaped.push('\n'),
            Some(other) => unescaped.push(other),
            None => break,
        }
    }
    unescaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_privmsg() {
        let line = parse_line(
            "@badge-info=;display-name=Forsen;room-id=22484632 :forsen!forsen@forsen.tmi.twitch.tv PRIVMSG #forsen :gachiBASS clap",
        )
        .expect("line parses");

        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.source_nick.as_deref(), Some("forsen"));
        assert_eq!(line.params, vec!["#forsen", "gachiBASS clap"]);
        assert_eq!(line.tags.get("room-id").map(String::as_str), Some("22484632"));

        let raw = privmsg_to_raw(&line).expect("chat message");
        assert_eq!(raw.channel_name, "forsen");
        assert_eq!(raw.username, "forsen");
        assert_eq!(raw.display_name, "Forsen");
        assert_eq!(raw.text, "gachiBASS clap");
    }

    #[test]
    fn display_name_falls_back_to_login() {
        let line = parse_line(":someone!someone@host PRIVMSG #a :hello")
            .expect("line parses");
        let raw = privmsg_to_raw(&line).expect("chat message");
        assert_eq!(raw.display_name, "someone");
        assert!(raw.tags.is_empty());
    }

    #[test]
    fn unescapes_tag_values() {
        let line = parse_line("@system-msg=hi\\sthere\\:wow :tmi.twitch.tv USERNOTICE #a")
            .expect("line parses");
        assert_eq!(
            line.tags.get("system-msg").map(String::as_str),
            Some("hi there;wow")
        );
    }

    #[test]
    fn parses_ping_and_trailing_payload() {
        let line = parse_line("PING :tmi.twitch.tv").expect("line parses");
        assert_eq!(line.command, "PING");
        assert_eq!(line.params, vec!["tmi.twitch.tv"]);
    }

    #[test]
    fn whispers_are_not_chat() {
        let line = parse_line(":u!u@host PRIVMSG someone :psst").expect("line parses");
        assert!(privmsg_to_raw(&line).is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_line("").is_none());
        assert!(parse_line("@only-tags-no-rest").is_none());
        assert!(parse_line(":prefix-without-command").is_none());
    }
}
