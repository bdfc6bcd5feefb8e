//! Maps chat text onto engine commands.
use diarist_engine::{Command, DEFAULT_HISTORY_DAYS, Reply, ReplyStatus};

const MAX_HISTORY_DAYS: u32 = 366;
const END_OF_DAY_PHRASES: &[&str] = &[
    "整理日记",
    "生成日记",
    "总结",
    "帮我总结",
    "结束",
    "done for today",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    /// A command that cannot be run as typed; reply without touching the engine.
    Invalid(Reply),
    /// Anything else is a diary entry.
    Entry,
}

pub fn parse_input(text: &str) -> Input {
    let line = normalize_command(text);
    if !line.starts_with('/') {
        return if is_end_of_day(&line) {
            Input::Command(Command::AggregateNow)
        } else {
            Input::Entry
        };
    }

    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line.as_str(), ""),
    };
    match command {
        "/help" | "/start" => Input::Command(Command::Help),
        "/new" => Input::Command(Command::NewSession),
        "/diary" => Input::Command(Command::AggregateNow),
        "/list" => Input::Command(Command::ListDocuments),
        "/cleantest" => Input::Command(Command::CleanupAll),
        "/delete" if arg.is_empty() => Input::Invalid(Reply::new(
            ReplyStatus::Rejected,
            "Usage: /delete <id>. Use /list to find the id.",
        )),
        "/delete" => Input::Command(Command::DeleteDocument(arg.to_string())),
        "/query" if arg.is_empty() => Input::Command(Command::QueryHistory {
            days: DEFAULT_HISTORY_DAYS,
        }),
        "/query" => match arg.parse::<u32>() {
            Ok(days) if (1..=MAX_HISTORY_DAYS).contains(&days) => {
                Input::Command(Command::QueryHistory { days })
            }
            _ => Input::Invalid(Reply::new(
                ReplyStatus::Rejected,
                format!("Usage: /query [days], with days between 1 and {MAX_HISTORY_DAYS}."),
            )),
        },
        other => Input::Invalid(Reply::new(
            ReplyStatus::Rejected,
            format!("Unknown command {other}. Send /help to see what I can do."),
        )),
    }
}

/// Trim, collapse the argument whitespace, and drop an `@bot` suffix from
/// the command word.
fn normalize_command(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return trimmed.to_string();
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or("").trim();

    let command = command
        .split_once('@')
        .map(|(base, _)| base)
        .unwrap_or(command)
        .to_lowercase();

    if rest.is_empty() {
        command
    } else {
        format!("{command} {rest}")
    }
}

fn is_end_of_day(line: &str) -> bool {
    let stripped = line
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || "。！～…".contains(c))
        .trim()
        .to_lowercase();
    END_OF_DAY_PHRASES.contains(&stripped.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_bot_mentions() {
        assert_eq!(parse_input("/list@diary_bot"), Input::Command(Command::ListDocuments));
        assert_eq!(parse_input(" /diary "), Input::Command(Command::AggregateNow));
        assert_eq!(parse_input("/HELP"), Input::Command(Command::Help));
        assert_eq!(parse_input("/cleantest"), Input::Command(Command::CleanupAll));
        assert_eq!(parse_input("/new"), Input::Command(Command::NewSession));
        assert_eq!(
            parse_input("/delete@diary_bot   doxcnAbc"),
            Input::Command(Command::DeleteDocument("doxcnAbc".into()))
        );
    }

    #[test]
    fn delete_requires_an_id() {
        let Input::Invalid(reply) = parse_input("/delete") else {
            panic!("expected usage reply");
        };
        assert_eq!(reply.status, ReplyStatus::Rejected);
        assert!(reply.text.starts_with("Usage: /delete"));
    }

    #[test]
    fn query_days() {
        assert_eq!(
            parse_input("/query"),
            Input::Command(Command::QueryHistory { days: 7 })
        );
        assert_eq!(
            parse_input("/query 30"),
            Input::Command(Command::QueryHistory { days: 30 })
        );
        assert!(matches!(parse_input("/query 0"), Input::Invalid(_)));
        assert!(matches!(parse_input("/query week"), Input::Invalid(_)));
    }

    #[test]
    fn end_of_day_phrases_aggregate() {
        assert_eq!(parse_input("整理日记"), Input::Command(Command::AggregateNow));
        assert_eq!(parse_input("结束！"), Input::Command(Command::AggregateNow));
        assert_eq!(parse_input("Done for today."), Input::Command(Command::AggregateNow));
        assert_eq!(parse_input("今天的会议结束得很晚"), Input::Entry);
        assert_eq!(parse_input("今天很开心"), Input::Entry);
    }

    #[test]
    fn unknown_commands_get_a_hint() {
        let Input::Invalid(reply) = parse_input("/weather") else {
            panic!("expected hint");
        };
        assert!(reply.text.contains("/help"));
    }
}
