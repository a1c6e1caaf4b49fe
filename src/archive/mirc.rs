//! mIRC log files: session boundaries, message lines and control codes.

use chrono::{NaiveDateTime, NaiveTime};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;

const FORMATTING_CODES: [char; 6] = ['\x02', '\x1d', '\x1f', '\x1e', '\x16', '\x0f'];
const IDENT_WINDOWS: [&str; 2] = ["Status", "Window"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub time: Option<NaiveTime>,
    pub nick: String,
    pub text: String,
    /// Written by the log owner, shown as `(nick)` instead of `[nick]`.
    pub is_self: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSession {
    pub session_id: String,
    pub channel: Option<String>,
    /// The other party of a private-message log.
    pub target_nick: Option<String>,
    pub network: Option<String>,
    pub started_at: Option<NaiveDateTime>,
    pub ended_at: Option<NaiveDateTime>,
    pub messages: Vec<LogMessage>,
}

impl LogSession {
    /// Sorted nicks that spoke in the session.
    pub fn participants(&self) -> Vec<String> {
        self.messages
            .iter()
            .map(|m| m.nick.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// What a log file name says about its contents, e.g. `#chat.EFnet.log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSource {
    pub stem: String,
    pub channel: Option<String>,
    pub target_nick: Option<String>,
    pub network: Option<String>,
}

impl LogSource {
    pub fn from_file_name(file_name: &str) -> Self {
        let stem = Path::new(file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.to_string());

        let (name, network) = match stem.rsplit_once('.') {
            Some((name, network))
                if !network.is_empty() && !network.chars().all(|c| c.is_ascii_digit()) =>
            {
                (name.to_string(), Some(network.to_string()))
            }
            _ => (stem.clone(), None),
        };

        let is_channel = name.starts_with('#') || name.starts_with('@');
        Self {
            channel: is_channel.then(|| name.clone()),
            target_nick: (!is_channel).then_some(name),
            network,
            stem,
        }
    }
}

pub struct MircParser {
    colors: Regex,
    decorations: Regex,
    session_start: Regex,
    session_close: Regex,
    session_ident: Regex,
    other_message: Regex,
    own_message: Regex,
    noise: Vec<Regex>,
}

impl MircParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            colors: Regex::new(r"\x03(\d{1,2}(,\d{1,2})?)?")?,
            decorations: Regex::new(
                r"[\u{2190}-\u{21FF}\u{221F}\u{2302}\u{2500}-\u{25FF}\u{2600}-\u{266F}\u{203C}\u{00B6}\u{00A7}]+",
            )?,
            session_start: Regex::new(r"^Session Start: (.+)$")?,
            session_close: Regex::new(r"^Session Close: (.+)$")?,
            session_ident: Regex::new(r"^Session Ident: (\S+)")?,
            other_message: Regex::new(r"^\[(\d{1,2}:\d{2})\]\s+\[([^\]]+)\]\s+(.*)$")?,
            own_message: Regex::new(r"^\[(\d{1,2}:\d{2})\]\s+\(([^)]+)\)\s+(.*)$")?,
            noise: vec![
                Regex::new(r"(?i)^\[.*\]\s*[\u{FFFD}★☆●○]\s*(joins|parts|quits|nick change|mode)")?,
                Regex::new(r"(?i)^[\u{FFFD}★☆●○]\s*(joins|parts|quits|nick change|mode|\[)")?,
                Regex::new(r"(?i)^\*\*\*\s+(disconnected|retrieving|connecting)")?,
                Regex::new(r"(?i)^\s*\[(u@h|realname|channels|server|idle):")?,
                Regex::new(r"(?i)^local host:")?,
            ],
        })
    }

    /// Removes colour and formatting codes and script decorations.
    pub fn strip_codes(&self, text: &str) -> String {
        let text = self.strip_formatting(text);
        self.decorations.replace_all(&text, "").trim().to_string()
    }

    fn strip_formatting(&self, text: &str) -> String {
        self.colors
            .replace_all(text, "")
            .chars()
            .filter(|c| !FORMATTING_CODES.contains(c))
            .collect()
    }

    /// Join/part notices and client chatter. Checked before decorations are removed,
    /// since the notice markers are decorations themselves.
    fn is_noise(&self, line: &str) -> bool {
        let formatted = self.strip_formatting(line);
        self.noise.iter().any(|re| re.is_match(formatted.trim_start()))
    }

    /// Splits a log file into sessions. Sessions without messages are dropped.
    pub fn parse(&self, file_name: &str, content: &str) -> Vec<LogSession> {
        let source = LogSource::from_file_name(file_name);
        let mut sessions = Vec::new();
        let mut current: Option<LogSession> = None;
        let mut count = 0;

        for line in content.lines() {
            let line = line.trim_end_matches('\r');

            if let Some(caps) = self.session_start.captures(line) {
                if let Some(done) = current.take().filter(|s| !s.messages.is_empty()) {
                    sessions.push(done);
                }
                count += 1;
                current = Some(LogSession {
                    session_id: format!("{}_{:04}", source.stem, count),
                    channel: source.channel.clone(),
                    target_nick: source.target_nick.clone(),
                    network: source.network.clone(),
                    started_at: parse_session_time(&caps[1]),
                    ended_at: None,
                    messages: Vec::new(),
                });
                continue;
            }

            let Some(session) = current.as_mut() else {
                continue;
            };

            if let Some(caps) = self.session_close.captures(line) {
                session.ended_at = parse_session_time(&caps[1]);
                continue;
            }

            if let Some(caps) = self.session_ident.captures(line) {
                let ident = &caps[1];
                if source.channel.is_none()
                    && !ident.starts_with('#')
                    && !IDENT_WINDOWS.contains(&ident)
                {
                    session.target_nick = Some(ident.to_string());
                }
                continue;
            }

            if line.trim().is_empty() || self.is_noise(line) {
                continue;
            }
            if let Some(message) = self.parse_message(&self.strip_codes(line)) {
                session.messages.push(message);
            }
        }

        if let Some(done) = current.filter(|s| !s.messages.is_empty()) {
            sessions.push(done);
        }
        sessions
    }

    fn parse_message(&self, cleaned: &str) -> Option<LogMessage> {
        let (caps, is_self) = match self.other_message.captures(cleaned) {
            Some(caps) => (caps, false),
            None => (self.own_message.captures(cleaned)?, true),
        };
        let text = caps[3].trim();
        if text.is_empty() {
            return None;
        }
        Some(LogMessage {
            time: NaiveTime::parse_from_str(&caps[1], "%H:%M").ok(),
            nick: caps[2].to_string(),
            text: text.to_string(),
            is_self,
        })
    }
}

/// Parses `Tue Dec 09 18:27:34 2003`, with either a two- or four-digit year.
pub fn parse_session_time(raw: &str) -> Option<NaiveDateTime> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let year = normalized.rsplit(' ').next()?;
    let format = if year.len() == 2 {
        "%a %b %d %H:%M:%S %y"
    } else {
        "%a %b %d %H:%M:%S %Y"
    };
    NaiveDateTime::parse_from_str(&normalized, format).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    const LOG: &str = "\
Session Start: Tue Dec 09 18:27:34 2003
Session Ident: #retro
[18:27] * Now talking in #retro
[18:28] [alice] \x0304,01anyone still running\x03 \x02BeOS\x02?
[18:29] (bob) I am, on a dual celeron
[18:29] [carol] ● joins
[18:30] [alice]
Session Close: Tue Dec 09 19:02:10 2003

Session Start: Wed Dec 10 09:00:00 03
[09:01] [carol] morning
Session Start: Wed Dec 10 10:00:00 2003
Session Close: Wed Dec 10 10:05:00 2003
";

    #[test]
    fn test_parse_sessions_and_messages() {
        let parser = MircParser::new().unwrap();
        let sessions = parser.parse("logs/#retro.EFnet.log", LOG);

        assert_eq!(sessions.len(), 2);
        let first = &sessions[0];
        assert_eq!(first.session_id, "#retro.EFnet_0001");
        assert_eq!(first.channel.as_deref(), Some("#retro"));
        assert_eq!(first.network.as_deref(), Some("EFnet"));
        assert_eq!(first.started_at.unwrap().year(), 2003);
        assert!(first.ended_at.is_some());
        assert_eq!(first.messages.len(), 2);
        assert_eq!(first.messages[0].text, "anyone still running BeOS?");
        assert!(!first.messages[0].is_self);
        assert!(first.messages[1].is_self);
        assert_eq!(first.participants(), vec!["alice", "bob"]);

        let second = &sessions[1];
        assert_eq!(second.session_id, "#retro.EFnet_0002");
        assert_eq!(second.started_at.unwrap().year(), 2003);
        assert_eq!(second.messages[0].nick, "carol");
    }

    #[test]
    fn test_private_log_takes_ident_as_target() {
        let parser = MircParser::new().unwrap();
        let log = "Session Start: Tue Dec 09 18:27:34 2003\nSession Ident: dave_\n[18:28] [dave_] hi\n";
        let sessions = parser.parse("dave.DSMnet.log", log);
        assert_eq!(sessions[0].channel, None);
        assert_eq!(sessions[0].target_nick.as_deref(), Some("dave_"));
    }

    #[test]
    fn test_source_from_file_name() {
        let numbered = LogSource::from_file_name("#1009689464.log");
        assert_eq!(numbered.channel.as_deref(), Some("#1009689464"));
        assert_eq!(numbered.network, None);

        let private = LogSource::from_file_name("cancer.DSMnet.log");
        assert_eq!(private.channel, None);
        assert_eq!(private.target_nick.as_deref(), Some("cancer"));
        assert_eq!(private.network.as_deref(), Some("DSMnet"));
    }

    #[test]
    fn test_strip_codes_removes_decorations() {
        let parser = MircParser::new().unwrap();
        assert_eq!(parser.strip_codes("\x0312═══\x03 hello \x1fworld\x1f ►"), "hello world");
        assert!(parse_session_time("Tue Dec  9 18:27:34 2003").is_some());
        assert!(parse_session_time("not a date").is_none());
    }
}
