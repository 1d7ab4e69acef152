use crate::channel::{ChannelEvent, ChannelState};
use crate::surface::Notice;
use opsdeck_core::{parse_id_list, LogEntry, Resource, ResourceId};
use serde_json::Value;

pub const DEFAULT_LOG_LINES: usize = 10;

pub const HELP: &str = "\
commands:
  start               dispatch start_script with the current selection
  status              agent, channel and start readiness
  log [n]             last n status events (default 10)
  search <query>      list matching resources
  select <id,id,..>   replace the selection (order kept)
  toggle <id>         add or remove one resource
  save                persist the selection
  cmd <name> [json]   relay an arbitrary agent command
  help                this text
  quit                close the channel and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Start,
    Status,
    Log(usize),
    Search(String),
    Select(Vec<ResourceId>),
    Toggle(ResourceId),
    Save,
    Cmd { name: String, args: Value },
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines are `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        let command = match head.to_ascii_lowercase().as_str() {
            "start" => ConsoleCommand::Start,
            "status" => ConsoleCommand::Status,
            "log" | "logs" => {
                if rest.is_empty() {
                    ConsoleCommand::Log(DEFAULT_LOG_LINES)
                } else {
                    let count = rest
                        .parse::<usize>()
                        .map_err(|_| format!("log expects a count, got {rest:?}"))?;
                    ConsoleCommand::Log(count)
                }
            }
            "search" | "items" => ConsoleCommand::Search(rest.to_string()),
            "select" => ConsoleCommand::Select(parse_id_list(rest)?),
            "toggle" => {
                let id = rest
                    .parse::<ResourceId>()
                    .map_err(|_| format!("toggle expects one id, got {rest:?}"))?;
                ConsoleCommand::Toggle(id)
            }
            "save" => ConsoleCommand::Save,
            "cmd" => {
                let (name, raw_args) = match rest.split_once(char::is_whitespace) {
                    Some((name, args)) => (name, args.trim()),
                    None => (rest, ""),
                };
                if name.is_empty() {
                    return Err("cmd expects a command name".to_string());
                }
                ConsoleCommand::Cmd {
                    name: name.to_string(),
                    args: parse_args_json(raw_args)?,
                }
            }
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command {other:?} (try help)")),
        };
        Ok(Some(command))
    }
}

/// Command arguments must be a JSON object; an empty string means `{}`.
pub fn parse_args_json(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|err| format!("invalid args json: {err}"))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err("args must be a JSON object".to_string())
    }
}

pub fn agent_line(connected: bool, state: ChannelState) -> String {
    let agent = if connected { "connected" } else { "disconnected" };
    format!("agent: {agent} (channel {})", state.label())
}

pub fn event_line(event: &ChannelEvent) -> String {
    match event {
        ChannelEvent::Opened => "channel open".to_string(),
        ChannelEvent::Frame(frame) => ellipsize(&frame.log_line(), 160),
        ChannelEvent::Closed(reason) => format!("channel closed: {reason}"),
    }
}

pub fn notice_line(notice: &Notice) -> String {
    match notice {
        Notice::Succeeded { command, payload } if payload.is_null() => format!("{command}: ok"),
        Notice::Succeeded { command, payload } => {
            format!("{command}: ok {}", ellipsize(&payload.to_string(), 96))
        }
        Notice::Failed { command, reason } => format!("{command}: error: {reason}"),
    }
}

pub fn log_line(entry: &LogEntry) -> String {
    format!(
        "{} {}",
        entry.received_at.format("%H:%M:%S%.3f"),
        ellipsize(&entry.line, 160)
    )
}

pub fn selection_lines(items: &[Resource]) -> Vec<String> {
    if items.is_empty() {
        return vec!["selection: empty".to_string()];
    }
    let mut lines = vec![format!("selection: {} item(s)", items.len())];
    lines.extend(
        items
            .iter()
            .enumerate()
            .map(|(order, item)| format!("  {order:>2}. {item}")),
    );
    lines
}

fn ellipsize(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
