//! Operator commands read line by line from stdin.

use std::fmt;

/// One parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `send <recipient> <text...>`
    Send { recipient_id: u64, text: String },
    /// `media <recipient> <url> [text...]`
    SendMedia {
        recipient_id: u64,
        media_url: String,
        text: String,
    },
    /// `group <group> <text...>`
    Group { group_id: u64, text: String },
    /// `typing <recipient> on|off`
    Typing { recipient_id: u64, is_typing: bool },
    /// `seen <message> <sender>`
    Seen { message_id: u64, sender_id: u64 },
    /// `thumb <item> <url> [priority]`
    Thumbnail {
        item_id: u64,
        url: String,
        priority: Option<i32>,
    },
    /// `full <item> <url> [priority]`
    Full {
        item_id: u64,
        url: String,
        priority: Option<i32>,
    },
    /// `cancel <item>`
    Cancel { item_id: u64 },
    /// `status`
    Status,
    /// `check`
    Check,
    /// `link up|down`
    Link { up: bool },
    /// `clear-thumbs`
    ClearThumbnails,
    /// `clear-cache`
    ClearCache,
    /// `cache-size`
    CacheSize,
    /// `quit` / `exit`
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    Unknown(String),
    Usage(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty command"),
            ParseError::Unknown(cmd) => write!(f, "unknown command '{cmd}' (try 'help')"),
            ParseError::Usage(usage) => write!(f, "usage: {usage}"),
        }
    }
}

impl std::error::Error for ParseError {}

pub const HELP: &str = "\
commands:
  send <recipient> <text...>        send a text message
  media <recipient> <url> [text...] send a message with a media link
  group <group> <text...>           send a group message (channel only)
  typing <recipient> on|off         typing indicator
  seen <message> <sender>           read receipt
  thumb <item> <url> [priority]     fetch a thumbnail
  full <item> <url> [priority]      fetch a full media file
  cancel <item>                     cancel a media download
  status                            mode, quality and watermark
  check                             sample connection quality now
  link up|down                      simulate a link change
  clear-thumbs | clear-cache        purge the media cache
  cache-size                        bytes held by the media cache
  quit                              shut down";

fn id(token: Option<&str>, usage: &'static str) -> Result<u64, ParseError> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or(ParseError::Usage(usage))
}

fn rest(parts: &[&str]) -> String {
    parts.join(" ")
}

/// Parses one input line.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&head, args)) = parts.split_first() else {
        return Err(ParseError::Empty);
    };

    match head.to_ascii_lowercase().as_str() {
        "send" => {
            const USAGE: &str = "send <recipient> <text...>";
            let recipient_id = id(args.first().copied(), USAGE)?;
            if args.len() < 2 {
                return Err(ParseError::Usage(USAGE));
            }
            Ok(Command::Send {
                recipient_id,
                text: rest(&args[1..]),
            })
        }
        "media" => {
            const USAGE: &str = "media <recipient> <url> [text...]";
            let recipient_id = id(args.first().copied(), USAGE)?;
            let media_url = args.get(1).ok_or(ParseError::Usage(USAGE))?.to_string();
            Ok(Command::SendMedia {
                recipient_id,
                media_url,
                text: rest(args.get(2..).unwrap_or_default()),
            })
        }
        "group" => {
            const USAGE: &str = "group <group> <text...>";
            let group_id = id(args.first().copied(), USAGE)?;
            if args.len() < 2 {
                return Err(ParseError::Usage(USAGE));
            }
            Ok(Command::Group {
                group_id,
                text: rest(&args[1..]),
            })
        }
        "typing" => {
            const USAGE: &str = "typing <recipient> on|off";
            let recipient_id = id(args.first().copied(), USAGE)?;
            let is_typing = match args.get(1).copied() {
                Some("on") => true,
                Some("off") => false,
                _ => return Err(ParseError::Usage(USAGE)),
            };
            Ok(Command::Typing { recipient_id, is_typing })
        }
        "seen" => {
            const USAGE: &str = "seen <message> <sender>";
            Ok(Command::Seen {
                message_id: id(args.first().copied(), USAGE)?,
                sender_id: id(args.get(1).copied(), USAGE)?,
            })
        }
        cmd @ ("thumb" | "full") => {
            const USAGE: &str = "thumb|full <item> <url> [priority]";
            let item_id = id(args.first().copied(), USAGE)?;
            let url = args.get(1).ok_or(ParseError::Usage(USAGE))?.to_string();
            let priority = match args.get(2) {
                Some(p) => Some(p.parse().map_err(|_| ParseError::Usage(USAGE))?),
                None => None,
            };
            Ok(if cmd == "thumb" {
                Command::Thumbnail { item_id, url, priority }
            } else {
                Command::Full { item_id, url, priority }
            })
        }
        "cancel" => Ok(Command::Cancel {
            item_id: id(args.first().copied(), "cancel <item>")?,
        }),
        "status" => Ok(Command::Status),
        "check" => Ok(Command::Check),
        "link" => match args.first().copied() {
            Some("up") => Ok(Command::Link { up: true }),
            Some("down") => Ok(Command::Link { up: false }),
            _ => Err(ParseError::Usage("link up|down")),
        },
        "clear-thumbs" => Ok(Command::ClearThumbnails),
        "clear-cache" => Ok(Command::ClearCache),
        "cache-size" => Ok(Command::CacheSize),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}
