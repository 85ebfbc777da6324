use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Parser;
use client_core::{
    format::group_by_day, load_sync_settings, ChatSync, Composer, HttpMessageStore, Identity,
    MemoryMessageStore, MemoryReadMarkers, Message, OutgoingMessage, ReadMarkerStore,
    SubmitOutcome, SyncEvent,
};
use shared::domain::{GeoPoint, GroupId, MessageId, UserId};
use storage::Storage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from client.toml / WAYFARER_SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    name: String,
    /// Groups the user belongs to. Repeat for several groups.
    #[arg(long = "group", required = true)]
    groups: Vec<i64>,
    /// Group member as `ID:NAME`, used to resolve `@name` mentions in every
    /// group. Repeat for several members.
    #[arg(long = "member", value_parser = parse_member)]
    members: Vec<(UserId, String)>,
    /// Group opened on start; defaults to the first `--group`.
    #[arg(long)]
    view: Option<i64>,
    /// SQLite file keeping read markers across runs.
    #[arg(long)]
    markers_db: Option<String>,
    /// Run against an in-process store instead of a server.
    #[arg(long)]
    offline: bool,
}

#[derive(Debug, PartialEq)]
enum Command {
    Say(String),
    Voice { url: String, duration_secs: Option<u32> },
    Sos(GeoPoint),
    Location(GeoPoint),
    Edit { message_id: MessageId, text: String },
    Delete { message_id: MessageId, privileged: bool },
    View(GroupId),
    Leave,
    Unread,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Command::Say(line.to_string())));
        };
        let mut parts = rest.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let args = parts.next().unwrap_or_default().trim();

        let command = match name {
            "sos" => Command::Sos(parse_point(args)?),
            "loc" => Command::Location(parse_point(args)?),
            "voice" => {
                let mut fields = args.split_whitespace();
                let url = fields.next().context("usage: /voice <url> [seconds]")?;
                let duration_secs = fields
                    .next()
                    .map(str::parse::<u32>)
                    .transpose()
                    .context("voice duration must be whole seconds")?;
                Command::Voice {
                    url: url.to_string(),
                    duration_secs,
                }
            }
            "edit" => {
                let (id, text) = args
                    .split_once(char::is_whitespace)
                    .context("usage: /edit <message id> <text>")?;
                Command::Edit {
                    message_id: MessageId(id.parse().context("invalid message id")?),
                    text: text.trim().to_string(),
                }
            }
            "delete" => {
                let mut fields = args.split_whitespace();
                let id = fields.next().context("usage: /delete <message id> [--admin]")?;
                Command::Delete {
                    message_id: MessageId(id.parse().context("invalid message id")?),
                    privileged: fields.next() == Some("--admin"),
                }
            }
            "view" => Command::View(GroupId(args.parse().context("usage: /view <group id>")?)),
            "leave" => Command::Leave,
            "unread" => Command::Unread,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command /{other}; try /help"),
        };
        Ok(Some(command))
    }
}

fn parse_member(raw: &str) -> Result<(UserId, String)> {
    let (id, name) = raw.split_once(':').context("expected ID:NAME")?;
    let name = name.trim();
    if name.is_empty() {
        bail!("member name is empty");
    }
    Ok((UserId(id.trim().parse().context("invalid member id")?), name.to_string()))
}

fn parse_point(args: &str) -> Result<GeoPoint> {
    let mut fields = args.split(|c: char| c == ',' || c.is_whitespace()).filter(|f| !f.is_empty());
    let lat = fields.next().context("usage: <lat> <lng>")?.parse::<f64>()?;
    let lng = fields.next().context("usage: <lat> <lng>")?.parse::<f64>()?;
    Ok(GeoPoint::new(lat, lng))
}

fn render(group_id: GroupId, messages: &[Message]) -> String {
    let mut out = format!("── group {group_id} ──\n");
    for day in group_by_day(messages, &Local) {
        out.push_str(&format!("  {}\n", day.date.format("%A, %B %-d")));
        for message in &day.messages {
            let time = message.created_at.with_timezone(&Local).format("%H:%M");
            let body = match (&message.body, &message.voice) {
                (Some(body), _) => body.clone(),
                (None, Some(voice)) => format!("[voice {}]", voice.url),
                (None, None) => String::new(),
            };
            let tag = if message.is_sos() {
                "[SOS] "
            } else if message.is_location_update() {
                "[location] "
            } else {
                ""
            };
            let marker = if message.is_optimistic() {
                " (sending)"
            } else if message.edited {
                " (edited)"
            } else {
                ""
            };
            out.push_str(&format!(
                "  [{}] {time} {}: {tag}{body}{marker}\n",
                message.key, message.sender_name
            ));
        }
    }
    out
}

const HELP: &str = "\
text             send a message to the viewed group
/voice URL [S]   send a voice clip
/sos LAT LNG     send an SOS alert with your location
/loc LAT LNG     share your location
/edit ID TEXT    edit one of your messages
/delete ID       delete one of your messages (--admin for any)
/view GROUP      switch the viewed group
/leave           stop viewing the current group
/unread          show unread counts
/quit            exit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_sync_settings();
    if let Some(server_url) = args.server_url.clone() {
        settings.server_url = server_url;
    }
    if args.api_key.is_some() {
        settings.api_key = args.api_key.clone();
    }

    let markers: Arc<dyn ReadMarkerStore> = match &args.markers_db {
        Some(url) => Arc::new(Storage::new(url).await?),
        None => Arc::new(MemoryReadMarkers::new()),
    };
    let sync = if args.offline {
        let store = Arc::new(MemoryMessageStore::new());
        ChatSync::new(store.clone(), store, markers, &settings)
    } else {
        let store = Arc::new(HttpMessageStore::from_settings(&settings)?);
        ChatSync::new(store.clone(), store, markers, &settings)
    };
    let sync = Arc::new(sync);

    let groups: Vec<GroupId> = args.groups.iter().copied().map(GroupId).collect();
    let viewed = args
        .view
        .map(GroupId)
        .or_else(|| groups.first().copied())
        .context("at least one --group is required")?;
    let mut events = sync.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::MessagesUpdated { group_id, messages }) => {
                    print!("{}", render(group_id, &messages));
                }
                Ok(SyncEvent::UnreadChanged {
                    group_id,
                    unread,
                    total,
                }) if unread > 0 => {
                    println!("* {unread} unread in group {group_id} ({total} total)");
                }
                Ok(SyncEvent::SendFailed { error, .. }) => println!("! send failed: {error}"),
                Ok(SyncEvent::SubscriptionFailed { group_id, error }) => {
                    println!("! live updates for group {group_id} interrupted: {error}")
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    sync.set_identity(Some(Identity::new(UserId(args.user_id), args.name.clone())))
        .await;
    sync.set_groups(groups.clone()).await?;
    for group_id in &groups {
        sync.set_members(*group_id, args.members.clone()).await?;
    }
    sync.view_group(viewed).await?;
    println!("type /help for commands");

    let mut composer = Composer::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("! {err:#}");
                continue;
            }
        };
        let quit = command == Command::Quit;
        if let Err(err) = run(&sync, &mut composer, command).await {
            println!("! {err:#}");
        }
        if quit {
            break;
        }
    }

    sync.shutdown().await;
    printer.abort();
    Ok(())
}

async fn run(sync: &ChatSync, composer: &mut Composer, command: Command) -> Result<()> {
    match command {
        Command::Say(text) => {
            composer.set_text(text);
            if let SubmitOutcome::RolledBack { .. } = sync.submit(composer).await? {
                println!("! not sent: {}", composer.take());
            }
        }
        Command::Voice { url, duration_secs } => {
            sync.send(OutgoingMessage::Voice {
                url,
                duration_secs,
                caption: None,
            })
            .await?;
        }
        Command::Sos(point) => {
            sync.send_sos_alert(point).await?;
        }
        Command::Location(point) => {
            sync.share_location(point).await?;
        }
        Command::Edit { message_id, text } => {
            sync.edit_message(message_id, &text).await?;
        }
        Command::Delete {
            message_id,
            privileged,
        } => sync.delete_message(message_id, privileged).await?,
        Command::View(group_id) => sync.view_group(group_id).await?,
        Command::Leave => sync.leave_view().await,
        Command::Unread => println!("{} unread", sync.total_unread()),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            Command::parse("  hi all ").expect("parse"),
            Some(Command::Say("hi all".into()))
        );
        assert_eq!(Command::parse("   ").expect("parse"), None);
    }

    #[test]
    fn parses_location_commands() {
        assert_eq!(
            Command::parse("/sos 38.7223, -9.1393").expect("parse"),
            Some(Command::Sos(GeoPoint::new(38.7223, -9.1393)))
        );
        assert_eq!(
            Command::parse("/loc 1 2").expect("parse"),
            Some(Command::Location(GeoPoint::new(1.0, 2.0)))
        );
        assert!(Command::parse("/sos north").is_err());
    }

    #[test]
    fn parses_edit_and_delete() {
        assert_eq!(
            Command::parse("/edit 12 new plan: 9am").expect("parse"),
            Some(Command::Edit {
                message_id: MessageId(12),
                text: "new plan: 9am".into()
            })
        );
        assert_eq!(
            Command::parse("/delete 12 --admin").expect("parse"),
            Some(Command::Delete {
                message_id: MessageId(12),
                privileged: true
            })
        );
    }

    #[test]
    fn parses_member_roster_entries() {
        assert_eq!(
            parse_member("2:Ben Ortiz").expect("member"),
            (UserId(2), "Ben Ortiz".to_string())
        );
        assert!(parse_member("Ben").is_err());
        assert!(parse_member("x:Ben").is_err());
        assert!(parse_member("3: ").is_err());
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(Command::parse("/dance").is_err());
    }
}
