use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::{
    domain::{GroupId, MessageKind, UserId},
    protocol::NewMessageRow,
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/wayfarer.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inserts a text message directly, bypassing the server's change feed.
    Post {
        group_id: i64,
        sender_id: i64,
        sender_name: String,
        text: String,
    },
    List {
        group_id: i64,
    },
    Purge {
        group_id: i64,
    },
    /// Prints the read markers stored for a user.
    Markers {
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Post {
            group_id,
            sender_id,
            sender_name,
            text,
        } => {
            if text.trim().is_empty() {
                bail!("message text is empty");
            }
            let row = storage
                .insert_message(&NewMessageRow {
                    group_id: GroupId(group_id),
                    sender_id: UserId(sender_id),
                    sender_name,
                    message_type: MessageKind::Text,
                    text: Some(text),
                    voice_url: None,
                    voice_duration: None,
                    mentions: Vec::new(),
                    sos_location: None,
                    sos_timestamp: None,
                })
                .await?;
            println!("created message_id={} at {}", row.id, row.created_at);
        }
        Command::List { group_id } => {
            for row in storage.list_group_messages(GroupId(group_id)).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}{}",
                    row.id,
                    row.created_at.to_rfc3339(),
                    row.message_type.as_str(),
                    row.sender_name,
                    row.text.unwrap_or_default().replace('\n', " "),
                    if row.edited { " (edited)" } else { "" }
                );
            }
        }
        Command::Purge { group_id } => {
            let removed = storage.purge_group(GroupId(group_id)).await?;
            println!("removed {removed} messages from group_id={group_id}");
        }
        Command::Markers { user_id } => {
            let mut markers: Vec<_> = storage
                .load_read_markers(UserId(user_id))
                .await?
                .into_iter()
                .collect();
            markers.sort_by_key(|(group_id, _)| *group_id);
            for (group_id, at) in markers {
                println!("group_id={group_id}\tlast_read_at={}", at.to_rfc3339());
            }
        }
    }

    Ok(())
}
