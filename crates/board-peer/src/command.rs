//! Line commands for driving a session from a terminal.
//!
//! Tiles are referred to by any unique prefix of their id, so `edit 3f2a hi`
//! works once `show` has listed the board.

use anyhow::{Context, Result, bail};
use board_core::change::{ConflictCategory, Resolution};
use board_core::model::LockState;
use board_core::{
    BoardEvent, BoardPersistence, CollabSession, CollaboratorId, CollaboratorStatus,
    PeerTransport, Role, SharedBoard, TileContent, TileId, TilePatch,
};
use std::fmt::Write as _;
use thiserror::Error;

pub const HELP: &str = "\
Commands:
  add <text>               add a tile
  edit <tile> <text>       replace a tile's text
  move <tile> <x> <y>      move a tile
  delete <tile>            delete a tile
  lock <tile>              take (or renew) the edit lock on a tile
  unlock <tile>            release a lock you hold
  cursor <x> <y>           move your cursor
  invite <peer-id> [role]  invite a collaborator (editor by default)
  show                     print the board
  conflicts                print the conflict log
  leave                    leave the board and exit
  help                     print this help";

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command: {0} (try `help`)")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Not a number: {0}")]
    BadNumber(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Add { text: String },
    Edit { tile: String, text: String },
    Move { tile: String, x: f64, y: f64 },
    Delete { tile: String },
    Lock { tile: String },
    Unlock { tile: String },
    Cursor { x: f64, y: f64 },
    Invite { peer: String, role: Option<String> },
    Show,
    Conflicts,
    Leave,
    Help,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        match name {
            "" => Err(CommandError::Empty),
            "add" => {
                if rest.is_empty() {
                    return Err(CommandError::Usage("add <text>"));
                }
                Ok(Command::Add {
                    text: rest.to_string(),
                })
            }
            "edit" => match rest.split_once(char::is_whitespace) {
                Some((tile, text)) if !text.trim().is_empty() => Ok(Command::Edit {
                    tile: tile.to_string(),
                    text: text.trim().to_string(),
                }),
                _ => Err(CommandError::Usage("edit <tile> <text>")),
            },
            "move" => match args.as_slice() {
                [tile, x, y] => Ok(Command::Move {
                    tile: tile.to_string(),
                    x: number(x)?,
                    y: number(y)?,
                }),
                _ => Err(CommandError::Usage("move <tile> <x> <y>")),
            },
            "delete" | "lock" | "unlock" => {
                let [tile] = args.as_slice() else {
                    return Err(CommandError::Usage(match name {
                        "delete" => "delete <tile>",
                        "lock" => "lock <tile>",
                        _ => "unlock <tile>",
                    }));
                };
                let tile = tile.to_string();
                Ok(match name {
                    "delete" => Command::Delete { tile },
                    "lock" => Command::Lock { tile },
                    _ => Command::Unlock { tile },
                })
            }
            "cursor" => match args.as_slice() {
                [x, y] => Ok(Command::Cursor {
                    x: number(x)?,
                    y: number(y)?,
                }),
                _ => Err(CommandError::Usage("cursor <x> <y>")),
            },
            "invite" => match args.as_slice() {
                [peer] => Ok(Command::Invite {
                    peer: peer.to_string(),
                    role: None,
                }),
                [peer, role] => Ok(Command::Invite {
                    peer: peer.to_string(),
                    role: Some(role.to_string()),
                }),
                _ => Err(CommandError::Usage("invite <peer-id> [role]")),
            },
            "show" => Ok(Command::Show),
            "conflicts" => Ok(Command::Conflicts),
            "leave" | "quit" | "exit" => Ok(Command::Leave),
            "help" | "?" => Ok(Command::Help),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn number(s: &str) -> Result<f64, CommandError> {
    s.parse().map_err(|_| CommandError::BadNumber(s.to_string()))
}

/// Find the tile whose id starts with `prefix`.
pub fn resolve_tile(board: &SharedBoard, prefix: &str) -> Result<TileId> {
    let matches: Vec<TileId> = board
        .tiles
        .iter()
        .map(|t| t.id)
        .filter(|id| id.to_string().starts_with(prefix))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No tile matches {prefix}"),
        _ => bail!("{prefix} matches {} tiles, use a longer prefix", matches.len()),
    }
}

/// Run a command against the session. Returns text to print, if any.
pub fn execute<T: PeerTransport, P: BoardPersistence>(
    session: &mut CollabSession<T, P>,
    command: Command,
) -> Result<Option<String>> {
    match command {
        Command::Add { text } => {
            let tile = session.add_tile(TileContent::text(text))?;
            Ok(Some(format!("Added {}", short(&tile.id))))
        }
        Command::Edit { tile: prefix, text } => {
            let id = find_tile(session, &prefix)?;
            let tile = session.edit_tile(id, TilePatch::text(text))?;
            Ok(Some(format!("{} is now at version {}", short(&tile.id), tile.version)))
        }
        Command::Move { tile: prefix, x, y } => {
            let id = find_tile(session, &prefix)?;
            session.edit_tile(id, TilePatch::position(x, y))?;
            Ok(None)
        }
        Command::Delete { tile: prefix } => {
            let id = find_tile(session, &prefix)?;
            session.delete_tile(id)?;
            Ok(Some(format!("Deleted {}", short(&id))))
        }
        Command::Lock { tile: prefix } => {
            let id = find_tile(session, &prefix)?;
            if session.lock_tile(id)? {
                Ok(Some(format!("Locked {}", short(&id))))
            } else if session.renew_lock(id)? {
                Ok(Some(format!("Renewed lock on {}", short(&id))))
            } else {
                Ok(Some(format!("{} is locked by someone else", short(&id))))
            }
        }
        Command::Unlock { tile: prefix } => {
            let id = find_tile(session, &prefix)?;
            if session.unlock_tile(id)? {
                Ok(Some(format!("Unlocked {}", short(&id))))
            } else {
                Ok(Some(format!("You do not hold the lock on {}", short(&id))))
            }
        }
        Command::Cursor { x, y } => {
            session.update_cursor_position(x, y)?;
            Ok(None)
        }
        Command::Invite { peer, role } => {
            let user: CollaboratorId = peer
                .parse()
                .map_err(|e| anyhow::anyhow!("Bad peer id {peer}: {e}"))?;
            let role = match role {
                Some(role) => role.parse::<Role>().map_err(anyhow::Error::msg)?,
                None => Role::Editor,
            };
            session.invite_user(user, role)?;
            Ok(Some(format!("Invited {user} as {role:?}")))
        }
        Command::Show => {
            let board = session.board().context("No board is open")?;
            Ok(Some(render_board(board, session.local_id())))
        }
        Command::Conflicts => {
            let conflicts = session.conflicts();
            if conflicts.is_empty() {
                return Ok(Some("No conflicts".to_string()));
            }
            let mut out = String::new();
            for record in conflicts {
                let category = match record.category {
                    ConflictCategory::StaleVersion => "stale version",
                    ConflictCategory::LockViolation => "lock violation",
                    ConflictCategory::MissingTile => "missing tile",
                };
                let resolution = match record.resolution {
                    Resolution::AcceptedRemote => "accepted",
                    Resolution::Rejected => "rejected",
                };
                let _ = writeln!(
                    out,
                    "{} from {}: {} ({})",
                    record.change_id,
                    record.author,
                    category,
                    resolution
                );
            }
            Ok(Some(out.trim_end().to_string()))
        }
        Command::Leave => {
            session.leave_shared_board()?;
            Ok(Some("Left the board".to_string()))
        }
        Command::Help => Ok(Some(HELP.to_string())),
    }
}

fn find_tile<T: PeerTransport, P: BoardPersistence>(
    session: &CollabSession<T, P>,
    prefix: &str,
) -> Result<TileId> {
    let board = session.board().context("No board is open")?;
    resolve_tile(board, prefix)
}

fn short(id: &TileId) -> String {
    id.to_string().chars().take(8).collect()
}

/// Plain-text view of a board.
pub fn render_board(board: &SharedBoard, local: CollaboratorId) -> String {
    let mut out = String::new();
    let name = if board.name.is_empty() {
        "(waiting for snapshot)"
    } else {
        board.name.as_str()
    };
    let _ = writeln!(out, "{} [{}] version {}", name, board.id, board.version);

    for c in &board.collaborators {
        let status = match c.status {
            CollaboratorStatus::Online => "online",
            CollaboratorStatus::Away => "away",
            CollaboratorStatus::Offline => "offline",
        };
        let me = if c.id == local { " (you)" } else { "" };
        let _ = writeln!(out, "  {} {}{} {:?} {}", c.id, c.display_name, me, c.role, status);
    }

    if board.tiles.is_empty() {
        let _ = writeln!(out, "  no tiles");
    }
    for tile in &board.tiles {
        let lock = match tile.lock {
            LockState::Unlocked => String::new(),
            LockState::LockedBy { holder } if holder == local => " [locked by you]".to_string(),
            LockState::LockedBy { holder } => format!(" [locked by {holder}]"),
        };
        let _ = writeln!(
            out,
            "  {} v{} ({}, {}) {:?}{}",
            short(&tile.id),
            tile.version,
            tile.content.position.x,
            tile.content.position.y,
            tile.content.text,
            lock
        );
    }
    out.trim_end().to_string()
}

/// One-line notice for an event, or `None` for events too chatty to print.
pub fn describe_event(event: &BoardEvent) -> Option<String> {
    let line = match event {
        BoardEvent::TileAdded { tile, by } => {
            format!("{by} added {} {:?}", short(&tile.id), tile.content.text)
        }
        BoardEvent::TileEdited { tile, by } => format!(
            "{by} edited {} {:?} (v{})",
            short(&tile.id),
            tile.content.text,
            tile.version
        ),
        BoardEvent::TileDeleted { tile_id, by } => format!("{by} deleted {}", short(tile_id)),
        BoardEvent::TileLocked { tile_id, holder } => {
            format!("{} locked by {holder}", short(tile_id))
        }
        BoardEvent::TileUnlocked {
            tile_id,
            holder,
            expired,
        } => {
            let how = if *expired { "expired" } else { "released" };
            format!("{}: lock of {holder} {how}", short(tile_id))
        }
        BoardEvent::LockLost { tile_id, winner } => {
            format!("Lost the lock on {} to {winner}", short(tile_id))
        }
        BoardEvent::SettingsChanged { by } => format!("{by} changed board settings"),
        BoardEvent::CollaboratorJoined { collaborator } => format!(
            "{} ({}) joined as {:?}",
            collaborator.display_name, collaborator.id, collaborator.role
        ),
        BoardEvent::CollaboratorLeft { id } => format!("{id} left"),
        BoardEvent::CollaboratorStatusChanged { id, status } => format!("{id} is {status:?}"),
        BoardEvent::PresenceUpdated { .. } => return None,
        BoardEvent::ConflictRecorded { record } => format!(
            "Conflict on change {} from {}: {:?}, {:?}",
            record.change_id, record.author, record.category, record.resolution
        ),
        BoardEvent::ChangeRejected {
            change_id,
            by,
            category,
        } => format!("{by} rejected change {change_id}: {category:?}"),
        BoardEvent::PeerConnected { peer } => format!("Linked to {peer}"),
        BoardEvent::PeerUnreachable { peer, retrying } => {
            if *retrying {
                format!("{peer} unreachable, retrying")
            } else {
                format!("{peer} unreachable")
            }
        }
        BoardEvent::SnapshotAdopted { version } => format!("Synced board at version {version}"),
        BoardEvent::JoinRejected { reason } => format!("Join rejected: {reason}"),
        BoardEvent::Invited { board_id, role, by } => {
            format!("{by} invited you to board {board_id} as {role:?}")
        }
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use board_core::{ManualClock, MemoryNetwork, MemoryPersistence, MemoryTransport, SessionConfig};
    use std::sync::Arc;

    fn session() -> CollabSession<MemoryTransport, MemoryPersistence> {
        let local = CollaboratorId::from(0xa);
        let net = MemoryNetwork::new();
        CollabSession::new(
            local,
            "alice",
            net.transport(local),
            MemoryPersistence::new(),
            SessionConfig::default(),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    // ==================== Parsing ====================

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("add buy milk").unwrap(),
            Command::Add {
                text: "buy milk".into()
            }
        );
        assert_eq!(
            Command::parse("  edit 3f2a  hello there ").unwrap(),
            Command::Edit {
                tile: "3f2a".into(),
                text: "hello there".into()
            }
        );
        assert_eq!(
            Command::parse("move 3f 10 -2.5").unwrap(),
            Command::Move {
                tile: "3f".into(),
                x: 10.0,
                y: -2.5
            }
        );
        assert_eq!(
            Command::parse("invite 00000000000000bb viewer").unwrap(),
            Command::Invite {
                peer: "00000000000000bb".into(),
                role: Some("viewer".into())
            }
        );
        assert_eq!(Command::parse("quit").unwrap(), Command::Leave);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Command::parse("   "), Err(CommandError::Empty));
        assert_eq!(
            Command::parse("frobnicate"),
            Err(CommandError::Unknown("frobnicate".into()))
        );
        assert_eq!(Command::parse("add"), Err(CommandError::Usage("add <text>")));
        assert_eq!(
            Command::parse("edit 3f2a"),
            Err(CommandError::Usage("edit <tile> <text>"))
        );
        assert_eq!(
            Command::parse("cursor 1 up"),
            Err(CommandError::BadNumber("up".into()))
        );
        assert_eq!(
            Command::parse("lock"),
            Err(CommandError::Usage("lock <tile>"))
        );
    }

    // ==================== Execution ====================

    #[test]
    fn test_tile_prefix_resolution() {
        let mut session = session();
        session.create_shared_board("Board", None).unwrap();
        let tile = session.add_tile(TileContent::text("one")).unwrap();
        let board = session.board().unwrap();

        let full = tile.id.to_string();
        assert_eq!(resolve_tile(board, &full[..6]).unwrap(), tile.id);
        assert_eq!(resolve_tile(board, "").unwrap(), tile.id);
        assert!(resolve_tile(board, "zz").is_err());
    }

    #[test]
    fn test_execute_edit_and_lock() {
        let mut session = session();
        session.create_shared_board("Board", None).unwrap();
        execute(&mut session, Command::Add { text: "Hello".into() }).unwrap();
        let prefix = session.board().unwrap().tiles[0].id.to_string()[..8].to_string();

        let out = execute(
            &mut session,
            Command::Edit {
                tile: prefix.clone(),
                text: "Hi".into(),
            },
        )
        .unwrap()
        .unwrap();
        assert!(out.ends_with("version 2"));
        assert_eq!(session.board().unwrap().tiles[0].content.text, "Hi");

        let out = execute(&mut session, Command::Lock { tile: prefix.clone() }).unwrap().unwrap();
        assert!(out.starts_with("Locked"));
        let out = execute(&mut session, Command::Lock { tile: prefix }).unwrap().unwrap();
        assert!(out.starts_with("Renewed lock"));
        let shown = execute(&mut session, Command::Show).unwrap().unwrap();
        assert!(shown.contains("[locked by you]"));
        assert!(shown.contains("alice (you)"));
    }

    #[test]
    fn test_execute_without_board_fails() {
        let mut session = session();
        assert!(execute(&mut session, Command::Add { text: "x".into() }).is_err());
        assert!(execute(&mut session, Command::Show).is_err());
        assert_eq!(
            execute(&mut session, Command::Help).unwrap().unwrap(),
            HELP
        );
    }

    #[test]
    fn test_execute_leave_deactivates() {
        let mut session = session();
        session.create_shared_board("Board", None).unwrap();
        execute(&mut session, Command::Leave).unwrap();
        assert!(!session.is_active());
    }

    #[test]
    fn test_describe_events() {
        let peer = CollaboratorId::from(0xb);
        assert_eq!(
            describe_event(&BoardEvent::SnapshotAdopted { version: 3 }).unwrap(),
            "Synced board at version 3"
        );
        assert_eq!(
            describe_event(&BoardEvent::PeerUnreachable {
                peer,
                retrying: true
            })
            .unwrap(),
            format!("{peer} unreachable, retrying")
        );
        assert!(
            describe_event(&BoardEvent::PresenceUpdated {
                id: peer,
                presence: Default::default(),
            })
            .is_none()
        );
    }

    #[test]
    fn test_render_waiting_board() {
        let local = CollaboratorId::from(0xa);
        let board = SharedBoard::placeholder(board_core::BoardId::new(), local, 0);
        let out = render_board(&board, local);
        assert!(out.starts_with("(waiting for snapshot)"));
        assert!(out.ends_with("no tiles"));
    }
}
