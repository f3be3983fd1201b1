//! Finished-team SQLite archive.
//!
//! When a team's run ends the Master emits a finished-team snapshot; this
//! module persists it under `saves/teams_database.db` and answers the
//! operator queries the Frontdesk UI runs against history. The game core
//! never reads the archive back into live state.

use std::path::Path;

use rusqlite::{params, Connection};
use tracing::info;

use crate::core::time::Timestamp;
use crate::game::team::{CompletedCube, TeamStatus};

/// Default archive location, relative to the project root.
pub const ARCHIVE_FILE: &str = "saves/teams_database.db";

/// Archive failures. The Master logs these and keeps running; losing an
/// archive row never loses live game state.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The database file could not be opened or created.
    #[error("archive open error: {0}")]
    Open(rusqlite::Error),

    /// A statement failed.
    #[error("archive query error: {0}")]
    Query(#[from] rusqlite::Error),

    /// The parent directory could not be created.
    #[error("archive i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Filters for archive queries; every field is optional and they compose
/// with AND.
#[derive(Debug, Clone, Default)]
pub struct ArchiveQuery {
    /// Exact team name.
    pub name: Option<String>,
    /// Only teams created at or after this time.
    pub created_after: Option<Timestamp>,
    /// Only teams created strictly before this time.
    pub created_before: Option<Timestamp>,
}

/// Write/read surface of the finished-team store.
pub trait TeamArchive: Send + Sync {
    /// Persist one finished team. Idempotent on (name, creation time).
    fn archive(&self, team: &TeamStatus) -> Result<(), ArchiveError>;

    /// Fetch archived teams matching `query`, newest first.
    fn query(&self, query: &ArchiveQuery) -> Result<Vec<TeamStatus>, ArchiveError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    custom_name TEXT NOT NULL DEFAULT '',
    rfid_uid TEXT NOT NULL,
    max_time_sec REAL NOT NULL,
    creation_timestamp REAL NOT NULL,
    start_timestamp REAL,
    end_timestamp REAL,
    use_alarm INTEGER NOT NULL DEFAULT 0,
    UNIQUE(name, creation_timestamp)
);

CREATE TABLE IF NOT EXISTS completed_cubeboxes (
    team_id INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    cube_id INTEGER NOT NULL,
    start_timestamp REAL NOT NULL,
    win_timestamp REAL NOT NULL,
    PRIMARY KEY(team_id, seq)
);

CREATE TABLE IF NOT EXISTS trophies (
    team_id INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    PRIMARY KEY(team_id, name)
);

CREATE INDEX IF NOT EXISTS idx_teams_name ON teams(name);
CREATE INDEX IF NOT EXISTS idx_teams_created ON teams(creation_timestamp);
"#;

/// SQLite-backed [`TeamArchive`].
pub struct SqliteArchive {
    conn: std::sync::Mutex<Connection>,
}

impl SqliteArchive {
    /// Open (or create) the archive at `path`, creating parent
    /// directories and the schema.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(ArchiveError::Open)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "team archive open");
        Ok(Self { conn: std::sync::Mutex::new(conn) })
    }

    /// Open the archive at the default location under `root`.
    pub fn open_from_root(root: &Path) -> Result<Self, ArchiveError> {
        Self::open(&root.join(ARCHIVE_FILE))
    }

    /// In-memory archive for tests.
    pub fn open_in_memory() -> Result<Self, ArchiveError> {
        let conn = Connection::open_in_memory().map_err(ArchiveError::Open)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: std::sync::Mutex::new(conn) })
    }
}

impl TeamArchive for SqliteArchive {
    fn archive(&self, team: &TeamStatus) -> Result<(), ArchiveError> {
        let mut conn = self.conn.lock().expect("archive lock");
        let tx = conn.transaction()?;

        // Re-archiving the same run replaces it wholesale.
        tx.execute(
            "DELETE FROM teams WHERE name = ?1 AND creation_timestamp = ?2",
            params![team.name, team.creation_timestamp],
        )?;
        tx.execute(
            "INSERT INTO teams (name, custom_name, rfid_uid, max_time_sec,
                creation_timestamp, start_timestamp, end_timestamp, use_alarm)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                team.name,
                team.custom_name,
                team.rfid_uid,
                team.max_time_sec,
                team.creation_timestamp,
                team.start_timestamp,
                team.end_timestamp,
                team.use_alarm,
            ],
        )?;
        let team_id = tx.last_insert_rowid();

        for (seq, cube) in team.completed_cubeboxes.iter().enumerate() {
            tx.execute(
                "INSERT INTO completed_cubeboxes
                    (team_id, seq, cube_id, start_timestamp, win_timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![team_id, seq as i64, cube.cube_id, cube.start_timestamp, cube.win_timestamp],
            )?;
        }
        for trophy in &team.trophies_names {
            tx.execute(
                "INSERT INTO trophies (team_id, name) VALUES (?1, ?2)",
                params![team_id, trophy],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn query(&self, query: &ArchiveQuery) -> Result<Vec<TeamStatus>, ArchiveError> {
        let conn = self.conn.lock().expect("archive lock");

        let mut sql = String::from(
            "SELECT id, name, custom_name, rfid_uid, max_time_sec,
                    creation_timestamp, start_timestamp, end_timestamp, use_alarm
             FROM teams WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(name) = &query.name {
            sql.push_str(" AND name = ?");
            args.push(Box::new(name.clone()));
        }
        if let Some(after) = query.created_after {
            sql.push_str(" AND creation_timestamp >= ?");
            args.push(Box::new(after));
        }
        if let Some(before) = query.created_before {
            sql.push_str(" AND creation_timestamp < ?");
            args.push(Box::new(before));
        }
        sql.push_str(" ORDER BY creation_timestamp DESC");

        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(args.iter().map(|a| a.as_ref()));
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                TeamStatus {
                    name: row.get(1)?,
                    custom_name: row.get(2)?,
                    rfid_uid: row.get(3)?,
                    max_time_sec: row.get(4)?,
                    creation_timestamp: row.get(5)?,
                    start_timestamp: row.get(6)?,
                    end_timestamp: row.get(7)?,
                    current_cubebox_id: None,
                    completed_cubeboxes: Vec::new(),
                    trophies_names: Default::default(),
                    use_alarm: row.get(8)?,
                },
            ))
        })?;

        let mut teams = Vec::new();
        for row in rows {
            let (team_id, mut team) = row?;

            let mut cubes = conn.prepare(
                "SELECT cube_id, start_timestamp, win_timestamp
                 FROM completed_cubeboxes WHERE team_id = ?1 ORDER BY seq",
            )?;
            team.completed_cubeboxes = cubes
                .query_map([team_id], |row| {
                    Ok(CompletedCube {
                        cube_id: row.get(0)?,
                        start_timestamp: row.get(1)?,
                        win_timestamp: row.get(2)?,
                    })
                })?
                .collect::<Result<_, _>>()?;

            let mut trophies =
                conn.prepare("SELECT name FROM trophies WHERE team_id = ?1")?;
            team.trophies_names = trophies
                .query_map([team_id], |row| row.get::<_, String>(0))?
                .collect::<Result<_, _>>()?;

            teams.push(team);
        }
        Ok(teams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished_team(name: &str, uid: &str, created: Timestamp) -> TeamStatus {
        let mut team = TeamStatus::new(name, uid, 3600.0, created);
        team.start_timestamp = Some(created + 10.0);
        team.end_timestamp = Some(created + 3610.0);
        team.complete_cube(1, created + 10.0, created + 40.0);
        team.complete_cube(5, created + 50.0, created + 700.0);
        team.trophies_names.insert("grit".into());
        team
    }

    #[test]
    fn test_archive_and_query_roundtrip() {
        let archive = SqliteArchive::open_in_memory().unwrap();
        let team = finished_team("Paris", "1234567890", 1000.0);
        archive.archive(&team).unwrap();

        let rows = archive.query(&ArchiveQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], team);
    }

    #[test]
    fn test_rearchiving_same_run_is_idempotent() {
        let archive = SqliteArchive::open_in_memory().unwrap();
        let mut team = finished_team("Paris", "1234567890", 1000.0);
        archive.archive(&team).unwrap();

        // Late trophy award, same run.
        team.trophies_names.insert("speedrun".into());
        archive.archive(&team).unwrap();

        let rows = archive.query(&ArchiveQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trophies_names.len(), 2);
    }

    #[test]
    fn test_query_filters() {
        let archive = SqliteArchive::open_in_memory().unwrap();
        archive.archive(&finished_team("Paris", "1234567890", 1000.0)).unwrap();
        archive.archive(&finished_team("Lyon", "0987654321", 2000.0)).unwrap();
        archive.archive(&finished_team("Paris", "1234567890", 3000.0)).unwrap();

        let by_name = archive
            .query(&ArchiveQuery { name: Some("Paris".into()), ..Default::default() })
            .unwrap();
        assert_eq!(by_name.len(), 2);
        // Newest first.
        assert_eq!(by_name[0].creation_timestamp, 3000.0);

        let in_window = archive
            .query(&ArchiveQuery {
                created_after: Some(1500.0),
                created_before: Some(2500.0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(in_window.len(), 1);
        assert_eq!(in_window[0].name, "Lyon");
    }

    #[test]
    fn test_file_backed_archive_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ARCHIVE_FILE);

        {
            let archive = SqliteArchive::open(&path).unwrap();
            archive.archive(&finished_team("Oslo", "1111111111", 500.0)).unwrap();
        }
        let archive = SqliteArchive::open(&path).unwrap();
        let rows = archive.query(&ArchiveQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Oslo");
    }
}
