//! Log Loader: builds `time`, `users` and the `songplays` fact from activity logs.

use crate::extract::{ExtractStats, extract_json_lines, stage_records};
use crate::songs::{ARTISTS_VIEW, SONGS_VIEW};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use common::{Error, Result};
use datafusion::dataframe::DataFrame;
use lakehouse::{LakehouseProcessor, StarTable, TableWriteReport, TableWriter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const STAGING_EVENTS: &str = "staging_events";
pub const NEXT_SONG_VIEW: &str = "next_song_events";
pub const NEXT_SONG_PAGE: &str = "NextSong";

/// `userId` shows up as a number, a numeric string, or `""` for logged-out users.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserId {
    Number(i64),
    Text(String),
}

impl UserId {
    fn into_user_id(self) -> Option<i32> {
        match self {
            UserId::Number(id) => i32::try_from(id).ok(),
            UserId::Text(text) => text.trim().parse().ok(),
        }
    }
}

/// `start_time` is stored with nanosecond precision, so the epoch-millisecond
/// `ts` must survive scaling into `i64` nanoseconds.
fn representable_as_nanos(ts: i64) -> bool {
    ts.checked_mul(1_000_000).is_some()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    page: Option<String>,
    ts: Option<i64>,
    user_id: Option<UserId>,
    first_name: Option<String>,
    last_name: Option<String>,
    gender: Option<String>,
    level: Option<String>,
    session_id: Option<i64>,
    item_in_session: Option<i64>,
    location: Option<String>,
    user_agent: Option<String>,
    song: Option<String>,
    artist: Option<String>,
    length: Option<f64>,
}

/// One staged activity-log event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventRecord {
    pub seq: i64,
    pub page: String,
    pub ts: i64,
    pub user_id: Option<i32>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub level: Option<String>,
    pub session_id: Option<i64>,
    pub item_in_session: Option<i64>,
    pub location: Option<String>,
    pub user_agent: Option<String>,
    pub song: Option<String>,
    pub artist: Option<String>,
    pub length: Option<f64>,
}

impl EventRecord {
    /// Parses one JSON line; `None` when it is not an object, lacks `page` or `ts`,
    /// or carries a `ts` outside the nanosecond timestamp range.
    pub fn parse(line: &str, seq: i64) -> Option<Self> {
        let raw: RawEvent = serde_json::from_str(line).ok()?;
        Some(Self {
            seq,
            page: raw.page?,
            ts: raw.ts.filter(|ts| representable_as_nanos(*ts))?,
            user_id: raw.user_id.and_then(UserId::into_user_id),
            first_name: raw.first_name,
            last_name: raw.last_name,
            gender: raw.gender,
            level: raw.level,
            session_id: raw.session_id,
            item_in_session: raw.item_in_session,
            location: raw.location,
            user_agent: raw.user_agent,
            song: raw.song,
            artist: raw.artist,
            length: raw.length,
        })
    }

    pub fn staging_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("seq", DataType::Int64, false),
            Field::new("page", DataType::Utf8, false),
            Field::new("ts", DataType::Int64, false),
            Field::new("user_id", DataType::Int32, true),
            Field::new("first_name", DataType::Utf8, true),
            Field::new("last_name", DataType::Utf8, true),
            Field::new("gender", DataType::Utf8, true),
            Field::new("level", DataType::Utf8, true),
            Field::new("session_id", DataType::Int64, true),
            Field::new("item_in_session", DataType::Int64, true),
            Field::new("location", DataType::Utf8, true),
            Field::new("user_agent", DataType::Utf8, true),
            Field::new("song", DataType::Utf8, true),
            Field::new("artist", DataType::Utf8, true),
            Field::new("length", DataType::Float64, true),
        ]))
    }
}

// Weekday counts from 1 = Sunday.
const TIME_SQL: &str = r#"
SELECT start_time,
       CAST(date_part('hour', start_time) AS INT) AS "hour",
       CAST(date_part('day', start_time) AS INT) AS "day",
       CAST(date_part('week', start_time) AS INT) AS "week",
       CAST(date_part('dow', start_time) + 1 AS INT) AS "weekday",
       CAST(date_part('year', start_time) AS INT) AS "year",
       CAST(date_part('month', start_time) AS INT) AS "month"
FROM (
    SELECT DISTINCT CAST(to_timestamp_millis(ts) AS TIMESTAMP) AS start_time
    FROM next_song_events
) plays
"#;

const USERS_SQL: &str = r#"
SELECT user_id, first_name, last_name, gender, "level"
FROM (
    SELECT user_id, first_name, last_name, gender, "level",
           ROW_NUMBER() OVER (PARTITION BY user_id ORDER BY ts DESC, seq DESC) AS rn
    FROM next_song_events
    WHERE user_id IS NOT NULL
) ranked
WHERE rn = 1
"#;

const SONGPLAYS_SQL: &str = r#"
WITH song_catalog AS (
    SELECT title, name, duration, song_id, artist_id
    FROM (
        SELECT s.title, a.name, s.duration, s.song_id, s.artist_id,
               ROW_NUMBER() OVER (
                   PARTITION BY s.title, a.name, s.duration
                   ORDER BY s.song_id, s.artist_id
               ) AS rn
        FROM dim_songs s
        JOIN dim_artists a ON s.artist_id = a.artist_id
    ) ranked
    WHERE rn = 1
),
plays AS (
    SELECT e.seq, e.ts, e.user_id, e."level", e.session_id, e.item_in_session,
           e."location", e.user_agent, e.song, e.artist, e.length,
           CAST(to_timestamp_millis(e.ts) AS TIMESTAMP) AS start_time
    FROM next_song_events e
)
SELECT CAST(ROW_NUMBER() OVER (
           ORDER BY p.ts, p.session_id, p.item_in_session, p.seq
       ) AS BIGINT) AS songplay_id,
       p.start_time,
       p.user_id,
       p."level",
       c.song_id,
       c.artist_id,
       p.session_id,
       p."location",
       p.user_agent,
       CAST(date_part('year', p.start_time) AS INT) AS "year",
       CAST(date_part('month', p.start_time) AS INT) AS "month"
FROM plays p
LEFT JOIN song_catalog c
    ON p.song = c.title AND p.artist = c.name AND p.length = c.duration
"#;

#[derive(Debug, Clone, Serialize)]
pub struct LogLoadReport {
    pub extract: ExtractStats,
    pub next_song_events: usize,
    pub tables: Vec<TableWriteReport>,
}

pub struct LogLoader<'a> {
    processor: &'a LakehouseProcessor,
    writer: &'a TableWriter<'a>,
    location: String,
}

impl<'a> LogLoader<'a> {
    pub fn new(processor: &'a LakehouseProcessor, writer: &'a TableWriter<'a>, location: &str) -> Self {
        Self {
            processor,
            writer,
            location: location.to_string(),
        }
    }

    /// Extracts the log files into `staging_events` and exposes the
    /// song-play subset as the `next_song_events` view.
    pub async fn stage(&self) -> Result<ExtractStats> {
        let (records, stats) =
            extract_json_lines(self.processor, &self.location, EventRecord::parse).await?;
        stage_records(self.processor, STAGING_EVENTS, EventRecord::staging_schema(), &records)?;

        let next_song = self
            .processor
            .execute_sql(&format!(
                "SELECT * FROM {} WHERE page = '{}'",
                STAGING_EVENTS, NEXT_SONG_PAGE
            ))
            .await?;
        self.processor.register_view(NEXT_SONG_VIEW, next_song)?;
        Ok(stats)
    }

    pub async fn derive_time(&self) -> Result<DataFrame> {
        self.processor.execute_sql(TIME_SQL).await
    }

    /// Latest attributes per user, ordered by event time then arrival.
    pub async fn derive_users(&self) -> Result<DataFrame> {
        self.processor.execute_sql(USERS_SQL).await
    }

    /// Requires the song and artist views registered by the song loader.
    pub async fn derive_songplays(&self) -> Result<DataFrame> {
        let ctx = self.processor.session_context();
        for view in [SONGS_VIEW, ARTISTS_VIEW] {
            if !ctx.table_exist(view)? {
                return Err(Error::InvalidInput(format!(
                    "'{}' is not registered; load song data before deriving songplays",
                    view
                )));
            }
        }
        self.processor.execute_sql(SONGPLAYS_SQL).await
    }

    pub async fn load(&self) -> Result<LogLoadReport> {
        info!(location = %self.location, "Loading log data");
        let extract = self.stage().await?;
        let next_song_events = self.processor.table_row_count(NEXT_SONG_VIEW).await?;
        info!(
            events = extract.records,
            next_song_events, "Filtered song-play events"
        );

        let time = self.writer.write_table(StarTable::Time, self.derive_time().await?).await?;
        let users = self.writer.write_table(StarTable::Users, self.derive_users().await?).await?;
        let songplays = self
            .writer
            .write_table(StarTable::Songplays, self.derive_songplays().await?)
            .await?;

        info!(
            time = time.row_count,
            users = users.row_count,
            songplays = songplays.row_count,
            "Log data loaded"
        );

        Ok(LogLoadReport {
            extract,
            next_song_events,
            tables: vec![time, users, songplays],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::songs::SongLoader;
    use crate::test_support::{collect_json, event_line, local_processor, song_line, write_lines};
    use serde_json::Value;

    #[test]
    fn test_parse_accepts_string_and_numeric_user_ids() {
        let numeric = r#"{"page": "NextSong", "ts": 1, "userId": 26}"#;
        let text = r#"{"page": "NextSong", "ts": 1, "userId": "26"}"#;
        let empty = r#"{"page": "Home", "ts": 1, "userId": ""}"#;
        assert_eq!(EventRecord::parse(numeric, 1).unwrap().user_id, Some(26));
        assert_eq!(EventRecord::parse(text, 1).unwrap().user_id, Some(26));
        assert_eq!(EventRecord::parse(empty, 1).unwrap().user_id, None);

        assert!(EventRecord::parse(r#"{"userId": "26", "ts": 1}"#, 1).is_none());
        assert!(EventRecord::parse(r#"{"page": "NextSong", "ts": null}"#, 1).is_none());
    }

    #[test]
    fn test_parse_rejects_ts_beyond_timestamp_range() {
        let line = |ts: i64| format!(r#"{{"page": "NextSong", "ts": {}, "userId": "26"}}"#, ts);
        assert_eq!(EventRecord::parse(&line(1541290555796), 1).unwrap().ts, 1541290555796);
        assert!(EventRecord::parse(&line(10_000_000_000_000_000), 1).is_none());
        assert!(EventRecord::parse(&line(i64::MIN), 1).is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_event_does_not_abort_time_derivation() {
        let (dir, processor) = staged(&[
            &event_line("NextSong", "7", 1541290555796, 1, 0, None),
            &event_line("NextSong", "7", 10_000_000_000_000_000, 1, 1, None),
        ])
        .await;
        let writer = TableWriter::new(&processor, "/unused", "run").with_write_output(false);
        let logs = LogLoader::new(&processor, &writer, &format!("{}/log_data/", dir.path().display()));
        let stats = logs.stage().await.unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.malformed, 1);

        let report = writer
            .write_table(StarTable::Time, logs.derive_time().await.unwrap())
            .await
            .unwrap();
        assert_eq!(report.row_count, 1);
    }

    async fn staged(lines: &[&str]) -> (tempfile::TempDir, LakehouseProcessor) {
        let dir = tempfile::tempdir().unwrap();
        write_lines(dir.path(), "log_data/2018/11/events.json", lines);
        write_lines(
            dir.path(),
            "song_data/A/s.json",
            &[&song_line("S1", "Hello", "A1", "Adele", 2015, 295.0)],
        );
        (dir, local_processor())
    }

    #[tokio::test]
    async fn test_time_row_is_pure_function_of_ts() {
        let home = event_line("Home", "7", 1541290555000, 1, 0, None);
        let play = event_line("NextSong", "7", 1541290555796, 1, 1, Some(("Hello", "Adele", 295.0)));
        let (dir, processor) = staged(&[&home, &play, &play]).await;
        let writer = TableWriter::new(&processor, "/unused", "run").with_write_output(false);
        let logs = LogLoader::new(&processor, &writer, &format!("{}/log_data/", dir.path().display()));
        logs.stage().await.unwrap();

        let time = collect_json(logs.derive_time().await.unwrap(), "start_time").await;
        assert_eq!(time.len(), 1);
        assert_eq!(time[0]["start_time"], "2018-11-04T00:15:55.796Z");
        assert_eq!(time[0]["hour"], 0);
        assert_eq!(time[0]["day"], 4);
        assert_eq!(time[0]["week"], 44);
        assert_eq!(time[0]["weekday"], 1);
        assert_eq!(time[0]["year"], 2018);
        assert_eq!(time[0]["month"], 11);
    }

    #[tokio::test]
    async fn test_users_last_write_wins_and_skip_anonymous() {
        let (dir, processor) = staged(&[
            &event_line("NextSong", "7", 2000, 1, 1, None).replace("\"free\"", "\"paid\""),
            &event_line("NextSong", "7", 1000, 1, 0, None),
            &event_line("NextSong", "", 3000, 2, 0, None),
            &event_line("Home", "8", 4000, 3, 0, None),
        ])
        .await;
        let writer = TableWriter::new(&processor, "/unused", "run").with_write_output(false);
        let logs = LogLoader::new(&processor, &writer, &format!("{}/log_data/", dir.path().display()));
        logs.stage().await.unwrap();

        let users = collect_json(logs.derive_users().await.unwrap(), "user_id").await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["user_id"], 7);
        assert_eq!(users[0]["level"], "paid");
    }

    #[tokio::test]
    async fn test_songplays_keep_every_event_and_match_exactly() {
        let (dir, processor) = staged(&[
            &event_line("NextSong", "7", 1000, 1, 0, Some(("Hello", "Adele", 295.0))),
            &event_line("NextSong", "7", 2000, 1, 1, Some(("Hello", "Adele", 295.5))),
            &event_line("NextSong", "", 3000, 2, 0, Some(("Unknown", "Nobody", 10.0))),
            &event_line("Logout", "7", 4000, 1, 2, None),
        ])
        .await;
        let writer = TableWriter::new(&processor, "/unused", "run").with_write_output(false);
        let songs = SongLoader::new(&processor, &writer, &format!("{}/song_data/", dir.path().display()));
        let logs = LogLoader::new(&processor, &writer, &format!("{}/log_data/", dir.path().display()));

        songs.load().await.unwrap();
        logs.stage().await.unwrap();

        let plays = collect_json(logs.derive_songplays().await.unwrap(), "songplay_id").await;
        assert_eq!(plays.len(), 3);
        let ids: Vec<_> = plays.iter().map(|p| p["songplay_id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        assert_eq!(plays[0]["song_id"], "S1");
        assert_eq!(plays[0]["artist_id"], "A1");
        assert_eq!(plays[1]["song_id"], Value::Null);
        assert_eq!(plays[2]["artist_id"], Value::Null);
        assert_eq!(plays[2]["user_id"], Value::Null);
        assert_eq!(plays[0]["year"], 1970);
        assert_eq!(plays[0]["month"], 1);
    }

    #[tokio::test]
    async fn test_songplays_need_song_dimensions() {
        let (dir, processor) = staged(&[]).await;
        let writer = TableWriter::new(&processor, "/unused", "run").with_write_output(false);
        let logs = LogLoader::new(&processor, &writer, &format!("{}/log_data/", dir.path().display()));
        logs.stage().await.unwrap();
        assert!(matches!(
            logs.derive_songplays().await,
            Err(Error::InvalidInput(_))
        ));
    }
}
