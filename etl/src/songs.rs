//! Song Loader: builds the `songs` and `artists` dimensions from song metadata.

use crate::extract::{ExtractStats, extract_json_lines, stage_records};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use common::Result;
use datafusion::dataframe::DataFrame;
use lakehouse::{LakehouseProcessor, StarTable, TableWriteReport, TableWriter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const STAGING_SONGS: &str = "staging_songs";
/// Views over the deduplicated dimensions, consumed by the songplays join.
pub const SONGS_VIEW: &str = "dim_songs";
pub const ARTISTS_VIEW: &str = "dim_artists";

#[derive(Debug, Deserialize)]
struct RawSong {
    song_id: Option<String>,
    title: Option<String>,
    artist_id: Option<String>,
    artist_name: Option<String>,
    year: Option<i32>,
    duration: Option<f64>,
    artist_location: Option<String>,
    artist_latitude: Option<f64>,
    artist_longitude: Option<f64>,
}

/// One staged song-metadata record.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SongRecord {
    pub seq: i64,
    pub song_id: String,
    pub title: String,
    pub artist_id: String,
    pub artist_name: String,
    pub year: i32,
    pub duration: f64,
    pub artist_location: Option<String>,
    pub artist_latitude: Option<f64>,
    pub artist_longitude: Option<f64>,
}

impl SongRecord {
    /// Parses one JSON line; `None` when it is not an object or a required field is absent.
    pub fn parse(line: &str, seq: i64) -> Option<Self> {
        let raw: RawSong = serde_json::from_str(line).ok()?;
        Some(Self {
            seq,
            song_id: raw.song_id?,
            title: raw.title?,
            artist_id: raw.artist_id?,
            artist_name: raw.artist_name?,
            year: raw.year?,
            duration: raw.duration?,
            artist_location: raw.artist_location,
            artist_latitude: raw.artist_latitude,
            artist_longitude: raw.artist_longitude,
        })
    }

    pub fn staging_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("seq", DataType::Int64, false),
            Field::new("song_id", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("artist_id", DataType::Utf8, false),
            Field::new("artist_name", DataType::Utf8, false),
            Field::new("year", DataType::Int32, false),
            Field::new("duration", DataType::Float64, false),
            Field::new("artist_location", DataType::Utf8, true),
            Field::new("artist_latitude", DataType::Float64, true),
            Field::new("artist_longitude", DataType::Float64, true),
        ]))
    }
}

const SONGS_SQL: &str = r#"
SELECT song_id, title, duration, "year", artist_id
FROM (
    SELECT song_id, title, duration, "year", artist_id,
           ROW_NUMBER() OVER (PARTITION BY song_id ORDER BY seq DESC) AS rn
    FROM staging_songs
) ranked
WHERE rn = 1
"#;

const ARTISTS_SQL: &str = r#"
SELECT artist_id, artist_name AS name, artist_location AS "location",
       artist_latitude AS latitude, artist_longitude AS longitude
FROM (
    SELECT artist_id, artist_name, artist_location, artist_latitude, artist_longitude,
           ROW_NUMBER() OVER (PARTITION BY artist_id ORDER BY seq DESC) AS rn
    FROM staging_songs
) ranked
WHERE rn = 1
"#;

#[derive(Debug, Clone, Serialize)]
pub struct SongLoadReport {
    pub extract: ExtractStats,
    pub tables: Vec<TableWriteReport>,
}

pub struct SongLoader<'a> {
    processor: &'a LakehouseProcessor,
    writer: &'a TableWriter<'a>,
    location: String,
}

impl<'a> SongLoader<'a> {
    pub fn new(processor: &'a LakehouseProcessor, writer: &'a TableWriter<'a>, location: &str) -> Self {
        Self {
            processor,
            writer,
            location: location.to_string(),
        }
    }

    /// Extracts the song files into the `staging_songs` table.
    pub async fn stage(&self) -> Result<ExtractStats> {
        let (records, stats) =
            extract_json_lines(self.processor, &self.location, SongRecord::parse).await?;
        stage_records(self.processor, STAGING_SONGS, SongRecord::staging_schema(), &records)?;
        Ok(stats)
    }

    /// One row per `song_id`; the later record wins.
    pub async fn derive_songs(&self) -> Result<DataFrame> {
        self.processor.execute_sql(SONGS_SQL).await
    }

    /// One row per `artist_id`; the later record wins.
    pub async fn derive_artists(&self) -> Result<DataFrame> {
        self.processor.execute_sql(ARTISTS_SQL).await
    }

    pub async fn load(&self) -> Result<SongLoadReport> {
        info!(location = %self.location, "Loading song data");
        let extract = self.stage().await?;

        let songs = self.derive_songs().await?;
        self.processor.register_view(SONGS_VIEW, songs.clone())?;
        let songs_report = self.writer.write_table(StarTable::Songs, songs).await?;

        let artists = self.derive_artists().await?;
        self.processor.register_view(ARTISTS_VIEW, artists.clone())?;
        let artists_report = self.writer.write_table(StarTable::Artists, artists).await?;

        info!(
            songs = songs_report.row_count,
            artists = artists_report.row_count,
            "Song data loaded"
        );

        Ok(SongLoadReport {
            extract,
            tables: vec![songs_report, artists_report],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{collect_json, local_processor, song_line, write_lines};

    #[test]
    fn test_parse_requires_identity_fields() {
        let line = song_line("S1", "Hello", "A1", "Adele", 2015, 295.0);
        let record = SongRecord::parse(&line, 4).unwrap();
        assert_eq!(record.seq, 4);
        assert_eq!(record.artist_name, "Adele");
        assert_eq!(record.artist_latitude, None);

        assert!(SongRecord::parse(r#"{"song_id": "S1", "title": "Hello"}"#, 1).is_none());
        assert!(SongRecord::parse(r#"["S1"]"#, 1).is_none());
        assert!(
            SongRecord::parse(
                r#"{"song_id": "S1", "title": "Hello", "artist_id": "A1", "artist_name": "Adele", "year": "2015", "duration": 295.0}"#,
                1
            )
            .is_none()
        );
    }

    #[tokio::test]
    async fn test_later_record_wins_per_key() {
        let dir = tempfile::tempdir().unwrap();
        write_lines(
            dir.path(),
            "song_data/A/a.json",
            &[&song_line("S1", "Old Title", "A1", "Old Name", 2000, 100.0)],
        );
        write_lines(
            dir.path(),
            "song_data/B/b.json",
            &[
                &song_line("S1", "New Title", "A1", "New Name", 2001, 100.0),
                &song_line("S2", "Other", "A1", "New Name", 2001, 50.0),
            ],
        );

        let processor = local_processor();
        let writer = TableWriter::new(&processor, "/unused", "run").with_write_output(false);
        let loader = SongLoader::new(
            &processor,
            &writer,
            &format!("{}/song_data/", dir.path().display()),
        );
        let stats = loader.stage().await.unwrap();
        assert_eq!(stats.records, 3);

        let songs = collect_json(loader.derive_songs().await.unwrap(), "song_id").await;
        assert_eq!(songs.len(), 2);
        assert_eq!(songs[0]["title"], "New Title");
        assert_eq!(songs[0]["year"], 2001);

        let artists = collect_json(loader.derive_artists().await.unwrap(), "artist_id").await;
        assert_eq!(artists.len(), 1);
        assert_eq!(artists[0]["name"], "New Name");
        assert_eq!(artists[0]["location"], serde_json::Value::Null);
    }
}
