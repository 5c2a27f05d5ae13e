use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use common::config::join_location;
use lazy_static::lazy_static;
use serde::Serialize;

/// The five tables of the song-play star schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StarTable {
    Songplays,
    Users,
    Songs,
    Artists,
    Time,
}

impl StarTable {
    /// Fixed order used for DROP and CREATE; the fact table leads.
    pub const ALL: [StarTable; 5] = [
        StarTable::Songplays,
        StarTable::Users,
        StarTable::Songs,
        StarTable::Artists,
        StarTable::Time,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Songplays => "songplays",
            Self::Users => "users",
            Self::Songs => "songs",
            Self::Artists => "artists",
            Self::Time => "time",
        }
    }

    pub fn key_column(&self) -> &'static str {
        match self {
            Self::Songplays => "songplay_id",
            Self::Users => "user_id",
            Self::Songs => "song_id",
            Self::Artists => "artist_id",
            Self::Time => "start_time",
        }
    }

    /// Hive partition columns, outermost first. They are always the trailing schema columns.
    pub fn partition_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Songs => &["year", "artist_id"],
            Self::Time | Self::Songplays => &["year", "month"],
            Self::Users | Self::Artists => &[],
        }
    }

    pub fn schema(&self) -> &'static Schema {
        match self {
            Self::Songplays => &SONGPLAYS_SCHEMA,
            Self::Users => &USERS_SCHEMA,
            Self::Songs => &SONGS_SCHEMA,
            Self::Artists => &ARTISTS_SCHEMA,
            Self::Time => &TIME_SCHEMA,
        }
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.schema()
            .fields()
            .iter()
            .map(|field| field.name().as_str())
            .collect()
    }
}

impl std::fmt::Display for StarTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn timestamp() -> DataType {
    DataType::Timestamp(TimeUnit::Nanosecond, None)
}

pub fn songplays_schema() -> Schema {
    Schema::new(vec![
        Field::new("songplay_id", DataType::Int64, false),
        Field::new("start_time", timestamp(), false),
        Field::new("user_id", DataType::Int32, true),
        Field::new("level", DataType::Utf8, true),
        Field::new("song_id", DataType::Utf8, true),
        Field::new("artist_id", DataType::Utf8, true),
        Field::new("session_id", DataType::Int64, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("user_agent", DataType::Utf8, true),
        Field::new("year", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
    ])
}

pub fn users_schema() -> Schema {
    Schema::new(vec![
        Field::new("user_id", DataType::Int32, false),
        Field::new("first_name", DataType::Utf8, true),
        Field::new("last_name", DataType::Utf8, true),
        Field::new("gender", DataType::Utf8, true),
        Field::new("level", DataType::Utf8, true),
    ])
}

pub fn songs_schema() -> Schema {
    Schema::new(vec![
        Field::new("song_id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("duration", DataType::Float64, false),
        Field::new("year", DataType::Int32, false),
        Field::new("artist_id", DataType::Utf8, false),
    ])
}

pub fn artists_schema() -> Schema {
    Schema::new(vec![
        Field::new("artist_id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("location", DataType::Utf8, true),
        Field::new("latitude", DataType::Float64, true),
        Field::new("longitude", DataType::Float64, true),
    ])
}

pub fn time_schema() -> Schema {
    Schema::new(vec![
        Field::new("start_time", timestamp(), false),
        Field::new("hour", DataType::Int32, false),
        Field::new("day", DataType::Int32, false),
        Field::new("week", DataType::Int32, false),
        Field::new("weekday", DataType::Int32, false),
        Field::new("year", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
    ])
}

// Lazy-loaded static schemas
lazy_static! {
    static ref SONGPLAYS_SCHEMA: Schema = songplays_schema();
    static ref USERS_SCHEMA: Schema = users_schema();
    static ref SONGS_SCHEMA: Schema = songs_schema();
    static ref ARTISTS_SCHEMA: Schema = artists_schema();
    static ref TIME_SCHEMA: Schema = time_schema();
}

/// Named DROP/CREATE pair for one table.
#[derive(Debug, Clone)]
pub struct TableDdl {
    pub table: StarTable,
    pub location: String,
    pub drop: String,
    pub create: String,
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sql_type(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Int32 => "INT",
        DataType::Int64 => "BIGINT",
        DataType::Float64 => "DOUBLE",
        DataType::Timestamp(_, _) => "TIMESTAMP",
        _ => "VARCHAR",
    }
}

/// Columns are declared nullable; the loaders own the NOT NULL guarantees.
/// Partition names stay bare: the DDL parser keeps quotes on them verbatim.
pub fn create_table_sql(table: StarTable, location: &str) -> String {
    let columns = table
        .schema()
        .fields()
        .iter()
        .map(|field| format!("{} {}", quote_ident(field.name()), sql_type(field.data_type())))
        .collect::<Vec<_>>()
        .join(", ");

    let partitioned_by = match table.partition_columns() {
        [] => String::new(),
        columns => format!(
            " PARTITIONED BY ({})",
            columns.join(", ")
        ),
    };

    format!(
        "CREATE EXTERNAL TABLE {} ({}) STORED AS PARQUET{} LOCATION {}",
        quote_ident(table.as_str()),
        columns,
        partitioned_by,
        quote_literal(location)
    )
}

pub fn drop_table_sql(table: StarTable) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(table.as_str()))
}

pub fn ddl_statements(output_root: &str) -> Vec<TableDdl> {
    StarTable::ALL
        .into_iter()
        .map(|table| {
            let location = join_location(output_root, table.as_str());
            TableDdl {
                table,
                drop: drop_table_sql(table),
                create: create_table_sql(table, &location),
                location,
            }
        })
        .collect()
}
