pub mod config;
pub mod db;
pub mod error;
pub mod loader;

pub use crate::config::AppConfig;
pub use crate::error::LoadError;
pub use crate::loader::{LoadOptions, LoadReport, Loader};

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Install the global logger. `debug` lowers the default filter so per-worker
/// progress lines show up; `RUST_LOG` still wins when set.
pub fn init_logger(debug: bool) {
    LOGGER.call_once(|| {
        let default_filter = if debug {
            "debug,sqlx=warn"
        } else {
            "info,sqlx=warn"
        };
        env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();
    });
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::loader::sink::{InsertError, RecordSink};
    use crate::loader::source::{
        Header, Record, RecordSource, RecordStream, SourceError, SourceOptions,
    };
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io::{self, Cursor, Read};
    use std::time::Duration;

    pub use database::{TestDatabase, TestDatabaseError};

    /// Split in-memory CSV text into its header and record stream.
    pub fn stream_from(text: &str) -> (Header, RecordStream<Cursor<Vec<u8>>>) {
        try_stream_from(text).expect("test input has a header")
    }

    pub fn try_stream_from(
        text: &str,
    ) -> Result<(Header, RecordStream<Cursor<Vec<u8>>>), SourceError> {
        RecordSource::new(Cursor::new(text.as_bytes().to_vec()), SourceOptions::default())
            .read_header()
    }

    /// Reader that serves `data` and then fails every read.
    pub struct FailingReader {
        data: Cursor<Vec<u8>>,
    }

    impl FailingReader {
        pub fn new(data: impl Into<Vec<u8>>) -> Self {
            Self {
                data: Cursor::new(data.into()),
            }
        }
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(io::Error::new(io::ErrorKind::BrokenPipe, "source went away")),
                n => Ok(n),
            }
        }
    }

    /// Sink that accepts everything and remembers what it saw, in order.
    #[derive(Default)]
    pub struct RecordingSink {
        records: Mutex<Vec<Record>>,
        delay: Option<Duration>,
    }

    impl RecordingSink {
        /// Sleep before accepting each record, so workers overlap.
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                records: Mutex::new(Vec::new()),
                delay: Some(delay),
            }
        }

        pub fn records(&self) -> Vec<Record> {
            self.records.lock().clone()
        }

        /// Source line numbers in insertion order.
        pub fn lines(&self) -> Vec<u64> {
            self.records.lock().iter().map(|record| record.line).collect()
        }

        pub fn lines_sorted(&self) -> Vec<u64> {
            let mut lines = self.lines();
            lines.sort_unstable();
            lines
        }

        pub fn len(&self) -> usize {
            self.records.lock().len()
        }

        pub fn is_empty(&self) -> bool {
            self.records.lock().is_empty()
        }

        fn push(&self, record: &Record) {
            self.records.lock().push(record.clone());
        }
    }

    impl RecordSink for RecordingSink {
        async fn insert(&self, record: &Record) -> Result<(), InsertError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.push(record);
            Ok(())
        }
    }

    /// Sink that fails chosen records a set number of times before accepting
    /// them.
    #[derive(Default)]
    pub struct FlakySink {
        failures: HashMap<u64, u32>,
        permanent: bool,
        panics: bool,
        unreachable: bool,
        attempts: Mutex<HashMap<u64, u32>>,
        inserted: RecordingSink,
    }

    impl FlakySink {
        /// Fail `line` with a transient error `failures` times.
        pub fn failing_line(line: u64, failures: u32) -> Self {
            Self {
                failures: HashMap::from([(line, failures)]),
                ..Self::default()
            }
        }

        /// Fail `line` with a permanent error, always.
        pub fn rejecting_line(line: u64) -> Self {
            Self {
                failures: HashMap::from([(line, u32::MAX)]),
                permanent: true,
                ..Self::default()
            }
        }

        /// Panic inside the insert for `line`, `failures` times.
        pub fn panicking_line(line: u64, failures: u32) -> Self {
            Self {
                failures: HashMap::from([(line, failures)]),
                panics: true,
                ..Self::default()
            }
        }

        /// Every insert fails to obtain a connection.
        pub fn unreachable() -> Self {
            Self {
                unreachable: true,
                ..Self::default()
            }
        }

        pub fn attempts_for(&self, line: u64) -> u32 {
            self.attempts.lock().get(&line).copied().unwrap_or(0)
        }

        pub fn inserted(&self) -> &RecordingSink {
            &self.inserted
        }
    }

    impl RecordSink for FlakySink {
        async fn insert(&self, record: &Record) -> Result<(), InsertError> {
            if self.unreachable {
                return Err(InsertError::Acquire(sqlx::Error::PoolTimedOut));
            }

            let attempt = {
                let mut attempts = self.attempts.lock();
                let count = attempts.entry(record.line).or_insert(0);
                *count += 1;
                *count
            };

            let allowed_failures = self.failures.get(&record.line).copied().unwrap_or(0);
            if attempt <= allowed_failures {
                if self.panics {
                    panic!("driver fault on record {} attempt {}", record.line, attempt);
                }
                let reason = format!("record {} attempt {}", record.line, attempt);
                return Err(if self.permanent {
                    InsertError::Permanent(reason)
                } else {
                    InsertError::Transient(reason)
                });
            }

            self.inserted.push(record);
            Ok(())
        }
    }

    pub mod database {
        use crate::config::AppConfig;
        use log::LevelFilter;
        use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use sqlx::{ConnectOptions, PgPool};
        use testcontainers::ImageExt;
        use testcontainers_modules::postgres::Postgres;
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use uuid::Uuid;

        const POSTGRES_TAG: &str = "16-alpine";

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Disposable PostgreSQL database for integration tests.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            host: String,
            port: u16,
            database_name: String,
            _container: ContainerAsync<Postgres>,
        }

        impl TestDatabase {
            /// Launch a Postgres container and create a uniquely named database in it.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = Postgres::default().with_tag(POSTGRES_TAG).start().await?;
                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;

                let admin_options = PgConnectOptions::new()
                    .host(&host)
                    .port(port)
                    .username("postgres")
                    .password("postgres")
                    .database("postgres")
                    .log_statements(LevelFilter::Off);

                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await?;

                let database_name = format!("bulkload_{}", Uuid::new_v4().simple());
                sqlx::query(&format!("CREATE DATABASE \"{}\"", database_name))
                    .execute(&admin_pool)
                    .await?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(admin_options.database(&database_name))
                    .await?;

                Ok(Self {
                    pool: Some(pool),
                    host,
                    port,
                    database_name,
                    _container: container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            /// Job configuration pointing at this database.
            pub fn app_config(&self, table: &str, workers: usize) -> AppConfig {
                let json = serde_json::json!({
                    "db_user": "postgres",
                    "db_pass": "postgres",
                    "db_address": self.host,
                    "db_port": self.port,
                    "db_name": self.database_name,
                    "db_table": table,
                    "db_max_idle_conns": 2,
                    "db_max_open_conns": 4,
                    "total_worker": workers,
                });
                serde_json::from_value(json).expect("valid test config")
            }

            /// Close the pool; the container is removed when `self` drops.
            pub async fn close(mut self) {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }
            }
        }
    }
}
