use rust_embed::RustEmbed;
use sqlx::{Executor, SqlitePool};

#[derive(RustEmbed)]
#[folder = "migrations/"]
struct Migrations;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("unable to parse migration script `{filename}`")]
    Script { filename: String },
    #[error("unable to execute migration script `{filename}`")]
    Execution {
        filename: String,
        #[source]
        error: sqlx::Error,
    },
}

pub(crate) async fn migrate(pool: &SqlitePool) -> Result<(), MigrationError> {
    let mut filenames = Migrations::iter().collect::<Vec<_>>();
    filenames.sort();

    for filename in filenames {
        let script = Migrations::get(&filename)
            .and_then(|file| String::from_utf8(file.data.to_vec()).ok())
            .ok_or_else(|| MigrationError::Script {
                filename: filename.to_string(),
            })?;

        pool.execute(&script[..])
            .await
            .map_err(|error| MigrationError::Execution {
                filename: filename.to_string(),
                error,
            })?;
    }
    Ok(())
}
