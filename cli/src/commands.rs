//! Subcommands and their execution.

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::session::{MergeOptions, VaultSession};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use vaultsync_engine::{
    ConvertOptions, Converter, Database, Error as EngineError, Format, NativeConverter, NodeIdx,
};

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a new empty vault
    Init {
        /// Overwrite an existing vault file
        #[arg(long)]
        force: bool,
    },

    /// List every entry; groups end with a slash
    List,

    /// Store a value, creating parent groups as needed
    Put {
        /// Slash-separated entry path, e.g. mail/alice
        path: String,
        value: String,
    },

    /// Print a stored value
    Get { path: String },

    /// Delete an entry and everything below it
    Rm { path: String },

    /// Merge another copy of the vault into this one
    Merge {
        /// Vault file to merge from
        remote: PathBuf,

        /// Print the merge log as JSON
        #[arg(long)]
        json: bool,

        /// Overwrite the remote file if it is out of date after the merge
        #[arg(long)]
        write_remote: bool,

        /// Also merge the remote-sync subtree
        #[arg(long)]
        remote_sync: bool,
    },

    /// Write the vault in the native per-node form
    Export {
        /// Output file (defaults to stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Include the remote-sync subtree
        #[arg(long)]
        remote_sync: bool,
    },

    /// Merge a native per-node export into the vault
    Import {
        input: PathBuf,

        /// Also import the remote-sync subtree
        #[arg(long)]
        remote_sync: bool,
    },
}

impl Command {
    pub async fn execute(&self, vault: &Path, config: &Config) -> Result<String> {
        match self {
            Command::Init { force } => {
                VaultSession::create(vault, config, *force).await?;
                Ok(format!("Created vault {}", vault.display()))
            }

            Command::List => {
                let session = VaultSession::open(vault, config).await?;
                Ok(session.read(list_paths).await)
            }

            Command::Put { path, value } => {
                let names = split_path(path)?;
                let session = VaultSession::open(vault, config).await?;
                session
                    .edit(|db| put_value(db, &names, value.as_bytes()))
                    .await?;
                session.save().await?;
                Ok(format!("Stored /{}", names.join("/")))
            }

            Command::Get { path } => {
                let names = split_path(path)?;
                let session = VaultSession::open(vault, config).await?;
                let value = session
                    .read(|db| db.find_path(&names).map(|idx| db.value_of(idx)))
                    .await
                    .ok_or_else(|| AppError::NotFound(path.clone()))??;
                Ok(value
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .unwrap_or_default())
            }

            Command::Rm { path } => {
                let names = split_path(path)?;
                let session = VaultSession::open(vault, config).await?;
                let (parent, id) = session
                    .read(|db| {
                        let node = db.node(db.find_path(&names)?)?;
                        node.parent().map(|parent| (parent, node.id()))
                    })
                    .await
                    .ok_or_else(|| AppError::NotFound(path.clone()))?;
                session.edit(|db| Ok(db.remove(parent, &id))).await?;
                session.save().await?;
                Ok(format!("Removed /{}", names.join("/")))
            }

            Command::Merge {
                remote,
                json,
                write_remote,
                remote_sync,
            } => {
                let session = VaultSession::open(vault, config).await?;
                let options = MergeOptions {
                    remote_sync: *remote_sync,
                    write_remote: *write_remote,
                };
                let log = session.merge_from(remote, options).await?;
                if session.is_dirty() {
                    session.save().await?;
                }

                if *json {
                    return Ok(serde_json::to_string_pretty(&log)?);
                }
                let mut out = log.as_text();
                if log.remote_out_of_date() && !*write_remote {
                    out.push_str("\nRemote copy is out of date; rerun with --write-remote to update it");
                }
                Ok(out)
            }

            Command::Export {
                output,
                remote_sync,
            } => {
                let session = VaultSession::open(vault, config).await?;
                let options = ConvertOptions::new(Format::Native).with_remote_sync(*remote_sync);
                let text = session
                    .read(|db| NativeConverter::new().export_text(db, &options))
                    .await?;
                match output {
                    Some(file) => {
                        tokio::fs::write(file, text).await?;
                        Ok(format!("Exported to {}", file.display()))
                    }
                    None => Ok(text),
                }
            }

            Command::Import { input, remote_sync } => {
                let text = tokio::fs::read_to_string(input).await?;
                let session = VaultSession::open(vault, config).await?;
                let options = ConvertOptions::new(Format::Native).with_remote_sync(*remote_sync);
                let actions = session
                    .edit(|db| NativeConverter::new().import_text(db, &options, &text))
                    .await?;
                session.save().await?;
                if actions.is_empty() {
                    return Ok("No changes.".to_string());
                }
                Ok(actions
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
        }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let names: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if names.is_empty() {
        return Err(AppError::InvalidPath(path.to_string()));
    }
    Ok(names)
}

/// Set the value at `names`, creating missing groups on the way.
fn put_value(db: &mut Database, names: &[&str], value: &[u8]) -> vaultsync_engine::Result<NodeIdx> {
    let Some((leaf, groups)) = names.split_last() else {
        return Err(EngineError::MalformedInput("empty path".to_string()));
    };

    let mut parent = db.root();
    for name in groups {
        parent = match db.tree().child_by_name(parent, name) {
            Some(idx) => idx,
            None => db.add_group(parent, name)?,
        };
    }

    match db.tree().child_by_name(parent, leaf) {
        Some(idx) => {
            db.set_value(idx, value)?;
            Ok(idx)
        }
        None => db.add_entry(parent, leaf, value),
    }
}

fn list_paths(db: &Database) -> String {
    let root = db.root();
    let lines: Vec<String> = db
        .walk()
        .into_iter()
        .filter(|idx| *idx != root)
        .map(|idx| match db.tree()[idx].value() {
            Some(_) => db.path(idx),
            None => format!("{}/", db.path(idx)),
        })
        .collect();
    if lines.is_empty() {
        return "(empty vault)".to_string();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use zeroize::Zeroizing;

    fn config() -> Config {
        Config {
            password: Zeroizing::new("pw".to_string()),
            memory_rounds: 1,
            file_rounds: 1,
        }
    }

    async fn run(vault: &Path, command: Command) -> Result<String> {
        command.execute(vault, &config()).await
    }

    #[test]
    fn split_path_ignores_extra_slashes() {
        assert_eq!(split_path("/mail//alice/").unwrap(), vec!["mail", "alice"]);
        assert!(matches!(split_path("///"), Err(AppError::InvalidPath(_))));
    }

    #[test]
    fn put_value_creates_groups_and_overwrites() {
        let mut db = Database::new("pw", 1, 1).unwrap();
        let first = put_value(&mut db, &["mail", "alice"], b"one").unwrap();
        let second = put_value(&mut db, &["mail", "alice"], b"two").unwrap();

        assert_eq!(first, second);
        assert_eq!(db.value_of(first).unwrap(), Some(b"two".to_vec()));
        let mail = db.find_path(&["mail"]).unwrap();
        assert_eq!(db.value_of(mail).unwrap(), None);
        assert_eq!(list_paths(&db), "/mail/\n/mail/alice");
    }

    #[test]
    fn list_empty_vault() {
        let db = Database::new("pw", 1, 1).unwrap();
        assert_eq!(list_paths(&db), "(empty vault)");
    }

    #[tokio::test]
    async fn put_get_rm() {
        let dir = TempDir::new().unwrap();
        let vault = dir.path().join("vault.json");

        run(&vault, Command::Init { force: false }).await.unwrap();
        run(
            &vault,
            Command::Put {
                path: "mail/alice".into(),
                value: "secret".into(),
            },
        )
        .await
        .unwrap();

        let value = run(&vault, Command::Get { path: "mail/alice".into() }).await.unwrap();
        assert_eq!(value, "secret");

        let listed = run(&vault, Command::List).await.unwrap();
        assert_eq!(listed, "/mail/\n/mail/alice");

        run(&vault, Command::Rm { path: "mail/alice".into() }).await.unwrap();
        let missing = run(&vault, Command::Get { path: "mail/alice".into() }).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn merge_reports_log() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("local.json");
        let remote = dir.path().join("remote.json");

        run(&local, Command::Init { force: false }).await.unwrap();
        std::fs::copy(&local, &remote).unwrap();
        run(
            &remote,
            Command::Put {
                path: "bank".into(),
                value: "1234".into(),
            },
        )
        .await
        .unwrap();

        let merge = Command::Merge {
            remote: remote.clone(),
            json: false,
            write_remote: false,
            remote_sync: false,
        };
        let out = run(&local, merge).await.unwrap();
        assert_eq!(out, "INFO - /bank - added");

        let value = run(&local, Command::Get { path: "bank".into() }).await.unwrap();
        assert_eq!(value, "1234");

        let merge = Command::Merge {
            remote,
            json: true,
            write_remote: false,
            remote_sync: false,
        };
        let out = run(&local, merge).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["items"][0]["text"], "unchanged");
        assert_eq!(parsed["remoteOutOfDate"], false);
    }

    #[tokio::test]
    async fn export_then_import() {
        let dir = TempDir::new().unwrap();
        let vault = dir.path().join("vault.json");
        let export = dir.path().join("export.json");

        run(&vault, Command::Init { force: false }).await.unwrap();
        run(
            &vault,
            Command::Put {
                path: "mail/alice".into(),
                value: "secret".into(),
            },
        )
        .await
        .unwrap();
        run(
            &vault,
            Command::Export {
                output: Some(export.clone()),
                remote_sync: false,
            },
        )
        .await
        .unwrap();

        // Importing into the same vault matches every node by id
        let out = run(
            &vault,
            Command::Import {
                input: export,
                remote_sync: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(out, "INFO - /mail - unchanged\nINFO - /mail/alice - unchanged");
    }
}
