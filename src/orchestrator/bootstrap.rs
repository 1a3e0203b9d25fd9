//! First-start seeding of the main group.

use std::path::Path;

use chrono::Utc;
use tracing::info;

use crate::agent::openai::INSTRUCTIONS_FILE;
use crate::config::DispatchConfig;
use crate::error::{ConfigError, Error};
use crate::model::RegisteredGroup;
use crate::store::Store;

/// Conversation id of the local console.
pub const MAIN_CHAT_JID: &str = "main@claw";

/// Register the main group when no group exists yet, and write its default
/// instructions file if missing. Returns whether a group was registered.
pub async fn ensure_main_group(
    store: &dyn Store,
    config: &DispatchConfig,
    groups_dir: &Path,
) -> Result<bool, Error> {
    if !store.get_registered_groups().await?.is_empty() {
        return Ok(false);
    }

    let folder = groups_dir.join(&config.default_folder);
    tokio::fs::create_dir_all(&folder)
        .await
        .map_err(ConfigError::from)?;

    let instructions = folder.join(INSTRUCTIONS_FILE);
    if !tokio::fs::try_exists(&instructions)
        .await
        .map_err(ConfigError::from)?
    {
        let content = format!("You are {}, a helpful AI assistant.\n", config.assistant_name);
        tokio::fs::write(&instructions, content)
            .await
            .map_err(ConfigError::from)?;
    }

    store
        .register_group(&RegisteredGroup {
            jid: MAIN_CHAT_JID.to_string(),
            name: "Main".to_string(),
            folder: config.default_folder.clone(),
            trigger_pattern: config.default_trigger(),
            requires_trigger: true,
            added_at: Utc::now(),
        })
        .await?;

    info!(jid = MAIN_CHAT_JID, folder = %folder.display(), "Registered main group");
    Ok(true)
}
