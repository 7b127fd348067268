use anyhow::Context;
use serde_json::json;
use std::sync::Arc;
use warden_core::{config::WardenConfig, engine::Engine, paths};

use super::Session;
use crate::output::print_json;

pub fn run(session: &Session) -> anyhow::Result<()> {
    let root = &session.root;
    let dir = paths::warden_dir(root);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_created = if paths::config_path(root).exists() {
        false
    } else {
        WardenConfig::default()
            .save(root)
            .context("failed to write config.yaml")?;
        true
    };

    let db_created = !paths::db_path(root).exists();
    let config = super::load_config(root)?;
    Engine::open(root, Arc::new(config)).context("failed to create warden store")?;

    if session.json {
        return print_json(&json!({
            "root": root.display().to_string(),
            "config_created": config_created,
            "store_created": db_created,
        }));
    }

    println!("Initializing warden in: {}", root.display());
    let label = |created: bool| if created { "created:" } else { "exists: " };
    println!("  {} {}", label(config_created), paths::CONFIG_FILE);
    println!("  {} {}", label(db_created), paths::DB_FILE);
    println!("\nNext: warden host add <id>");
    Ok(())
}
