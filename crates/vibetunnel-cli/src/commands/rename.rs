//! `vt rename` — rename a session, uniqueified on collision

use anyhow::Result;

use vibetunnel_core::SessionManager;

pub async fn execute(id: &str, name: &str) -> Result<()> {
    let manager = SessionManager::with_default_root()?;
    let applied = manager.rename(id, name).await?;
    println!("renamed to {applied}");
    Ok(())
}
