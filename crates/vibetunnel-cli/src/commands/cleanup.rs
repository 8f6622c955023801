//! `vt cleanup` — remove exited session directories

use anyhow::Result;

use vibetunnel_core::config;
use vibetunnel_core::SessionStore;

pub async fn execute(id: Option<&str>, old_versions: bool) -> Result<()> {
    let store = SessionStore::new(config::control_root())?;

    if let Some(id) = id {
        store.cleanup(id).await?;
        println!("removed {id}");
        return Ok(());
    }

    let removed = store.cleanup_exited().await?;
    println!("removed {removed} exited session(s)");

    if old_versions {
        let (removed, kept) = store.cleanup_old_versions().await?;
        println!("removed {removed} old-version session(s), kept {kept}");
    }
    Ok(())
}
