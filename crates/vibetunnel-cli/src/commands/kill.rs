//! `vt kill` — terminate a session with escalation

use anyhow::{anyhow, Result};

use vibetunnel_core::ipc::SignalSpec;
use vibetunnel_core::SessionManager;

pub async fn execute(id: &str, signal: Option<&str>) -> Result<()> {
    let signal = match signal {
        Some(raw) => {
            let spec = match raw.parse::<i32>() {
                Ok(n) => SignalSpec::Number(n),
                Err(_) => SignalSpec::Name(raw.to_string()),
            };
            Some(
                spec.to_signal()
                    .ok_or_else(|| anyhow!("unknown signal: {raw}"))?,
            )
        }
        None => None,
    };

    let manager = SessionManager::with_default_root()?;
    manager.kill(id, signal).await?;
    println!("killed {id}");
    Ok(())
}
